use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{
    CompoundRecord, IdentifierType, RegistryValidity, normalize_inchikey, parse_cid,
    registry_validity,
};
use crate::error::MolidError;
use crate::pubchem::{FetchedCompound, RemoteLookupClient};
use crate::store::real_column;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS cached_molecules (
    CID INTEGER PRIMARY KEY,
    InChIKey TEXT UNIQUE,
    MolecularFormula TEXT,
    InChI TEXT,
    TPSA REAL,
    Charge INTEGER,
    ConnectivitySMILES TEXT,
    Title TEXT,
    IUPACName TEXT,
    XLogP REAL,
    ExactMass REAL,
    Complexity REAL,
    MonoisotopicMass REAL,
    MolecularWeight REAL,
    SMILES TEXT,
    CAS TEXT,
    fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_cached_inchikey14 ON cached_molecules(substr(InChIKey, 1, 14));
CREATE INDEX IF NOT EXISTS idx_cached_formula ON cached_molecules(MolecularFormula);
CREATE TABLE IF NOT EXISTS cas_mapping (
    CAS TEXT NOT NULL,
    CID INTEGER NOT NULL,
    source TEXT NOT NULL,
    confidence INTEGER NOT NULL,
    PRIMARY KEY (CAS, CID)
);
CREATE INDEX IF NOT EXISTS idx_cas_mapping_cid ON cas_mapping(CID);
CREATE TABLE IF NOT EXISTS query_aliases (
    id_type TEXT NOT NULL,
    value TEXT NOT NULL,
    CID INTEGER NOT NULL,
    PRIMARY KEY (id_type, value)
);
";

/// Columns added after the first cache generation.
const LATE_COLUMNS: [(&str, &str); 3] = [
    ("CAS", "TEXT"),
    ("fetched_at", "TEXT"),
    ("MolecularWeight", "REAL"),
];

/// Read order expected by `cached_from_row`.
const CACHED_COLUMNS: [&str; 17] = [
    "CID",
    "Title",
    "IUPACName",
    "MolecularFormula",
    "MolecularWeight",
    "ExactMass",
    "MonoisotopicMass",
    "Charge",
    "SMILES",
    "ConnectivitySMILES",
    "InChI",
    "InChIKey",
    "XLogP",
    "TPSA",
    "Complexity",
    "CAS",
    "fetched_at",
];

/// Where a registry-number mapping came from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrySource {
    Xref,
    Query,
    Synonym,
}

impl RegistrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrySource::Xref => "xref",
            RegistrySource::Query => "query",
            RegistrySource::Synonym => "synonym",
        }
    }
}

pub const CONFIDENCE_GENERIC: i64 = 0;
pub const CONFIDENCE_BAD_CHECKSUM: i64 = 1;
pub const CONFIDENCE_VALID: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryMapping {
    pub registry_number: String,
    pub cid: i64,
    pub source: String,
    pub confidence: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub cids: usize,
    pub mappings_written: usize,
    pub generic_downgraded: usize,
    pub lookups_failed: usize,
}

/// Local store of previously resolved remote lookups.
#[derive(Debug)]
pub struct QueryCache {
    conn: Connection,
    path: PathBuf,
    columns: OnceCell<Vec<String>>,
}

impl QueryCache {
    pub fn open(path: &Path) -> Result<Self, MolidError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|_| MolidError::CacheNotWritable(parent.to_path_buf()))?;
        }
        let cache = Self::with_connection(Connection::open(path)?, path);
        cache.ensure_schema()?;
        Ok(cache)
    }

    pub fn open_readonly(path: &Path) -> Result<Self, MolidError> {
        if !path.is_file() {
            return Err(MolidError::DatabaseNotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::with_connection(conn, path))
    }

    pub fn in_memory() -> Result<Self, MolidError> {
        let cache = Self::with_connection(Connection::open_in_memory()?, Path::new(":memory:"));
        cache.ensure_schema()?;
        Ok(cache)
    }

    fn with_connection(conn: Connection, path: &Path) -> Self {
        Self {
            conn,
            path: path.to_path_buf(),
            columns: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs before the column list is first read, so later projections see added columns.
    fn ensure_schema(&self) -> Result<(), MolidError> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        let present = self.table_columns("cached_molecules")?;
        for (column, kind) in LATE_COLUMNS {
            if !present.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                self.conn.execute(
                    &format!("ALTER TABLE cached_molecules ADD COLUMN {column} {kind}"),
                    [],
                )?;
            }
        }
        Ok(())
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>, MolidError> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Older caches lack some columns; a read-only handle cannot add them, so they read as NULL.
    fn present_columns(&self) -> Result<&[String], MolidError> {
        if let Some(columns) = self.columns.get() {
            return Ok(columns);
        }
        let columns = self.table_columns("cached_molecules")?;
        Ok(self.columns.get_or_init(|| columns))
    }

    fn has_column(&self, column: &str) -> Result<bool, MolidError> {
        Ok(self
            .present_columns()?
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column)))
    }

    fn projection(&self) -> Result<String, MolidError> {
        let present = self.present_columns()?;
        Ok(CACHED_COLUMNS
            .iter()
            .map(|column| {
                if present.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                    format!("c.{column}")
                } else {
                    format!("NULL AS {column}")
                }
            })
            .collect::<Vec<_>>()
            .join(", "))
    }

    /// `None` when the cache has neither a mapping table nor a registry column to search.
    fn registry_clause(&self) -> Result<Option<String>, MolidError> {
        let mut conditions = Vec::new();
        if self.has_table("cas_mapping")? {
            conditions.push("c.CID IN (SELECT CID FROM cas_mapping WHERE CAS = ?1)");
        }
        if self.has_column("CAS")? {
            conditions.push("c.CAS = ?1");
        }
        if conditions.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!(
            "WHERE {} ORDER BY c.CID",
            conditions.join(" OR ")
        )))
    }

    fn has_table(&self, table: &str) -> Result<bool, MolidError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Rows matching a normalized identifier, falling back to recorded query aliases.
    pub fn lookup(
        &self,
        id_type: IdentifierType,
        value: &str,
    ) -> Result<Vec<CompoundRecord>, MolidError> {
        let records = match id_type {
            IdentifierType::Inchikey => {
                self.select("WHERE c.InChIKey = ?1", &normalize_inchikey(value))?
            }
            IdentifierType::Cid => self.select_with("WHERE c.CID = ?1", params![parse_cid(value)?])?,
            IdentifierType::Name => self.select(
                "WHERE c.Title = ?1 COLLATE NOCASE OR c.IUPACName = ?1 COLLATE NOCASE",
                value.trim(),
            )?,
            IdentifierType::Molecularformula => {
                self.select("WHERE c.MolecularFormula = ?1", value.trim())?
            }
            IdentifierType::Cas => match self.registry_clause()? {
                Some(clause) => self.select(&clause, value.trim())?,
                None => Vec::new(),
            },
            IdentifierType::Inchi | IdentifierType::Smiles | IdentifierType::Xyz => {
                self.select("WHERE c.InChI = ?1 OR c.SMILES = ?1", value.trim())?
            }
        };
        if !records.is_empty() {
            return Ok(records);
        }
        self.lookup_alias(id_type, value)
    }

    fn lookup_alias(
        &self,
        id_type: IdentifierType,
        value: &str,
    ) -> Result<Vec<CompoundRecord>, MolidError> {
        if !self.has_table("query_aliases")? {
            return Ok(Vec::new());
        }
        self.select_with(
            "JOIN query_aliases a ON a.CID = c.CID WHERE a.id_type = ?1 AND a.value = ?2",
            params![id_type.as_str(), alias_value(id_type, value)],
        )
    }

    fn select(&self, clause: &str, value: &str) -> Result<Vec<CompoundRecord>, MolidError> {
        self.select_with(clause, params![value])
    }

    fn select_with(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CompoundRecord>, MolidError> {
        let sql = format!(
            "SELECT {} FROM cached_molecules c {clause}",
            self.projection()?
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, cached_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, cid: i64) -> Result<Option<CompoundRecord>, MolidError> {
        Ok(self
            .select_with("WHERE c.CID = ?1", params![cid])?
            .into_iter()
            .next())
    }

    /// Returns `true` when a new row was written.
    pub fn insert_if_absent(&self, record: &CompoundRecord) -> Result<bool, MolidError> {
        let fetched_at = record
            .fetched_at
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO cached_molecules (
                CID, InChIKey, MolecularFormula, InChI, TPSA, Charge, ConnectivitySMILES,
                Title, IUPACName, XLogP, ExactMass, Complexity, MonoisotopicMass,
                MolecularWeight, SMILES, CAS, fetched_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                record.cid,
                record.inchikey.as_deref().map(normalize_inchikey),
                record.molecular_formula,
                record.inchi,
                record.tpsa,
                record.charge,
                record.connectivity_smiles,
                record.title,
                record.iupac_name,
                record.xlogp,
                record.exact_mass,
                record.complexity,
                record.monoisotopic_mass,
                record.molecular_weight,
                record.smiles,
                record.registry_number,
                fetched_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn record_alias(
        &self,
        id_type: IdentifierType,
        value: &str,
        cid: i64,
    ) -> Result<(), MolidError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO query_aliases (id_type, value, CID) VALUES (?1, ?2, ?3)",
            params![id_type.as_str(), alias_value(id_type, value), cid],
        )?;
        Ok(())
    }

    /// Stores a mapping with checksum-derived confidence; malformed numbers are ignored.
    /// An existing mapping is only replaced by a more confident one.
    pub fn add_registry_mapping(
        &self,
        registry_number: &str,
        cid: i64,
        source: RegistrySource,
    ) -> Result<bool, MolidError> {
        let registry_number = registry_number.trim();
        let confidence = match registry_validity(registry_number) {
            RegistryValidity::Valid => CONFIDENCE_VALID,
            RegistryValidity::BadChecksum => CONFIDENCE_BAD_CHECKSUM,
            RegistryValidity::Malformed => {
                debug!(registry_number, "ignoring malformed registry number");
                return Ok(false);
            }
        };
        if source == RegistrySource::Synonym && confidence != CONFIDENCE_VALID {
            return Ok(false);
        }
        let changed = self.conn.execute(
            "INSERT INTO cas_mapping (CAS, CID, source, confidence) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(CAS, CID) DO UPDATE SET
                source = excluded.source,
                confidence = excluded.confidence
             WHERE excluded.confidence > cas_mapping.confidence",
            params![registry_number, cid, source.as_str(), confidence],
        )?;
        Ok(changed > 0)
    }

    pub fn registry_mappings(&self, cid: i64) -> Result<Vec<RegistryMapping>, MolidError> {
        let mut stmt = self.conn.prepare(
            "SELECT CAS, CID, source, confidence FROM cas_mapping WHERE CID = ?1 ORDER BY CAS",
        )?;
        let rows = stmt.query_map(params![cid], |row| {
            Ok(RegistryMapping {
                registry_number: row.get(0)?,
                cid: row.get(1)?,
                source: row.get(2)?,
                confidence: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Highest confidence, then xref > query > synonym, then lexical.
    pub fn best_registry_number(&self, cid: i64) -> Result<Option<String>, MolidError> {
        Ok(self
            .conn
            .query_row(
                "SELECT CAS FROM cas_mapping WHERE CID = ?1
                 ORDER BY confidence DESC,
                    CASE source WHEN 'xref' THEN 0 WHEN 'query' THEN 1 ELSE 2 END,
                    CAS
                 LIMIT 1",
                params![cid],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn refresh_best_registry(&self, cid: i64) -> Result<Option<String>, MolidError> {
        let best = self.best_registry_number(cid)?;
        if let Some(best) = &best {
            self.conn.execute(
                "UPDATE cached_molecules SET CAS = ?1 WHERE CID = ?2",
                params![best, cid],
            )?;
        }
        Ok(best)
    }

    /// Registry numbers shared by compounds with different connectivity are generic.
    pub fn downgrade_generic_registry_numbers(&self) -> Result<usize, MolidError> {
        Ok(self.conn.execute(
            "UPDATE cas_mapping SET confidence = ?1
             WHERE confidence > ?1 AND CAS IN (
                SELECT m.CAS FROM cas_mapping m
                JOIN cached_molecules c ON c.CID = m.CID
                WHERE c.InChIKey IS NOT NULL
                GROUP BY m.CAS
                HAVING COUNT(DISTINCT substr(c.InChIKey, 1, 14)) > 1
             )",
            params![CONFIDENCE_GENERIC],
        )?)
    }

    /// Persists a fresh remote hit: the row, the query alias and its registry mappings.
    pub fn store_fetched(
        &self,
        id_type: IdentifierType,
        value: &str,
        fetched: &FetchedCompound,
    ) -> Result<CompoundRecord, MolidError> {
        let cid = fetched.record.cid;
        self.insert_if_absent(&fetched.record)?;
        self.record_alias(id_type, value, cid)?;
        for number in &fetched.registry_numbers {
            self.add_registry_mapping(number, cid, RegistrySource::Xref)?;
        }
        if id_type == IdentifierType::Cas {
            self.add_registry_mapping(value, cid, RegistrySource::Query)?;
        }
        if let Some(best) = self.refresh_best_registry(cid)? {
            debug!(cid, registry_number = %best, "registry number updated");
        } else if let Some(number) = &fetched.record.registry_number {
            self.conn.execute(
                "UPDATE cached_molecules SET CAS = ?1 WHERE CID = ?2",
                params![number, cid],
            )?;
        }
        Ok(self.get(cid)?.unwrap_or_else(|| fetched.record.clone()))
    }

    pub fn cached_cids(&self) -> Result<Vec<i64>, MolidError> {
        let mut stmt = self.conn.prepare("SELECT CID FROM cached_molecules ORDER BY CID")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Pulls registry numbers for `cids` (every cached CID when empty). Remote failures
    /// are counted and skipped.
    pub fn enrich_registry_numbers(
        &self,
        remote: &dyn RemoteLookupClient,
        cids: &[i64],
        use_synonyms: bool,
    ) -> Result<EnrichReport, MolidError> {
        let cids = if cids.is_empty() {
            self.cached_cids()?
        } else {
            cids.to_vec()
        };
        let mut report = EnrichReport {
            cids: cids.len(),
            ..EnrichReport::default()
        };

        for &cid in &cids {
            match remote.registry_numbers(cid) {
                Ok(numbers) => {
                    for number in numbers {
                        if self.add_registry_mapping(&number, cid, RegistrySource::Xref)? {
                            report.mappings_written += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(cid, error = %err, "registry lookup failed");
                    report.lookups_failed += 1;
                }
            }
            if use_synonyms {
                match remote.synonyms(cid) {
                    Ok(synonyms) => {
                        for synonym in synonyms {
                            if self.add_registry_mapping(&synonym, cid, RegistrySource::Synonym)? {
                                report.mappings_written += 1;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(cid, error = %err, "synonym lookup failed");
                        report.lookups_failed += 1;
                    }
                }
            }
        }

        report.generic_downgraded = self.downgrade_generic_registry_numbers()?;
        for &cid in &cids {
            self.refresh_best_registry(cid)?;
        }
        Ok(report)
    }
}

fn alias_value(id_type: IdentifierType, value: &str) -> String {
    match id_type {
        IdentifierType::Name => value.trim().to_lowercase(),
        IdentifierType::Inchikey => normalize_inchikey(value),
        _ => value.trim().to_string(),
    }
}

fn cached_from_row(row: &Row<'_>) -> rusqlite::Result<CompoundRecord> {
    Ok(CompoundRecord {
        cid: row.get(0)?,
        title: row.get(1)?,
        iupac_name: row.get(2)?,
        molecular_formula: row.get(3)?,
        molecular_weight: real_column(row, 4)?,
        exact_mass: real_column(row, 5)?,
        monoisotopic_mass: real_column(row, 6)?,
        charge: real_column(row, 7)?.map(|value| value.round() as i64),
        smiles: row.get(8)?,
        connectivity_smiles: row.get(9)?,
        inchi: row.get(10)?,
        inchikey: row.get(11)?,
        xlogp: real_column(row, 12)?,
        tpsa: real_column(row, 13)?,
        complexity: real_column(row, 14)?,
        registry_number: row.get(15)?,
        fetched_at: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cid: i64, key: &str) -> CompoundRecord {
        CompoundRecord {
            cid,
            inchikey: Some(key.to_string()),
            title: Some(format!("compound {cid}")),
            ..CompoundRecord::default()
        }
    }

    #[test]
    fn insert_is_first_writer_wins() {
        let cache = QueryCache::in_memory().unwrap();
        assert!(cache.insert_if_absent(&record(1, "AAAAAAAAAAAAAA-BBBBBBBBBB-C")).unwrap());
        let mut changed = record(1, "AAAAAAAAAAAAAA-BBBBBBBBBB-C");
        changed.title = Some("other".to_string());
        assert!(!cache.insert_if_absent(&changed).unwrap());
        assert_eq!(
            cache.get(1).unwrap().unwrap().title.as_deref(),
            Some("compound 1")
        );
    }

    #[test]
    fn malformed_registry_numbers_are_ignored() {
        let cache = QueryCache::in_memory().unwrap();
        cache.insert_if_absent(&record(1, "AAAAAAAAAAAAAA-BBBBBBBBBB-C")).unwrap();
        assert!(!cache.add_registry_mapping("12345", 1, RegistrySource::Xref).unwrap());
        assert!(cache.registry_mappings(1).unwrap().is_empty());
    }

    #[test]
    fn aliases_serve_synonym_names() {
        let cache = QueryCache::in_memory().unwrap();
        cache.insert_if_absent(&record(280, "CURLTUGMZLYLDI-UHFFFAOYSA-N")).unwrap();
        cache.record_alias(IdentifierType::Name, "Carbonic Anhydride", 280).unwrap();
        let hits = cache
            .lookup(IdentifierType::Name, "carbonic anhydride")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cid, 280);
    }
}
