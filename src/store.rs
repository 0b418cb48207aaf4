use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::warn;

use crate::domain::{
    ArchiveStatus, CompoundRecord, KEY_PREFIX_LEN, MatchKind, PlanSource, key_prefix,
    normalize_inchikey,
};
use crate::error::MolidError;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS compound_data (
    CID INTEGER PRIMARY KEY,
    Title TEXT,
    IUPACName TEXT,
    MolecularFormula TEXT,
    MolecularWeight REAL,
    ExactMass REAL,
    MonoisotopicMass REAL,
    Charge INTEGER,
    SMILES TEXT,
    ConnectivitySMILES TEXT,
    InChI TEXT,
    InChIKey TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_compound_inchikey ON compound_data(InChIKey);
CREATE INDEX IF NOT EXISTS idx_compound_inchikey14 ON compound_data(substr(InChIKey, 1, 14));
CREATE TABLE IF NOT EXISTS processed_archives (
    archive_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_error TEXT,
    md5 TEXT,
    source TEXT,
    last_ingested TEXT,
    updated_at TEXT NOT NULL
);
";

/// Columns read from `compound_data`, paired with the record field they fill.
const COMPOUND_COLUMNS: [&str; 12] = [
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
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub archive_name: String,
    pub status: ArchiveStatus,
    pub last_error: Option<String>,
    pub checksum: Option<String>,
    pub source: Option<PlanSource>,
    pub last_ingested: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub compounds: u64,
    pub archives_ingested: u64,
    pub archives_failed: u64,
}

/// The bulk compound database plus its archive ingestion ledger.
#[derive(Debug)]
pub struct CompoundStore {
    conn: Connection,
    path: PathBuf,
    columns: OnceCell<Vec<String>>,
}

impl CompoundStore {
    /// Opens (creating if needed) a writable store and applies the schema.
    pub fn open(path: &Path) -> Result<Self, MolidError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(MolidError::from_io)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, path);
        store.ensure_schema()?;
        Ok(store)
    }

    /// Opens an existing store for lookups only; a missing file is a precondition failure.
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
        let conn = Connection::open_in_memory()?;
        let store = Self::with_connection(conn, Path::new(":memory:"));
        store.ensure_schema()?;
        Ok(store)
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

    pub fn ensure_schema(&self) -> Result<(), MolidError> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Inserts records whose CID and InChIKey are not yet present; returns how many were new.
    /// The batch commits as one transaction, so a failed row leaves nothing behind.
    pub fn upsert_compounds(&self, records: &[CompoundRecord]) -> Result<usize, MolidError> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = insert_batch(&tx, records)?;
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<CompoundRecord>, MolidError> {
        let sql = format!(
            "SELECT {} FROM compound_data WHERE InChIKey = ?1 LIMIT 1",
            self.projection()?
        );
        Ok(self
            .conn
            .query_row(&sql, params![normalize_inchikey(key)], compound_from_row)
            .optional()?)
    }

    /// All compounds sharing the connectivity block, lowest CID first.
    pub fn get_by_key_prefix(&self, prefix: &str) -> Result<Vec<CompoundRecord>, MolidError> {
        let prefix = normalize_inchikey(key_prefix(prefix));
        if prefix.chars().count() != KEY_PREFIX_LEN {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM compound_data WHERE substr(InChIKey, 1, 14) = ?1 ORDER BY CID",
            self.projection()?
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![prefix], compound_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Exact key first, then the connectivity prefix.
    pub fn lookup_key(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<CompoundRecord>, MatchKind)>, MolidError> {
        if let Some(record) = self.get_by_key(key)? {
            return Ok(Some((vec![record], MatchKind::Exact)));
        }
        let matches = self.get_by_key_prefix(key)?;
        if matches.is_empty() {
            return Ok(None);
        }
        Ok(Some((matches, MatchKind::Connectivity)))
    }

    fn projection(&self) -> Result<String, MolidError> {
        let present = match self.columns.get() {
            Some(columns) => columns,
            None => {
                let columns = self.table_columns("compound_data")?;
                self.columns.get_or_init(|| columns)
            }
        };
        Ok(COMPOUND_COLUMNS
            .iter()
            .map(|column| {
                if present.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                    column.to_string()
                } else {
                    format!("NULL AS {column}")
                }
            })
            .collect::<Vec<_>>()
            .join(", "))
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>, MolidError> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_ledger_entry(&self, name: &str) -> Result<Option<LedgerEntry>, MolidError> {
        self.conn
            .query_row(
                &format!("SELECT {LEDGER_COLUMNS} FROM processed_archives WHERE archive_name = ?1"),
                params![name],
                LedgerRow::from_row,
            )
            .optional()?
            .map(LedgerRow::into_entry)
            .transpose()
    }

    /// Entries with the given status, by archive name.
    pub fn ledger_entries(&self, status: ArchiveStatus) -> Result<Vec<LedgerEntry>, MolidError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEDGER_COLUMNS} FROM processed_archives WHERE status = ?1 ORDER BY archive_name"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], LedgerRow::from_row)?;
        rows.map(|row| row.map_err(MolidError::from).and_then(LedgerRow::into_entry))
            .collect()
    }

    /// Single-statement upsert. Fields passed as `None` keep their stored value.
    pub fn upsert_ledger_entry(
        &self,
        name: &str,
        status: ArchiveStatus,
        source: PlanSource,
        checksum: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), MolidError> {
        self.conn.execute(
            "INSERT INTO processed_archives
                (archive_name, status, last_error, md5, source, last_ingested, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(archive_name) DO UPDATE SET
                status = excluded.status,
                last_error = excluded.last_error,
                md5 = COALESCE(excluded.md5, processed_archives.md5),
                source = excluded.source,
                last_ingested = COALESCE(excluded.last_ingested, processed_archives.last_ingested),
                updated_at = excluded.updated_at",
            params![
                name,
                status.as_str(),
                error,
                checksum,
                source.as_str(),
                timestamp.map(|ts| ts.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent successful ingestion across the ledger.
    pub fn last_ingested(&self) -> Result<Option<DateTime<Utc>>, MolidError> {
        let value: Option<String> = self.conn.query_row(
            "SELECT MAX(last_ingested) FROM processed_archives WHERE status = 'ingested'",
            [],
            |row| row.get(0),
        )?;
        Ok(value.as_deref().and_then(parse_timestamp))
    }

    pub fn stats(&self) -> Result<StoreStats, MolidError> {
        let count = |sql: &str| -> Result<u64, MolidError> {
            let value: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(value.max(0) as u64)
        };
        Ok(StoreStats {
            compounds: count("SELECT COUNT(*) FROM compound_data")?,
            archives_ingested: count(
                "SELECT COUNT(*) FROM processed_archives WHERE status = 'ingested'",
            )?,
            archives_failed: count(
                "SELECT COUNT(*) FROM processed_archives WHERE status = 'failed'",
            )?,
        })
    }
}

const LEDGER_COLUMNS: &str =
    "archive_name, status, last_error, md5, source, last_ingested, updated_at";

struct LedgerRow {
    archive_name: String,
    status: String,
    last_error: Option<String>,
    checksum: Option<String>,
    source: Option<String>,
    last_ingested: Option<String>,
    updated_at: String,
}

impl LedgerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            archive_name: row.get(0)?,
            status: row.get(1)?,
            last_error: row.get(2)?,
            checksum: row.get(3)?,
            source: row.get(4)?,
            last_ingested: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry, MolidError> {
        Ok(LedgerEntry {
            archive_name: self.archive_name,
            status: self.status.parse()?,
            last_error: self.last_error,
            checksum: self.checksum,
            source: self.source.as_deref().map(str::parse::<PlanSource>).transpose()?,
            last_ingested: self.last_ingested.as_deref().and_then(parse_timestamp),
            updated_at: parse_timestamp(&self.updated_at).unwrap_or_else(Utc::now),
        })
    }
}

fn insert_batch(conn: &Connection, records: &[CompoundRecord]) -> Result<usize, MolidError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO compound_data (
            CID, Title, IUPACName, MolecularFormula, MolecularWeight, ExactMass,
            MonoisotopicMass, Charge, SMILES, ConnectivitySMILES, InChI, InChIKey
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    let mut inserted = 0;
    for record in records {
        if record.cid <= 0 {
            warn!("skipping compound without CID");
            continue;
        }
        inserted += stmt.execute(params![
            record.cid,
            record.title,
            record.iupac_name,
            record.molecular_formula,
            record.molecular_weight,
            record.exact_mass,
            record.monoisotopic_mass,
            record.charge,
            record.smiles,
            record.connectivity_smiles,
            record.inchi,
            record.inchikey.as_deref().map(normalize_inchikey),
        ])?;
    }
    Ok(inserted)
}

fn compound_from_row(row: &Row<'_>) -> rusqlite::Result<CompoundRecord> {
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
        ..CompoundRecord::default()
    })
}

/// Older databases stored masses as TEXT; coerce either representation.
pub(crate) fn real_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f64>> {
    use rusqlite::types::ValueRef;

    Ok(match row.get_ref(idx)? {
        ValueRef::Real(value) => Some(value),
        ValueRef::Integer(value) => Some(value as f64),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(crate::domain::coerce_f64),
        ValueRef::Null | ValueRef::Blob(_) => None,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_schema_reads_missing_columns_as_null() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE compound_data (CID INTEGER PRIMARY KEY, InChIKey TEXT, ExactMass TEXT);
             INSERT INTO compound_data VALUES (280, 'CURLTUGMZLYLDI-UHFFFAOYSA-N', '43.98983');",
        )
        .unwrap();
        let store = CompoundStore::with_connection(conn, Path::new(":memory:"));

        let record = store
            .get_by_key("curltugmzlyldi-uhfffaoysa-n")
            .unwrap()
            .unwrap();
        assert_eq!(record.cid, 280);
        assert_eq!(record.exact_mass, Some(43.98983));
        assert_eq!(record.title, None);
    }
}
