use std::collections::HashMap;
use std::sync::Mutex;

use assert_matches::assert_matches;

use molid::cache::{
    CONFIDENCE_BAD_CHECKSUM, CONFIDENCE_GENERIC, CONFIDENCE_VALID, QueryCache, RegistrySource,
};
use molid::domain::{CompoundRecord, IdentifierType};
use molid::error::MolidError;
use molid::pubchem::{FetchedCompound, RemoteLookupClient, ViewDocument};

fn record(cid: i64, key: &str) -> CompoundRecord {
    CompoundRecord {
        cid,
        title: Some(format!("compound {cid}")),
        inchikey: Some(key.to_string()),
        ..CompoundRecord::default()
    }
}

#[derive(Default)]
struct MockRegistry {
    xrefs: HashMap<i64, Vec<String>>,
    synonyms: HashMap<i64, Vec<String>>,
    calls: Mutex<usize>,
}

impl RemoteLookupClient for MockRegistry {
    fn resolve_cids(&self, _id_type: IdentifierType, _value: &str) -> Result<Vec<i64>, MolidError> {
        Ok(Vec::new())
    }

    fn properties(&self, _cid: i64) -> Result<Option<CompoundRecord>, MolidError> {
        Ok(None)
    }

    fn view_document(
        &self,
        _cid: i64,
        _heading: Option<&str>,
    ) -> Result<Option<ViewDocument>, MolidError> {
        Ok(None)
    }

    fn registry_numbers(&self, cid: i64) -> Result<Vec<String>, MolidError> {
        *self.calls.lock().unwrap() += 1;
        self.xrefs
            .get(&cid)
            .cloned()
            .ok_or_else(|| MolidError::Status {
                status: 503,
                message: "busy".to_string(),
            })
    }

    fn synonyms(&self, cid: i64) -> Result<Vec<String>, MolidError> {
        Ok(self.synonyms.get(&cid).cloned().unwrap_or_default())
    }
}

#[test]
fn confidence_follows_checksum_validity() {
    let cache = QueryCache::in_memory().unwrap();
    cache.insert_if_absent(&record(280, "CURLTUGMZLYLDI-UHFFFAOYSA-N")).unwrap();

    assert!(cache.add_registry_mapping("124-38-8", 280, RegistrySource::Xref).unwrap());
    assert!(cache.add_registry_mapping("124-38-9", 280, RegistrySource::Xref).unwrap());
    assert!(!cache.add_registry_mapping("124-38-8", 280, RegistrySource::Synonym).unwrap());

    let mappings = cache.registry_mappings(280).unwrap();
    let confidence: HashMap<&str, i64> = mappings
        .iter()
        .map(|m| (m.registry_number.as_str(), m.confidence))
        .collect();
    assert_eq!(confidence["124-38-8"], CONFIDENCE_BAD_CHECKSUM);
    assert_eq!(confidence["124-38-9"], CONFIDENCE_VALID);

    assert_eq!(
        cache.refresh_best_registry(280).unwrap().as_deref(),
        Some("124-38-9")
    );
    assert_eq!(
        cache.get(280).unwrap().unwrap().registry_number.as_deref(),
        Some("124-38-9")
    );
}

#[test]
fn source_breaks_confidence_ties() {
    let cache = QueryCache::in_memory().unwrap();
    cache.insert_if_absent(&record(962, "XLYOFNOQVPJJNP-UHFFFAOYSA-N")).unwrap();

    cache
        .add_registry_mapping("7732-18-5", 962, RegistrySource::Synonym)
        .unwrap();
    cache
        .add_registry_mapping("7440-44-0", 962, RegistrySource::Query)
        .unwrap();
    assert_eq!(
        cache.best_registry_number(962).unwrap().as_deref(),
        Some("7440-44-0")
    );

    cache
        .add_registry_mapping("7732-18-5", 962, RegistrySource::Xref)
        .unwrap();
    let water = cache
        .registry_mappings(962)
        .unwrap()
        .into_iter()
        .find(|m| m.registry_number == "7732-18-5")
        .unwrap();
    assert_eq!(water.source, "synonym");
}

#[test]
fn generic_numbers_are_downgraded() {
    let cache = QueryCache::in_memory().unwrap();
    cache.insert_if_absent(&record(1, "AAAAAAAAAAAAAA-UHFFFAOYSA-N")).unwrap();
    cache.insert_if_absent(&record(2, "BBBBBBBBBBBBBB-UHFFFAOYSA-N")).unwrap();
    cache.insert_if_absent(&record(3, "AAAAAAAAAAAAAA-UHFFFAOYSA-M")).unwrap();
    for cid in [1, 2] {
        cache
            .add_registry_mapping("50-00-0", cid, RegistrySource::Xref)
            .unwrap();
    }
    for cid in [1, 3] {
        cache
            .add_registry_mapping("64-17-5", cid, RegistrySource::Xref)
            .unwrap();
    }

    assert_eq!(cache.downgrade_generic_registry_numbers().unwrap(), 2);
    let first = cache.registry_mappings(1).unwrap();
    let generic = first.iter().find(|m| m.registry_number == "50-00-0").unwrap();
    assert_eq!(generic.confidence, CONFIDENCE_GENERIC);
    let shared_prefix = first.iter().find(|m| m.registry_number == "64-17-5").unwrap();
    assert_eq!(shared_prefix.confidence, CONFIDENCE_VALID);
}

#[test]
fn enrichment_counts_and_skips_failures() {
    let cache = QueryCache::in_memory().unwrap();
    cache.insert_if_absent(&record(280, "CURLTUGMZLYLDI-UHFFFAOYSA-N")).unwrap();
    cache.insert_if_absent(&record(962, "XLYOFNOQVPJJNP-UHFFFAOYSA-N")).unwrap();

    let mut remote = MockRegistry::default();
    remote
        .xrefs
        .insert(280, vec!["124-38-9".to_string(), "bogus".to_string()]);
    remote.synonyms.insert(
        280,
        vec!["carbonic anhydride".to_string(), "124-38-9".to_string()],
    );

    let report = cache.enrich_registry_numbers(&remote, &[], true).unwrap();
    assert_eq!(report.cids, 2);
    assert_eq!(report.mappings_written, 1);
    assert_eq!(report.lookups_failed, 1);
    assert_eq!(*remote.calls.lock().unwrap(), 2);
    assert_eq!(
        cache.get(280).unwrap().unwrap().registry_number.as_deref(),
        Some("124-38-9")
    );
    assert_eq!(cache.get(962).unwrap().unwrap().registry_number, None);
}

#[test]
fn stored_fetches_answer_later_queries() {
    let cache = QueryCache::in_memory().unwrap();
    let mut fetched_record = record(280, "CURLTUGMZLYLDI-UHFFFAOYSA-N");
    fetched_record.molecular_formula = Some("CO2".to_string());
    let fetched = FetchedCompound {
        record: fetched_record,
        registry_numbers: vec!["124-38-9".to_string()],
    };

    let stored = cache
        .store_fetched(IdentifierType::Cas, "124-38-9", &fetched)
        .unwrap();
    assert_eq!(stored.registry_number.as_deref(), Some("124-38-9"));
    assert!(stored.fetched_at.is_some());

    for (id_type, value) in [
        (IdentifierType::Cas, "124-38-9"),
        (IdentifierType::Cid, "280"),
        (IdentifierType::Molecularformula, "CO2"),
        (IdentifierType::Inchikey, "curltugmzlyldi-uhfffaoysa-n"),
    ] {
        let hits = cache.lookup(id_type, value).unwrap();
        assert_eq!(hits.len(), 1, "{id_type}={value}");
        assert_eq!(hits[0].cid, 280);
    }
    assert!(cache.lookup(IdentifierType::Name, "water").unwrap().is_empty());
}

#[test]
fn readonly_cache_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    assert_matches!(
        QueryCache::open_readonly(&temp.path().join("missing.db")),
        Err(MolidError::DatabaseNotFound(_))
    );
}

fn legacy_cache(path: &std::path::Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE cached_molecules (
            CID INTEGER PRIMARY KEY, InChIKey TEXT UNIQUE, MolecularFormula TEXT, InChI TEXT,
            TPSA REAL, Charge INTEGER, ConnectivitySMILES TEXT, Title TEXT, IUPACName TEXT,
            XLogP REAL, ExactMass REAL, Complexity REAL, MonoisotopicMass TEXT, SMILES TEXT
        );
        INSERT INTO cached_molecules (CID, InChIKey, MolecularFormula, Title, MonoisotopicMass)
        VALUES (280, 'CURLTUGMZLYLDI-UHFFFAOYSA-N', 'CO2', 'Carbon Dioxide', '43.98982924');",
    )
    .unwrap();
}

#[test]
fn readonly_legacy_cache_reads_missing_columns_as_null() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("old_cache.db");
    legacy_cache(&path);

    let cache = QueryCache::open_readonly(&path).unwrap();
    let hits = cache.lookup(IdentifierType::Cid, "280").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title.as_deref(), Some("Carbon Dioxide"));
    assert_eq!(hits[0].monoisotopic_mass, Some(43.98982924));
    assert_eq!(hits[0].molecular_weight, None);
    assert_eq!(hits[0].registry_number, None);
    assert_eq!(hits[0].fetched_at, None);

    assert!(cache.lookup(IdentifierType::Cas, "124-38-9").unwrap().is_empty());
    assert!(cache.lookup(IdentifierType::Name, "dry ice").unwrap().is_empty());
}

#[test]
fn writable_open_migrates_legacy_cache() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("old_cache.db");
    legacy_cache(&path);

    let cache = QueryCache::open(&path).unwrap();
    cache
        .add_registry_mapping("124-38-9", 280, RegistrySource::Xref)
        .unwrap();
    cache.refresh_best_registry(280).unwrap();

    let hits = cache.lookup(IdentifierType::Cas, "124-38-9").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].registry_number.as_deref(), Some("124-38-9"));
}
