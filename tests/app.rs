use std::io::{Cursor, Write};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};

use molid::app::{App, ProgressEvent, ProgressSink, UpdateOverrides};
use molid::config::{Config, ConfigLoader, DefaultPaths, ResolvedConfig};
use molid::convert::StructureConverter;
use molid::domain::{CompoundRecord, IdentifierType, PlanSource, Query, SearchMode, Strategy};
use molid::error::MolidError;
use molid::pubchem::{RemoteLookupClient, ViewDocument};
use molid::remote::{RemoteArchive, RemoteDirectoryClient, Transfer};

const ARCHIVE: &str = "Compound_000000001_000500000.sdf.gz";

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

#[derive(Default)]
struct MockRemote {
    calls: Mutex<usize>,
}

impl RemoteLookupClient for MockRemote {
    fn resolve_cids(&self, _id_type: IdentifierType, _value: &str) -> Result<Vec<i64>, MolidError> {
        *self.calls.lock().unwrap() += 1;
        Ok(vec![2244])
    }

    fn properties(&self, cid: i64) -> Result<Option<CompoundRecord>, MolidError> {
        Ok(Some(CompoundRecord {
            cid,
            title: Some("Aspirin".to_string()),
            iupac_name: Some("2-acetyloxybenzoic acid".to_string()),
            inchikey: Some("BSYNRYMUTXBXSQ-UHFFFAOYSA-N".to_string()),
            ..CompoundRecord::default()
        }))
    }

    fn view_document(
        &self,
        _cid: i64,
        _heading: Option<&str>,
    ) -> Result<Option<ViewDocument>, MolidError> {
        Ok(None)
    }

    fn registry_numbers(&self, _cid: i64) -> Result<Vec<String>, MolidError> {
        Ok(vec!["50-78-2".to_string()])
    }

    fn synonyms(&self, _cid: i64) -> Result<Vec<String>, MolidError> {
        Ok(vec!["acetylsalicylic acid".to_string(), "50-78-2".to_string()])
    }
}

struct MockDirectory {
    body: Vec<u8>,
    transfers: Mutex<usize>,
}

impl MockDirectory {
    fn new() -> Self {
        let sdf = "2244\nM  END\n> <PUBCHEM_COMPOUND_CID>\n2244\n\n\
                   > <PUBCHEM_IUPAC_INCHIKEY>\nBSYNRYMUTXBXSQ-UHFFFAOYSA-N\n\n$$$$\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(sdf.as_bytes()).unwrap();
        Self {
            body: encoder.finish().unwrap(),
            transfers: Mutex::new(0),
        }
    }
}

impl RemoteDirectoryClient for MockDirectory {
    fn list_full(&self) -> Result<Vec<RemoteArchive>, MolidError> {
        Ok(vec![RemoteArchive::full(ARCHIVE)])
    }

    fn list_incremental(&self, _since: NaiveDate) -> Result<Vec<RemoteArchive>, MolidError> {
        Ok(Vec::new())
    }

    fn fetch_checksum(&self, archive: &RemoteArchive) -> Result<String, MolidError> {
        let digest: String = Md5::digest(&self.body)
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();
        Ok(format!("{digest}  {}\n", archive.file_name))
    }

    fn remote_size(&self, _archive: &RemoteArchive) -> Result<Option<u64>, MolidError> {
        Ok(Some(self.body.len() as u64))
    }

    fn open_transfer(&self, _archive: &RemoteArchive, offset: u64) -> Result<Transfer, MolidError> {
        *self.transfers.lock().unwrap() += 1;
        Ok(Transfer {
            resumed: offset > 0,
            body: Box::new(Cursor::new(self.body[offset as usize..].to_vec())),
        })
    }
}

struct NoConverter;

impl StructureConverter for NoConverter {
    fn to_inchikey(&self, _id_type: IdentifierType, _structure: &str) -> Result<String, MolidError> {
        Err(MolidError::MissingTool("obabel".to_string()))
    }
}

fn resolved(root: &std::path::Path) -> ResolvedConfig {
    let root = Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap();
    let config = Config {
        min_free_gb: Some(0),
        ..Config::default()
    };
    ConfigLoader::resolve_config(config, &DefaultPaths::rooted(&root)).unwrap()
}

fn app(root: &std::path::Path) -> App<MockRemote, MockDirectory, NoConverter> {
    App::new(
        resolved(root),
        MockRemote::default(),
        MockDirectory::new(),
        NoConverter,
    )
}

#[test]
fn create_then_use_database() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    let sink = RecordingSink::default();

    assert_matches!(app.use_db(None, &sink), Err(MolidError::DatabaseNotFound(_)));

    let created = app.create_db(None, &sink).unwrap();
    assert_eq!(created.stats.compounds, 0);
    assert_eq!(created.path, app.config().master_db.to_string());

    let status = app.use_db(None, &sink).unwrap();
    assert_eq!(status.last_ingested, None);
    assert!(
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .all(|message| message.starts_with("phase="))
    );
}

#[test]
fn update_ingests_and_reports() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    let sink = RecordingSink::default();

    let report = app.update_db(UpdateOverrides::default(), &sink).unwrap();
    assert_eq!(report.source, PlanSource::Full);
    assert_eq!(report.ingested, 1);
    assert_eq!(report.records, 1);

    let status = app.use_db(None, &sink).unwrap();
    assert_eq!(status.stats.compounds, 1);
    assert_eq!(status.stats.archives_ingested, 1);
    assert!(status.last_ingested.is_some());

    let outcome = app
        .search(
            &Query::new(IdentifierType::Inchikey, "BSYNRYMUTXBXSQ-UHFFFAOYSA-N"),
            None,
            &sink,
        )
        .unwrap();
    assert_eq!(outcome.provenance, Strategy::BulkOnly);
    assert_eq!(outcome.records[0].cid, 2244);
}

#[test]
fn update_honours_overrides() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    let db_file = Utf8PathBuf::from_path_buf(temp.path().join("elsewhere.db")).unwrap();

    let report = app
        .update_db(
            UpdateOverrides {
                db_file: Some(db_file.clone()),
                max_files: Some(0),
                ..UpdateOverrides::default()
            },
            &RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(report.planned, 0);
    assert!(db_file.exists());
    assert!(!app.config().master_db.exists());
}

#[test]
fn remote_search_then_registry_enrichment() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    let sink = RecordingSink::default();

    let outcome = app
        .search(
            &Query::new(IdentifierType::Name, "aspirin"),
            Some(&SearchMode::Single(Strategy::RemoteWithCache)),
            &sink,
        )
        .unwrap();
    assert_eq!(outcome.records[0].registry_number.as_deref(), Some("50-78-2"));

    let report = app.enrich_cas(&[2244], true, &sink).unwrap();
    assert_eq!(report.cids, 1);
    assert_eq!(report.lookups_failed, 0);
    assert_eq!(report.mappings_written, 0);
}

#[test]
fn structure_queries_need_the_converter() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    assert_matches!(
        app.search(
            &Query::new(IdentifierType::Smiles, "CC(=O)OC1=CC=CC=C1C(=O)O"),
            None,
            &RecordingSink::default(),
        ),
        Err(MolidError::MissingTool(_))
    );
}
