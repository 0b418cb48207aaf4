use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{EnrichReport, QueryCache};
use crate::config::{Config, ConfigLoader, ResolvedConfig};
use crate::convert::StructureConverter;
use crate::domain::{CompoundRecord, Query, SearchMode, Strategy};
use crate::error::MolidError;
use crate::pubchem::RemoteLookupClient;
use crate::remote::RemoteDirectoryClient;
use crate::search::{SearchEngine, SearchOutcome};
use crate::store::{CompoundStore, StoreStats};
use crate::sync::{ArchiveSyncEngine, SyncOptions, SyncReport};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Per-run overrides for `db update`; unset fields fall back to the resolved config.
#[derive(Debug, Clone, Default)]
pub struct UpdateOverrides {
    pub db_file: Option<Utf8PathBuf>,
    pub max_files: Option<usize>,
    pub download_folder: Option<Utf8PathBuf>,
    pub processed_folder: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    pub path: String,
    #[serde(flatten)]
    pub stats: StoreStats,
    pub last_ingested: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub config_file: String,
    pub master_db: String,
    pub cache_db: String,
    pub mode: String,
    pub auto_priority: Vec<Strategy>,
    pub download_folder: String,
    pub processed_folder: String,
    pub max_files: Option<usize>,
    pub min_free_bytes: u64,
    pub http_retries: usize,
    pub http_backoff_ms: u64,
    pub http_timeout_secs: u64,
}

impl ConfigView {
    pub fn new(config_file: &Utf8Path, resolved: &ResolvedConfig) -> Self {
        let auto_priority = match &resolved.mode {
            SearchMode::Auto(priority) => priority.clone(),
            SearchMode::Single(_) => Vec::new(),
        };
        Self {
            config_file: config_file.to_string(),
            master_db: resolved.master_db.to_string(),
            cache_db: resolved.cache_db.to_string(),
            mode: resolved.mode.to_string(),
            auto_priority,
            download_folder: resolved.download_folder.to_string(),
            processed_folder: resolved.processed_folder.to_string(),
            max_files: resolved.max_files,
            min_free_bytes: resolved.min_free_bytes,
            http_retries: resolved.http.retries,
            http_backoff_ms: resolved.http.backoff.as_millis() as u64,
            http_timeout_secs: resolved.http.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigSetting {
    MasterDb(String),
    CacheDb(String),
    Mode(String),
}

/// Applies one `config set-*` edit to the file at `path`, keeping every other key.
pub fn update_config(path: &Utf8Path, setting: ConfigSetting) -> Result<Config, MolidError> {
    let mut config = ConfigLoader::load_or_default(path)?;
    match setting {
        ConfigSetting::MasterDb(value) => config.master_db = Some(value),
        ConfigSetting::CacheDb(value) => config.cache_db = Some(value),
        ConfigSetting::Mode(value) => {
            let mode: SearchMode = value.parse()?;
            config.mode = Some(mode.to_string());
        }
    }
    config.schema_version.get_or_insert(1);
    ConfigLoader::save(path, &config)?;
    Ok(config)
}

/// Wires the resolved configuration to the search engine, the archive sync engine and
/// the query cache.
pub struct App<R: RemoteLookupClient, D: RemoteDirectoryClient, C: StructureConverter> {
    config: ResolvedConfig,
    search: SearchEngine<R, C>,
    directory: D,
}

impl<R: RemoteLookupClient, D: RemoteDirectoryClient, C: StructureConverter> App<R, D, C> {
    pub fn new(config: ResolvedConfig, remote: R, directory: D, converter: C) -> Self {
        let search = SearchEngine::new(
            config.master_db.as_std_path(),
            config.cache_db.as_std_path(),
            remote,
            converter,
        );
        Self {
            config,
            search,
            directory,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn search(
        &self,
        query: &Query,
        mode: Option<&SearchMode>,
        sink: &dyn ProgressSink,
    ) -> Result<SearchOutcome, MolidError> {
        let mode = mode.unwrap_or(&self.config.mode);
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {query} mode={mode}"),
            elapsed: None,
        });
        let started = Instant::now();
        let outcome = self.search.search(query, mode)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} record(s) via {}",
                outcome.records.len(),
                outcome.provenance
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(outcome)
    }

    pub fn create_db(
        &self,
        db_file: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<DbStatus, MolidError> {
        let path = db_file.unwrap_or(self.config.master_db.as_path());
        sink.event(ProgressEvent {
            message: format!("phase=Store; initializing {path}"),
            elapsed: None,
        });
        let store = CompoundStore::open(path.as_std_path())?;
        db_status(path, &store)
    }

    pub fn use_db(
        &self,
        db_file: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<DbStatus, MolidError> {
        let path = db_file.unwrap_or(self.config.master_db.as_path());
        sink.event(ProgressEvent {
            message: format!("phase=Store; checking {path}"),
            elapsed: None,
        });
        let store = CompoundStore::open_readonly(path.as_std_path())?;
        db_status(path, &store)
    }

    pub fn update_db(
        &self,
        overrides: UpdateOverrides,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, MolidError> {
        let db_file = overrides
            .db_file
            .unwrap_or_else(|| self.config.master_db.clone());
        let download = overrides
            .download_folder
            .unwrap_or_else(|| self.config.download_folder.clone());
        let processed = overrides
            .processed_folder
            .unwrap_or_else(|| self.config.processed_folder.clone());
        let max_files = overrides.max_files.or(self.config.max_files);

        let mut options = SyncOptions::new(download.as_std_path(), processed.as_std_path());
        options.min_free_bytes = self.config.min_free_bytes;

        sink.event(ProgressEvent {
            message: format!("phase=Prepare; opening {db_file}"),
            elapsed: None,
        });
        let store = CompoundStore::open(db_file.as_std_path())?;
        let engine = ArchiveSyncEngine::new(&self.directory, options);
        let mut ingest = |batch: &[CompoundRecord]| store.upsert_compounds(batch);
        engine.run(&store, max_files, &mut ingest, sink)
    }

    /// Registry-number enrichment over the writable query cache.
    pub fn enrich_cas(
        &self,
        cids: &[i64],
        use_synonyms: bool,
        sink: &dyn ProgressSink,
    ) -> Result<EnrichReport, MolidError> {
        let cache = QueryCache::open(self.config.cache_db.as_std_path())?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Enrich; {} compound(s)",
                if cids.is_empty() {
                    "all cached".to_string()
                } else {
                    cids.len().to_string()
                }
            ),
            elapsed: None,
        });
        let started = Instant::now();
        let report = cache.enrich_registry_numbers(self.search.remote(), cids, use_synonyms)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} mapping(s) written", report.mappings_written),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }
}

fn db_status(path: &Utf8Path, store: &CompoundStore) -> Result<DbStatus, MolidError> {
    Ok(DbStatus {
        path: path.to_string(),
        stats: store.stats()?,
        last_ingested: store.last_ingested()?,
    })
}
