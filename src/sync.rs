use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::{
    self, CHECKSUM_SUFFIX, PartialState, available_space, inspect_partial, md5_hex,
    parse_checksum, remove_if_exists, unpack_gz,
};
use crate::domain::{ArchiveStatus, CompoundRecord, PlanSource};
use crate::error::MolidError;
use crate::http::backoff_delay;
use crate::remote::{RemoteArchive, RemoteDirectoryClient};
use crate::sdf::extract_compounds;
use crate::store::CompoundStore;

pub const INGEST_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub download_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub max_attempts: usize,
    pub backoff_base: Duration,
    pub max_consecutive_failures: usize,
    pub min_free_bytes: u64,
}

impl SyncOptions {
    pub fn new(download_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            processed_dir: processed_dir.into(),
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            max_consecutive_failures: 3,
            min_free_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub source: PlanSource,
    pub since: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub archives: Vec<RemoteArchive>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveAction {
    Ingested,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub archive: String,
    pub action: ArchiveAction,
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: PlanSource,
    pub planned: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records: usize,
    pub aborted: bool,
    pub archives: Vec<ArchiveOutcome>,
}

/// Receives each batch of extracted compounds; returns how many were written.
pub type IngestFn<'a> = dyn FnMut(&[CompoundRecord]) -> Result<usize, MolidError> + 'a;

pub struct ArchiveSyncEngine<C: RemoteDirectoryClient> {
    client: C,
    options: SyncOptions,
}

impl<C: RemoteDirectoryClient> ArchiveSyncEngine<C> {
    pub fn new(client: C, options: SyncOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Full snapshot when nothing was ever ingested, otherwise deltas since the last ingestion.
    /// Archives that failed in earlier runs are planned again ahead of new ones.
    pub fn plan(
        &self,
        store: &CompoundStore,
        max_items: Option<usize>,
    ) -> Result<SyncPlan, MolidError> {
        let since = store.last_ingested()?;
        let (source, mut archives) = match since {
            None => (PlanSource::Full, self.client.list_full()?),
            Some(ts) => {
                let since_date = ts.date_naive();
                let archives = self
                    .client
                    .list_incremental(since_date)?
                    .into_iter()
                    .filter(|archive| archive.released.is_none_or(|date| date >= since_date))
                    .collect();
                (PlanSource::Incremental, archives)
            }
        };

        let mut retries: Vec<RemoteArchive> = store
            .ledger_entries(ArchiveStatus::Failed)?
            .into_iter()
            .filter_map(|entry| {
                RemoteArchive::from_ledger(&entry.archive_name, entry.source.unwrap_or(source))
            })
            .filter(|retry| !archives.iter().any(|archive| archive.name == retry.name))
            .collect();
        if !retries.is_empty() {
            info!(count = retries.len(), "retrying previously failed archives");
            retries.append(&mut archives);
            archives = retries;
        }

        if let Some(max) = max_items {
            archives.truncate(max);
        }
        Ok(SyncPlan {
            source,
            since,
            archives,
        })
    }

    pub fn run(
        &self,
        store: &CompoundStore,
        max_items: Option<usize>,
        ingest: &mut IngestFn<'_>,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, MolidError> {
        self.check_free_space()?;
        let plan = self.plan(store, max_items)?;
        fs::create_dir_all(&self.options.download_dir).map_err(MolidError::from_io)?;
        fs::create_dir_all(&self.options.processed_dir).map_err(MolidError::from_io)?;

        info!(
            source = plan.source.as_str(),
            archives = plan.archives.len(),
            "starting archive sync"
        );
        let mut report = SyncReport {
            source: plan.source,
            planned: plan.archives.len(),
            ingested: 0,
            skipped: 0,
            failed: 0,
            records: 0,
            aborted: false,
            archives: Vec::new(),
        };

        let started = Instant::now();
        let mut consecutive_failures = 0usize;
        for (idx, archive) in plan.archives.iter().enumerate() {
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Sync; [{}/{}] {}",
                    idx + 1,
                    plan.archives.len(),
                    archive.name
                ),
                elapsed: Some(started.elapsed()),
            });

            match self.process_archive(store, archive, ingest) {
                Ok(Some(records)) => {
                    consecutive_failures = 0;
                    report.ingested += 1;
                    report.records += records;
                    report.archives.push(ArchiveOutcome {
                        archive: archive.name.clone(),
                        action: ArchiveAction::Ingested,
                        records,
                        error: None,
                    });
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    report.skipped += 1;
                    report.archives.push(ArchiveOutcome {
                        archive: archive.name.clone(),
                        action: ArchiveAction::Skipped,
                        records: 0,
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(archive = %archive.name, error = %err, "archive failed");
                    let message = err.to_string();
                    store.upsert_ledger_entry(
                        &archive.name,
                        ArchiveStatus::Failed,
                        archive.source,
                        None,
                        None,
                        Some(&message),
                    )?;
                    consecutive_failures += 1;
                    report.failed += 1;
                    report.archives.push(ArchiveOutcome {
                        archive: archive.name.clone(),
                        action: ArchiveAction::Failed,
                        records: 0,
                        error: Some(message),
                    });
                    if consecutive_failures >= self.options.max_consecutive_failures {
                        warn!(
                            failures = consecutive_failures,
                            "aborting sync after consecutive failures"
                        );
                        report.aborted = true;
                        break;
                    }
                }
            }
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; ingested={} skipped={} failed={}",
                report.ingested, report.skipped, report.failed
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    fn check_free_space(&self) -> Result<(), MolidError> {
        let volume = existing_ancestor(&self.options.download_dir);
        let available = available_space(&volume)?;
        if available < self.options.min_free_bytes {
            return Err(MolidError::InsufficientDiskSpace {
                available,
                required: self.options.min_free_bytes,
            });
        }
        Ok(())
    }

    /// `Ok(None)` when the archive is already ingested with the same checksum.
    fn process_archive(
        &self,
        store: &CompoundStore,
        archive: &RemoteArchive,
        ingest: &mut IngestFn<'_>,
    ) -> Result<Option<usize>, MolidError> {
        let remote_checksum_text = self.client.fetch_checksum(archive)?;
        let expected = parse_checksum(&remote_checksum_text).ok_or_else(|| {
            MolidError::CorruptArchive(format!("unreadable checksum file for {}", archive.name))
        })?;

        if let Some(entry) = store.get_ledger_entry(&archive.name)? {
            if entry.status == ArchiveStatus::Ingested
                && entry.checksum.as_deref() == Some(expected.as_str())
            {
                info!(archive = %archive.name, "unchanged, skipping");
                return Ok(None);
            }
        }

        store.upsert_ledger_entry(
            &archive.name,
            ArchiveStatus::Pending,
            archive.source,
            None,
            None,
            None,
        )?;

        let gz_path = self.options.download_dir.join(archive.local_name());
        let md5_path = self
            .options
            .download_dir
            .join(format!("{}{CHECKSUM_SUFFIX}", archive.local_name()));

        self.download_with_retries(archive, &gz_path)?;
        fs::write(&md5_path, remote_checksum_text.as_bytes()).map_err(MolidError::from_io)?;

        let actual = md5_hex(&gz_path)?;
        if actual != expected {
            remove_if_exists(&gz_path)?;
            remove_if_exists(&md5_path)?;
            return Err(MolidError::ChecksumMismatch {
                archive: archive.name.clone(),
                expected,
                actual,
            });
        }

        let records = self.ingest_archive(&gz_path, ingest)?;
        remove_if_exists(&gz_path)?;
        remove_if_exists(&md5_path)?;

        store.upsert_ledger_entry(
            &archive.name,
            ArchiveStatus::Ingested,
            archive.source,
            Some(&expected),
            Some(Utc::now()),
            None,
        )?;
        info!(archive = %archive.name, records, "archive ingested");
        Ok(Some(records))
    }

    fn ingest_archive(
        &self,
        gz_path: &Path,
        ingest: &mut IngestFn<'_>,
    ) -> Result<usize, MolidError> {
        let extracted = unpack_gz(gz_path, &self.options.processed_dir)?;
        let reader = BufReader::new(extracted.reopen().map_err(MolidError::from_io)?);

        let mut written = 0;
        let mut batch = Vec::with_capacity(INGEST_BATCH_SIZE);
        for record in extract_compounds(reader) {
            batch.push(record?);
            if batch.len() >= INGEST_BATCH_SIZE {
                written += ingest(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            written += ingest(&batch)?;
        }
        Ok(written)
    }

    fn download_with_retries(&self, archive: &RemoteArchive, path: &Path) -> Result<(), MolidError> {
        let mut last_error = String::new();
        for attempt in 0..self.options.max_attempts {
            if attempt > 0 {
                thread::sleep(backoff_delay(self.options.backoff_base, attempt - 1));
            }
            match self.download_once(archive, path) {
                Ok(()) => return Ok(()),
                Err(err) if is_retryable(&err) => {
                    warn!(
                        archive = %archive.name,
                        attempt = attempt + 1,
                        error = %err,
                        "download attempt failed"
                    );
                    remove_if_exists(path)?;
                    last_error = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        Err(MolidError::DownloadExhausted {
            archive: archive.name.clone(),
            attempts: self.options.max_attempts,
            last_error,
        })
    }

    fn download_once(&self, archive: &RemoteArchive, path: &Path) -> Result<(), MolidError> {
        let remote_size = self.client.remote_size(archive)?;
        let state = inspect_partial(path)?;
        if state == PartialState::Corrupt {
            warn!(archive = %archive.name, "discarding corrupt partial download");
            remove_if_exists(path)?;
        }
        let mut offset = state.resumable_len();

        if let Some(size) = remote_size {
            if offset > size {
                warn!(archive = %archive.name, offset, size, "partial larger than remote, restarting");
                remove_if_exists(path)?;
                offset = 0;
            } else if offset == size {
                return Ok(());
            }
        } else if matches!(state, PartialState::Complete(_)) {
            return Ok(());
        }

        let mut transfer = self.client.open_transfer(archive, offset)?;
        let mut file = if offset > 0 && transfer.resumed {
            info!(archive = %archive.name, offset, "resuming download");
            OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(MolidError::from_io)?
        } else {
            File::create(path).map_err(MolidError::from_io)?
        };
        io::copy(&mut transfer.body, &mut file)
            .map_err(|err| MolidError::Http(format!("transfer of {}: {err}", archive.name)))?;
        file.sync_all().map_err(MolidError::from_io)?;
        drop(file);

        let written = fs::metadata(path).map_err(MolidError::from_io)?.len();
        if let Some(size) = remote_size {
            if written != size {
                return Err(MolidError::SizeMismatch {
                    archive: archive.name.clone(),
                    expected: size,
                    actual: written,
                });
            }
        }
        archive::validate_gz(path)
    }
}

fn is_retryable(err: &MolidError) -> bool {
    err.is_transport()
        || matches!(
            err,
            MolidError::SizeMismatch { .. } | MolidError::CorruptArchive(_)
        )
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}
