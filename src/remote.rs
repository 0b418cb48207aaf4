use std::io::Read;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use tracing::debug;

use crate::archive::{ARCHIVE_SUFFIX, CHECKSUM_SUFFIX};
use crate::config::HttpOptions;
use crate::domain::PlanSource;
use crate::error::MolidError;
use crate::http::{build_client, handle_status, send_with_retries};

pub const PUBCHEM_ARCHIVE_BASE: &str = "https://ftp.ncbi.nlm.nih.gov/pubchem/Compound/";
pub const FULL_DIR: &str = "CURRENT-Full/SDF/";
pub const MONTHLY_DIR: &str = "Monthly/";
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"?#]+)""#).expect("valid href pattern"));
static RELEASE_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})/?$").expect("valid release pattern"));

/// One archive file on the remote mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArchive {
    /// Ledger key: the file name for the full snapshot, `YYYY-MM-DD/<file>` for deltas.
    pub name: String,
    pub file_name: String,
    /// Path relative to the mirror base.
    pub path: String,
    pub source: PlanSource,
    pub released: Option<NaiveDate>,
}

impl RemoteArchive {
    pub fn full(file_name: &str) -> Self {
        Self {
            name: file_name.to_string(),
            file_name: file_name.to_string(),
            path: format!("{FULL_DIR}{file_name}"),
            source: PlanSource::Full,
            released: None,
        }
    }

    pub fn incremental(released: NaiveDate, file_name: &str) -> Self {
        let date = released.format("%Y-%m-%d").to_string();
        Self {
            name: format!("{date}/{file_name}"),
            file_name: file_name.to_string(),
            path: format!("{MONTHLY_DIR}{date}/SDF/{file_name}"),
            source: PlanSource::Incremental,
            released: Some(released),
        }
    }

    /// Rebuilds an archive from its ledger key, for retrying earlier failures.
    pub fn from_ledger(name: &str, source: PlanSource) -> Option<Self> {
        match source {
            PlanSource::Full => (!name.contains('/')).then(|| Self::full(name)),
            PlanSource::Incremental => {
                let (date, file_name) = name.split_once('/')?;
                let released = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
                Some(Self::incremental(released, file_name))
            }
        }
    }

    pub fn checksum_path(&self) -> String {
        format!("{}{CHECKSUM_SUFFIX}", self.path)
    }

    /// Flat local file name that keeps monthly files with equal names apart.
    pub fn local_name(&self) -> String {
        self.name.replace('/', "_")
    }
}

pub struct Transfer {
    /// `false` when the server ignored the range and is sending the whole file.
    pub resumed: bool,
    pub body: Box<dyn Read + Send>,
}

pub trait RemoteDirectoryClient: Send + Sync {
    fn list_full(&self) -> Result<Vec<RemoteArchive>, MolidError>;
    /// Delta archives from releases dated on or after `since`.
    fn list_incremental(&self, since: NaiveDate) -> Result<Vec<RemoteArchive>, MolidError>;
    fn fetch_checksum(&self, archive: &RemoteArchive) -> Result<String, MolidError>;
    fn remote_size(&self, archive: &RemoteArchive) -> Result<Option<u64>, MolidError>;
    fn open_transfer(&self, archive: &RemoteArchive, offset: u64) -> Result<Transfer, MolidError>;
}

impl<T: RemoteDirectoryClient + ?Sized> RemoteDirectoryClient for &T {
    fn list_full(&self) -> Result<Vec<RemoteArchive>, MolidError> {
        (**self).list_full()
    }

    fn list_incremental(&self, since: NaiveDate) -> Result<Vec<RemoteArchive>, MolidError> {
        (**self).list_incremental(since)
    }

    fn fetch_checksum(&self, archive: &RemoteArchive) -> Result<String, MolidError> {
        (**self).fetch_checksum(archive)
    }

    fn remote_size(&self, archive: &RemoteArchive) -> Result<Option<u64>, MolidError> {
        (**self).remote_size(archive)
    }

    fn open_transfer(&self, archive: &RemoteArchive, offset: u64) -> Result<Transfer, MolidError> {
        (**self).open_transfer(archive, offset)
    }
}

#[derive(Clone)]
pub struct HttpDirectoryClient {
    client: Client,
    transfer_client: Client,
    base_url: Url,
    options: HttpOptions,
}

impl HttpDirectoryClient {
    pub fn new(options: HttpOptions) -> Result<Self, MolidError> {
        Self::with_base_url(PUBCHEM_ARCHIVE_BASE, options)
    }

    pub fn with_base_url(base_url: &str, options: HttpOptions) -> Result<Self, MolidError> {
        Ok(Self {
            client: build_client(options.timeout)?,
            transfer_client: build_client(TRANSFER_TIMEOUT)?,
            base_url: Url::parse(base_url).map_err(|err| MolidError::Http(err.to_string()))?,
            options,
        })
    }

    fn url(&self, path: &str) -> Result<Url, MolidError> {
        self.base_url
            .join(path)
            .map_err(|err| MolidError::Http(format!("{path}: {err}")))
    }

    fn get_text(&self, path: &str) -> Result<String, MolidError> {
        let url = self.url(path)?;
        let response = send_with_retries(&self.options, || self.client.get(url.clone()))?;
        handle_status(response)?
            .text()
            .map_err(|err| MolidError::Http(err.to_string()))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, MolidError> {
        let listing = self.get_text(path)?;
        Ok(parse_listing(&listing))
    }
}

impl RemoteDirectoryClient for HttpDirectoryClient {
    fn list_full(&self) -> Result<Vec<RemoteArchive>, MolidError> {
        let mut archives: Vec<RemoteArchive> = self
            .list_dir(FULL_DIR)?
            .iter()
            .filter(|name| name.ends_with(ARCHIVE_SUFFIX))
            .map(|name| RemoteArchive::full(name))
            .collect();
        archives.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(archives)
    }

    fn list_incremental(&self, since: NaiveDate) -> Result<Vec<RemoteArchive>, MolidError> {
        let mut releases: Vec<NaiveDate> = self
            .list_dir(MONTHLY_DIR)?
            .iter()
            .filter_map(|entry| release_date(entry))
            .filter(|date| *date >= since)
            .collect();
        releases.sort();
        releases.dedup();

        let mut archives = Vec::new();
        for release in releases {
            let dir = format!("{MONTHLY_DIR}{}/SDF/", release.format("%Y-%m-%d"));
            debug!(%dir, "listing release");
            archives.extend(
                self.list_dir(&dir)?
                    .iter()
                    .filter(|name| name.ends_with(ARCHIVE_SUFFIX))
                    .map(|name| RemoteArchive::incremental(release, name)),
            );
        }
        Ok(archives)
    }

    fn fetch_checksum(&self, archive: &RemoteArchive) -> Result<String, MolidError> {
        self.get_text(&archive.checksum_path())
    }

    fn remote_size(&self, archive: &RemoteArchive) -> Result<Option<u64>, MolidError> {
        let url = self.url(&archive.path)?;
        let response = send_with_retries(&self.options, || self.client.head(url.clone()))?;
        let response = handle_status(response)?;
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok()))
    }

    fn open_transfer(&self, archive: &RemoteArchive, offset: u64) -> Result<Transfer, MolidError> {
        let url = self.url(&archive.path)?;
        let response = send_with_retries(&self.options, || {
            let request = self.transfer_client.get(url.clone());
            if offset > 0 {
                request.header(RANGE, format!("bytes={offset}-"))
            } else {
                request
            }
        })?;
        let response = handle_status(response)?;
        let resumed = offset > 0 && response.status().as_u16() == 206;
        if offset > 0 && !resumed {
            debug!(archive = %archive.name, "server ignored range request");
        }
        Ok(Transfer {
            resumed,
            body: Box::new(response),
        })
    }
}

/// Entry names from an HTML directory index, parent links and sort links excluded.
pub fn parse_listing(html: &str) -> Vec<String> {
    HREF.captures_iter(html)
        .filter_map(|caps| {
            let href = caps[1].trim();
            if href.starts_with("..") || href.starts_with("http") {
                return None;
            }
            let trailing_slash = href.ends_with('/');
            let last = href.trim_end_matches('/').rsplit('/').next()?;
            if last.is_empty() {
                return None;
            }
            Some(if trailing_slash {
                format!("{last}/")
            } else {
                last.to_string()
            })
        })
        .collect()
}

pub fn release_date(entry: &str) -> Option<NaiveDate> {
    let caps = RELEASE_DIR.captures(entry)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_extracts_archives_and_releases() {
        let html = r#"<a href="../">Parent</a>
            <a href="?C=M;O=A">sort</a>
            <a href="Compound_000000001_000500000.sdf.gz">x</a>
            <a href="Compound_000000001_000500000.sdf.gz.md5">x</a>
            <a href="2025-03-01/">2025-03-01/</a>"#;
        let entries = parse_listing(html);
        assert_eq!(
            entries,
            vec![
                "Compound_000000001_000500000.sdf.gz",
                "Compound_000000001_000500000.sdf.gz.md5",
                "2025-03-01/",
            ]
        );
        assert_eq!(
            release_date("2025-03-01/"),
            NaiveDate::from_ymd_opt(2025, 3, 1)
        );
        assert_eq!(release_date("README"), None);
    }

    #[test]
    fn incremental_names_are_dated() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let archive = RemoteArchive::incremental(date, "Compound_1.sdf.gz");
        assert_eq!(archive.name, "2025-03-01/Compound_1.sdf.gz");
        assert_eq!(archive.path, "Monthly/2025-03-01/SDF/Compound_1.sdf.gz");
        assert_eq!(archive.checksum_path(), "Monthly/2025-03-01/SDF/Compound_1.sdf.gz.md5");
        assert_eq!(archive.local_name(), "2025-03-01_Compound_1.sdf.gz");
        assert_eq!(
            RemoteArchive::from_ledger(&archive.name, PlanSource::Incremental),
            Some(archive)
        );
    }
}
