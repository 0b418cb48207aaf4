use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{SearchMode, Strategy};
use crate::error::MolidError;

pub const CONFIG_FILE_NAME: &str = "molid.json";
pub const DEFAULT_MIN_FREE_GB: u64 = 50;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_priority: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_free_gb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSettings>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HttpOptions {
    pub retries: usize,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            retries: 4,
            backoff: Duration::from_millis(700),
            timeout: Duration::from_secs(35),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub master_db: Utf8PathBuf,
    pub cache_db: Utf8PathBuf,
    pub mode: SearchMode,
    /// Strategy order for `auto`, whichever mode is the default.
    pub auto_priority: Vec<Strategy>,
    pub download_folder: Utf8PathBuf,
    pub processed_folder: Utf8PathBuf,
    pub max_files: Option<usize>,
    pub min_free_bytes: u64,
    pub http: HttpOptions,
}

/// Platform locations used when neither the file nor the environment names a path.
#[derive(Debug, Clone)]
pub struct DefaultPaths {
    pub config_dir: Utf8PathBuf,
    pub data_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
}

impl DefaultPaths {
    pub fn discover() -> Result<Self, MolidError> {
        let dirs = ProjectDirs::from("", "", "molid").ok_or_else(|| {
            MolidError::Filesystem("unable to resolve platform directories".to_string())
        })?;
        let utf8 = |path: &std::path::Path| {
            Utf8PathBuf::from_path_buf(path.to_path_buf())
                .map_err(|_| MolidError::Filesystem("non UTF-8 platform directory".to_string()))
        };
        Ok(Self {
            config_dir: utf8(dirs.config_dir())?,
            data_dir: utf8(dirs.data_dir())?,
            cache_dir: utf8(dirs.cache_dir())?,
        })
    }

    pub fn rooted(root: &Utf8Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
        }
    }

    pub fn config_file(&self) -> Utf8PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file (explicit path must exist), then layers `MOLID_*` overrides.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MolidError> {
        let defaults = DefaultPaths::discover()?;
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => defaults.config_file(),
        };

        let mut config = if config_path.as_std_path().exists() {
            Self::load(&config_path)?
        } else if path.is_some() {
            return Err(MolidError::MissingConfig(config_path.into_std_path_buf()));
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Self::resolve_config(config, &defaults)
    }

    /// The file `config set-*` writes to: the explicit path or the platform default.
    pub fn config_path(path: Option<&str>) -> Result<Utf8PathBuf, MolidError> {
        match path {
            Some(path) => Ok(Utf8PathBuf::from(path)),
            None => Ok(DefaultPaths::discover()?.config_file()),
        }
    }

    pub fn load(path: &Utf8Path) -> Result<Config, MolidError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| MolidError::ConfigRead(path.as_std_path().to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| MolidError::ConfigParse(err.to_string()))
    }

    /// Loads the file if present so that `config set-*` edits keep unrelated keys.
    pub fn load_or_default(path: &Utf8Path) -> Result<Config, MolidError> {
        if path.as_std_path().exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(path: &Utf8Path, config: &Config) -> Result<(), MolidError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(MolidError::from_io)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(config)
            .map_err(|err| MolidError::ConfigParse(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content).map_err(MolidError::from_io)?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path()).map_err(MolidError::from_io)?;
        Ok(())
    }

    pub fn resolve_config(
        config: Config,
        defaults: &DefaultPaths,
    ) -> Result<ResolvedConfig, MolidError> {
        let auto_priority = resolve_priority(config.auto_priority.as_deref())?;
        let mode = resolve_mode(config.mode.as_deref(), &auto_priority)?;
        let http_settings = config.http.unwrap_or_default();
        let http_defaults = HttpOptions::default();
        let http = HttpOptions {
            retries: http_settings.retries.unwrap_or(http_defaults.retries),
            backoff: http_settings
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(http_defaults.backoff),
            timeout: http_settings
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.timeout),
        };

        Ok(ResolvedConfig {
            master_db: config.master_db.map(Utf8PathBuf::from).unwrap_or_else(|| {
                defaults.data_dir.join("master").join("pubchem_master.db")
            }),
            cache_db: config
                .cache_db
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.data_dir.join("cache").join("pubchem_cache.db")),
            mode,
            auto_priority,
            download_folder: config
                .download_folder
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.cache_dir.join("downloads")),
            processed_folder: config
                .processed_folder
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.data_dir.join("processed")),
            max_files: config.max_files,
            min_free_bytes: config.min_free_gb.unwrap_or(DEFAULT_MIN_FREE_GB) * BYTES_PER_GB,
            http,
        })
    }
}

impl ResolvedConfig {
    /// Parses a mode given at call time; `auto` keeps the configured priority.
    pub fn parse_mode(&self, value: &str) -> Result<SearchMode, MolidError> {
        resolve_mode(Some(value), &self.auto_priority)
    }
}

fn resolve_priority(names: Option<&[String]>) -> Result<Vec<Strategy>, MolidError> {
    match names {
        Some(names) if !names.is_empty() => names
            .iter()
            .map(|name| name.parse::<Strategy>())
            .collect(),
        _ => Ok(Strategy::DEFAULT_AUTO_PRIORITY.to_vec()),
    }
}

fn resolve_mode(mode: Option<&str>, auto_priority: &[Strategy]) -> Result<SearchMode, MolidError> {
    let mode = match mode {
        Some(value) => value.parse()?,
        None => SearchMode::default(),
    };
    Ok(match mode {
        SearchMode::Auto(_) => SearchMode::Auto(auto_priority.to_vec()),
        single => single,
    })
}

/// Applies `MOLID_*` variables on top of the file config. `lookup` is the environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), MolidError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(value) = get("MOLID_MASTER_DB") {
        config.master_db = Some(value);
    }
    if let Some(value) = get("MOLID_CACHE_DB") {
        config.cache_db = Some(value);
    }
    if let Some(value) = get("MOLID_MODE") {
        config.mode = Some(value);
    }
    if let Some(value) = get("MOLID_AUTO_PRIORITY") {
        config.auto_priority = Some(
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        );
    }
    if let Some(value) = get("MOLID_DOWNLOAD_FOLDER") {
        config.download_folder = Some(value);
    }
    if let Some(value) = get("MOLID_PROCESSED_FOLDER") {
        config.processed_folder = Some(value);
    }
    if let Some(value) = get("MOLID_MAX_FILES") {
        config.max_files = Some(parse_env("MOLID_MAX_FILES", &value)?);
    }
    if let Some(value) = get("MOLID_MIN_FREE_GB") {
        config.min_free_gb = Some(parse_env("MOLID_MIN_FREE_GB", &value)?);
    }

    let http = config.http.get_or_insert_with(HttpSettings::default);
    if let Some(value) = get("MOLID_HTTP_RETRIES") {
        http.retries = Some(parse_env("MOLID_HTTP_RETRIES", &value)?);
    }
    if let Some(value) = get("MOLID_HTTP_BACKOFF_MS") {
        http.backoff_ms = Some(parse_env("MOLID_HTTP_BACKOFF_MS", &value)?);
    }
    if let Some(value) = get("MOLID_HTTP_TIMEOUT_SECS") {
        http.timeout_secs = Some(parse_env("MOLID_HTTP_TIMEOUT_SECS", &value)?);
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MolidError> {
    value
        .trim()
        .parse()
        .map_err(|_| MolidError::ConfigParse(format!("{key}: invalid value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_path() {
        let defaults = DefaultPaths::rooted(Utf8Path::new("/tmp/molid-test"));
        let resolved = ConfigLoader::resolve_config(Config::default(), &defaults).unwrap();
        assert!(resolved.master_db.ends_with("master/pubchem_master.db"));
        assert!(resolved.cache_db.ends_with("cache/pubchem_cache.db"));
        assert_eq!(resolved.mode, SearchMode::default());
        assert_eq!(resolved.min_free_bytes, 50 * BYTES_PER_GB);
        assert_eq!(resolved.http, HttpOptions::default());
    }

    #[test]
    fn auto_priority_only_applies_to_auto() {
        let priority = resolve_priority(Some(["remote-only".to_string()].as_slice())).unwrap();
        assert_eq!(
            resolve_mode(Some("auto"), &priority).unwrap(),
            SearchMode::Auto(vec![Strategy::RemoteOnly])
        );
        assert_eq!(
            resolve_mode(Some("cache-only"), &priority).unwrap(),
            SearchMode::Single(Strategy::CacheOnly)
        );
        let empty: &[String] = &[];
        assert_eq!(
            resolve_priority(Some(empty)).unwrap(),
            Strategy::DEFAULT_AUTO_PRIORITY.to_vec()
        );
    }
}
