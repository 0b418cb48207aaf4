use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use molid::app::{ConfigSetting, update_config};
use molid::config::{Config, ConfigLoader, DefaultPaths, HttpSettings, apply_env_overrides};
use molid::domain::{SearchMode, Strategy};
use molid::error::MolidError;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn file_values_override_defaults() {
    let config = Config {
        master_db: Some("/data/master.db".to_string()),
        mode: Some("bulk-only".to_string()),
        max_files: Some(3),
        min_free_gb: Some(0),
        http: Some(HttpSettings {
            retries: Some(1),
            ..HttpSettings::default()
        }),
        ..Config::default()
    };
    let defaults = DefaultPaths::rooted(Utf8Path::new("/home/user"));
    let resolved = ConfigLoader::resolve_config(config, &defaults).unwrap();

    assert_eq!(resolved.master_db, Utf8PathBuf::from("/data/master.db"));
    assert_eq!(
        resolved.cache_db,
        Utf8PathBuf::from("/home/user/data/cache/pubchem_cache.db")
    );
    assert_eq!(resolved.mode, SearchMode::Single(Strategy::BulkOnly));
    assert_eq!(resolved.max_files, Some(3));
    assert_eq!(resolved.min_free_bytes, 0);
    assert_eq!(resolved.http.retries, 1);
    assert_eq!(resolved.http.timeout, Duration::from_secs(35));
}

#[test]
fn environment_overrides_file() {
    let mut config = Config {
        mode: Some("cache-only".to_string()),
        ..Config::default()
    };
    apply_env_overrides(
        &mut config,
        env(&[
            ("MOLID_MODE", "auto"),
            ("MOLID_AUTO_PRIORITY", "cache-only, remote-only"),
            ("MOLID_CACHE_DB", "  "),
            ("MOLID_HTTP_TIMEOUT_SECS", "5"),
        ]),
    )
    .unwrap();
    assert_eq!(config.cache_db, None);

    let defaults = DefaultPaths::rooted(Utf8Path::new("/srv"));
    let resolved = ConfigLoader::resolve_config(config, &defaults).unwrap();
    assert_eq!(
        resolved.mode,
        SearchMode::Auto(vec![Strategy::CacheOnly, Strategy::RemoteOnly])
    );
    assert_eq!(resolved.http.timeout, Duration::from_secs(5));
}

#[test]
fn call_time_auto_keeps_configured_priority() {
    let config = Config {
        mode: Some("cache-only".to_string()),
        auto_priority: Some(vec!["remote-with-cache".to_string(), "bulk-only".to_string()]),
        ..Config::default()
    };
    let defaults = DefaultPaths::rooted(Utf8Path::new("/srv"));
    let resolved = ConfigLoader::resolve_config(config, &defaults).unwrap();
    assert_eq!(resolved.mode, SearchMode::Single(Strategy::CacheOnly));

    let configured = SearchMode::Auto(vec![Strategy::RemoteWithCache, Strategy::BulkOnly]);
    assert_eq!(resolved.parse_mode("auto").unwrap(), configured);
    assert_eq!(resolved.parse_mode(" Auto ").unwrap(), configured);
    assert_eq!(
        resolved.parse_mode("remote-only").unwrap(),
        SearchMode::Single(Strategy::RemoteOnly)
    );
    assert_matches!(resolved.parse_mode("later"), Err(MolidError::InvalidMode(_)));

    let plain = ConfigLoader::resolve_config(Config::default(), &defaults).unwrap();
    assert_eq!(plain.parse_mode("auto").unwrap(), SearchMode::default());
}

#[test]
fn invalid_environment_values_are_rejected() {
    let mut config = Config::default();
    assert_matches!(
        apply_env_overrides(&mut config, env(&[("MOLID_MAX_FILES", "many")])),
        Err(MolidError::ConfigParse(_))
    );

    let config = Config {
        mode: Some("whenever".to_string()),
        ..Config::default()
    };
    let defaults = DefaultPaths::rooted(Utf8Path::new("/srv"));
    assert_matches!(
        ConfigLoader::resolve_config(config, &defaults),
        Err(MolidError::InvalidMode(_))
    );
}

#[test]
fn explicit_config_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("nope.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(MolidError::MissingConfig(_))
    );
}

#[test]
fn settings_round_trip_and_keep_other_keys() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("conf").join("molid.json")).unwrap();

    update_config(&path, ConfigSetting::CacheDb("/tmp/cache.db".to_string())).unwrap();
    let saved = update_config(&path, ConfigSetting::Mode("online-only".to_string())).unwrap();
    assert_eq!(saved.schema_version, Some(1));

    let loaded = ConfigLoader::load(&path).unwrap();
    assert_eq!(loaded.cache_db.as_deref(), Some("/tmp/cache.db"));
    assert_eq!(loaded.mode.as_deref(), Some("remote-only"));
    assert!(!path.with_extension("json.tmp").exists());

    assert_matches!(
        update_config(&path, ConfigSetting::Mode("eventually".to_string())),
        Err(MolidError::InvalidMode(_))
    );
    assert_eq!(
        ConfigLoader::load(&path).unwrap().mode.as_deref(),
        Some("remote-only")
    );
}

#[test]
fn malformed_file_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("molid.json")).unwrap();
    std::fs::write(&path, "{ not json").unwrap();
    assert_matches!(ConfigLoader::load(&path), Err(MolidError::ConfigParse(_)));
}
