use std::cell::OnceCell;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::QueryCache;
use crate::convert::StructureConverter;
use crate::domain::{
    CompoundRecord, IdentifierType, MatchKind, Query, SearchMode, Strategy, normalize_inchikey,
    parse_cid,
};
use crate::error::MolidError;
use crate::formula::canonicalize_formula;
use crate::pubchem::{RemoteLookupClient, fetch_compound};
use crate::sdf::extract_compounds;
use crate::store::CompoundStore;

/// A query after case folding, structure conversion and formula canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// The identifier the lookup runs on (structures become `inchikey`).
    pub id_type: IdentifierType,
    pub value: String,
    pub original: Query,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub records: Vec<CompoundRecord>,
    pub provenance: Strategy,
    pub from_cache: bool,
    pub match_kind: MatchKind,
}

impl SearchOutcome {
    fn exact(records: Vec<CompoundRecord>, provenance: Strategy, from_cache: bool) -> Self {
        Self {
            records,
            provenance,
            from_cache,
            match_kind: MatchKind::Exact,
        }
    }
}

/// Resolves one-identifier queries against the bulk store, the query cache and the remote
/// service. Store handles are opened on first use and kept for the engine's lifetime.
pub struct SearchEngine<R: RemoteLookupClient, C: StructureConverter> {
    master_db: PathBuf,
    cache_db: PathBuf,
    remote: R,
    converter: C,
    master: OnceCell<CompoundStore>,
    cache: OnceCell<QueryCache>,
}

impl<R: RemoteLookupClient, C: StructureConverter> SearchEngine<R, C> {
    pub fn new(
        master_db: impl Into<PathBuf>,
        cache_db: impl Into<PathBuf>,
        remote: R,
        converter: C,
    ) -> Self {
        Self {
            master_db: master_db.into(),
            cache_db: cache_db.into(),
            remote,
            converter,
            master: OnceCell::new(),
            cache: OnceCell::new(),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn search(&self, query: &Query, mode: &SearchMode) -> Result<SearchOutcome, MolidError> {
        let normalized = self.normalize(query)?;
        match mode {
            SearchMode::Single(strategy) => self.resolve(*strategy, &normalized),
            SearchMode::Auto(priority) => self.search_auto(&normalized, priority),
        }
    }

    fn search_auto(
        &self,
        query: &NormalizedQuery,
        priority: &[Strategy],
    ) -> Result<SearchOutcome, MolidError> {
        for &strategy in priority {
            if let Err(reason) = self.precheck(strategy) {
                debug!(strategy = strategy.as_str(), %reason, "strategy not eligible");
                continue;
            }
            match self.resolve(strategy, query) {
                Ok(outcome) => {
                    info!(strategy = strategy.as_str(), query = %query.original, "resolved");
                    return Ok(outcome);
                }
                Err(err) if err.is_fallthrough() => {
                    debug!(strategy = strategy.as_str(), error = %err, "falling through");
                }
                Err(err) => return Err(err),
            }
        }
        Err(MolidError::not_found(
            query.original.id_type.as_str(),
            query.original.value.clone(),
        ))
    }

    pub fn normalize(&self, query: &Query) -> Result<NormalizedQuery, MolidError> {
        let value = query.value.trim();
        if value.is_empty() {
            return Err(MolidError::InvalidQuery(format!(
                "empty value for {}",
                query.id_type
            )));
        }
        let (id_type, value) = match query.id_type {
            IdentifierType::Inchikey => (IdentifierType::Inchikey, normalize_inchikey(value)),
            IdentifierType::Inchi | IdentifierType::Smiles | IdentifierType::Xyz => {
                let structure = if query.id_type == IdentifierType::Xyz {
                    query.value.as_str()
                } else {
                    value
                };
                let key = self.converter.to_inchikey(query.id_type, structure)?;
                (IdentifierType::Inchikey, normalize_inchikey(&key))
            }
            IdentifierType::Cid => (IdentifierType::Cid, parse_cid(value)?.to_string()),
            IdentifierType::Molecularformula => (
                IdentifierType::Molecularformula,
                canonicalize_formula(value),
            ),
            IdentifierType::Name | IdentifierType::Cas => (query.id_type, value.to_string()),
        };
        Ok(NormalizedQuery {
            id_type,
            value,
            original: query.clone(),
        })
    }

    /// Cheap eligibility test used by auto mode before attempting a strategy.
    pub fn precheck(&self, strategy: Strategy) -> Result<(), MolidError> {
        match strategy {
            Strategy::BulkOnly => readable_file(&self.master_db),
            Strategy::CacheOnly => readable_file(&self.cache_db),
            Strategy::RemoteWithCache => writable_parent(&self.cache_db),
            Strategy::RemoteOnly => Ok(()),
        }
    }

    pub fn resolve(
        &self,
        strategy: Strategy,
        query: &NormalizedQuery,
    ) -> Result<SearchOutcome, MolidError> {
        if !strategy.supports(query.original.id_type) {
            return Err(MolidError::UnsupportedIdentifierForStrategy {
                id_type: query.original.id_type.to_string(),
                strategy: strategy.to_string(),
            });
        }
        match strategy {
            Strategy::BulkOnly => self.resolve_bulk(query),
            Strategy::CacheOnly => self.resolve_cache(query),
            Strategy::RemoteOnly => self.resolve_remote(query),
            Strategy::RemoteWithCache => self.resolve_remote_cached(query),
        }
    }

    fn resolve_bulk(&self, query: &NormalizedQuery) -> Result<SearchOutcome, MolidError> {
        let store = self.master_store()?;
        match store.lookup_key(&query.value)? {
            Some((records, match_kind)) => {
                if match_kind == MatchKind::Connectivity {
                    info!(key = %query.value, "matched on connectivity block only");
                }
                Ok(SearchOutcome {
                    records,
                    provenance: Strategy::BulkOnly,
                    from_cache: false,
                    match_kind,
                })
            }
            None => Err(self.not_found(query)),
        }
    }

    fn resolve_cache(&self, query: &NormalizedQuery) -> Result<SearchOutcome, MolidError> {
        let records = match self.cache.get() {
            Some(cache) => cache.lookup(query.id_type, &query.value)?,
            None => QueryCache::open_readonly(&self.cache_db)?.lookup(query.id_type, &query.value)?,
        };
        if records.is_empty() {
            return Err(self.not_found(query));
        }
        Ok(SearchOutcome::exact(records, Strategy::CacheOnly, true))
    }

    fn resolve_remote(&self, query: &NormalizedQuery) -> Result<SearchOutcome, MolidError> {
        match fetch_compound(&self.remote, query.id_type, &query.value)? {
            Some(fetched) => Ok(SearchOutcome::exact(
                vec![fetched.record],
                Strategy::RemoteOnly,
                false,
            )),
            None => Err(self.not_found(query)),
        }
    }

    fn resolve_remote_cached(&self, query: &NormalizedQuery) -> Result<SearchOutcome, MolidError> {
        let cache = self.writable_cache()?;
        let cached = cache.lookup(query.id_type, &query.value)?;
        if !cached.is_empty() {
            debug!(query = %query.original, "served from cache");
            return Ok(SearchOutcome::exact(cached, Strategy::RemoteWithCache, true));
        }

        let Some(fetched) = fetch_compound(&self.remote, query.id_type, &query.value)? else {
            return Err(self.not_found(query));
        };
        let stored = cache.store_fetched(query.id_type, &query.value, &fetched)?;
        if query.original.id_type != query.id_type {
            cache.record_alias(query.original.id_type, query.original.value.trim(), stored.cid)?;
        }
        Ok(SearchOutcome::exact(
            vec![stored],
            Strategy::RemoteWithCache,
            false,
        ))
    }

    fn master_store(&self) -> Result<&CompoundStore, MolidError> {
        if let Some(store) = self.master.get() {
            return Ok(store);
        }
        let store = CompoundStore::open_readonly(&self.master_db)?;
        Ok(self.master.get_or_init(|| store))
    }

    fn writable_cache(&self) -> Result<&QueryCache, MolidError> {
        if let Some(cache) = self.cache.get() {
            return Ok(cache);
        }
        let cache = QueryCache::open(&self.cache_db)?;
        Ok(self.cache.get_or_init(|| cache))
    }

    fn not_found(&self, query: &NormalizedQuery) -> MolidError {
        MolidError::not_found(query.original.id_type.as_str(), query.original.value.clone())
    }
}

fn readable_file(path: &Path) -> Result<(), MolidError> {
    if !path.is_file() {
        return Err(MolidError::DatabaseNotFound(path.to_path_buf()));
    }
    File::open(path).map_err(|_| MolidError::DatabaseNotFound(path.to_path_buf()))?;
    Ok(())
}

fn writable_parent(path: &Path) -> Result<(), MolidError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|_| MolidError::CacheNotWritable(dir.clone()))?;
    tempfile::tempfile_in(&dir).map_err(|_| MolidError::CacheNotWritable(dir.clone()))?;
    Ok(())
}

/// Builds a query from a structure file: `.xyz`/`.extxyz` content or the first
/// InChIKey of an `.sdf`.
pub fn query_from_file(path: &Path) -> Result<Query, MolidError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "xyz" | "extxyz" => {
            let content = fs::read_to_string(path)
                .map_err(|err| MolidError::Filesystem(format!("read {}: {err}", path.display())))?;
            Ok(Query::new(IdentifierType::Xyz, content))
        }
        "sdf" => {
            let file = File::open(path)
                .map_err(|err| MolidError::Filesystem(format!("open {}: {err}", path.display())))?;
            for record in extract_compounds(BufReader::new(file)) {
                if let Some(key) = record?.inchikey {
                    return Ok(Query::new(IdentifierType::Inchikey, key));
                }
            }
            Err(MolidError::InvalidQuery(format!(
                "no InChIKey found in {}",
                path.display()
            )))
        }
        other => Err(MolidError::InvalidQuery(format!(
            "unsupported structure file extension: {other:?}"
        ))),
    }
}
