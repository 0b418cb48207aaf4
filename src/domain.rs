use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MolidError;

pub const KEY_PREFIX_LEN: usize = 14;

static CAS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2,7})-(\d{2})-(\d)$").expect("valid CAS pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    #[value(alias = "key")]
    Inchikey,
    Inchi,
    Smiles,
    Xyz,
    Cid,
    Name,
    #[value(alias = "formula")]
    #[serde(alias = "formula")]
    Molecularformula,
    #[value(alias = "registry")]
    #[serde(alias = "registry")]
    Cas,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Inchikey => "inchikey",
            IdentifierType::Inchi => "inchi",
            IdentifierType::Smiles => "smiles",
            IdentifierType::Xyz => "xyz",
            IdentifierType::Cid => "cid",
            IdentifierType::Name => "name",
            IdentifierType::Molecularformula => "molecularformula",
            IdentifierType::Cas => "cas",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierType {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "inchikey" | "key" => Ok(IdentifierType::Inchikey),
            "inchi" => Ok(IdentifierType::Inchi),
            "smiles" | "canonicalsmiles" | "isomericsmiles" => Ok(IdentifierType::Smiles),
            "xyz" | "extxyz" => Ok(IdentifierType::Xyz),
            "cid" => Ok(IdentifierType::Cid),
            "name" | "title" => Ok(IdentifierType::Name),
            "molecularformula" | "formula" => Ok(IdentifierType::Molecularformula),
            "cas" | "registry" => Ok(IdentifierType::Cas),
            _ => Err(MolidError::InvalidIdentifierType(value.to_string())),
        }
    }
}

/// A single identifier-type/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id_type: IdentifierType,
    pub value: String,
}

impl Query {
    pub fn new(id_type: IdentifierType, value: impl Into<String>) -> Self {
        Self {
            id_type,
            value: value.into(),
        }
    }

    /// Builds a query from loosely typed pairs; anything but exactly one pair is a usage error.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, MolidError>
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut iter = pairs.into_iter();
        let (key, value) = iter.next().ok_or_else(|| {
            MolidError::InvalidQuery("expected exactly one identifier, got none".to_string())
        })?;
        let extra = iter.count();
        if extra > 0 {
            return Err(MolidError::InvalidQuery(format!(
                "expected exactly one identifier, got {}",
                extra + 1
            )));
        }
        Ok(Self::new(key.as_ref().parse()?, value))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.id_type, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[value(alias = "offline-basic")]
    #[serde(alias = "offline-basic")]
    BulkOnly,
    #[value(alias = "offline-advanced")]
    #[serde(alias = "offline-advanced")]
    CacheOnly,
    #[value(alias = "online-only")]
    #[serde(alias = "online-only")]
    RemoteOnly,
    #[value(alias = "online-cached")]
    #[serde(alias = "online-cached")]
    RemoteWithCache,
}

impl Strategy {
    pub const DEFAULT_AUTO_PRIORITY: [Strategy; 3] = [
        Strategy::BulkOnly,
        Strategy::RemoteWithCache,
        Strategy::RemoteOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::BulkOnly => "bulk-only",
            Strategy::CacheOnly => "cache-only",
            Strategy::RemoteOnly => "remote-only",
            Strategy::RemoteWithCache => "remote-with-cache",
        }
    }

    pub fn supports(&self, id_type: IdentifierType) -> bool {
        match self {
            Strategy::BulkOnly => matches!(
                id_type,
                IdentifierType::Inchikey
                    | IdentifierType::Inchi
                    | IdentifierType::Smiles
                    | IdentifierType::Xyz
            ),
            Strategy::CacheOnly | Strategy::RemoteOnly | Strategy::RemoteWithCache => true,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "bulk-only" | "offline-basic" => Ok(Strategy::BulkOnly),
            "cache-only" | "offline-advanced" => Ok(Strategy::CacheOnly),
            "remote-only" | "online-only" => Ok(Strategy::RemoteOnly),
            "remote-with-cache" | "online-cached" => Ok(Strategy::RemoteWithCache),
            _ => Err(MolidError::InvalidMode(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMode {
    Single(Strategy),
    Auto(Vec<Strategy>),
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Auto(Strategy::DEFAULT_AUTO_PRIORITY.to_vec())
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Single(strategy) => write!(f, "{strategy}"),
            SearchMode::Auto(_) => write!(f, "auto"),
        }
    }
}

impl FromStr for SearchMode {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("auto") {
            return Ok(SearchMode::default());
        }
        Ok(SearchMode::Single(value.parse()?))
    }
}

/// Whether a bulk hit matched the full key or only its connectivity prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Connectivity,
}

/// Connectivity skeleton of an InChIKey: its first block.
pub fn key_prefix(key: &str) -> &str {
    let key = key.trim();
    match key.char_indices().nth(KEY_PREFIX_LEN) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

pub fn normalize_inchikey(value: &str) -> String {
    value.trim().to_uppercase()
}

pub fn parse_cid(value: &str) -> Result<i64, MolidError> {
    let trimmed = value.trim();
    match trimmed.parse::<i64>() {
        Ok(cid) if cid > 0 => Ok(cid),
        _ => Err(MolidError::InvalidCid(value.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistryValidity {
    Malformed,
    BadChecksum,
    Valid,
}

/// Checks a CAS registry number (`NNNNNNN-NN-N`) including its check digit.
pub fn registry_validity(candidate: &str) -> RegistryValidity {
    let Some(caps) = CAS_PATTERN.captures(candidate.trim()) else {
        return RegistryValidity::Malformed;
    };
    let body = format!("{}{}", &caps[1], &caps[2]);
    let checksum: u32 = body
        .chars()
        .rev()
        .enumerate()
        .filter_map(|(idx, ch)| ch.to_digit(10).map(|digit| digit * (idx as u32 + 1)))
        .sum();
    let check = caps[3].parse::<u32>().unwrap_or(10);
    if checksum % 10 == check {
        RegistryValidity::Valid
    } else {
        RegistryValidity::BadChecksum
    }
}

pub fn is_valid_registry_number(candidate: &str) -> bool {
    registry_validity(candidate) == RegistryValidity::Valid
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundRecord {
    pub cid: i64,
    pub title: Option<String>,
    pub iupac_name: Option<String>,
    pub molecular_formula: Option<String>,
    pub molecular_weight: Option<f64>,
    pub exact_mass: Option<f64>,
    pub monoisotopic_mass: Option<f64>,
    pub charge: Option<i64>,
    pub smiles: Option<String>,
    pub connectivity_smiles: Option<String>,
    pub inchi: Option<String>,
    pub inchikey: Option<String>,
    pub xlogp: Option<f64>,
    pub tpsa: Option<f64>,
    pub complexity: Option<f64>,
    pub registry_number: Option<String>,
    pub fetched_at: Option<String>,
}

/// Coerces text or numeric descriptor values into a float; unparsable input becomes `None`.
pub fn coerce_f64(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn coerce_i64(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| coerce_f64(trimmed).map(|v| v.round() as i64))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Pending,
    Ingested,
    Failed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Pending => "pending",
            ArchiveStatus::Ingested => "ingested",
            ArchiveStatus::Failed => "failed",
        }
    }
}

impl FromStr for ArchiveStatus {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ArchiveStatus::Pending),
            "ingested" => Ok(ArchiveStatus::Ingested),
            "failed" => Ok(ArchiveStatus::Failed),
            other => Err(MolidError::Filesystem(format!(
                "unknown archive status in ledger: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanSource {
    Full,
    Incremental,
}

impl PlanSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanSource::Full => "full",
            PlanSource::Incremental => "incremental",
        }
    }
}

impl FromStr for PlanSource {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(PlanSource::Full),
            "incremental" | "monthly" => Ok(PlanSource::Incremental),
            other => Err(MolidError::Filesystem(format!(
                "unknown plan source in ledger: {other}"
            ))),
        }
    }
}
