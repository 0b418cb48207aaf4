use reqwest::Url;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::config::HttpOptions;
use crate::domain::{
    CompoundRecord, IdentifierType, coerce_f64, coerce_i64, is_valid_registry_number, parse_cid,
};
use crate::error::MolidError;
use crate::http::{build_client, handle_status, send_with_retries};

pub const PUBCHEM_REST_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/";

pub const PROPERTY_LIST: [&str; 14] = [
    "Title",
    "IUPACName",
    "MolecularFormula",
    "MolecularWeight",
    "InChI",
    "InChIKey",
    "ConnectivitySMILES",
    "SMILES",
    "XLogP",
    "ExactMass",
    "MonoisotopicMass",
    "TPSA",
    "Complexity",
    "Charge",
];

pub const NAME_HEADINGS: [&str; 3] = ["Preferred IUPAC Name", "IUPAC Name", "Systematic Name"];

/// PUG View heading filter tried before the full record.
pub const VIEW_HEADING: &str = "IUPAC Name";

pub trait RemoteLookupClient: Send + Sync {
    /// Candidate CIDs for an identifier; an unknown identifier yields an empty list.
    fn resolve_cids(&self, id_type: IdentifierType, value: &str) -> Result<Vec<i64>, MolidError>;
    fn properties(&self, cid: i64) -> Result<Option<CompoundRecord>, MolidError>;
    /// PUG View record for `cid`, narrowed to one heading when `heading` is set.
    fn view_document(
        &self,
        cid: i64,
        heading: Option<&str>,
    ) -> Result<Option<ViewDocument>, MolidError>;
    fn registry_numbers(&self, cid: i64) -> Result<Vec<String>, MolidError>;
    fn synonyms(&self, cid: i64) -> Result<Vec<String>, MolidError>;
}

/// A remote hit plus the cross-references gathered while enriching it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedCompound {
    pub record: CompoundRecord,
    pub registry_numbers: Vec<String>,
}

/// Resolves one identifier to a full record: first candidate CID, its properties,
/// then best-effort name and registry-number enrichment.
pub fn fetch_compound(
    client: &dyn RemoteLookupClient,
    id_type: IdentifierType,
    value: &str,
) -> Result<Option<FetchedCompound>, MolidError> {
    let cid = if id_type == IdentifierType::Cid {
        parse_cid(value)?
    } else {
        match client.resolve_cids(id_type, value)?.first() {
            Some(cid) => *cid,
            None => return Ok(None),
        }
    };

    let Some(mut record) = client.properties(cid)? else {
        return Ok(None);
    };

    if is_blank(&record.iupac_name) {
        record.iupac_name = view_display_name(client, cid);
        if is_blank(&record.iupac_name) {
            record.iupac_name = record.title.clone();
        }
    }

    let registry_numbers = match client.registry_numbers(cid) {
        Ok(numbers) => numbers,
        Err(err) => {
            warn!(cid, error = %err, "registry cross-reference lookup failed");
            Vec::new()
        }
    };
    record.registry_number = preferred_registry_number(&registry_numbers);
    if id_type == IdentifierType::Cas {
        let queried = value.trim().to_string();
        if record.registry_number.is_none() {
            record.registry_number = Some(queried);
        }
    }

    Ok(Some(FetchedCompound {
        record,
        registry_numbers,
    }))
}

/// Heading-filtered view first, then the whole record.
fn view_display_name(client: &dyn RemoteLookupClient, cid: i64) -> Option<String> {
    [Some(VIEW_HEADING), None].into_iter().find_map(|heading| {
        match client.view_document(cid, heading) {
            Ok(Some(doc)) => doc.display_name(),
            Ok(None) => None,
            Err(err) => {
                debug!(cid, heading, error = %err, "view lookup failed");
                None
            }
        }
    })
}

/// First checksum-valid number, else the first one listed.
pub fn preferred_registry_number(numbers: &[String]) -> Option<String> {
    numbers
        .iter()
        .find(|rn| is_valid_registry_number(rn))
        .or_else(|| numbers.first())
        .cloned()
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

#[derive(Clone)]
pub struct PubchemHttpClient {
    client: Client,
    base_url: Url,
    options: HttpOptions,
}

impl PubchemHttpClient {
    pub fn new(options: HttpOptions) -> Result<Self, MolidError> {
        Self::with_base_url(PUBCHEM_REST_BASE, options)
    }

    pub fn with_base_url(base_url: &str, options: HttpOptions) -> Result<Self, MolidError> {
        let base_url = Url::parse(base_url).map_err(|err| MolidError::Http(err.to_string()))?;
        Ok(Self {
            client: build_client(options.timeout)?,
            base_url,
            options,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, MolidError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MolidError::Http(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `None` on 404; PubChem answers unknown identifiers that way.
    fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, MolidError> {
        let response = send_with_retries(&self.options, || {
            self.client.get(url.clone()).query(query)
        })?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = handle_status(response)?;
        let body = response
            .json::<T>()
            .map_err(|err| MolidError::Json(err.to_string()))?;
        Ok(Some(body))
    }

    fn information(&self, cid: i64, operation: &[&str]) -> Result<Vec<Information>, MolidError> {
        let cid = cid.to_string();
        let mut segments = vec!["pug", "compound", "cid", cid.as_str()];
        segments.extend_from_slice(operation);
        segments.push("JSON");
        let response: Option<InformationResponse> = self.get_json(self.url(&segments)?, &[])?;
        Ok(response
            .map(|body| body.information_list.information)
            .unwrap_or_default())
    }
}

impl RemoteLookupClient for PubchemHttpClient {
    fn resolve_cids(&self, id_type: IdentifierType, value: &str) -> Result<Vec<i64>, MolidError> {
        let namespace: &[&str] = match id_type {
            IdentifierType::Cid => return Ok(vec![parse_cid(value)?]),
            IdentifierType::Inchikey => &["inchikey"],
            IdentifierType::Inchi => &["inchi"],
            IdentifierType::Smiles => &["smiles"],
            IdentifierType::Name => &["name"],
            IdentifierType::Molecularformula => &["fastformula"],
            IdentifierType::Cas => &["xref", "rn"],
            IdentifierType::Xyz => {
                return Err(MolidError::UnsupportedIdentifierForStrategy {
                    id_type: id_type.to_string(),
                    strategy: "pubchem".to_string(),
                });
            }
        };
        let mut segments = vec!["pug", "compound"];
        segments.extend_from_slice(namespace);
        segments.extend_from_slice(&[value.trim(), "cids", "JSON"]);

        let response: Option<CidResponse> = self.get_json(self.url(&segments)?, &[])?;
        Ok(response.map(CidResponse::into_cids).unwrap_or_default())
    }

    fn properties(&self, cid: i64) -> Result<Option<CompoundRecord>, MolidError> {
        let cid_text = cid.to_string();
        let properties = PROPERTY_LIST.join(",");
        let url = self.url(&[
            "pug",
            "compound",
            "cid",
            cid_text.as_str(),
            "property",
            properties.as_str(),
            "JSON",
        ])?;
        let response: Option<PropertyResponse> = self.get_json(url, &[])?;
        Ok(response
            .and_then(|body| body.property_table.properties.into_iter().next())
            .map(PropertyRow::into_record))
    }

    fn view_document(
        &self,
        cid: i64,
        heading: Option<&str>,
    ) -> Result<Option<ViewDocument>, MolidError> {
        let cid_text = cid.to_string();
        let url = self.url(&["pug_view", "data", "compound", cid_text.as_str(), "JSON"])?;
        match heading {
            Some(heading) => self.get_json(url, &[("heading", heading)]),
            None => self.get_json(url, &[]),
        }
    }

    fn registry_numbers(&self, cid: i64) -> Result<Vec<String>, MolidError> {
        Ok(self
            .information(cid, &["xrefs", "RN"])?
            .into_iter()
            .flat_map(|info| info.rn)
            .collect())
    }

    fn synonyms(&self, cid: i64) -> Result<Vec<String>, MolidError> {
        Ok(self
            .information(cid, &["synonyms"])?
            .into_iter()
            .flat_map(|info| info.synonym)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct CidResponse {
    #[serde(rename = "IdentifierList", default)]
    identifier_list: Option<IdentifierList>,
    #[serde(rename = "InformationList", default)]
    information_list: Option<InformationList>,
}

impl CidResponse {
    fn into_cids(self) -> Vec<i64> {
        if let Some(list) = self.identifier_list {
            return list.cid;
        }
        self.information_list
            .and_then(|list| list.information.into_iter().next())
            .map(|info| info.cid_list)
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct IdentifierList {
    #[serde(rename = "CID", default)]
    cid: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct InformationResponse {
    #[serde(rename = "InformationList")]
    information_list: InformationList,
}

#[derive(Debug, Default, Deserialize)]
struct InformationList {
    #[serde(rename = "Information", default)]
    information: Vec<Information>,
}

#[derive(Debug, Deserialize)]
struct Information {
    #[serde(rename = "CID", default, deserialize_with = "one_or_many")]
    cid_list: Vec<i64>,
    #[serde(rename = "RN", default)]
    rn: Vec<String>,
    #[serde(rename = "Synonym", default)]
    synonym: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PropertyResponse {
    #[serde(rename = "PropertyTable")]
    property_table: PropertyTable,
}

#[derive(Debug, Deserialize)]
struct PropertyTable {
    #[serde(rename = "Properties", default)]
    properties: Vec<PropertyRow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PropertyRow {
    #[serde(rename = "CID")]
    cid: i64,
    title: Option<String>,
    #[serde(rename = "IUPACName")]
    iupac_name: Option<String>,
    molecular_formula: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    molecular_weight: Option<f64>,
    #[serde(rename = "InChI")]
    inchi: Option<String>,
    #[serde(rename = "InChIKey")]
    inchikey: Option<String>,
    #[serde(rename = "ConnectivitySMILES")]
    connectivity_smiles: Option<String>,
    #[serde(rename = "SMILES")]
    smiles: Option<String>,
    #[serde(rename = "XLogP", default, deserialize_with = "lenient_f64")]
    xlogp: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    exact_mass: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    monoisotopic_mass: Option<f64>,
    #[serde(rename = "TPSA", default, deserialize_with = "lenient_f64")]
    tpsa: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    complexity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    charge: Option<i64>,
}

impl PropertyRow {
    fn into_record(self) -> CompoundRecord {
        CompoundRecord {
            cid: self.cid,
            title: self.title,
            iupac_name: self.iupac_name,
            molecular_formula: self.molecular_formula,
            molecular_weight: self.molecular_weight,
            exact_mass: self.exact_mass,
            monoisotopic_mass: self.monoisotopic_mass,
            charge: self.charge,
            smiles: self.smiles,
            connectivity_smiles: self.connectivity_smiles,
            inchi: self.inchi,
            inchikey: self.inchikey,
            xlogp: self.xlogp,
            tpsa: self.tpsa,
            complexity: self.complexity,
            ..CompoundRecord::default()
        }
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => coerce_f64(&s),
        _ => None,
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        Some(serde_json::Value::String(s)) => coerce_i64(&s),
        _ => None,
    })
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(i64),
        Many(Vec<i64>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(cid)) => vec![cid],
        Some(OneOrMany::Many(cids)) => cids,
        None => Vec::new(),
    })
}

/// PUG View per-compound document, reduced to the section tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewDocument {
    #[serde(rename = "Record", default)]
    pub record: ViewRecord,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewRecord {
    #[serde(rename = "Section", default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Section {
    #[serde(rename = "TOCHeading", default)]
    pub heading: Option<String>,
    #[serde(rename = "Section", default)]
    pub sections: Vec<Section>,
    #[serde(rename = "Information", default)]
    pub information: Vec<SectionInformation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectionInformation {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Value", default)]
    pub value: Option<InformationValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InformationValue {
    #[serde(rename = "StringWithMarkup", default)]
    pub string_with_markup: Vec<Markup>,
    #[serde(rename = "StringList", default)]
    pub string_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Markup {
    #[serde(rename = "String", default)]
    pub string: Option<String>,
}

impl InformationValue {
    fn first_text(&self) -> Option<String> {
        self.string_with_markup
            .iter()
            .filter_map(|markup| markup.string.as_deref())
            .chain(self.string_list.iter().map(String::as_str))
            .map(str::trim)
            .find(|text| !text.is_empty())
            .map(str::to_string)
    }
}

impl ViewDocument {
    /// Depth-first walk in document order; the first name under a naming heading wins.
    pub fn display_name(&self) -> Option<String> {
        let mut stack: Vec<&Section> = self.record.sections.iter().rev().collect();
        while let Some(section) = stack.pop() {
            let heading_matches = section
                .heading
                .as_deref()
                .is_some_and(|heading| NAME_HEADINGS.contains(&heading));
            for info in &section.information {
                let info_matches = info
                    .name
                    .as_deref()
                    .is_some_and(|name| NAME_HEADINGS.contains(&name));
                if heading_matches || info_matches {
                    if let Some(text) = info.value.as_ref().and_then(InformationValue::first_text)
                    {
                        return Some(text);
                    }
                }
            }
            stack.extend(section.sections.iter().rev());
        }
        None
    }
}
