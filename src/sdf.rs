use std::io::{BufRead, Lines};

use tracing::warn;

use crate::domain::{CompoundRecord, coerce_f64, coerce_i64};
use crate::error::MolidError;

pub const RECORD_TERMINATOR: &str = "$$$$";

/// SDF data tag to output field name.
pub type FieldTable = &'static [(&'static str, &'static str)];

pub const PUBCHEM_FIELDS: FieldTable = &[
    ("PUBCHEM_COMPOUND_CID", "cid"),
    ("PUBCHEM_IUPAC_TRADITIONAL_NAME", "title"),
    ("PUBCHEM_IUPAC_NAME", "iupac_name"),
    ("PUBCHEM_MOLECULAR_FORMULA", "molecular_formula"),
    ("PUBCHEM_EXACT_MASS", "exact_mass"),
    ("PUBCHEM_MOLECULAR_WEIGHT", "molecular_weight"),
    ("PUBCHEM_MONOISOTOPIC_WEIGHT", "monoisotopic_mass"),
    ("PUBCHEM_MONOISOTOPIC_MASS", "monoisotopic_mass"),
    ("PUBCHEM_TOTAL_CHARGE", "charge"),
    ("PUBCHEM_SMILES", "smiles"),
    ("PUBCHEM_CONNECTIVITY_SMILES", "connectivity_smiles"),
    ("PUBCHEM_IUPAC_INCHI", "inchi"),
    ("PUBCHEM_IUPAC_INCHIKEY", "inchikey"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedRecord {
    fields: Vec<(&'static str, String)>,
}

impl ExtractedRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn set(&mut self, field: &'static str, value: String) {
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    /// `None` when the record has no usable CID, since the store is keyed by it.
    pub fn into_compound(self) -> Option<CompoundRecord> {
        let cid = self.get("cid").and_then(coerce_i64).filter(|cid| *cid > 0)?;
        let text = |field: &str| {
            self.get(field)
                .map(str::to_string)
                .filter(|value| !value.is_empty())
        };
        let number = |field: &str| self.get(field).and_then(coerce_f64);
        Some(CompoundRecord {
            cid,
            title: text("title"),
            iupac_name: text("iupac_name"),
            molecular_formula: text("molecular_formula"),
            molecular_weight: number("molecular_weight"),
            exact_mass: number("exact_mass"),
            monoisotopic_mass: number("monoisotopic_mass"),
            charge: self.get("charge").and_then(coerce_i64),
            smiles: text("smiles"),
            connectivity_smiles: text("connectivity_smiles"),
            inchi: text("inchi"),
            inchikey: text("inchikey"),
            ..CompoundRecord::default()
        })
    }
}

/// Streams records out of an SDF file in file order.
pub struct RecordExtractor<R: BufRead> {
    lines: Lines<R>,
    table: FieldTable,
}

impl<R: BufRead> RecordExtractor<R> {
    pub fn new(reader: R, table: FieldTable) -> Self {
        Self {
            lines: reader.lines(),
            table,
        }
    }

    fn field_for(&self, tag: &str) -> Option<&'static str> {
        self.table
            .iter()
            .find(|(candidate, _)| *candidate == tag)
            .map(|(_, field)| *field)
    }
}

impl<R: BufRead> Iterator for RecordExtractor<R> {
    type Item = Result<ExtractedRecord, MolidError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = ExtractedRecord::default();
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(MolidError::from_io(err))),
            };
            let line = line.trim_end();

            if line == RECORD_TERMINATOR {
                if record.is_empty() {
                    continue;
                }
                return Some(Ok(record));
            }

            let Some(tag) = header_tag(line) else {
                continue;
            };
            let Some(field) = self.field_for(tag) else {
                continue;
            };

            let mut value_lines = Vec::new();
            let mut terminated = false;
            for value_line in self.lines.by_ref() {
                let value_line = match value_line {
                    Ok(value_line) => value_line,
                    Err(err) => return Some(Err(MolidError::from_io(err))),
                };
                let value_line = value_line.trim_end();
                if value_line.is_empty() {
                    break;
                }
                if value_line == RECORD_TERMINATOR {
                    terminated = true;
                    break;
                }
                value_lines.push(value_line.to_string());
            }
            record.set(field, value_lines.join("\n").trim().to_string());

            if terminated {
                return Some(Ok(record));
            }
        }
    }
}

/// Parses `> <TAG>` (optionally followed by a registry suffix like `(1)`).
fn header_tag(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('>')?;
    let start = rest.find('<')? + 1;
    let end = rest[start..].find('>')? + start;
    Some(&rest[start..end])
}

/// Extracts compounds, dropping records that cannot be keyed.
pub fn extract_compounds<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = Result<CompoundRecord, MolidError>> {
    RecordExtractor::new(reader, PUBCHEM_FIELDS).filter_map(|record| match record {
        Ok(record) => match record.into_compound() {
            Some(compound) => Some(Ok(compound)),
            None => {
                warn!("skipping SDF record without CID");
                None
            }
        },
        Err(err) => Some(Err(err)),
    })
}
