use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::domain::{IdentifierType, normalize_inchikey};
use crate::error::MolidError;

/// Turns a structure (SMILES, InChI or XYZ block) into its InChIKey.
pub trait StructureConverter: Send + Sync {
    fn to_inchikey(&self, id_type: IdentifierType, structure: &str) -> Result<String, MolidError>;
}

/// Shells out to Open Babel's `obabel`.
#[derive(Debug, Clone)]
pub struct ObabelConverter {
    obabel: Option<PathBuf>,
}

impl ObabelConverter {
    pub fn new() -> Self {
        Self {
            obabel: find_in_path("obabel"),
        }
    }

    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        Self {
            obabel: Some(path.into()),
        }
    }

    fn run(&self, program: &Path, input_format: &str, input: &str) -> Result<String, MolidError> {
        let mut child = Command::new(program)
            .arg(format!("-i{input_format}"))
            .arg("-oinchikey")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| MolidError::Conversion(err.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"))
                .map_err(|err| MolidError::Conversion(err.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|err| MolidError::Conversion(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("command failed: {}", program.display())
            } else {
                stderr
            };
            return Err(MolidError::Conversion(message));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for ObabelConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureConverter for ObabelConverter {
    fn to_inchikey(&self, id_type: IdentifierType, structure: &str) -> Result<String, MolidError> {
        let input_format = match id_type {
            IdentifierType::Smiles => "smi",
            IdentifierType::Inchi => "inchi",
            IdentifierType::Xyz => "xyz",
            other => {
                return Err(MolidError::Conversion(format!(
                    "{other} is not a structure format"
                )));
            }
        };
        let program = self
            .obabel
            .as_ref()
            .ok_or_else(|| MolidError::MissingTool("obabel".to_string()))?;
        let stdout = self.run(program, input_format, structure.trim_end())?;
        stdout
            .lines()
            .map(str::trim)
            .find(|line| is_inchikey(line))
            .map(normalize_inchikey)
            .ok_or_else(|| MolidError::Conversion(format!("no InChIKey produced for {id_type}")))
    }
}

/// `XXXXXXXXXXXXXX-YYYYYYYYFV-P` shape check.
pub fn is_inchikey(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 3
        && parts[0].len() == 14
        && parts[1].len() == 10
        && parts[2].len() == 1
        && parts
            .iter()
            .all(|part| part.chars().all(|ch| ch.is_ascii_alphabetic()))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
