use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use md5::{Digest, Md5};
use tempfile::NamedTempFile;

use crate::error::MolidError;

pub const ARCHIVE_SUFFIX: &str = ".sdf.gz";
pub const CHECKSUM_SUFFIX: &str = ".md5";

/// What is on disk for an archive before a transfer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialState {
    Missing,
    /// A well-formed gzip stream cut short; resume from this many bytes.
    Truncated(u64),
    /// Decodes to the end without error.
    Complete(u64),
    Corrupt,
}

impl PartialState {
    pub fn resumable_len(&self) -> u64 {
        match self {
            PartialState::Truncated(len) | PartialState::Complete(len) => *len,
            PartialState::Missing | PartialState::Corrupt => 0,
        }
    }
}

pub fn inspect_partial(path: &Path) -> Result<PartialState, MolidError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PartialState::Missing),
        Err(err) => return Err(MolidError::from_io(err)),
    };
    if len == 0 {
        return Ok(PartialState::Missing);
    }

    let file = File::open(path).map_err(MolidError::from_io)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    match io::copy(&mut decoder, &mut io::sink()) {
        Ok(_) => Ok(PartialState::Complete(len)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(PartialState::Truncated(len)),
        Err(_) => Ok(PartialState::Corrupt),
    }
}

pub fn validate_gz(path: &Path) -> Result<(), MolidError> {
    let file = File::open(path)
        .map_err(|err| MolidError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())
        .map_err(|err| MolidError::CorruptArchive(format!("{}: {err}", path.display())))?;
    Ok(())
}

/// Decompresses into a temp file inside `work_dir`; the file is removed when dropped.
pub fn unpack_gz(gz_path: &Path, work_dir: &Path) -> Result<NamedTempFile, MolidError> {
    fs::create_dir_all(work_dir).map_err(MolidError::from_io)?;
    let file = File::open(gz_path)
        .map_err(|err| MolidError::Filesystem(format!("open {}: {err}", gz_path.display())))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let mut out = tempfile::Builder::new()
        .prefix("molid-extract")
        .suffix(".sdf")
        .tempfile_in(work_dir)
        .map_err(MolidError::from_io)?;
    io::copy(&mut decoder, out.as_file_mut())
        .map_err(|err| MolidError::CorruptArchive(format!("{}: {err}", gz_path.display())))?;
    out.as_file_mut().flush().map_err(MolidError::from_io)?;
    Ok(out)
}

pub fn md5_hex(path: &Path) -> Result<String, MolidError> {
    let mut file = File::open(path)
        .map_err(|err| MolidError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(MolidError::from_io)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Checksum files read `<hex digest>  <file name>`; only the digest matters.
pub fn parse_checksum(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    let digest = token.to_ascii_lowercase();
    if digest.len() == 32 && digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
        Some(digest)
    } else {
        None
    }
}

pub fn remove_if_exists(path: &Path) -> Result<(), MolidError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MolidError::from_io(err)),
    }
}

pub fn available_space(path: &Path) -> Result<u64, MolidError> {
    fs4::available_space(path).map_err(MolidError::from_io)
}

#[cfg(test)]
mod tests {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn truncated_stream_is_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sdf.gz");
        let payload: Vec<u8> = (0..20_000u32).flat_map(|n| n.to_le_bytes()).collect();
        let full = gzip(&payload);

        fs::write(&path, &full).unwrap();
        assert_eq!(
            inspect_partial(&path).unwrap(),
            PartialState::Complete(full.len() as u64)
        );

        fs::write(&path, &full[..full.len() / 2]).unwrap();
        assert_eq!(
            inspect_partial(&path).unwrap(),
            PartialState::Truncated((full.len() / 2) as u64)
        );
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.sdf.gz");
        fs::write(&path, b"this is not gzip at all").unwrap();
        assert_eq!(inspect_partial(&path).unwrap(), PartialState::Corrupt);
        assert_eq!(
            inspect_partial(&dir.path().join("missing")).unwrap(),
            PartialState::Missing
        );
    }

    #[test]
    fn checksum_file_parsing() {
        assert_eq!(
            parse_checksum("D41D8CD98F00B204E9800998ECF8427E  Compound_000000001.sdf.gz\n"),
            Some("d41d8cd98f00b204e9800998ecf8427e".to_string())
        );
        assert_eq!(parse_checksum("nonsense"), None);
    }

    #[test]
    fn md5_of_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(md5_hex(&path).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
