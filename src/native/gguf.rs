//! GGUF header checks
//!
//! The llama runtime refuses an engine whose model file does not carry a readable GGUF
//! header, so a bad path fails at construction instead of leaving an engine that never
//! becomes initialized.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: u64 = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    Truncated,
}

/// Fixed-size header at the start of every GGUF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

fn read_u32(reader: &mut impl Read) -> Result<u32, GgufError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, GgufError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads and checks the GGUF header of `path`. Versions 2 and 3 are accepted.
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;

    if file.seek(SeekFrom::End(0))? < HEADER_LEN {
        return Err(GgufError::Truncated);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: read_u64(&mut file)?,
        metadata_kv_count: read_u64(&mut file)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_header(magic: u32, version: u32) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&291u64.to_le_bytes()).unwrap();
        file.write_all(&24u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_valid_header() {
        let file = write_header(GGUF_MAGIC, 3);
        let header = read_header(file.path()).unwrap();
        assert_eq!(
            header,
            GgufHeader {
                version: 3,
                tensor_count: 291,
                metadata_kv_count: 24,
            }
        );
    }

    #[test]
    fn test_invalid_magic() {
        let file = write_header(0xDEADBEEF, 3);
        assert!(matches!(
            read_header(file.path()),
            Err(GgufError::InvalidMagic(0xDEADBEEF))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let file = write_header(GGUF_MAGIC, 1);
        assert!(matches!(
            read_header(file.path()),
            Err(GgufError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();
        assert!(matches!(read_header(file.path()), Err(GgufError::Truncated)));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_header("/nonexistent/model.gguf"),
            Err(GgufError::Io(_))
        ));
    }
}
