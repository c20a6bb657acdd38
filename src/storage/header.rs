use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::file::{read_checksummed, write_checksummed};

const HEADER_MAGIC: u32 = 0x4C44_5354; // "LDST"
const FORMAT_VERSION: u32 = 1;

/// Small file at the base directory tying the three stores together. The
/// combined checksum folds each store's checksum, so any single store being
/// swapped or rolled back independently is detected on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHeader {
    pub magic: u32,
    pub version: u32,
    pub combined_checksum: u32,
    pub written_at: DateTime<Utc>,
}

impl EngineHeader {
    pub fn new(combined_checksum: u32) -> Self {
        EngineHeader {
            magic: HEADER_MAGIC,
            version: FORMAT_VERSION,
            combined_checksum,
            written_at: Utc::now(),
        }
    }

    /// Folds the per-store checksums into a single value.
    pub fn combine_checksums(schema: u32, documents: u32, index: u32) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&schema.to_le_bytes());
        hasher.update(&documents.to_le_bytes());
        hasher.update(&index.to_le_bytes());
        hasher.finalize()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_checksummed(path, self)
    }

    /// Loads and verifies magic and version. A malformed or mismatching
    /// header reads as `DataLoss` so the caller can take the recovery path.
    pub fn read(path: &Path) -> Result<Self> {
        let header: EngineHeader = read_checksummed(path).map_err(|err| match err.kind {
            ErrorKind::DataLoss => err,
            _ => Error::data_loss(format!("unreadable header: {}", err.context)),
        })?;
        if header.magic != HEADER_MAGIC {
            return Err(Error::data_loss(format!(
                "bad header magic {:#x}",
                header.magic
            )));
        }
        if header.version != FORMAT_VERSION {
            return Err(Error::data_loss(format!(
                "unsupported header version {}",
                header.version
            )));
        }
        Ok(header)
    }
}
