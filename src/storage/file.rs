use std::fs;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::error::{Error, Result};
use crate::storage::layout::write_atomically;

/// Serializes `value` as `[crc32: u32][bincode payload]` and writes it
/// atomically. Derived files, index snapshots and the schema all use this
/// framing so tampering and partial writes are caught at load.
pub fn write_checksummed<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)?;
    let crc = crc32fast::hash(&payload);

    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&payload);
    write_atomically(path, &bytes)
}

/// Reads a file written by [`write_checksummed`]. Returns `DataLoss` when the
/// stored checksum does not match the payload.
pub fn read_checksummed<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::data_loss(format!(
            "checksummed file too short: {}",
            path.display()
        )));
    }
    let crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let payload = &bytes[4..];
    if crc32fast::hash(payload) != crc {
        return Err(Error::data_loss(format!(
            "checksum mismatch: {}",
            path.display()
        )));
    }
    Ok(bincode::deserialize(payload)?)
}

/// CRC32 of the payload a checksummed file would hold for `value`. Used to
/// fold store states into the combined header checksum.
pub fn checksum_of<T: Serialize>(value: &T) -> Result<u32> {
    let payload = bincode::serialize(value)?;
    Ok(crc32fast::hash(&payload))
}
