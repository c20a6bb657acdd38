use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::core::error::{Error, Result};

const RECORD_HEADER_SIZE: u64 = 8; // u32 length + u32 crc

/// Append-only log of checksummed bincode records. This is the ground truth
/// of the document store: every record is framed as
/// `[len: u32][crc32: u32][payload]` so a torn tail from a crash is detected
/// and dropped at open.
pub struct RecordLog<T> {
    file: File,
    path: PathBuf,
    len_bytes: u64,
    /// Running CRC over every byte of the valid log, maintained on append so
    /// checksum reads never rescan the file.
    hasher: crc32fast::Hasher,
    _record: PhantomData<T>,
}

/// What the open-time scan found.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogScan {
    pub num_records: usize,
    /// Bytes dropped from a torn or corrupt tail.
    pub lost_bytes: u64,
}

impl<T: Serialize + DeserializeOwned> RecordLog<T> {
    /// Opens (or creates) the log, scans it for the last valid record
    /// boundary and physically truncates anything past it.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, LogScan)> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let mut hasher = crc32fast::Hasher::new();
        let (valid_len, num_records) = scan_valid_prefix(&mut file, file_len, &mut hasher)?;

        let scan = LogScan {
            num_records,
            lost_bytes: file_len - valid_len,
        };
        if scan.lost_bytes > 0 {
            warn!(
                path = %path.display(),
                lost_bytes = scan.lost_bytes,
                "dropping torn tail from record log"
            );
            file.set_len(valid_len)?;
        }

        Ok((
            RecordLog {
                file,
                path,
                len_bytes: valid_len,
                hasher,
                _record: PhantomData,
            },
            scan,
        ))
    }

    /// Appends one record and returns its byte offset.
    pub fn append(&mut self, record: &T) -> Result<u64> {
        let payload = bincode::serialize(record)?;
        let crc = crc32fast::hash(&payload);
        let offset = self.len_bytes;

        let len_bytes = (payload.len() as u32).to_le_bytes();
        let crc_bytes = crc.to_le_bytes();
        self.file.write_all(&len_bytes)?;
        self.file.write_all(&crc_bytes)?;
        self.file.write_all(&payload)?;

        self.hasher.update(&len_bytes);
        self.hasher.update(&crc_bytes);
        self.hasher.update(&payload);
        self.len_bytes += RECORD_HEADER_SIZE + payload.len() as u64;
        Ok(offset)
    }

    /// Reads the record starting at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<T> {
        if offset >= self.len_bytes {
            return Err(Error::internal(format!(
                "log offset {} past end {}",
                offset, self.len_bytes
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; 8];
        self.file.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(Error::data_loss(format!(
                "checksum mismatch in record log at offset {}",
                offset
            )));
        }
        Ok(bincode::deserialize(&payload)?)
    }

    /// Replays every record from the beginning, yielding (offset, record).
    pub fn replay(&mut self) -> Result<Vec<(u64, T)>> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset < self.len_bytes {
            let record = self.read_at(offset)?;
            let next = next_offset(&mut self.file, offset)?;
            entries.push((offset, record));
            offset = next;
        }
        Ok(entries)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn len_bytes(&self) -> u64 {
        self.len_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// CRC32 over the entire valid log contents.
    pub fn compute_checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// Walks record frames from the start, feeding valid bytes into `hasher`,
/// and returns (valid byte length, record count).
fn scan_valid_prefix(
    file: &mut File,
    file_len: u64,
    hasher: &mut crc32fast::Hasher,
) -> Result<(u64, usize)> {
    let mut offset = 0u64;
    let mut count = 0usize;
    file.seek(SeekFrom::Start(0))?;

    loop {
        if offset + RECORD_HEADER_SIZE > file_len {
            break;
        }
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if offset + RECORD_HEADER_SIZE + len > file_len {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            break;
        }
        hasher.update(&header);
        hasher.update(&payload);
        offset += RECORD_HEADER_SIZE + len;
        count += 1;
    }

    Ok((offset, count))
}

fn next_offset(file: &mut File, offset: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
    Ok(offset + RECORD_HEADER_SIZE + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: u32,
        body: String,
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let (mut log, scan) = RecordLog::<Entry>::open(&path).unwrap();
        assert_eq!(scan.num_records, 0);

        let a = Entry { id: 1, body: "one".into() };
        let b = Entry { id: 2, body: "two".into() };
        let off_a = log.append(&a).unwrap();
        let off_b = log.append(&b).unwrap();

        assert_eq!(log.read_at(off_a).unwrap(), a);
        assert_eq!(log.read_at(off_b).unwrap(), b);

        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].1, b);
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        {
            let (mut log, _) = RecordLog::<Entry>::open(&path).unwrap();
            log.append(&Entry { id: 1, body: "keep".into() }).unwrap();
            log.append(&Entry { id: 2, body: "torn".into() }).unwrap();
        }

        // Chop a few bytes off the final record to simulate a crash mid-write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let (mut log, scan) = RecordLog::<Entry>::open(&path).unwrap();
        assert_eq!(scan.num_records, 1);
        assert!(scan.lost_bytes > 0);
        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].1.body, "keep");
    }
}
