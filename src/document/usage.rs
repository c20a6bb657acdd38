use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::core::error::Result;
use crate::core::types::{DocumentId, UsageType};
use crate::storage::file::{checksum_of, read_checksummed, write_checksummed};
use crate::storage::layout::StorageLayout;

/// Per-document usage counters and last-used timestamps, one slot per
/// usage type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageScores {
    pub counts: [u32; 3],
    pub last_used_ms: [i64; 3],
}

/// Usage data is its own small ground truth: it cannot be rebuilt from the
/// document log, so a corrupt file resets to empty rather than failing the
/// whole store open.
pub struct UsageStore {
    path: PathBuf,
    scores: BTreeMap<u32, UsageScores>,
    /// Set when the persisted file had to be discarded at open.
    pub lost_on_open: bool,
}

impl UsageStore {
    pub fn open(layout: &StorageLayout) -> Self {
        let path = layout.usage_path();
        let mut store = UsageStore {
            path,
            scores: BTreeMap::new(),
            lost_on_open: false,
        };
        if store.path.exists() {
            match read_checksummed::<BTreeMap<u32, UsageScores>>(&store.path) {
                Ok(scores) => store.scores = scores,
                Err(err) => {
                    warn!(context = %err.context, "usage store unreadable, resetting");
                    store.lost_on_open = true;
                }
            }
        }
        store
    }

    /// Applies one usage event. Counters increment; timestamps only move
    /// forward, so a late-arriving older report cannot mask a newer one.
    pub fn report(&mut self, document_id: DocumentId, usage_type: UsageType, timestamp_ms: i64) {
        let slot = usage_type.index();
        let scores = self.scores.entry(document_id.value()).or_default();
        scores.counts[slot] = scores.counts[slot].saturating_add(1);
        if timestamp_ms > scores.last_used_ms[slot] {
            scores.last_used_ms[slot] = timestamp_ms;
        }
    }

    pub fn get(&self, document_id: DocumentId) -> Option<&UsageScores> {
        self.scores.get(&document_id.value())
    }

    pub fn remove(&mut self, document_id: DocumentId) {
        self.scores.remove(&document_id.value());
    }

    /// Writes a copy of the scores keyed by the compacted ids produced by
    /// optimize, dropping entries whose documents did not survive. The
    /// in-memory state is untouched until the swapped directory is reopened.
    pub fn persist_remapped(
        &self,
        path: &std::path::Path,
        old_to_new: &std::collections::HashMap<u32, u32>,
    ) -> Result<()> {
        let remapped: BTreeMap<u32, UsageScores> = self
            .scores
            .iter()
            .filter_map(|(old_id, scores)| old_to_new.get(old_id).map(|new_id| (*new_id, *scores)))
            .collect();
        write_checksummed(path, &remapped)
    }

    pub fn clear(&mut self) {
        self.scores.clear();
    }

    pub fn persist(&self) -> Result<()> {
        write_checksummed(&self.path, &self.scores)
    }

    pub fn compute_checksum(&self) -> Result<u32> {
        checksum_of(&self.scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> UsageStore {
        let layout = StorageLayout::create(dir.path()).unwrap();
        UsageStore::open(&layout)
    }

    #[test]
    fn counters_increment_per_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut usage = store(&dir);
        usage.report(DocumentId(1), UsageType::Type1, 100);
        usage.report(DocumentId(1), UsageType::Type1, 200);
        usage.report(DocumentId(1), UsageType::Type2, 150);

        let scores = usage.get(DocumentId(1)).unwrap();
        assert_eq!(scores.counts, [2, 1, 0]);
    }

    #[test]
    fn older_timestamp_does_not_override_newer() {
        let dir = tempfile::tempdir().unwrap();
        let mut usage = store(&dir);
        usage.report(DocumentId(7), UsageType::Type1, 5000);
        usage.report(DocumentId(7), UsageType::Type1, 1000);

        let scores = usage.get(DocumentId(7)).unwrap();
        assert_eq!(scores.last_used_ms[0], 5000);
        assert_eq!(scores.counts[0], 2);
    }
}
