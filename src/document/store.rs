use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use roaring::RoaringBitmap;
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::core::error::{Error, Result};
use crate::core::stats::{DataStatus, RecoveryCause};
use crate::core::types::{Document, DocumentId, UsageReport, MAX_DOCUMENT_SIZE};
use crate::document::usage::{UsageScores, UsageStore};
use crate::storage::file::{read_checksummed, write_checksummed};
use crate::storage::layout::StorageLayout;
use crate::storage::log::RecordLog;

/// Ground-truth log entry. Supersede-by-key is implicit: a later `Put` with
/// the same (namespace, uri) retires the earlier document at replay.
/// Explicit deletions need their own entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    Put {
        document_id: DocumentId,
        document: Document,
    },
    Tombstone {
        document_id: DocumentId,
    },
}

/// Everything needed to serve metadata queries about a document without
/// touching the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    pub offset: u64,
    pub len_bytes: u64,
    pub namespace: String,
    pub uri: String,
    pub schema_type: String,
    pub creation_timestamp_ms: i64,
    pub ttl_ms: i64,
    pub score: i32,
}

impl DocMeta {
    pub fn expired(&self, now_ms: i64) -> bool {
        self.ttl_ms != 0 && self.creation_timestamp_ms + self.ttl_ms <= now_ms
    }
}

/// Snapshot of the rebuildable state, persisted so most opens avoid a full
/// log replay. `committed_log_len` is the watermark that detects both a
/// rolled-back log (partial loss) and a stale snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DerivedState {
    key_map: BTreeMap<(String, String), u32>,
    metas: BTreeMap<u32, DocMeta>,
    tombstones: Vec<u32>,
    last_document_id: Option<u32>,
    committed_log_len: u64,
}

/// What `open` had to do to arrive at a consistent state.
#[derive(Debug, Clone, Copy)]
pub struct DocumentStoreRecovery {
    pub cause: RecoveryCause,
    pub data_status: DataStatus,
    pub usage_lost: bool,
}

/// Append-only document store. The log is the only ground truth; the key
/// map, filter tables and tombstone set are all derived and rebuildable.
pub struct DocumentStore {
    log: RecordLog<LogEntry>,
    usage: UsageStore,

    key_map: HashMap<(String, String), u32>,
    metas: HashMap<u32, DocMeta>,
    tombstones: RoaringBitmap,
    namespace_docs: HashMap<String, RoaringBitmap>,
    type_docs: HashMap<String, RoaringBitmap>,
    last_document_id: Option<u32>,

    derived_path: std::path::PathBuf,
}

impl DocumentStore {
    pub fn open(layout: &StorageLayout) -> Result<(Self, DocumentStoreRecovery)> {
        let (log, scan) = RecordLog::open(layout.document_log_path())?;
        let usage = UsageStore::open(layout);
        let usage_lost = usage.lost_on_open;

        let mut store = DocumentStore {
            log,
            usage,
            key_map: HashMap::new(),
            metas: HashMap::new(),
            tombstones: RoaringBitmap::new(),
            namespace_docs: HashMap::new(),
            type_docs: HashMap::new(),
            last_document_id: None,
            derived_path: layout.derived_path(),
        };

        let mut cause = RecoveryCause::None;
        let mut committed_len = None;
        match store.try_load_derived() {
            Ok(Some(len)) => committed_len = Some(len),
            Ok(None) => {
                // Fresh store, or snapshot never written.
                if store.log.len_bytes() > 0 {
                    cause = RecoveryCause::InconsistentWithGroundTruth;
                }
            }
            Err(err) => {
                warn!(context = %err.context, "derived document state unreadable");
                cause = RecoveryCause::DataLoss;
            }
        }

        let data_status = match committed_len {
            Some(len) if len == store.log.len_bytes() && scan.lost_bytes == 0 => {
                DataStatus::NoDataLoss
            }
            Some(len) if len > store.log.len_bytes() || scan.lost_bytes > 0 => {
                // The log rewound past the committed watermark.
                if store.log.len_bytes() == 0 {
                    DataStatus::CompleteLoss
                } else {
                    DataStatus::PartialLoss
                }
            }
            Some(_) => DataStatus::NoDataLoss, // log grew past a stale snapshot
            None => {
                if scan.lost_bytes > 0 {
                    DataStatus::PartialLoss
                } else {
                    DataStatus::NoDataLoss
                }
            }
        };

        let snapshot_is_current = committed_len == Some(store.log.len_bytes());
        if !snapshot_is_current {
            if cause == RecoveryCause::None && store.log.len_bytes() > 0 {
                cause = if data_status == DataStatus::NoDataLoss {
                    RecoveryCause::InconsistentWithGroundTruth
                } else {
                    RecoveryCause::DataLoss
                };
            }
            store.rebuild_from_log()?;
        }

        Ok((
            store,
            DocumentStoreRecovery {
                cause,
                data_status,
                usage_lost,
            },
        ))
    }

    /// Appends a document, superseding any live document with the same key.
    /// The creation timestamp must already be stamped by the caller.
    pub fn put(&mut self, document: Document) -> Result<DocumentId> {
        if document.namespace.is_empty() {
            return Err(Error::invalid_argument("document namespace must not be empty"));
        }
        if document.uri.is_empty() {
            return Err(Error::invalid_argument("document uri must not be empty"));
        }
        let serialized_len = bincode::serialized_size(&document)? as usize;
        if serialized_len > MAX_DOCUMENT_SIZE {
            return Err(Error::out_of_space(format!(
                "document is {} bytes, max {}",
                serialized_len, MAX_DOCUMENT_SIZE
            )));
        }

        let next_id = match self.last_document_id {
            None => 0,
            Some(last) if last < DocumentId::MAX.value() => last + 1,
            Some(_) => {
                return Err(Error::out_of_space(
                    "document id space exhausted; run optimize",
                ));
            }
        };

        let key = (document.namespace.clone(), document.uri.clone());
        let entry = LogEntry::Put {
            document_id: DocumentId(next_id),
            document,
        };
        let offset = self.log.append(&entry)?;
        let (document_id, document) = match entry {
            LogEntry::Put { document_id, document } => (document_id, document),
            _ => unreachable!(),
        };

        if let Some(old_id) = self.key_map.insert(key, next_id) {
            self.tombstones.insert(old_id);
            self.usage.remove(DocumentId(old_id));
        }
        let len_bytes = self.log.len_bytes() - offset;
        self.index_meta(document_id, offset, len_bytes, &document);
        self.last_document_id = Some(next_id);
        Ok(document_id)
    }

    /// Fetches a live document by key.
    pub fn get(&mut self, namespace: &str, uri: &str, now_ms: i64) -> Result<Document> {
        let id = self
            .key_map
            .get(&(namespace.to_string(), uri.to_string()))
            .copied()
            .ok_or_else(|| Error::not_found(format!("({}, {}) not found", namespace, uri)))?;
        self.get_by_id(DocumentId(id), now_ms)
    }

    pub fn get_by_id(&mut self, document_id: DocumentId, now_ms: i64) -> Result<Document> {
        if !self.is_alive(document_id, now_ms) {
            return Err(Error::not_found(format!(
                "document {} not found",
                document_id.value()
            )));
        }
        let offset = self.metas[&document_id.value()].offset;
        match self.log.read_at(offset)? {
            LogEntry::Put { document, .. } => Ok(document),
            LogEntry::Tombstone { .. } => Err(Error::internal(format!(
                "meta for document {} points at a tombstone",
                document_id.value()
            ))),
        }
    }

    /// A document is live iff its key still resolves to it, it is not
    /// tombstoned, and its ttl has not elapsed.
    pub fn is_alive(&self, document_id: DocumentId, now_ms: i64) -> bool {
        let id = document_id.value();
        match self.metas.get(&id) {
            None => false,
            Some(meta) => !self.tombstones.contains(id) && !meta.expired(now_ms),
        }
    }

    pub fn meta(&self, document_id: DocumentId) -> Option<&DocMeta> {
        self.metas.get(&document_id.value())
    }

    pub fn resolve_key(&self, namespace: &str, uri: &str) -> Option<DocumentId> {
        self.key_map
            .get(&(namespace.to_string(), uri.to_string()))
            .map(|id| DocumentId(*id))
    }

    pub fn delete(&mut self, namespace: &str, uri: &str, now_ms: i64) -> Result<()> {
        let id = self
            .resolve_key(namespace, uri)
            .filter(|id| self.is_alive(*id, now_ms))
            .ok_or_else(|| Error::not_found(format!("({}, {}) not found", namespace, uri)))?;
        self.tombstone(id)?;
        Ok(())
    }

    pub fn delete_by_namespace(&mut self, namespace: &str, now_ms: i64) -> Result<usize> {
        let ids = self.collect_alive(self.namespace_docs.get(namespace), now_ms);
        if ids.is_empty() {
            return Err(Error::not_found(format!(
                "no live documents in namespace '{}'",
                namespace
            )));
        }
        for id in &ids {
            self.tombstone(*id)?;
        }
        Ok(ids.len())
    }

    pub fn delete_by_schema_type(&mut self, schema_type: &str, now_ms: i64) -> Result<usize> {
        let ids = self.collect_alive(self.type_docs.get(schema_type), now_ms);
        if ids.is_empty() {
            return Err(Error::not_found(format!(
                "no live documents of type '{}'",
                schema_type
            )));
        }
        for id in &ids {
            self.tombstone(*id)?;
        }
        Ok(ids.len())
    }

    /// Whether any live, unexpired document of this type exists. Schema
    /// compatibility checks hinge on this: a change to a type nobody uses
    /// cannot invalidate anything.
    pub fn has_live_documents(&self, schema_type: &str, now_ms: i64) -> bool {
        match self.type_docs.get(schema_type) {
            None => false,
            Some(ids) => ids.iter().any(|id| self.is_alive(DocumentId(id), now_ms)),
        }
    }

    /// Live document ids of one schema type.
    pub fn alive_ids_of_type(&self, schema_type: &str, now_ms: i64) -> Vec<DocumentId> {
        self.collect_alive(self.type_docs.get(schema_type), now_ms)
    }

    pub fn report_usage(&mut self, report: &UsageReport, now_ms: i64) -> Result<()> {
        let id = self
            .resolve_key(&report.namespace, &report.uri)
            .filter(|id| self.is_alive(*id, now_ms))
            .ok_or_else(|| {
                Error::not_found(format!(
                    "({}, {}) not found",
                    report.namespace, report.uri
                ))
            })?;
        self.usage
            .report(id, report.usage_type, report.usage_timestamp_ms);
        Ok(())
    }

    pub fn usage_scores(&self, document_id: DocumentId) -> Option<&UsageScores> {
        self.usage.get(document_id)
    }

    /// Namespaces that still hold at least one live, unexpired document.
    pub fn active_namespaces(&self, now_ms: i64) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .namespace_docs
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .any(|id| self.is_alive(DocumentId(id), now_ms))
            })
            .map(|(ns, _)| ns.clone())
            .collect();
        namespaces.sort();
        namespaces
    }

    /// Live document ids in ascending order. Used for index rebuilds and the
    /// optimize rewrite.
    pub fn alive_ids(&self, now_ms: i64) -> Vec<DocumentId> {
        let mut ids: Vec<u32> = self
            .metas
            .keys()
            .copied()
            .filter(|id| self.is_alive(DocumentId(*id), now_ms))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(DocumentId).collect()
    }

    pub fn num_alive(&self, now_ms: i64) -> usize {
        self.metas
            .keys()
            .filter(|id| self.is_alive(DocumentId(**id), now_ms))
            .count()
    }

    pub fn last_document_id(&self) -> Option<DocumentId> {
        self.last_document_id.map(DocumentId)
    }

    /// Count and byte estimate of what an optimize run would reclaim.
    pub fn optimizable_stats(&self, now_ms: i64) -> (usize, u64) {
        let mut docs = 0usize;
        let mut bytes = 0u64;
        for (id, meta) in &self.metas {
            if !self.is_alive(DocumentId(*id), now_ms) {
                docs += 1;
                bytes += meta.len_bytes;
            }
        }
        (docs, bytes)
    }

    /// Rewrites only the live documents into a fresh log under `tmp_dir`,
    /// compacting document ids. Returns the old-id to new-id mapping; the
    /// caller swaps directories and reopens.
    pub fn rewrite_live(
        &mut self,
        tmp_dir: &Path,
        now_ms: i64,
    ) -> Result<HashMap<u32, u32>> {
        std::fs::create_dir_all(tmp_dir)?;
        let (mut new_log, _) =
            RecordLog::<LogEntry>::open(tmp_dir.join(StorageLayout::DOCUMENT_LOG_FILE))?;

        let mut old_to_new = HashMap::new();
        let mut derived = DerivedState::default();
        let mut next_id = 0u32;
        for old_id in self.alive_ids(now_ms) {
            let document = self.get_by_id(old_id, now_ms)?;
            let entry = LogEntry::Put {
                document_id: DocumentId(next_id),
                document,
            };
            let offset = new_log.append(&entry)?;
            let document = match entry {
                LogEntry::Put { document, .. } => document,
                _ => unreachable!(),
            };
            old_to_new.insert(old_id.value(), next_id);

            derived.key_map.insert(
                (document.namespace.clone(), document.uri.clone()),
                next_id,
            );
            derived.metas.insert(
                next_id,
                DocMeta {
                    offset,
                    len_bytes: new_log.len_bytes() - offset,
                    namespace: document.namespace.clone(),
                    uri: document.uri.clone(),
                    schema_type: document.schema_type.clone(),
                    creation_timestamp_ms: document.creation_timestamp_ms,
                    ttl_ms: document.ttl_ms,
                    score: document.score,
                },
            );
            next_id += 1;
        }
        derived.last_document_id = next_id.checked_sub(1);
        derived.committed_log_len = new_log.len_bytes();
        new_log.sync()?;
        write_checksummed(&tmp_dir.join(StorageLayout::DERIVED_FILE), &derived)?;
        // Usage travels with the rewrite under the compacted ids, so the
        // swapped-in directory is complete.
        self.usage
            .persist_remapped(&tmp_dir.join(StorageLayout::USAGE_FILE), &old_to_new)?;

        info!(
            live = old_to_new.len(),
            removed = self.metas.len() - old_to_new.len(),
            "document log rewritten"
        );
        Ok(old_to_new)
    }

    /// Flushes the log and snapshots the derived state.
    pub fn persist(&mut self) -> Result<()> {
        self.log.sync()?;
        let derived = DerivedState {
            key_map: self
                .key_map
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            metas: self
                .metas
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            tombstones: self.tombstones.iter().collect(),
            last_document_id: self.last_document_id,
            committed_log_len: self.log.len_bytes(),
        };
        write_checksummed(&self.derived_path, &derived)?;
        self.usage.persist()
    }

    pub fn compute_checksum(&self) -> u32 {
        self.log.compute_checksum()
    }

    /// Writes a tombstone for one document and retires its key. Callers that
    /// resolve ids themselves (delete-by-query, schema-change revalidation)
    /// come through here directly.
    pub fn tombstone(&mut self, document_id: DocumentId) -> Result<()> {
        self.log.append(&LogEntry::Tombstone { document_id })?;
        let id = document_id.value();
        self.tombstones.insert(id);
        if let Some(meta) = self.metas.get(&id) {
            let key = (meta.namespace.clone(), meta.uri.clone());
            if self.key_map.get(&key) == Some(&id) {
                self.key_map.remove(&key);
            }
        }
        self.usage.remove(document_id);
        Ok(())
    }

    fn collect_alive(&self, ids: Option<&RoaringBitmap>, now_ms: i64) -> Vec<DocumentId> {
        match ids {
            None => Vec::new(),
            Some(ids) => ids
                .iter()
                .map(DocumentId)
                .filter(|id| self.is_alive(*id, now_ms))
                .collect(),
        }
    }

    fn index_meta(
        &mut self,
        document_id: DocumentId,
        offset: u64,
        len_bytes: u64,
        document: &Document,
    ) {
        let id = document_id.value();
        self.metas.insert(
            id,
            DocMeta {
                offset,
                len_bytes,
                namespace: document.namespace.clone(),
                uri: document.uri.clone(),
                schema_type: document.schema_type.clone(),
                creation_timestamp_ms: document.creation_timestamp_ms,
                ttl_ms: document.ttl_ms,
                score: document.score,
            },
        );
        self.namespace_docs
            .entry(document.namespace.clone())
            .or_default()
            .insert(id);
        self.type_docs
            .entry(document.schema_type.clone())
            .or_default()
            .insert(id);
    }

    /// Loads the derived snapshot if present. Returns its committed log
    /// watermark, or None when no snapshot exists.
    fn try_load_derived(&mut self) -> Result<Option<u64>> {
        if !self.derived_path.exists() {
            return Ok(None);
        }
        let derived: DerivedState = read_checksummed(&self.derived_path)?;

        self.key_map = derived
            .key_map
            .into_iter()
            .collect();
        self.metas = derived.metas.into_iter().collect();
        self.tombstones = derived.tombstones.into_iter().collect();
        self.last_document_id = derived.last_document_id;

        self.namespace_docs.clear();
        self.type_docs.clear();
        let metas: Vec<(u32, String, String)> = self
            .metas
            .iter()
            .map(|(id, m)| (*id, m.namespace.clone(), m.schema_type.clone()))
            .collect();
        for (id, namespace, schema_type) in metas {
            self.namespace_docs.entry(namespace).or_default().insert(id);
            self.type_docs.entry(schema_type).or_default().insert(id);
        }

        Ok(Some(derived.committed_log_len))
    }

    /// Full replay of the ground-truth log.
    fn rebuild_from_log(&mut self) -> Result<()> {
        self.key_map.clear();
        self.metas.clear();
        self.tombstones.clear();
        self.namespace_docs.clear();
        self.type_docs.clear();
        self.last_document_id = None;

        let entries = self.log.replay()?;
        info!(records = entries.len(), "rebuilding document store from log");
        let log_len = self.log.len_bytes();
        for (i, (offset, entry)) in entries.iter().enumerate() {
            let next_offset = entries
                .get(i + 1)
                .map(|(next, _)| *next)
                .unwrap_or(log_len);
            match entry {
                LogEntry::Put { document_id, document } => {
                    let key = (document.namespace.clone(), document.uri.clone());
                    if let Some(old_id) = self.key_map.insert(key, document_id.value()) {
                        self.tombstones.insert(old_id);
                    }
                    self.index_meta(*document_id, *offset, next_offset - offset, document);
                    self.last_document_id = Some(
                        self.last_document_id
                            .map(|last| last.max(document_id.value()))
                            .unwrap_or(document_id.value()),
                    );
                }
                LogEntry::Tombstone { document_id } => {
                    let id = document_id.value();
                    self.tombstones.insert(id);
                    if let Some(meta) = self.metas.get(&id) {
                        let key = (meta.namespace.clone(), meta.uri.clone());
                        if self.key_map.get(&key) == Some(&id) {
                            self.key_map.remove(&key);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
