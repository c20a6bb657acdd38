use serde::{Serialize, Deserialize};

/// Why a store had to recover state during `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryCause {
    None,
    DataLoss,
    InconsistentWithGroundTruth,
    TotalChecksumMismatch,
    IoError,
    SchemaChangesOutOfSync,
}

impl Default for RecoveryCause {
    fn default() -> Self {
        RecoveryCause::None
    }
}

/// Ground-truth survival status observed while opening the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataStatus {
    NoDataLoss,
    PartialLoss,
    CompleteLoss,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreRecoveryStats {
    pub latency_ms: u64,
    pub cause: RecoveryCause,
}

/// Statistics returned by a successful `initialize`.
#[derive(Debug, Clone, Default)]
pub struct InitializeStats {
    pub latency_ms: u64,
    pub num_documents: usize,
    pub num_schema_types: usize,
    pub schema_store: StoreRecoveryStats,
    pub document_store: StoreRecoveryStats,
    pub index: StoreRecoveryStats,
    pub document_store_data_status: Option<DataStatus>,
}

/// Per-stage timings and sizes for a single `put`.
#[derive(Debug, Clone, Default)]
pub struct PutStats {
    pub latency_ms: u64,
    pub document_store_latency_ms: u64,
    pub tokenization_latency_ms: u64,
    pub index_latency_ms: u64,
    pub index_merge_latency_ms: u64,
    pub document_size_bytes: usize,
    pub num_tokens_indexed: usize,
    pub exceeded_max_tokens: bool,
}

/// Outcome of a `set_schema` call.
#[derive(Debug, Clone, Default)]
pub struct SetSchemaResult {
    pub deleted_types: Vec<String>,
    pub incompatible_types: Vec<String>,
    pub index_incompatible_types: Vec<String>,
}

/// What an `optimize` run would reclaim.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizeInfo {
    pub optimizable_docs: usize,
    pub estimated_bytes: u64,
}

/// Outcome of a completed `optimize` run.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizeResult {
    pub latency_ms: u64,
    pub docs_removed: usize,
    /// Set when part of the ground truth could not be carried over and the
    /// engine continued with what survived.
    pub data_loss: bool,
}
