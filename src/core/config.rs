use std::path::PathBuf;

use crate::core::error::{Error, Result};

/// Engine configuration. Validated once at `initialize`; invalid values fail
/// with `InvalidArgument` before any file is touched.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_dir: PathBuf,

    pub index_merge_size: usize,        // Lite tier budget before merging into Main
    pub max_token_length: usize,        // Longer tokens are truncated, both at index and query time
    pub max_tokens_per_doc: usize,      // Excess tokens are dropped, the document still indexes

    pub default_page_size: usize,       // Used when the result spec leaves num_per_page unset
    pub result_cache_capacity: usize,   // Max concurrently cached result streams
}

impl EngineConfig {
    /// Largest accepted merge size. Leaves headroom for one page of hits on
    /// top of the buffer when deciding whether a merge is due.
    pub const MAX_INDEX_MERGE_SIZE: usize = i32::MAX as usize - 4096;

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        EngineConfig {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(Error::invalid_argument("base_dir must be provided"));
        }
        if self.index_merge_size == 0 || self.index_merge_size > Self::MAX_INDEX_MERGE_SIZE {
            return Err(Error::invalid_argument(format!(
                "index_merge_size must be in 1..={}, got {}",
                Self::MAX_INDEX_MERGE_SIZE,
                self.index_merge_size
            )));
        }
        if self.max_token_length == 0 {
            return Err(Error::invalid_argument("max_token_length must be positive"));
        }
        if self.max_tokens_per_doc == 0 {
            return Err(Error::invalid_argument("max_tokens_per_doc must be positive"));
        }
        if self.default_page_size == 0 {
            return Err(Error::invalid_argument("default_page_size must be positive"));
        }
        if self.result_cache_capacity == 0 {
            return Err(Error::invalid_argument(
                "result_cache_capacity must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            base_dir: PathBuf::from("./data"),
            index_merge_size: 1024 * 1024,  // 1MB of lite hits before a merge
            max_token_length: 30,
            max_tokens_per_doc: 8000,
            default_page_size: 10,
            result_cache_capacity: 128,
        }
    }
}
