use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::Result;

/// Directory structure for all persisted files under the base directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
    pub schema_dir: PathBuf,      // schema/schema.bin
    pub documents_dir: PathBuf,   // document_log + derived.bin + usage.bin
    pub index_dir: PathBuf,       // lite.bin + main.bin
}

impl StorageLayout {
    pub const DOCUMENT_LOG_FILE: &'static str = "document_log";
    pub const DERIVED_FILE: &'static str = "derived.bin";
    pub const USAGE_FILE: &'static str = "usage.bin";

    /// Builds the layout and creates any missing directories.
    pub fn create(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let layout = StorageLayout::paths_only(base_dir);
        fs::create_dir_all(&layout.schema_dir)?;
        fs::create_dir_all(&layout.documents_dir)?;
        fs::create_dir_all(&layout.index_dir)?;
        Ok(layout)
    }

    /// Builds the layout without touching the filesystem. Used when pointing
    /// at temporary optimize directories before they exist.
    pub fn paths_only(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        StorageLayout {
            schema_dir: base_dir.join("schema"),
            documents_dir: base_dir.join("documents"),
            index_dir: base_dir.join("index"),
            base_dir,
        }
    }

    pub fn header_path(&self) -> PathBuf {
        self.base_dir.join("engine_header")
    }

    pub fn schema_path(&self) -> PathBuf {
        self.schema_dir.join("schema.bin")
    }

    pub fn document_log_path(&self) -> PathBuf {
        self.documents_dir.join(Self::DOCUMENT_LOG_FILE)
    }

    pub fn derived_path(&self) -> PathBuf {
        self.documents_dir.join(Self::DERIVED_FILE)
    }

    pub fn usage_path(&self) -> PathBuf {
        self.documents_dir.join(Self::USAGE_FILE)
    }

    pub fn lite_index_path(&self) -> PathBuf {
        self.index_dir.join("lite.bin")
    }

    pub fn main_index_path(&self) -> PathBuf {
        self.index_dir.join("main.bin")
    }

    /// Scratch directory used by `optimize` while rewriting a store. Always
    /// deleted before use; a leftover one is a sign of an interrupted run.
    pub fn optimize_tmp_dir(&self, store: &str) -> PathBuf {
        self.base_dir.join(format!("{}_optimize_tmp", store))
    }
}

/// Writes `bytes` to `path` atomically: write to a sibling temp file, sync,
/// then rename over the destination.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = temp_sibling(path);
    {
        let mut file = fs::File::create(&tmp_path)?;
        use std::io::Write;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
