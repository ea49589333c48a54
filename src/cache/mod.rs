//! On-disk token cache: chunked cache files plus a completion ledger.
//!
//! Layout of a cache directory:
//! - `docs-<index>.<ext>`: one chunk of packed batches, written as
//!   `docs-<index>.<ext>.partial` and renamed once durable.
//! - `ledger.json`: JSON array of `{file_name, num_tokens}` in file order. It
//!   exists only when every chunk was committed; its presence marks the cache
//!   as complete.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::cache::{CACHE_FILE_PREFIX, LEDGER_FILE, LEDGER_TMP_SUFFIX};
use crate::errors::PipelineError;
use crate::types::CacheFileName;

mod codec;
/// Replay of committed cache files.
pub mod reader;
/// Chunked cache production.
pub mod writer;

pub use reader::{CacheFileBatches, CacheReader, LedgerBatches};
pub use writer::{CacheSummary, CacheWriter, CancellationToken};

/// Name of the cache file at `index`.
pub fn cache_file_name(index: usize, extension: &str) -> CacheFileName {
    format!("{CACHE_FILE_PREFIX}{index}.{extension}")
}

/// Path of the ledger inside `dir`.
pub fn ledger_path(dir: &Path) -> PathBuf {
    dir.join(LEDGER_FILE)
}

/// One committed cache file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// File name relative to the cache directory (absolute paths are honored).
    pub file_name: CacheFileName,
    /// Tokens of the primary field stored in the file.
    pub num_tokens: u64,
}

/// Completion manifest of a cache directory, in file creation order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger with the given entries.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        Self { entries }
    }

    /// Append one committed file.
    pub fn push(&mut self, file_name: impl Into<CacheFileName>, num_tokens: u64) {
        self.entries.push(LedgerEntry {
            file_name: file_name.into(),
            num_tokens,
        });
    }

    /// Entries in file order.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Number of committed files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no file was committed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of `num_tokens` over all entries.
    pub fn total_tokens(&self) -> u64 {
        self.entries.iter().map(|entry| entry.num_tokens).sum()
    }

    /// Absolute location of every file, resolved against `dir`.
    pub fn file_paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(|entry| dir.join(&entry.file_name))
            .collect()
    }

    /// Load `dir`'s ledger; `Ok(None)` when there is none.
    pub fn load(dir: &Path) -> Result<Option<Self>, PipelineError> {
        let path = ledger_path(dir);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(PipelineError::corruption(
                    &path,
                    format!("unreadable ledger: {err}"),
                ));
            }
        };
        let ledger: Self = serde_json::from_str(&raw)
            .map_err(|err| PipelineError::corruption(&path, format!("invalid ledger: {err}")))?;
        debug!(path = %path.display(), files = ledger.len(), "loaded cache ledger");
        Ok(Some(ledger))
    }

    /// Persist into `dir` atomically (temp file, fsync, rename).
    pub fn store(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        let path = ledger_path(dir);
        let tmp_path = dir.join(format!("{LEDGER_FILE}.{LEDGER_TMP_SUFFIX}"));
        let payload = serde_json::to_vec_pretty(self)?;
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        sync_dir(dir);
        Ok(path)
    }

    /// Remove `dir`'s ledger if present.
    pub fn remove(dir: &Path) -> Result<bool, PipelineError> {
        match fs::remove_file(ledger_path(dir)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Flush directory metadata so renames survive a crash.
pub(crate) fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!(dir = %dir.display(), error = %err, "failed to sync cache directory");
    }
}
