use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::cache::codec::{encode_batch, write_frame, write_header};
use crate::cache::{Ledger, cache_file_name, sync_dir};
use crate::config::CacheConfig;
use crate::constants::cache::{CACHE_FILE_PREFIX, PARTIAL_SUFFIX};
use crate::data::TokenBatch;
use crate::errors::PipelineError;

/// Shared flag used to interrupt cache production.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once `cancel` was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result of a completed cache write.
#[derive(Clone, Debug)]
pub struct CacheSummary {
    /// Ledger as persisted.
    pub ledger: Ledger,
    /// Path of the last committed file, if any batch was written.
    pub final_file: Option<PathBuf>,
}

struct OpenFile {
    index: usize,
    file_name: String,
    partial_path: PathBuf,
    writer: BufWriter<File>,
    num_tokens: u64,
    batches: usize,
}

/// Writes packed batches into size-bounded cache files and commits a ledger.
///
/// A file is closed before the batch that would push it past
/// `num_tokens_per_file`, unless it is still empty: a single oversized batch
/// always gets its own file and files are never split mid-batch. Dropping a
/// writer without `finish` removes the in-progress file and writes no ledger.
pub struct CacheWriter {
    config: CacheConfig,
    ledger: Ledger,
    current: Option<OpenFile>,
    next_index: usize,
}

impl CacheWriter {
    /// Prepare `config.out_dir` and open the first cache file.
    ///
    /// A ledger left in the directory is removed first, together with every
    /// cache file and partial file of an earlier run, so the directory only
    /// ever holds files the next ledger will name.
    pub fn create(config: CacheConfig) -> Result<Self, PipelineError> {
        let config = config.validated()?;
        fs::create_dir_all(&config.out_dir)?;
        if Ledger::remove(&config.out_dir)? {
            warn!(dir = %config.out_dir.display(), "removed stale cache ledger");
        }
        let removed = remove_stale_cache_files(&config.out_dir, &config.file_extension)?;
        if removed > 0 {
            warn!(dir = %config.out_dir.display(), removed, "removed stale cache files");
        }
        let mut writer = Self {
            config,
            ledger: Ledger::new(),
            current: None,
            next_index: 0,
        };
        let first = writer.open_next()?;
        writer.current = Some(first);
        Ok(writer)
    }

    /// Cache directory.
    pub fn out_dir(&self) -> &Path {
        &self.config.out_dir
    }

    /// Entries committed so far.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Append one batch. Returns the path of a file that was committed to
    /// make room for it.
    pub fn write_batch(&mut self, batch: &TokenBatch) -> Result<Option<PathBuf>, PipelineError> {
        batch.validate()?;
        if batch.is_empty() {
            debug!("skipping empty batch");
            return Ok(None);
        }
        let batch_tokens = batch.num_tokens();
        let limit = self.config.num_tokens_per_file;
        let rotate = self
            .current
            .as_ref()
            .is_some_and(|file| file.batches > 0 && file.num_tokens + batch_tokens > limit);
        let committed = if rotate { self.close_current()? } else { None };
        let open = match self.current.take() {
            Some(open) => open,
            None => self.open_next()?,
        };
        let file = self.current.insert(open);
        write_frame(&mut file.writer, &encode_batch(batch))?;
        file.num_tokens += batch_tokens;
        file.batches += 1;
        Ok(committed)
    }

    /// Commit the last file (or delete it when empty) and persist the ledger.
    pub fn finish(mut self) -> Result<CacheSummary, PipelineError> {
        let final_file = self.close_current()?;
        let ledger = std::mem::take(&mut self.ledger);
        let path = ledger.store(&self.config.out_dir)?;
        info!(
            ledger = %path.display(),
            files = ledger.len(),
            tokens = ledger.total_tokens(),
            "committed cache ledger"
        );
        Ok(CacheSummary { ledger, final_file })
    }

    /// Abandon production: delete the in-progress file, write no ledger.
    pub fn abort(mut self) -> Result<(), PipelineError> {
        self.discard_current()
    }

    /// Drain `batches` into the cache, calling `on_file` with each committed
    /// path (the last one after the ledger is written).
    ///
    /// `cancel` is checked before every batch. On cancellation or any error
    /// the in-progress file is deleted and no ledger is written.
    pub fn write_all<I, F>(
        mut self,
        batches: I,
        cancel: &CancellationToken,
        mut on_file: F,
    ) -> Result<Ledger, PipelineError>
    where
        I: IntoIterator<Item = Result<TokenBatch, PipelineError>>,
        F: FnMut(&Path),
    {
        let mut batches = batches.into_iter();
        loop {
            if cancel.is_cancelled() {
                warn!(dir = %self.out_dir().display(), "cache production cancelled");
                return Err(self.fail(PipelineError::Cancelled));
            }
            let Some(batch) = batches.next() else {
                break;
            };
            match batch.and_then(|batch| self.write_batch(&batch)) {
                Ok(Some(path)) => {
                    debug!(path = %path.display(), "cache file committed");
                    on_file(&path);
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
        let summary = self.finish()?;
        if let Some(path) = &summary.final_file {
            on_file(path);
        }
        Ok(summary.ledger)
    }

    fn fail(self, err: PipelineError) -> PipelineError {
        if let Err(cleanup) = self.abort() {
            warn!(error = %cleanup, "failed to remove partial cache file");
        }
        err
    }

    fn open_next(&mut self) -> Result<OpenFile, PipelineError> {
        let index = self.next_index;
        let file_name = cache_file_name(index, &self.config.file_extension);
        let partial_path = self
            .config
            .out_dir
            .join(format!("{file_name}.{PARTIAL_SUFFIX}"));
        let mut writer = BufWriter::new(File::create(&partial_path)?);
        write_header(&mut writer)?;
        debug!(path = %partial_path.display(), index, "opened cache file");
        self.next_index += 1;
        Ok(OpenFile {
            index,
            file_name,
            partial_path,
            writer,
            num_tokens: 0,
            batches: 0,
        })
    }

    /// Make the open file durable under its final name and record it.
    fn close_current(&mut self) -> Result<Option<PathBuf>, PipelineError> {
        let Some(open) = self.current.take() else {
            return Ok(None);
        };
        if open.batches == 0 {
            drop(open.writer);
            remove_if_exists(&open.partial_path)?;
            self.next_index = open.index;
            return Ok(None);
        }
        let file = open.writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);
        let final_path = self.config.out_dir.join(&open.file_name);
        fs::rename(&open.partial_path, &final_path)?;
        sync_dir(&self.config.out_dir);
        debug!(
            path = %final_path.display(),
            tokens = open.num_tokens,
            batches = open.batches,
            "closed cache file"
        );
        self.ledger.push(open.file_name, open.num_tokens);
        Ok(Some(final_path))
    }

    fn discard_current(&mut self) -> Result<(), PipelineError> {
        if let Some(open) = self.current.take() {
            drop(open.writer);
            remove_if_exists(&open.partial_path)?;
            debug!(path = %open.partial_path.display(), "removed partial cache file");
        }
        Ok(())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let Err(err) = self.discard_current() {
            warn!(error = %err, "failed to remove partial cache file");
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Delete `docs-*.{extension}` files and `docs-*` partial files in `dir`.
fn remove_stale_cache_files(dir: &Path, extension: &str) -> Result<usize, PipelineError> {
    let committed_suffix = format!(".{extension}");
    let partial_suffix = format!(".{PARTIAL_SUFFIX}");
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let stale = name.starts_with(CACHE_FILE_PREFIX)
            && (name.ends_with(&committed_suffix) || name.ends_with(&partial_suffix));
        if stale {
            remove_if_exists(&entry.path())?;
            debug!(path = %entry.path().display(), "removed stale cache file");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::reader::CacheReader;
    use tempfile::tempdir;

    fn batch_of(lengths: &[usize]) -> TokenBatch {
        TokenBatch::from_input_ids(lengths.iter().map(|len| vec![7; *len]).collect())
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rotates_before_the_batch_that_would_overflow() {
        let temp = tempdir().unwrap();
        let config = CacheConfig::new(temp.path()).with_num_tokens_per_file(10);
        let mut writer = CacheWriter::create(config).unwrap();

        assert_eq!(writer.write_batch(&batch_of(&[4])).unwrap(), None);
        assert_eq!(writer.write_batch(&batch_of(&[6])).unwrap(), None);
        let committed = writer.write_batch(&batch_of(&[1])).unwrap();
        assert_eq!(committed, Some(temp.path().join("docs-0.bin")));

        let summary = writer.finish().unwrap();
        assert_eq!(summary.final_file, Some(temp.path().join("docs-1.bin")));
        let tokens: Vec<u64> = summary.ledger.entries().iter().map(|e| e.num_tokens).collect();
        assert_eq!(tokens, vec![10, 1]);
        assert_eq!(
            dir_names(temp.path()),
            vec!["docs-0.bin", "docs-1.bin", "ledger.json"]
        );
    }

    #[test]
    fn oversized_batch_gets_its_own_file() {
        let temp = tempdir().unwrap();
        let config = CacheConfig::new(temp.path()).with_num_tokens_per_file(4);
        let mut writer = CacheWriter::create(config).unwrap();
        assert_eq!(writer.write_batch(&batch_of(&[9])).unwrap(), None);
        assert!(writer.write_batch(&batch_of(&[2])).unwrap().is_some());
        assert!(writer.write_batch(&batch_of(&[5, 5])).unwrap().is_some());
        let summary = writer.finish().unwrap();
        let tokens: Vec<u64> = summary.ledger.entries().iter().map(|e| e.num_tokens).collect();
        assert_eq!(tokens, vec![9, 2, 10]);
    }

    #[test]
    fn empty_run_commits_empty_ledger_and_no_files() {
        let temp = tempdir().unwrap();
        let mut writer = CacheWriter::create(CacheConfig::new(temp.path())).unwrap();
        assert_eq!(writer.write_batch(&TokenBatch::new()).unwrap(), None);
        let summary = writer.finish().unwrap();
        assert!(summary.final_file.is_none());
        assert!(summary.ledger.is_empty());
        assert_eq!(dir_names(temp.path()), vec!["ledger.json"]);
    }

    #[test]
    fn abort_and_drop_leave_no_partial_file_or_ledger() {
        let temp = tempdir().unwrap();
        let mut writer = CacheWriter::create(CacheConfig::new(temp.path())).unwrap();
        writer.write_batch(&batch_of(&[3])).unwrap();
        writer.abort().unwrap();
        assert!(dir_names(temp.path()).is_empty());

        let mut dropped = CacheWriter::create(CacheConfig::new(temp.path())).unwrap();
        dropped.write_batch(&batch_of(&[3])).unwrap();
        drop(dropped);
        assert!(dir_names(temp.path()).is_empty());
    }

    #[test]
    fn write_all_reports_files_and_honors_cancellation() {
        let temp = tempdir().unwrap();
        let config = CacheConfig::new(temp.path()).with_num_tokens_per_file(5);
        let batches = (0..4).map(|_| Ok(batch_of(&[5])));
        let mut seen = Vec::new();
        let ledger = CacheWriter::create(config.clone())
            .unwrap()
            .write_all(batches, &CancellationToken::new(), |path| {
                seen.push(path.to_path_buf())
            })
            .unwrap();
        assert_eq!(ledger.len(), 4);
        assert_eq!(seen, ledger.file_paths(temp.path()));
        assert!(CacheReader::open(temp.path()).unwrap().is_some());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let batches = (0..4).map(move |n| {
            if n == 2 {
                trigger.cancel();
            }
            Ok(batch_of(&[5]))
        });
        let err = CacheWriter::create(config)
            .unwrap()
            .write_all(batches, &cancel, |_| {})
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!temp.path().join("ledger.json").exists());
        assert!(dir_names(temp.path()).iter().all(|name| !name.ends_with(".partial")));
    }

    #[test]
    fn create_clears_files_of_an_earlier_run() {
        let temp = tempdir().unwrap();
        let config = CacheConfig::new(temp.path()).with_num_tokens_per_file(2);
        let mut first = CacheWriter::create(config.clone()).unwrap();
        for _ in 0..5 {
            first.write_batch(&batch_of(&[2])).unwrap();
        }
        first.finish().unwrap();
        fs::write(temp.path().join("docs-9.bin.partial"), b"torn").unwrap();
        fs::write(temp.path().join("notes.txt"), b"keep me").unwrap();

        let mut second = CacheWriter::create(config).unwrap();
        second.write_batch(&batch_of(&[2])).unwrap();
        let summary = second.finish().unwrap();
        assert_eq!(summary.ledger.len(), 1);
        assert_eq!(
            dir_names(temp.path()),
            vec!["docs-0.bin", "ledger.json", "notes.txt"]
        );
    }

    #[test]
    fn rotation_reopens_the_next_file_on_demand() {
        let temp = tempdir().unwrap();
        let config = CacheConfig::new(temp.path()).with_num_tokens_per_file(3);
        let mut writer = CacheWriter::create(config).unwrap();
        for _ in 0..3 {
            writer.write_batch(&batch_of(&[3])).unwrap();
        }
        assert_eq!(
            dir_names(temp.path()),
            vec!["docs-0.bin", "docs-1.bin", "docs-2.bin.partial"]
        );
        let summary = writer.finish().unwrap();
        assert_eq!(summary.final_file, Some(temp.path().join("docs-2.bin")));
    }

    #[test]
    fn write_all_propagates_source_errors_without_ledger() {
        let temp = tempdir().unwrap();
        let batches = vec![
            Ok(batch_of(&[2])),
            Err(PipelineError::Tokenizer("bad document".into())),
        ];
        let err = CacheWriter::create(CacheConfig::new(temp.path()))
            .unwrap()
            .write_all(batches, &CancellationToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, PipelineError::Tokenizer(_)));
        assert!(dir_names(temp.path()).is_empty());
    }
}
