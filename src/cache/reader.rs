use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::vec;

use tracing::{debug, info};

use crate::cache::Ledger;
use crate::cache::codec::{decode_batch, read_frame, read_header};
use crate::data::TokenBatch;
use crate::errors::PipelineError;

/// Replays a completed cache directory without re-tokenizing.
#[derive(Clone, Debug)]
pub struct CacheReader {
    dir: PathBuf,
    ledger: Ledger,
}

impl CacheReader {
    /// Reader for `dir`, or `None` when the directory has no ledger.
    pub fn open(dir: impl AsRef<Path>) -> Result<Option<Self>, PipelineError> {
        let dir = dir.as_ref();
        Ok(Ledger::load(dir)?.map(|ledger| Self::new(dir, ledger)))
    }

    /// Reader over an already loaded ledger.
    pub fn new(dir: impl Into<PathBuf>, ledger: Ledger) -> Self {
        Self {
            dir: dir.into(),
            ledger,
        }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ledger being replayed.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Lazily read the batches of one cache file.
    ///
    /// With `flatten`, every stored row becomes its own single-row batch.
    pub fn read_file(
        path: impl AsRef<Path>,
        flatten: bool,
    ) -> Result<CacheFileBatches, PipelineError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|err| PipelineError::corruption(&path, format!("cannot open: {err}")))?;
        let mut reader = BufReader::new(file);
        read_header(&mut reader, &path)?;
        debug!(path = %path.display(), flatten, "reading cache file");
        Ok(CacheFileBatches {
            reader,
            path,
            flatten,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Every batch of every ledger file, in ledger order.
    pub fn batches(&self, flatten: bool) -> LedgerBatches {
        info!(
            dir = %self.dir.display(),
            files = self.ledger.len(),
            tokens = self.ledger.total_tokens(),
            "replaying token cache"
        );
        LedgerBatches {
            files: self.ledger.file_paths(&self.dir).into_iter(),
            current: None,
            flatten,
            done: false,
        }
    }

    /// Check that every ledger file exists, decodes, and holds the recorded
    /// token count.
    pub fn verify(&self) -> Result<(), PipelineError> {
        for (entry, path) in self
            .ledger
            .entries()
            .iter()
            .zip(self.ledger.file_paths(&self.dir))
        {
            let mut tokens = 0u64;
            for batch in Self::read_file(&path, false)? {
                tokens += batch?.num_tokens();
            }
            if tokens != entry.num_tokens {
                return Err(PipelineError::corruption(
                    &path,
                    format!(
                        "ledger records {} tokens but file holds {tokens}",
                        entry.num_tokens
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Batches of one cache file, decoded frame by frame.
pub struct CacheFileBatches {
    reader: BufReader<File>,
    path: PathBuf,
    flatten: bool,
    pending: VecDeque<TokenBatch>,
    done: bool,
}

impl CacheFileBatches {
    fn read_next(&mut self) -> Result<Option<TokenBatch>, PipelineError> {
        let Some(frame) = read_frame(&mut self.reader, &self.path)? else {
            return Ok(None);
        };
        decode_batch(&frame, &self.path).map(Some)
    }
}

impl Iterator for CacheFileBatches {
    type Item = Result<TokenBatch, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Some(Ok(batch));
            }
            if self.done {
                return None;
            }
            match self.read_next() {
                Ok(Some(batch)) if self.flatten => self.pending.extend(batch.split_rows()),
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => self.done = true,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Batches of every file in a ledger, in order. Ends after the first error.
pub struct LedgerBatches {
    files: vec::IntoIter<PathBuf>,
    current: Option<CacheFileBatches>,
    flatten: bool,
    done: bool,
}

impl Iterator for LedgerBatches {
    type Item = Result<TokenBatch, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if let Some(file) = self.current.as_mut() {
                match file.next() {
                    Some(Ok(batch)) => return Some(Ok(batch)),
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            let path = self.files.next()?;
            match CacheReader::read_file(&path, self.flatten) {
                Ok(file) => self.current = Some(file),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::writer::CacheWriter;
    use crate::config::CacheConfig;
    use std::fs;
    use tempfile::tempdir;

    fn write_cache(dir: &Path, batches: &[TokenBatch], limit: u64) -> Ledger {
        let mut writer =
            CacheWriter::create(CacheConfig::new(dir).with_num_tokens_per_file(limit)).unwrap();
        for batch in batches {
            writer.write_batch(batch).unwrap();
        }
        writer.finish().unwrap().ledger
    }

    fn sample_batches() -> Vec<TokenBatch> {
        vec![
            TokenBatch::from_fields([
                ("input_ids", vec![vec![1, 2], vec![3, 4]]),
                ("attention_mask", vec![vec![1, 1], vec![1, 1]]),
            ])
            .unwrap(),
            TokenBatch::from_fields([
                ("input_ids", vec![vec![5, 6]]),
                ("attention_mask", vec![vec![1, 0]]),
            ])
            .unwrap(),
        ]
    }

    #[test]
    fn replays_batches_in_ledger_order() {
        let temp = tempdir().unwrap();
        let batches = sample_batches();
        let ledger = write_cache(temp.path(), &batches, 4);
        assert_eq!(ledger.len(), 2);

        let reader = CacheReader::open(temp.path()).unwrap().unwrap();
        reader.verify().unwrap();
        let replayed: Vec<TokenBatch> = reader.batches(false).map(Result::unwrap).collect();
        assert_eq!(replayed, batches);
    }

    #[test]
    fn flatten_yields_one_row_per_batch() {
        let temp = tempdir().unwrap();
        write_cache(temp.path(), &sample_batches(), 100);
        let reader = CacheReader::open(temp.path()).unwrap().unwrap();
        let flat: Vec<TokenBatch> = reader.batches(true).map(Result::unwrap).collect();
        assert_eq!(flat.len(), 3);
        assert!(flat.iter().all(|batch| batch.num_rows() == 1));
        assert_eq!(flat[2].field("attention_mask").unwrap(), &[vec![1, 0]]);
    }

    #[test]
    fn missing_or_truncated_files_are_corruption() {
        let temp = tempdir().unwrap();
        let ledger = write_cache(temp.path(), &sample_batches(), 4);
        let paths = ledger.file_paths(temp.path());

        let bytes = fs::read(&paths[1]).unwrap();
        fs::write(&paths[1], &bytes[..bytes.len() - 2]).unwrap();
        let reader = CacheReader::open(temp.path()).unwrap().unwrap();
        let results: Vec<_> = reader.batches(false).collect();
        assert!(results[0].is_ok());
        assert!(matches!(
            results.last(),
            Some(Err(PipelineError::CacheCorruption { .. }))
        ));
        assert!(reader.verify().is_err());

        fs::remove_file(&paths[0]).unwrap();
        let mut batches = reader.batches(false);
        assert!(matches!(
            batches.next(),
            Some(Err(PipelineError::CacheCorruption { .. }))
        ));
        assert!(batches.next().is_none());
    }

    #[test]
    fn verify_detects_token_count_mismatch() {
        let temp = tempdir().unwrap();
        let mut ledger = write_cache(temp.path(), &sample_batches(), 100);
        let entries = vec![crate::cache::LedgerEntry {
            file_name: ledger.entries()[0].file_name.clone(),
            num_tokens: 99,
        }];
        ledger = Ledger::from_entries(entries);
        let err = CacheReader::new(temp.path(), ledger).verify().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CacheCorruption { details, .. } if details.contains("99")
        ));
    }

    #[test]
    fn open_without_ledger_is_none() {
        let temp = tempdir().unwrap();
        assert!(CacheReader::open(temp.path()).unwrap().is_none());
    }
}
