//! Background cache production with cache-hit replay behind one interface.
//!
//! Lifecycle:
//! - `Uninitialized -> ReplayingCache` when a ledger exists at `stream()`.
//! - `Uninitialized -> Producing -> Complete` otherwise.
//! - `Producing -> Failed` on cancellation, worker error, or worker loss.
//!
//! The worker owns the cache directory while producing and reports each
//! committed file over an unbounded channel, ending with a `Finished`
//! sentinel sent after the ledger is durable.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheFileBatches, CacheReader, CacheWriter, CancellationToken, Ledger, LedgerBatches,
};
use crate::config::{CacheConfig, PipelineConfig};
use crate::constants::pipeline::{
    WORKER_DISCONNECTED_REASON, WORKER_PANICKED_REASON, WORKER_THREAD_NAME,
};
use crate::data::TokenBatch;
use crate::errors::PipelineError;
use crate::packer::SequencePacker;
use crate::sampler::{StreamMap, WeightedSampler};
use crate::tokenize::{DocumentBatcher, Tokenizer};
use crate::types::DocumentText;

/// Packed batches feeding the cache writer.
pub type BatchSource = Box<dyn Iterator<Item = Result<TokenBatch, PipelineError>> + Send>;

/// Builds the batch source; invoked at most once, inside the worker.
pub type SourceFactory = Box<dyn FnOnce() -> Result<BatchSource, PipelineError> + Send>;

/// Lifecycle state of a [`CachingPipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// `stream()` has not been called yet.
    Uninitialized,
    /// A completed ledger was found; batches come from disk.
    ReplayingCache,
    /// The worker is tokenizing and writing cache files.
    Producing,
    /// The worker committed the ledger.
    Complete,
    /// Production was cancelled, failed, or the worker disappeared.
    Failed,
}

/// Worker-to-consumer notification.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A cache file was committed and can be read.
    FileReady(PathBuf),
    /// Completion sentinel, sent after the ledger write.
    Finished(Ledger),
    /// Production stopped with an error.
    Failed(PipelineError),
}

type SharedState = Arc<Mutex<PipelineState>>;

fn set_state(state: &SharedState, next: PipelineState) {
    let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = next;
}

fn read_state(state: &SharedState) -> PipelineState {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mixed, packed, cached stream: replays a completed cache or produces one
/// in the background while streaming it.
pub struct CachingPipeline {
    config: CacheConfig,
    factory: Option<SourceFactory>,
    state: SharedState,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    flatten: bool,
}

impl CachingPipeline {
    /// Pipeline over `config.out_dir`. `factory` runs only if production is needed.
    pub fn new<F>(config: CacheConfig, factory: F) -> Self
    where
        F: FnOnce() -> Result<BatchSource, PipelineError> + Send + 'static,
    {
        Self {
            config,
            factory: Some(Box::new(factory)),
            state: Arc::new(Mutex::new(PipelineState::Uninitialized)),
            cancel: CancellationToken::new(),
            worker: None,
            flatten: false,
        }
    }

    /// Pipeline wired from a full config: weighted mixture of `streams`,
    /// batched, tokenized with `tokenizer`, and packed.
    ///
    /// The sampler and packer are validated here; documents are read only
    /// once production starts.
    pub fn from_config<K>(
        config: &PipelineConfig,
        streams: StreamMap<DocumentText>,
        tokenizer: K,
    ) -> Result<Self, PipelineError>
    where
        K: Tokenizer + 'static,
    {
        let config = config.clone().validated()?;
        let sampler = WeightedSampler::from_config(streams, &config.sampling)?;
        let packer = SequencePacker::new(config.packing)?;
        let batch_size = config.packing.batch_size;
        Ok(Self::new(config.cache, move || {
            production_source(sampler, tokenizer, batch_size, packer)
        }))
    }

    /// Re-frame every row as its own single-row batch when streaming.
    pub fn with_flatten(mut self, flatten: bool) -> Self {
        self.flatten = flatten;
        self
    }

    /// Cache directory.
    pub fn out_dir(&self) -> &Path {
        &self.config.out_dir
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        read_state(&self.state)
    }

    /// Returns `true` once a production worker was spawned.
    pub fn worker_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Ask the worker to stop; the in-progress file is deleted and no ledger
    /// is written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this pipeline's worker.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start streaming: replay the cache when its ledger exists, otherwise
    /// spawn the worker and follow the files it commits.
    pub fn stream(&mut self) -> Result<CachedStream, PipelineError> {
        if self.worker.is_some() {
            return Err(PipelineError::Configuration(
                "cache worker already started for this pipeline".into(),
            ));
        }
        let config = self.config.clone().validated()?;
        if let Some(reader) = CacheReader::open(&config.out_dir)? {
            set_state(&self.state, PipelineState::ReplayingCache);
            return Ok(CachedStream {
                inner: StreamInner::Replay(reader.batches(self.flatten)),
                done: false,
            });
        }

        let factory = self.factory.take().ok_or_else(|| {
            PipelineError::Configuration("batch source factory was already consumed".into())
        })?;
        let (sender, receiver) = mpsc::channel();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        set_state(&self.state, PipelineState::Producing);
        info!(dir = %config.out_dir.display(), "no cache ledger; starting cache worker");
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || run_worker(config, factory, cancel, sender, state));
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                set_state(&self.state, PipelineState::Failed);
                return Err(err.into());
            }
        };
        self.worker = Some(handle);
        Ok(CachedStream {
            inner: StreamInner::Live {
                receiver,
                current: None,
                flatten: self.flatten,
                state: Arc::clone(&self.state),
                cancel: self.cancel.clone(),
            },
            done: false,
        })
    }

    /// Wait for the worker to exit and return the final state.
    pub fn join(mut self) -> Result<PipelineState, PipelineError> {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                set_state(&self.state, PipelineState::Failed);
                return Err(PipelineError::WorkerStopped(WORKER_PANICKED_REASON.into()));
            }
        }
        Ok(self.state())
    }
}

impl Drop for CachingPipeline {
    fn drop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        if !handle.is_finished() {
            warn!(
                dir = %self.config.out_dir.display(),
                "pipeline dropped during production; cancelling worker"
            );
            self.cancel.cancel();
        }
        if handle.join().is_err() {
            set_state(&self.state, PipelineState::Failed);
        }
    }
}

fn run_worker(
    config: CacheConfig,
    factory: SourceFactory,
    cancel: CancellationToken,
    sender: Sender<WorkerMessage>,
    state: SharedState,
) {
    let outcome = factory().and_then(|source| {
        let writer = CacheWriter::create(config)?;
        writer.write_all(source, &cancel, |path| {
            if sender.send(WorkerMessage::FileReady(path.to_path_buf())).is_err() {
                debug!(path = %path.display(), "consumer gone; file still committed");
            }
        })
    });
    let message = match outcome {
        Ok(ledger) => {
            info!(files = ledger.len(), tokens = ledger.total_tokens(), "cache worker finished");
            set_state(&state, PipelineState::Complete);
            WorkerMessage::Finished(ledger)
        }
        Err(err) => {
            if err.is_cancelled() {
                warn!("cache worker cancelled");
            } else {
                warn!(error = %err, "cache worker failed");
            }
            set_state(&state, PipelineState::Failed);
            WorkerMessage::Failed(err)
        }
    };
    if sender.send(message).is_err() {
        debug!("consumer gone before completion message");
    }
}

/// Compose `sampler -> batcher -> tokenizer -> packer` into a batch source.
pub fn production_source<R, K>(
    sampler: WeightedSampler<DocumentText, R>,
    tokenizer: K,
    batch_size: usize,
    packer: SequencePacker,
) -> Result<BatchSource, PipelineError>
where
    R: RngCore + Send + 'static,
    K: Tokenizer + 'static,
{
    let documents = DocumentBatcher::new(sampler, batch_size)?;
    let tokenized =
        documents.map(move |docs| docs.and_then(|docs| tokenizer.encode_batch(&docs)));
    Ok(Box::new(packer.packed(tokenized)))
}

enum StreamInner {
    Replay(LedgerBatches),
    Live {
        receiver: Receiver<WorkerMessage>,
        current: Option<CacheFileBatches>,
        flatten: bool,
        state: SharedState,
        cancel: CancellationToken,
    },
}

/// Batches of a [`CachingPipeline`], in cache file order.
///
/// Ends after the last batch or after yielding one error.
pub struct CachedStream {
    inner: StreamInner,
    done: bool,
}

impl CachedStream {
    /// Returns `true` when batches come from an existing cache.
    pub fn is_replay(&self) -> bool {
        matches!(self.inner, StreamInner::Replay(_))
    }

    fn next_live(&mut self) -> Option<Result<TokenBatch, PipelineError>> {
        let StreamInner::Live {
            receiver,
            current,
            flatten,
            state,
            cancel,
        } = &mut self.inner
        else {
            return None;
        };
        loop {
            if let Some(file) = current.as_mut() {
                match file.next() {
                    Some(Ok(batch)) => return Some(Ok(batch)),
                    Some(Err(err)) => {
                        cancel.cancel();
                        set_state(state, PipelineState::Failed);
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => *current = None,
                }
            }
            match receiver.recv() {
                Ok(WorkerMessage::FileReady(path)) => {
                    debug!(path = %path.display(), "cache file ready");
                    match CacheReader::read_file(&path, *flatten) {
                        Ok(file) => *current = Some(file),
                        Err(err) => {
                            cancel.cancel();
                            set_state(state, PipelineState::Failed);
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                }
                Ok(WorkerMessage::Finished(ledger)) => {
                    debug!(files = ledger.len(), "cache production complete");
                    set_state(state, PipelineState::Complete);
                    self.done = true;
                    return None;
                }
                Ok(WorkerMessage::Failed(err)) => {
                    set_state(state, PipelineState::Failed);
                    self.done = true;
                    return Some(Err(err));
                }
                Err(_) => {
                    set_state(state, PipelineState::Failed);
                    self.done = true;
                    return Some(Err(PipelineError::WorkerStopped(
                        WORKER_DISCONNECTED_REASON.into(),
                    )));
                }
            }
        }
    }
}

impl Iterator for CachedStream {
    type Item = Result<TokenBatch, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.is_replay() {
            return self.next_live();
        }
        let StreamInner::Replay(batches) = &mut self.inner else {
            return None;
        };
        let item = batches.next();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}
