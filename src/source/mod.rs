//! Document stream interfaces and in-memory stream adapters.
//!
//! Ownership model:
//! - `DocumentStream` is the sampler-facing interface: pull the next item or
//!   report exhaustion, and optionally restart from the beginning.
//! - Adapters here wrap literal sequences, repeated values, iterator
//!   factories, cycling, and rank/worker sharding.
//! - `files` hosts filesystem-backed corpora.

use std::sync::Arc;

use crate::errors::PipelineError;
use crate::types::{DocumentText, StreamName};

/// Filesystem-backed document streams and format handlers.
pub mod files;

pub use files::{
    Decompressor, DocumentInput, DocumentReader, FileDocumentStream, FormatHandler, FormatRegistry,
};

/// Lazy, possibly infinite source of documents.
///
/// `next_item` returns `Ok(None)` on exhaustion. `restart` re-acquires a
/// fresh instance of the same logical sequence; streams that cannot restart
/// report `false` from `can_restart` and fail in `restart`.
pub trait DocumentStream: Send {
    /// Item type produced by this stream.
    type Item;

    /// Pull the next item, or `Ok(None)` when exhausted.
    fn next_item(&mut self) -> Result<Option<Self::Item>, PipelineError>;

    /// Whether `restart` is supported.
    fn can_restart(&self) -> bool {
        false
    }

    /// Rewind to the start of the logical sequence.
    fn restart(&mut self) -> Result<(), PipelineError> {
        Err(PipelineError::Configuration(
            "document stream does not support restart".into(),
        ))
    }
}

/// Boxed stream of raw document text.
pub type BoxedTextStream = Box<dyn DocumentStream<Item = DocumentText>>;

impl<S: DocumentStream + ?Sized> DocumentStream for Box<S> {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<Self::Item>, PipelineError> {
        (**self).next_item()
    }

    fn can_restart(&self) -> bool {
        (**self).can_restart()
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        (**self).restart()
    }
}

/// Literal finite sequence; restartable.
pub struct VecStream<T> {
    items: Arc<Vec<T>>,
    cursor: usize,
}

impl<T: Clone> VecStream<T> {
    /// Create a stream over `items`.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
            cursor: 0,
        }
    }
}

impl<T: Clone + Send + Sync> DocumentStream for VecStream<T> {
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>, PipelineError> {
        let item = self.items.get(self.cursor).cloned();
        if item.is_some() {
            self.cursor += 1;
        }
        Ok(item)
    }

    fn can_restart(&self) -> bool {
        true
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        self.cursor = 0;
        Ok(())
    }
}

/// Infinite repetition of a single value.
pub struct RepeatStream<T> {
    value: T,
}

impl<T: Clone> RepeatStream<T> {
    /// Create a stream that yields `value` forever.
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Clone + Send> DocumentStream for RepeatStream<T> {
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>, PipelineError> {
        Ok(Some(self.value.clone()))
    }

    fn can_restart(&self) -> bool {
        true
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Stream backed by an iterator factory; `restart` calls the factory again.
pub struct FnStream<F, I> {
    factory: F,
    current: I,
}

impl<F, I> FnStream<F, I>
where
    F: Fn() -> I,
{
    /// Create a stream and acquire the first iterator from `factory`.
    pub fn new(factory: F) -> Self {
        let current = factory();
        Self { factory, current }
    }
}

impl<F, I, T> DocumentStream for FnStream<F, I>
where
    F: Fn() -> I + Send,
    I: Iterator<Item = T> + Send,
{
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>, PipelineError> {
        Ok(self.current.next())
    }

    fn can_restart(&self) -> bool {
        true
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        self.current = (self.factory)();
        Ok(())
    }
}

/// One-shot stream over an iterator; cannot restart.
pub struct IterStream<I> {
    inner: I,
}

impl<I> IterStream<I> {
    /// Wrap `inner`.
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I, T> DocumentStream for IterStream<I>
where
    I: Iterator<Item = Result<T, PipelineError>> + Send,
{
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>, PipelineError> {
        self.inner.next().transpose()
    }
}

/// Turns a restartable stream into an infinite one.
///
/// An inner stream that is empty right after a restart ends the cycle instead
/// of spinning.
pub struct CyclingStream<S> {
    inner: S,
}

impl<S: DocumentStream> CyclingStream<S> {
    /// Wrap a restartable stream.
    pub fn new(inner: S) -> Result<Self, PipelineError> {
        if !inner.can_restart() {
            return Err(PipelineError::Configuration(
                "cycling requires a restartable stream".into(),
            ));
        }
        Ok(Self { inner })
    }
}

impl<S: DocumentStream> DocumentStream for CyclingStream<S> {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<S::Item>, PipelineError> {
        if let Some(item) = self.inner.next_item()? {
            return Ok(Some(item));
        }
        self.inner.restart()?;
        self.inner.next_item()
    }

    fn can_restart(&self) -> bool {
        true
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        self.inner.restart()
    }
}

/// Keeps items at positions `rank, rank + world_size, ...` of the inner stream.
pub struct ShardedStream<S> {
    inner: S,
    rank: usize,
    world_size: usize,
    position: usize,
}

impl<S: DocumentStream> ShardedStream<S> {
    /// Shard `inner` for `rank` of `world_size`.
    pub fn new(inner: S, rank: usize, world_size: usize) -> Result<Self, PipelineError> {
        if world_size == 0 || rank >= world_size {
            return Err(PipelineError::Configuration(format!(
                "invalid shard rank {rank} for world size {world_size}"
            )));
        }
        Ok(Self {
            inner,
            rank,
            world_size,
            position: 0,
        })
    }
}

impl<S: DocumentStream> DocumentStream for ShardedStream<S> {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<S::Item>, PipelineError> {
        loop {
            let Some(item) = self.inner.next_item()? else {
                return Ok(None);
            };
            let position = self.position;
            self.position += 1;
            if position % self.world_size == self.rank {
                return Ok(Some(item));
            }
        }
    }

    fn can_restart(&self) -> bool {
        self.inner.can_restart()
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        self.inner.restart()?;
        self.position = 0;
        Ok(())
    }
}

/// Adapts a `DocumentStream` into a fused `Iterator` of results.
pub struct StreamIter<S> {
    stream: S,
    done: bool,
}

impl<S> StreamIter<S> {
    /// Wrap `stream`.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            done: false,
        }
    }
}

impl<S: DocumentStream> Iterator for StreamIter<S> {
    type Item = Result<S::Item, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.stream.next_item() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Attach a stream name to a read failure.
pub(crate) fn unavailable(
    stream: impl Into<StreamName>,
    reason: impl Into<String>,
) -> PipelineError {
    PipelineError::StreamUnavailable {
        stream: stream.into(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<S: DocumentStream>(stream: S, limit: usize) -> Vec<S::Item> {
        StreamIter::new(stream)
            .take(limit)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn vec_stream_exhausts_and_restarts() {
        let mut stream = VecStream::new(vec![1, 2]);
        assert_eq!(stream.next_item().unwrap(), Some(1));
        assert_eq!(stream.next_item().unwrap(), Some(2));
        assert_eq!(stream.next_item().unwrap(), None);
        assert!(stream.can_restart());
        stream.restart().unwrap();
        assert_eq!(stream.next_item().unwrap(), Some(1));
    }

    #[test]
    fn fn_stream_reacquires_iterator_on_restart() {
        let mut stream = FnStream::new(|| vec!["a", "b"].into_iter());
        assert_eq!(stream.next_item().unwrap(), Some("a"));
        stream.restart().unwrap();
        assert_eq!(drain(stream, 10), vec!["a", "b"]);
    }

    #[test]
    fn iter_stream_cannot_restart() {
        let mut stream = IterStream::new(vec![Ok::<_, PipelineError>(1)].into_iter());
        assert!(!stream.can_restart());
        assert!(matches!(
            stream.restart(),
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(stream.next_item().unwrap(), Some(1));
        assert_eq!(stream.next_item().unwrap(), None);
    }

    #[test]
    fn cycling_stream_repeats_and_stops_on_empty_inner() {
        let cycle = CyclingStream::new(VecStream::new(vec![1, 2, 3])).unwrap();
        assert_eq!(drain(cycle, 7), vec![1, 2, 3, 1, 2, 3, 1]);

        let mut empty = CyclingStream::new(VecStream::<u8>::new(Vec::new())).unwrap();
        assert_eq!(empty.next_item().unwrap(), None);

        let one_shot = IterStream::new(std::iter::empty::<Result<u8, PipelineError>>());
        assert!(CyclingStream::new(one_shot).is_err());
    }

    #[test]
    fn sharded_stream_keeps_rank_positions() {
        let items: Vec<u32> = (0..10).collect();
        let rank_1 = ShardedStream::new(VecStream::new(items.clone()), 1, 3).unwrap();
        assert_eq!(drain(rank_1, 100), vec![1, 4, 7]);

        let mut rank_0 = ShardedStream::new(VecStream::new(items), 0, 3).unwrap();
        assert_eq!(rank_0.next_item().unwrap(), Some(0));
        assert_eq!(rank_0.next_item().unwrap(), Some(3));
        rank_0.restart().unwrap();
        assert_eq!(rank_0.next_item().unwrap(), Some(0));

        assert!(ShardedStream::new(VecStream::new(vec![1]), 2, 2).is_err());
        assert!(ShardedStream::new(VecStream::new(vec![1]), 0, 0).is_err());
    }

    #[test]
    fn repeat_stream_never_exhausts() {
        assert_eq!(drain(RepeatStream::new('b'), 4), vec!['b'; 4]);
    }
}
