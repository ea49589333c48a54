#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// On-disk token cache files and completion ledger.
pub mod cache;
/// Mixing, packing, and cache configuration types.
pub mod config;
/// Centralized constants used across sampler, packer, cache, and sources.
pub mod constants;
/// Token batch and window types.
pub mod data;
/// Mixture share metrics.
pub mod metrics;
/// Sequence packing into fixed-length windows.
pub mod packer;
/// Background cache production and cache replay.
pub mod pipeline;
/// Weighted multi-stream sampling.
pub mod sampler;
/// Document stream traits and built-in streams.
pub mod source;
/// Tokenizer seam and document batching.
pub mod tokenize;
/// Shared type aliases.
pub mod types;

mod errors;

pub use cache::{
    CacheFileBatches, CacheReader, CacheSummary, CacheWriter, CancellationToken, Ledger,
    LedgerBatches, LedgerEntry,
};
pub use config::{
    CacheConfig, PackingConfig, PipelineConfig, RemainderPolicy, SamplingConfig, StopPolicy,
};
pub use data::{TokenBatch, TokenWindow};
pub use errors::PipelineError;
pub use metrics::{MixReport, StreamShare, mix_report};
pub use packer::{PackedWindows, SequencePacker, usable_length};
pub use pipeline::{
    BatchSource, CachedStream, CachingPipeline, PipelineState, SourceFactory, WorkerMessage,
    production_source,
};
pub use sampler::{DeterministicRng, StreamMap, WeightedSampler};
pub use source::{
    CyclingStream, Decompressor, DocumentInput, DocumentReader, DocumentStream,
    FileDocumentStream, FnStream, FormatHandler, FormatRegistry, IterStream, RepeatStream,
    ShardedStream, StreamIter, VecStream,
};
pub use tokenize::{DocumentBatcher, FnTokenizer, HashingWhitespaceTokenizer, Tokenizer};
pub use types::{CacheFileName, DocumentText, FieldName, StreamName, TokenId};
