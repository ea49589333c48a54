/// Constants used by the weighted stream sampler.
pub mod sampler {
    /// Offset mixed into the user seed before seeding the mixture RNG.
    pub const MIXTURE_SEED_OFFSET: u64 = 0xB4C3_5EED;
    /// Default seed used when a config does not provide one.
    pub const DEFAULT_SEED: u64 = 0;
}

/// Constants used by tokenization and packing.
pub mod packing {
    /// Canonical token-id field produced by tokenizers.
    pub const INPUT_IDS_FIELD: &str = "input_ids";
    /// Canonical attention-mask field produced by tokenizers.
    pub const ATTENTION_MASK_FIELD: &str = "attention_mask";
    /// Default number of documents tokenized and packed together.
    pub const DEFAULT_BATCH_SIZE: usize = 1000;
    /// Default window length.
    pub const DEFAULT_SEQ_LEN: usize = 1024;
    /// Default vocabulary size of the hashing test tokenizer.
    pub const DEFAULT_HASH_VOCAB_SIZE: u32 = 50_257;
}

/// Constants used by cache file layout and ledger persistence.
pub mod cache {
    /// Ledger file name inside a cache directory.
    pub const LEDGER_FILE: &str = "ledger.json";
    /// Cache file name prefix; files are `docs-<index>.<ext>`.
    pub const CACHE_FILE_PREFIX: &str = "docs-";
    /// Default cache file extension.
    pub const DEFAULT_FILE_EXTENSION: &str = "bin";
    /// Suffix appended to a cache file while it is being written.
    pub const PARTIAL_SUFFIX: &str = "partial";
    /// Suffix appended to the ledger while it is being written.
    pub const LEDGER_TMP_SUFFIX: &str = "tmp";
    /// Default soft per-file token bound (128 * 512 * 1024).
    ///
    /// Divisible by common `seq_len * batch_size` products.
    pub const NUM_TOKENS_PER_FILE: u64 = 67_108_864;
    /// Magic bytes at the start of every cache file.
    pub const CACHE_FILE_MAGIC: &[u8; 4] = b"PKSC";
    /// Version tag for the cache file layout.
    pub const CACHE_FILE_VERSION: u8 = 1;
    /// Prefix marker for bitcode-encoded batch payloads.
    pub const BITCODE_PREFIX: u8 = b'B';
    /// Upper bound on a single encoded batch frame, guards against corrupt length headers.
    pub const MAX_FRAME_BYTES: u64 = 1 << 34;
}

/// Constants used by the caching pipeline worker.
pub mod pipeline {
    /// Name given to the background caching thread.
    pub const WORKER_THREAD_NAME: &str = "packstream-cache";
    /// Failure reason when the worker disappears without sending the sentinel.
    pub const WORKER_DISCONNECTED_REASON: &str = "queue closed before completion sentinel";
    /// Failure reason when the worker thread panics.
    pub const WORKER_PANICKED_REASON: &str = "cache worker panicked";
}

/// Constants used by file-backed document streams.
pub mod files {
    /// Default JSON key holding document text in JSONL corpora.
    pub const DEFAULT_JSON_TEXT_KEY: &str = "text";
    /// Extensions read as one JSON document per line.
    pub const JSONL_EXTENSIONS: [&str; 2] = ["jsonl", "ndjson"];
    /// Extensions read as one document per file.
    pub const TEXT_EXTENSIONS: [&str; 2] = ["txt", "text"];
    /// Compression extensions decoded with gzip (multi-member aware).
    pub const GZIP_EXTENSIONS: [&str; 1] = ["gz"];
    /// Compression extensions decoded with zstd.
    pub const ZSTD_EXTENSIONS: [&str; 2] = ["zst", "zstd"];
}
