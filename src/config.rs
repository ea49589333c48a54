use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::constants::cache::{DEFAULT_FILE_EXTENSION, NUM_TOKENS_PER_FILE};
use crate::constants::packing::{DEFAULT_BATCH_SIZE, DEFAULT_SEQ_LEN};
use crate::constants::sampler::DEFAULT_SEED;
use crate::errors::PipelineError;
use crate::types::StreamName;

/// Behavior when the selected stream runs out during weighted sampling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// End the whole mixture cleanly on the first exhausted stream.
    Stop,
    /// Drop the exhausted stream and its weight, keep sampling the rest.
    Skip,
    /// Restart the exhausted stream and yield its first document.
    Loop,
    /// Fail the mixture with an exhaustion error naming the stream.
    #[default]
    Raise,
}

impl StopPolicy {
    /// Lowercase policy name as accepted by `FromStr`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Skip => "skip",
            Self::Loop => "loop",
            Self::Raise => "raise",
        }
    }
}

impl fmt::Display for StopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopPolicy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "skip" => Ok(Self::Skip),
            "loop" => Ok(Self::Loop),
            "raise" => Ok(Self::Raise),
            other => Err(PipelineError::Configuration(format!(
                "unknown stop policy '{other}' (expected stop, skip, loop, or raise)"
            ))),
        }
    }
}

/// What the packer does with tokens past the last full window of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Drop trailing tokens; only full `seq_len` windows are emitted.
    #[default]
    Drop,
    /// Emit one shorter trailing window holding the leftover tokens.
    Keep,
}

/// Weighted mixture settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// RNG seed that controls the draw sequence.
    pub seed: u64,
    /// Exhaustion behavior.
    pub stop_policy: StopPolicy,
    /// Relative weight per stream name; `None` samples uniformly.
    pub weights: Option<IndexMap<StreamName, f64>>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            stop_policy: StopPolicy::default(),
            weights: None,
        }
    }
}

impl SamplingConfig {
    /// Override the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Override the stop policy.
    pub fn with_stop_policy(mut self, stop_policy: StopPolicy) -> Self {
        self.stop_policy = stop_policy;
        self
    }

    /// Set explicit per-stream weights.
    pub fn with_weights<K, I>(mut self, weights: I) -> Self
    where
        K: Into<StreamName>,
        I: IntoIterator<Item = (K, f64)>,
    {
        self.weights = Some(
            weights
                .into_iter()
                .map(|(name, weight)| (name.into(), weight))
                .collect(),
        );
        self
    }
}

/// Tokenize-and-pack settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    /// Window length in tokens.
    pub seq_len: usize,
    /// Offset between window starts; `None` means `seq_len`.
    pub stride: Option<usize>,
    /// Number of documents tokenized and concatenated together.
    pub batch_size: usize,
    /// Handling of tokens past the last full window.
    pub remainder: RemainderPolicy,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            seq_len: DEFAULT_SEQ_LEN,
            stride: None,
            batch_size: DEFAULT_BATCH_SIZE,
            remainder: RemainderPolicy::default(),
        }
    }
}

impl PackingConfig {
    /// Config with `seq_len` and default stride/batch size.
    pub fn new(seq_len: usize) -> Self {
        Self {
            seq_len,
            ..Self::default()
        }
    }

    /// Override the stride.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = Some(stride);
        self
    }

    /// Override the document batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Override the remainder policy.
    pub fn with_remainder(mut self, remainder: RemainderPolicy) -> Self {
        self.remainder = remainder;
        self
    }

    /// Effective stride.
    pub fn effective_stride(&self) -> usize {
        self.stride.unwrap_or(self.seq_len)
    }

    /// Validate that all lengths are positive.
    pub fn validated(self) -> Result<Self, PipelineError> {
        if self.seq_len == 0 {
            return Err(PipelineError::Configuration(
                "seq_len must be positive".into(),
            ));
        }
        if self.stride == Some(0) {
            return Err(PipelineError::Configuration(
                "stride must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch_size must be positive".into(),
            ));
        }
        Ok(self)
    }
}

/// On-disk cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory owned by one producer; holds cache files and the ledger.
    pub out_dir: PathBuf,
    /// Soft token bound per cache file.
    #[serde(default = "default_num_tokens_per_file")]
    pub num_tokens_per_file: u64,
    /// Cache file extension (without the dot).
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

fn default_num_tokens_per_file() -> u64 {
    NUM_TOKENS_PER_FILE
}

fn default_file_extension() -> String {
    DEFAULT_FILE_EXTENSION.to_string()
}

impl CacheConfig {
    /// Config for `out_dir` with default file size and extension.
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            num_tokens_per_file: NUM_TOKENS_PER_FILE,
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
        }
    }

    /// Override the soft per-file token bound.
    pub fn with_num_tokens_per_file(mut self, num_tokens_per_file: u64) -> Self {
        self.num_tokens_per_file = num_tokens_per_file;
        self
    }

    /// Override the cache file extension.
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Validate the per-file bound and extension.
    pub fn validated(self) -> Result<Self, PipelineError> {
        if self.num_tokens_per_file == 0 {
            return Err(PipelineError::Configuration(
                "num_tokens_per_file must be positive".into(),
            ));
        }
        let extension = self.file_extension.trim_start_matches('.');
        if extension.is_empty() || extension.contains(['/', '\\']) {
            return Err(PipelineError::Configuration(format!(
                "invalid cache file extension '{}'",
                self.file_extension
            )));
        }
        Ok(Self {
            file_extension: extension.to_string(),
            ..self
        })
    }
}

/// Top-level pipeline configuration, loadable from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Mixture settings.
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Packing settings.
    #[serde(default)]
    pub packing: PackingConfig,
    /// Cache settings.
    pub cache: CacheConfig,
}

impl PipelineConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validated()
    }

    /// Read, parse, and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Validate every section.
    pub fn validated(self) -> Result<Self, PipelineError> {
        Ok(Self {
            sampling: self.sampling,
            packing: self.packing.validated()?,
            cache: self.cache.validated()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_policy_parses_known_names_and_rejects_others() {
        assert_eq!("stop".parse::<StopPolicy>().unwrap(), StopPolicy::Stop);
        assert_eq!(" Skip ".parse::<StopPolicy>().unwrap(), StopPolicy::Skip);
        assert_eq!("LOOP".parse::<StopPolicy>().unwrap(), StopPolicy::Loop);
        assert_eq!("raise".parse::<StopPolicy>().unwrap(), StopPolicy::Raise);
        let err = "restart".parse::<StopPolicy>().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(msg) if msg.contains("restart")));
        assert_eq!(StopPolicy::default(), StopPolicy::Raise);
        assert_eq!(StopPolicy::Loop.to_string(), "loop");
    }

    #[test]
    fn packing_config_rejects_non_positive_lengths() {
        assert!(PackingConfig::new(0).validated().is_err());
        assert!(PackingConfig::new(8).with_stride(0).validated().is_err());
        assert!(PackingConfig::new(8).with_batch_size(0).validated().is_err());
        let ok = PackingConfig::new(8).validated().unwrap();
        assert_eq!(ok.effective_stride(), 8);
        assert_eq!(ok.with_stride(3).effective_stride(), 3);
    }

    #[test]
    fn cache_config_normalizes_extension() {
        let config = CacheConfig::new("/tmp/cache")
            .with_file_extension(".arrow")
            .validated()
            .unwrap();
        assert_eq!(config.file_extension, "arrow");
        assert!(CacheConfig::new("/tmp/cache")
            .with_num_tokens_per_file(0)
            .validated()
            .is_err());
        assert!(CacheConfig::new("/tmp/cache")
            .with_file_extension("a/b")
            .validated()
            .is_err());
    }

    #[test]
    fn pipeline_config_loads_from_json_with_defaults() {
        let raw = r#"{
            "sampling": {"seed": 7, "stop_policy": "skip", "weights": {"web": 0.8, "pubmed": 0.2}},
            "packing": {"seq_len": 512, "batch_size": 64},
            "cache": {"out_dir": "cache"}
        }"#;
        let config = PipelineConfig::from_json_str(raw).unwrap();
        assert_eq!(config.sampling.seed, 7);
        assert_eq!(config.sampling.stop_policy, StopPolicy::Skip);
        let weights = config.sampling.weights.unwrap();
        assert_eq!(weights.keys().collect::<Vec<_>>(), vec!["web", "pubmed"]);
        assert_eq!(config.packing.seq_len, 512);
        assert_eq!(config.packing.effective_stride(), 512);
        assert_eq!(config.packing.remainder, RemainderPolicy::Drop);
        assert_eq!(config.cache.num_tokens_per_file, NUM_TOKENS_PER_FILE);
        assert_eq!(config.cache.file_extension, DEFAULT_FILE_EXTENSION);
    }

    #[test]
    fn pipeline_config_rejects_invalid_sections() {
        let raw = r#"{"packing": {"seq_len": 0}, "cache": {"out_dir": "cache"}}"#;
        assert!(matches!(
            PipelineConfig::from_json_str(raw),
            Err(PipelineError::Configuration(_))
        ));
        let raw = r#"{"sampling": {"stop_policy": "forever"}, "cache": {"out_dir": "c"}}"#;
        assert!(matches!(
            PipelineConfig::from_json_str(raw),
            Err(PipelineError::Json(_))
        ));
    }
}
