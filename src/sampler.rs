use indexmap::IndexMap;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::config::{SamplingConfig, StopPolicy};
use crate::constants::sampler::MIXTURE_SEED_OFFSET;
use crate::errors::PipelineError;
use crate::metrics::{MixReport, mix_report};
use crate::source::DocumentStream;
use crate::types::StreamName;

/// Named document streams in selection order.
pub type StreamMap<T> = IndexMap<StreamName, Box<dyn DocumentStream<Item = T>>>;

#[derive(Debug, Clone)]
/// Small deterministic RNG used for reproducible mixture draws.
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    /// Seed a new generator.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Resume from a state captured with [`DeterministicRng::state`].
    pub fn from_state(state: u64) -> Self {
        Self { state }
    }

    /// Current internal state.
    pub fn state(&self) -> u64 {
        self.state
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            let bytes = self.next_u64_internal().to_le_bytes();
            let copy_len = (dest.len() - offset).min(bytes.len());
            dest[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += copy_len;
        }
    }
}

/// Uniform draw in `[0, 1)` from the top 53 bits of one `next_u64`.
fn unit_interval<R: RngCore>(rng: &mut R) -> f64 {
    (rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

/// Interleaves named document streams by weight (roulette-wheel selection).
///
/// Each emitted document costs one uniform draw. When the selected stream is
/// exhausted the [`StopPolicy`] decides what happens:
/// - `Raise`: yield [`PipelineError::Exhausted`] and end.
/// - `Skip`: drop the stream and its weight, then redraw among the rest.
/// - `Loop`: restart the stream and yield its first document.
/// - `Stop`: end the whole mixture.
///
/// Identical seeds, stream contents and weights reproduce identical output.
pub struct WeightedSampler<T, R = DeterministicRng> {
    streams: StreamMap<T>,
    /// Current weights, index-aligned with `streams`.
    weights: Vec<f64>,
    total: f64,
    /// Weights as configured at construction, for reporting.
    targets: IndexMap<StreamName, f64>,
    counts: IndexMap<StreamName, usize>,
    rng: R,
    policy: StopPolicy,
    finished: bool,
}

impl<T> WeightedSampler<T, DeterministicRng> {
    /// Seeded sampler. `weights: None` samples uniformly.
    pub fn new(
        streams: StreamMap<T>,
        weights: Option<IndexMap<StreamName, f64>>,
        seed: u64,
        policy: StopPolicy,
    ) -> Result<Self, PipelineError> {
        let rng = DeterministicRng::new(seed ^ MIXTURE_SEED_OFFSET);
        Self::with_rng(streams, weights, rng, policy)
    }

    /// Sampler configured from a [`SamplingConfig`].
    pub fn from_config(
        streams: StreamMap<T>,
        config: &SamplingConfig,
    ) -> Result<Self, PipelineError> {
        Self::new(
            streams,
            config.weights.clone(),
            config.seed,
            config.stop_policy,
        )
    }
}

impl<T, R: RngCore> WeightedSampler<T, R> {
    /// Sampler drawing from a caller-supplied RNG.
    pub fn with_rng(
        streams: StreamMap<T>,
        weights: Option<IndexMap<StreamName, f64>>,
        rng: R,
        policy: StopPolicy,
    ) -> Result<Self, PipelineError> {
        if streams.is_empty() {
            return Err(PipelineError::Configuration(
                "weighted sampler requires at least one stream".into(),
            ));
        }
        let weights = resolve_weights(&streams, weights)?;
        if policy == StopPolicy::Loop {
            if let Some((name, _)) = streams.iter().find(|(_, stream)| !stream.can_restart()) {
                return Err(PipelineError::Configuration(format!(
                    "stream '{name}' cannot restart under the loop policy"
                )));
            }
        }
        let targets: IndexMap<StreamName, f64> = streams
            .keys()
            .cloned()
            .zip(weights.iter().copied())
            .collect();
        let counts = streams.keys().map(|name| (name.clone(), 0)).collect();
        let total: f64 = weights.iter().sum();
        debug!(
            streams = streams.len(),
            policy = %policy,
            total_weight = total,
            "weighted sampler ready"
        );
        Ok(Self {
            streams,
            weights,
            total,
            targets,
            counts,
            rng,
            policy,
            finished: false,
        })
    }

    /// Pull the next mixed document. `Ok(None)` once the mixture has ended.
    pub fn next_document(&mut self) -> Result<Option<T>, PipelineError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.draw();
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }

    /// Current weight per active stream.
    pub fn weights(&self) -> IndexMap<StreamName, f64> {
        self.streams
            .keys()
            .cloned()
            .zip(self.weights.iter().copied())
            .collect()
    }

    /// Names of streams still in the pool.
    pub fn active_streams(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Documents yielded so far per stream, including removed streams.
    pub fn draw_counts(&self) -> &IndexMap<StreamName, usize> {
        &self.counts
    }

    /// Observed versus configured share per stream.
    pub fn mix_report(&self) -> Option<MixReport> {
        mix_report(&self.counts, &self.targets)
    }

    fn draw(&mut self) -> Result<Option<T>, PipelineError> {
        loop {
            if self.streams.is_empty() || self.total <= 0.0 {
                return Ok(None);
            }
            let Some(idx) = self.select() else {
                return Ok(None);
            };
            let Some((_, stream)) = self.streams.get_index_mut(idx) else {
                return Ok(None);
            };
            if let Some(doc) = stream.next_item()? {
                self.record_draw(idx);
                return Ok(Some(doc));
            }

            let name = self.stream_name(idx);
            match self.policy {
                StopPolicy::Raise => return Err(PipelineError::Exhausted { stream: name }),
                StopPolicy::Stop => {
                    info!(stream = %name, "stream exhausted; ending mixture");
                    return Ok(None);
                }
                StopPolicy::Skip => {
                    self.remove(idx);
                    warn!(
                        stream = %name,
                        remaining = self.streams.len(),
                        "stream exhausted; removed from mixture"
                    );
                }
                StopPolicy::Loop => {
                    let Some((_, stream)) = self.streams.get_index_mut(idx) else {
                        return Ok(None);
                    };
                    stream.restart()?;
                    let Some(doc) = stream.next_item()? else {
                        return Err(PipelineError::Exhausted { stream: name });
                    };
                    debug!(stream = %name, "restarted exhausted stream");
                    self.record_draw(idx);
                    return Ok(Some(doc));
                }
            }
        }
    }

    fn select(&mut self) -> Option<usize> {
        let mut r = unit_interval(&mut self.rng) * self.total;
        let mut fallback = None;
        for (idx, weight) in self.weights.iter().enumerate() {
            if *weight > 0.0 {
                fallback = Some(idx);
            }
            if r < *weight {
                return Some(idx);
            }
            r -= weight;
        }
        // rounding fell through every stream
        fallback
    }

    fn remove(&mut self, idx: usize) {
        self.streams.shift_remove_index(idx);
        self.weights.remove(idx);
        self.total = self.weights.iter().sum();
    }

    fn record_draw(&mut self, idx: usize) {
        if let Some((name, _)) = self.streams.get_index(idx) {
            if let Some(count) = self.counts.get_mut(name) {
                *count += 1;
            }
        }
    }

    fn stream_name(&self, idx: usize) -> StreamName {
        self.streams
            .get_index(idx)
            .map(|(name, _)| name.clone())
            .unwrap_or_default()
    }
}

impl<T, R: RngCore> Iterator for WeightedSampler<T, R> {
    type Item = Result<T, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

/// Align weights with stream order and validate them.
fn resolve_weights<T>(
    streams: &StreamMap<T>,
    weights: Option<IndexMap<StreamName, f64>>,
) -> Result<Vec<f64>, PipelineError> {
    let Some(weights) = weights else {
        let uniform = 1.0 / streams.len() as f64;
        return Ok(vec![uniform; streams.len()]);
    };
    if weights.len() != streams.len() || streams.keys().any(|name| !weights.contains_key(name)) {
        let mut stream_keys: Vec<&str> = streams.keys().map(String::as_str).collect();
        let mut weight_keys: Vec<&str> = weights.keys().map(String::as_str).collect();
        stream_keys.sort_unstable();
        weight_keys.sort_unstable();
        return Err(PipelineError::Configuration(format!(
            "weight keys {weight_keys:?} do not match stream keys {stream_keys:?}"
        )));
    }
    let mut aligned = Vec::with_capacity(streams.len());
    for name in streams.keys() {
        let weight = weights[name.as_str()];
        if !weight.is_finite() || weight < 0.0 {
            return Err(PipelineError::Configuration(format!(
                "weight for stream '{name}' must be finite and non-negative, got {weight}"
            )));
        }
        aligned.push(weight);
    }
    if aligned.iter().sum::<f64>() <= 0.0 {
        return Err(PipelineError::Configuration(
            "stream weights must sum to a positive value".into(),
        ));
    }
    Ok(aligned)
}
