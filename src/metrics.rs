use indexmap::IndexMap;

use crate::types::StreamName;

/// Observed versus configured mixture shares.
#[derive(Clone, Debug, PartialEq)]
pub struct MixReport {
    /// Documents drawn across all streams.
    pub total_draws: usize,
    /// Largest `|observed_share - target_share|` across streams.
    pub max_abs_deviation: f64,
    /// One entry per stream, in draw-count order.
    pub per_stream: Vec<StreamShare>,
}

/// One stream's share of the mixture.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamShare {
    /// Stream name.
    pub stream: StreamName,
    /// Documents drawn from this stream.
    pub count: usize,
    /// `count / total_draws`.
    pub observed_share: f64,
    /// Configured weight normalized over all weights.
    pub target_share: f64,
}

/// Compare per-stream draw counts against configured weights.
///
/// Streams appear in `counts` order. Weights are normalized to shares; a
/// stream with no weight entry has a target share of zero.
pub fn mix_report(
    counts: &IndexMap<StreamName, usize>,
    weights: &IndexMap<StreamName, f64>,
) -> Option<MixReport> {
    if counts.is_empty() {
        return None;
    }
    let total_draws: usize = counts.values().sum();
    let weight_sum: f64 = weights.values().sum();
    let per_stream: Vec<StreamShare> = counts
        .iter()
        .map(|(stream, count)| StreamShare {
            stream: stream.clone(),
            count: *count,
            observed_share: if total_draws == 0 {
                0.0
            } else {
                *count as f64 / total_draws as f64
            },
            target_share: match weights.get(stream) {
                Some(weight) if weight_sum > 0.0 => weight / weight_sum,
                _ => 0.0,
            },
        })
        .collect();
    let max_abs_deviation = per_stream
        .iter()
        .map(|share| (share.observed_share - share.target_share).abs())
        .fold(0.0, f64::max);
    Some(MixReport {
        total_draws,
        max_abs_deviation,
        per_stream,
    })
}
