use indexmap::IndexMap;
use tracing::debug;

use crate::config::{PackingConfig, RemainderPolicy};
use crate::data::{TokenBatch, TokenWindow};
use crate::errors::PipelineError;
use crate::types::{FieldName, TokenId};

/// Length of the prefix covered by full-window starts.
///
/// `floor((total_length - seq_len + stride) / stride) * stride`, clamped to
/// zero. Window starts are the multiples of `stride` below this value.
pub fn usable_length(total_length: usize, seq_len: usize, stride: usize) -> usize {
    if stride == 0 {
        return 0;
    }
    let span = total_length as i128 - seq_len as i128 + stride as i128;
    if span <= 0 {
        return 0;
    }
    let stride = stride as i128;
    ((span / stride) * stride) as usize
}

/// Re-slices concatenated documents into fixed-length windows.
///
/// Each batch is packed independently: rows are concatenated per field and
/// cut at `0, stride, 2 * stride, ...`. Leftover tokens never carry over to
/// the next batch.
#[derive(Clone, Copy, Debug)]
pub struct SequencePacker {
    config: PackingConfig,
}

impl SequencePacker {
    /// Validate `config` and build a packer.
    pub fn new(config: PackingConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            config: config.validated()?,
        })
    }

    /// Active packing settings.
    pub fn config(&self) -> &PackingConfig {
        &self.config
    }

    /// Tokens of a `total_length` batch that end up in no window.
    pub fn dropped_tokens(&self, total_length: usize) -> usize {
        match self.config.remainder {
            RemainderPolicy::Keep => 0,
            RemainderPolicy::Drop => total_length.saturating_sub(self.usable(total_length)),
        }
    }

    /// Pack one batch into windows, in start order.
    pub fn pack(&self, batch: &TokenBatch) -> Result<Vec<TokenWindow>, PipelineError> {
        batch.validate()?;
        let flat = batch.concatenated();
        let total_length = self.primary_length(batch, &flat);
        let windows: Vec<TokenWindow> = self
            .window_bounds(total_length)
            .into_iter()
            .map(|(start, end)| TokenWindow {
                fields: flat
                    .iter()
                    .map(|(name, values)| (name.clone(), values[start..end].to_vec()))
                    .collect(),
            })
            .collect();
        self.log_batch(batch, total_length, windows.len());
        Ok(windows)
    }

    /// Pack one batch into a batch whose rows are the windows.
    pub fn pack_to_batch(&self, batch: &TokenBatch) -> Result<TokenBatch, PipelineError> {
        batch.validate()?;
        let flat = batch.concatenated();
        let total_length = self.primary_length(batch, &flat);
        let bounds = self.window_bounds(total_length);
        let fields = flat.into_iter().map(|(name, values)| {
            let rows = bounds
                .iter()
                .map(|&(start, end)| values[start..end].to_vec())
                .collect();
            (name, rows)
        });
        let packed = TokenBatch::from_fields(fields)?;
        self.log_batch(batch, total_length, packed.num_rows());
        Ok(packed)
    }

    /// Lazily pack every batch of `batches`.
    pub fn packed<I>(self, batches: I) -> PackedWindows<I>
    where
        I: Iterator<Item = Result<TokenBatch, PipelineError>>,
    {
        PackedWindows {
            packer: self,
            inner: batches,
        }
    }

    fn usable(&self, total_length: usize) -> usize {
        usable_length(
            total_length,
            self.config.seq_len,
            self.config.effective_stride(),
        )
    }

    fn window_bounds(&self, total_length: usize) -> Vec<(usize, usize)> {
        let seq_len = self.config.seq_len;
        let usable = self.usable(total_length);
        let mut bounds: Vec<(usize, usize)> = (0..usable)
            .step_by(self.config.effective_stride())
            .map(|start| (start, start + seq_len))
            .collect();
        // The tail is only kept when some token after the last full window
        // would otherwise go unseen.
        let covered = bounds.last().map_or(0, |&(_, end)| end);
        if self.config.remainder == RemainderPolicy::Keep
            && usable < total_length
            && covered < total_length
        {
            bounds.push((usable, total_length));
        }
        bounds
    }

    fn primary_length(
        &self,
        batch: &TokenBatch,
        flat: &IndexMap<FieldName, Vec<TokenId>>,
    ) -> usize {
        batch
            .primary_field()
            .and_then(|name| flat.get(name))
            .map_or(0, Vec::len)
    }

    fn log_batch(&self, batch: &TokenBatch, total_length: usize, windows: usize) {
        debug!(
            documents = batch.num_rows(),
            total_tokens = total_length,
            windows,
            dropped = self.dropped_tokens(total_length),
            "packed batch"
        );
    }
}

/// Iterator adapter that packs each incoming batch.
pub struct PackedWindows<I> {
    packer: SequencePacker,
    inner: I,
}

impl<I> Iterator for PackedWindows<I>
where
    I: Iterator<Item = Result<TokenBatch, PipelineError>>,
{
    type Item = Result<TokenBatch, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.inner.next()?;
        Some(batch.and_then(|batch| self.packer.pack_to_batch(&batch)))
    }
}
