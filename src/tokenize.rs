//! Tokenizer seam, a deterministic hashing tokenizer, and document batching.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::constants::packing::{ATTENTION_MASK_FIELD, DEFAULT_HASH_VOCAB_SIZE, INPUT_IDS_FIELD};
use crate::data::TokenBatch;
use crate::errors::PipelineError;
use crate::types::{DocumentText, FieldName, TokenId};

/// Turns document text into named token fields.
///
/// Every field of one encoding must have the same length.
pub trait Tokenizer: Send + Sync {
    /// Encode one document.
    fn encode(&self, text: &str) -> Result<IndexMap<FieldName, Vec<TokenId>>, PipelineError>;

    /// Encode a batch of documents, one row per document, in input order.
    fn encode_batch(&self, docs: &[DocumentText]) -> Result<TokenBatch, PipelineError> {
        let rows = docs
            .par_iter()
            .map(|doc| self.encode(doc))
            .collect::<Result<Vec<_>, _>>()?;
        TokenBatch::from_rows(rows)
    }
}

impl<T: Tokenizer + ?Sized> Tokenizer for Arc<T> {
    fn encode(&self, text: &str) -> Result<IndexMap<FieldName, Vec<TokenId>>, PipelineError> {
        (**self).encode(text)
    }

    fn encode_batch(&self, docs: &[DocumentText]) -> Result<TokenBatch, PipelineError> {
        (**self).encode_batch(docs)
    }
}

fn with_attention_mask(input_ids: Vec<TokenId>) -> IndexMap<FieldName, Vec<TokenId>> {
    let mask = vec![1; input_ids.len()];
    let mut fields = IndexMap::with_capacity(2);
    fields.insert(INPUT_IDS_FIELD.to_string(), input_ids);
    fields.insert(ATTENTION_MASK_FIELD.to_string(), mask);
    fields
}

/// Deterministic whitespace tokenizer that hashes words into a fixed vocabulary.
///
/// Useful for tests and dry runs; ids are stable across processes.
#[derive(Clone, Debug)]
pub struct HashingWhitespaceTokenizer {
    vocab_size: u32,
    seed: u64,
    eos_id: Option<TokenId>,
}

impl Default for HashingWhitespaceTokenizer {
    fn default() -> Self {
        Self {
            vocab_size: DEFAULT_HASH_VOCAB_SIZE,
            seed: 0,
            eos_id: None,
        }
    }
}

impl HashingWhitespaceTokenizer {
    /// Tokenizer with `vocab_size` ids.
    pub fn new(vocab_size: u32) -> Result<Self, PipelineError> {
        if vocab_size == 0 {
            return Err(PipelineError::Configuration(
                "vocab_size must be positive".into(),
            ));
        }
        Ok(Self {
            vocab_size,
            ..Self::default()
        })
    }

    /// Append `eos_id` after every document.
    pub fn with_eos(mut self, eos_id: TokenId) -> Self {
        self.eos_id = Some(eos_id);
        self
    }

    /// Change the hash seed (and with it every id).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Id for one word.
    pub fn token_id(&self, word: &str) -> TokenId {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        word.hash(&mut hasher);
        (hasher.finish() % u64::from(self.vocab_size)) as TokenId
    }
}

impl Tokenizer for HashingWhitespaceTokenizer {
    fn encode(&self, text: &str) -> Result<IndexMap<FieldName, Vec<TokenId>>, PipelineError> {
        let mut ids: Vec<TokenId> = text.split_whitespace().map(|w| self.token_id(w)).collect();
        ids.extend(self.eos_id);
        Ok(with_attention_mask(ids))
    }
}

/// Adapts an external `text -> ids` function into a [`Tokenizer`].
///
/// The attention mask is all ones.
pub struct FnTokenizer<F> {
    encode_fn: F,
}

impl<F> FnTokenizer<F>
where
    F: Fn(&str) -> Result<Vec<TokenId>, PipelineError> + Send + Sync,
{
    /// Wrap `encode_fn`.
    pub fn new(encode_fn: F) -> Self {
        Self { encode_fn }
    }
}

impl<F> Tokenizer for FnTokenizer<F>
where
    F: Fn(&str) -> Result<Vec<TokenId>, PipelineError> + Send + Sync,
{
    fn encode(&self, text: &str) -> Result<IndexMap<FieldName, Vec<TokenId>>, PipelineError> {
        (self.encode_fn)(text).map(with_attention_mask)
    }
}

/// Groups a document iterator into batches of `batch_size`.
///
/// The last batch may be shorter. An upstream error is yielded in place of
/// the batch it interrupted and ends the iterator.
pub struct DocumentBatcher<I> {
    inner: I,
    batch_size: usize,
    done: bool,
}

impl<I> DocumentBatcher<I>
where
    I: Iterator<Item = Result<DocumentText, PipelineError>>,
{
    /// Batch `inner` into groups of `batch_size` (must be positive).
    pub fn new(inner: I, batch_size: usize) -> Result<Self, PipelineError> {
        if batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch_size must be positive".into(),
            ));
        }
        Ok(Self {
            inner,
            batch_size,
            done: false,
        })
    }
}

impl<I> Iterator for DocumentBatcher<I>
where
    I: Iterator<Item = Result<DocumentText, PipelineError>>,
{
    type Item = Result<Vec<DocumentText>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.inner.next() {
                Some(Ok(doc)) => batch.push(doc),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if batch.is_empty() { None } else { Some(Ok(batch)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_tokenizer_is_deterministic_and_bounded() {
        let tokenizer = HashingWhitespaceTokenizer::new(97).unwrap().with_eos(96);
        let first = tokenizer.encode("the cat  sat\non the mat").unwrap();
        let second = tokenizer.encode("the cat sat on the mat").unwrap();
        assert_eq!(first, second);
        let ids = &first[INPUT_IDS_FIELD];
        assert_eq!(ids.len(), 7);
        assert_eq!(ids[0], ids[4]);
        assert_eq!(*ids.last().unwrap(), 96);
        assert!(ids.iter().all(|id| *id < 97));
        assert_eq!(first[ATTENTION_MASK_FIELD], vec![1; 7]);
        assert!(HashingWhitespaceTokenizer::new(0).is_err());
    }

    #[test]
    fn encode_batch_preserves_order() {
        let tokenizer = HashingWhitespaceTokenizer::default();
        let docs: Vec<String> = (0..64).map(|n| "w ".repeat(n + 1)).collect();
        let batch = tokenizer.encode_batch(&docs).unwrap();
        assert_eq!(batch.num_rows(), 64);
        let lengths: Vec<usize> = batch
            .field(INPUT_IDS_FIELD)
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(lengths, (1..=64).collect::<Vec<_>>());
    }

    #[test]
    fn fn_tokenizer_surfaces_failures() {
        let tokenizer = FnTokenizer::new(|text: &str| {
            if text.is_empty() {
                Err(PipelineError::Tokenizer("empty document".into()))
            } else {
                Ok(text.bytes().map(TokenId::from).collect())
            }
        });
        let ok = tokenizer.encode("ab").unwrap();
        assert_eq!(ok[INPUT_IDS_FIELD], vec![97, 98]);
        let err = tokenizer
            .encode_batch(&["a".to_string(), String::new()])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Tokenizer(_)));
    }

    #[test]
    fn batcher_emits_partial_tail_and_stops_on_error() {
        let docs = (0..5).map(|n| Ok::<_, PipelineError>(n.to_string()));
        let batches: Vec<Vec<String>> = DocumentBatcher::new(docs, 2)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(batches, vec![vec!["0", "1"], vec!["2", "3"], vec!["4"]]);

        let failing = vec![
            Ok("a".to_string()),
            Err(PipelineError::Tokenizer("x".into())),
            Ok("b".to_string()),
        ];
        let mut batcher = DocumentBatcher::new(failing.into_iter(), 4).unwrap();
        assert!(batcher.next().unwrap().is_err());
        assert!(batcher.next().is_none());

        let nothing = std::iter::empty::<Result<DocumentText, PipelineError>>();
        assert!(DocumentBatcher::new(nothing, 0).is_err());
    }
}
