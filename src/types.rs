/// Unique label of one corpus stream inside a sampler.
/// Examples: `webtext`, `pubmed`
pub type StreamName = String;
/// Name of one tokenized field.
/// Examples: `input_ids`, `attention_mask`
pub type FieldName = String;
/// One token id (or mask value) produced by a tokenizer.
/// Example: `50256`
pub type TokenId = u32;
/// Raw document text before tokenization.
/// Example: `The quick brown fox.`
pub type DocumentText = String;
/// Cache file name as recorded in the ledger (relative to the cache directory).
/// Example: `docs-0.bin`
pub type CacheFileName = String;
