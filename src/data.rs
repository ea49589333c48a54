use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::packing::INPUT_IDS_FIELD;
use crate::errors::PipelineError;

pub use crate::types::{FieldName, TokenId};

/// A batch of tokenized rows, stored column-wise per field.
///
/// Rows are documents before packing and windows after packing. Every field
/// holds the same number of rows, and row `i` has the same length in every
/// field (token ids and attention mask stay in lockstep). Deserializing
/// checks the same invariant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedBatch")]
pub struct TokenBatch {
    fields: IndexMap<FieldName, Vec<Vec<TokenId>>>,
}

#[derive(Deserialize)]
struct UncheckedBatch {
    fields: IndexMap<FieldName, Vec<Vec<TokenId>>>,
}

impl TryFrom<UncheckedBatch> for TokenBatch {
    type Error = PipelineError;

    fn try_from(raw: UncheckedBatch) -> Result<Self, Self::Error> {
        Self::from_fields(raw.fields)
    }
}

impl TokenBatch {
    /// Create an empty batch with no fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validated batch from `(field, rows)` pairs.
    pub fn from_fields<K, I>(fields: I) -> Result<Self, PipelineError>
    where
        K: Into<FieldName>,
        I: IntoIterator<Item = (K, Vec<Vec<TokenId>>)>,
    {
        let batch = Self {
            fields: fields
                .into_iter()
                .map(|(name, rows)| (name.into(), rows))
                .collect(),
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Build a single-field batch of `input_ids` rows.
    pub fn from_input_ids(rows: Vec<Vec<TokenId>>) -> Self {
        let mut fields = IndexMap::with_capacity(1);
        fields.insert(INPUT_IDS_FIELD.to_string(), rows);
        Self { fields }
    }

    /// Build a batch from row-wise encodings (one field map per document).
    ///
    /// Field order follows the first row.
    pub fn from_rows<I>(rows: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = IndexMap<FieldName, Vec<TokenId>>>,
    {
        let mut fields: IndexMap<FieldName, Vec<Vec<TokenId>>> = IndexMap::new();
        for (row_idx, row) in rows.into_iter().enumerate() {
            if row_idx > 0 && row.len() != fields.len() {
                return Err(PipelineError::InvalidBatch(format!(
                    "row {row_idx} has {} fields, expected {}",
                    row.len(),
                    fields.len()
                )));
            }
            for (name, values) in row {
                if row_idx > 0 && !fields.contains_key(&name) {
                    return Err(PipelineError::InvalidBatch(format!(
                        "row {row_idx} introduces unknown field '{name}'"
                    )));
                }
                fields.entry(name).or_default().push(values);
            }
        }
        let batch = Self { fields };
        batch.validate()?;
        Ok(batch)
    }

    /// Check the row-count and row-length invariants across fields.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let Some((first_name, first_rows)) = self.fields.first() else {
            return Ok(());
        };
        for (name, rows) in self.fields.iter().skip(1) {
            if rows.len() != first_rows.len() {
                return Err(PipelineError::InvalidBatch(format!(
                    "field '{name}' has {} rows but '{first_name}' has {}",
                    rows.len(),
                    first_rows.len()
                )));
            }
            for (idx, (row, reference)) in rows.iter().zip(first_rows).enumerate() {
                if row.len() != reference.len() {
                    return Err(PipelineError::InvalidBatch(format!(
                        "row {idx}: field '{name}' has length {} but '{first_name}' has {}",
                        row.len(),
                        reference.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Field names in stored order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Rows of one field.
    pub fn field(&self, name: &str) -> Option<&[Vec<TokenId>]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Iterate `(field, rows)` pairs in stored order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &[Vec<TokenId>])> {
        self.fields
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.as_slice()))
    }

    /// Field that defines token counts: `input_ids` when present, else the first field.
    pub fn primary_field(&self) -> Option<&str> {
        if self.fields.contains_key(INPUT_IDS_FIELD) {
            return Some(INPUT_IDS_FIELD);
        }
        self.fields.keys().next().map(String::as_str)
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.fields.values().next().map_or(0, Vec::len)
    }

    /// Returns `true` when the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Total tokens across all rows of the primary field.
    pub fn num_tokens(&self) -> u64 {
        self.primary_field()
            .and_then(|name| self.fields.get(name))
            .map_or(0, |rows| rows.iter().map(|row| row.len() as u64).sum())
    }

    /// Row `idx` as a window.
    pub fn row(&self, idx: usize) -> Option<TokenWindow> {
        if idx >= self.num_rows() {
            return None;
        }
        let fields = self
            .fields
            .iter()
            .map(|(name, rows)| Some((name.clone(), rows.get(idx)?.clone())))
            .collect::<Option<_>>()?;
        Some(TokenWindow { fields })
    }

    /// Iterate rows as windows.
    pub fn rows(&self) -> impl Iterator<Item = TokenWindow> + '_ {
        (0..self.num_rows()).filter_map(|idx| self.row(idx))
    }

    /// Concatenate every row per field into one flat sequence per field.
    pub fn concatenated(&self) -> IndexMap<FieldName, Vec<TokenId>> {
        self.fields
            .iter()
            .map(|(name, rows)| {
                let total = rows.iter().map(Vec::len).sum();
                let mut flat = Vec::with_capacity(total);
                for row in rows {
                    flat.extend_from_slice(row);
                }
                (name.clone(), flat)
            })
            .collect()
    }

    /// Re-frame each row as its own single-row batch.
    pub fn split_rows(self) -> Vec<TokenBatch> {
        let num_rows = self.num_rows();
        let mut out: Vec<TokenBatch> = (0..num_rows).map(|_| TokenBatch::new()).collect();
        for (name, rows) in self.fields {
            for (batch, row) in out.iter_mut().zip(rows) {
                batch.fields.insert(name.clone(), vec![row]);
            }
        }
        out
    }

    /// Build a batch whose rows are `windows`. Field order follows the first window.
    pub fn from_windows(windows: Vec<TokenWindow>) -> Result<Self, PipelineError> {
        Self::from_rows(windows.into_iter().map(|window| window.fields))
    }

    pub(crate) fn into_fields(self) -> IndexMap<FieldName, Vec<Vec<TokenId>>> {
        self.fields
    }
}

/// One fixed-length training example with all fields in lockstep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenWindow {
    /// Field name to the window's values.
    pub fields: IndexMap<FieldName, Vec<TokenId>>,
}

impl TokenWindow {
    /// Values of the primary field (`input_ids` when present, else the first field).
    pub fn tokens(&self) -> &[TokenId] {
        self.fields
            .get(INPUT_IDS_FIELD)
            .or_else(|| self.fields.values().next())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Values of one field.
    pub fn field(&self, name: &str) -> Option<&[TokenId]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Window length in tokens.
    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    /// Returns `true` for a zero-length window.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::packing::ATTENTION_MASK_FIELD;

    fn two_field_batch() -> TokenBatch {
        TokenBatch::from_fields([
            (INPUT_IDS_FIELD, vec![vec![1, 2, 3], vec![4, 5]]),
            (ATTENTION_MASK_FIELD, vec![vec![1, 1, 1], vec![1, 1]]),
        ])
        .unwrap()
    }

    #[test]
    fn validate_rejects_mismatched_rows_and_lengths() {
        let err = TokenBatch::from_fields([
            (INPUT_IDS_FIELD, vec![vec![1, 2], vec![3]]),
            (ATTENTION_MASK_FIELD, vec![vec![1, 1]]),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBatch(msg) if msg.contains("rows")));

        let err = TokenBatch::from_fields([
            (INPUT_IDS_FIELD, vec![vec![1, 2]]),
            (ATTENTION_MASK_FIELD, vec![vec![1]]),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBatch(msg) if msg.contains("length")));
    }

    #[test]
    fn deserializing_a_ragged_batch_fails() {
        let ragged = serde_json::json!({
            "fields": {
                "input_ids": [[1, 2], [3]],
                "attention_mask": [[1, 1]],
            }
        });
        let err = serde_json::from_value::<TokenBatch>(ragged).unwrap_err();
        assert!(err.to_string().contains("rows"));

        let batch = two_field_batch();
        let round_trip: TokenBatch =
            serde_json::from_value(serde_json::to_value(&batch).unwrap()).unwrap();
        assert_eq!(round_trip, batch);
        assert_eq!(round_trip.rows().count(), 2);
        assert!(round_trip.row(2).is_none());
    }

    #[test]
    fn counts_tokens_on_primary_field() {
        let batch = two_field_batch();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_tokens(), 5);
        assert_eq!(batch.primary_field(), Some(INPUT_IDS_FIELD));

        let custom = TokenBatch::from_fields([("ids", vec![vec![9; 4]])]).unwrap();
        assert_eq!(custom.primary_field(), Some("ids"));
        assert_eq!(custom.num_tokens(), 4);
        assert_eq!(TokenBatch::new().num_tokens(), 0);
        assert!(TokenBatch::new().is_empty());
    }

    #[test]
    fn concatenates_and_splits_rows_per_field() {
        let batch = two_field_batch();
        let flat = batch.concatenated();
        assert_eq!(flat[INPUT_IDS_FIELD], vec![1, 2, 3, 4, 5]);
        assert_eq!(flat[ATTENTION_MASK_FIELD], vec![1, 1, 1, 1, 1]);

        let singles = batch.clone().split_rows();
        assert_eq!(singles.len(), 2);
        assert_eq!(singles[1].field(INPUT_IDS_FIELD).unwrap(), &[vec![4, 5]]);
        assert_eq!(
            singles[1].field_names().collect::<Vec<_>>(),
            vec![INPUT_IDS_FIELD, ATTENTION_MASK_FIELD]
        );
    }

    #[test]
    fn rows_round_trip_through_windows() {
        let batch = two_field_batch();
        let windows: Vec<TokenWindow> = batch.rows().collect();
        assert_eq!(windows[0].tokens(), &[1, 2, 3]);
        assert_eq!(windows[1].field(ATTENTION_MASK_FIELD).unwrap(), &[1, 1]);
        assert_eq!(TokenBatch::from_windows(windows).unwrap(), batch);
    }

    #[test]
    fn from_rows_rejects_inconsistent_field_sets() {
        let mut first = IndexMap::new();
        first.insert(INPUT_IDS_FIELD.to_string(), vec![1]);
        let mut second = IndexMap::new();
        second.insert("other".to_string(), vec![2]);
        assert!(TokenBatch::from_rows([first, second]).is_err());
    }
}
