use std::io::{self, Read, Write};
use std::path::Path;

use crate::constants::cache::{
    BITCODE_PREFIX, CACHE_FILE_MAGIC, CACHE_FILE_VERSION, MAX_FRAME_BYTES,
};
use crate::data::TokenBatch;
use crate::errors::PipelineError;
use crate::types::{FieldName, TokenId};

/// On-disk form of one batch: fields in stored order.
#[derive(Clone, Debug, bitcode::Encode, bitcode::Decode)]
struct StoredBatch {
    fields: Vec<(FieldName, Vec<Vec<TokenId>>)>,
}

pub(crate) fn write_header<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(CACHE_FILE_MAGIC)?;
    writer.write_all(&[CACHE_FILE_VERSION])
}

pub(crate) fn read_header<R: Read>(reader: &mut R, path: &Path) -> Result<(), PipelineError> {
    let mut header = [0u8; 5];
    reader
        .read_exact(&mut header)
        .map_err(|err| PipelineError::corruption(path, format!("missing file header: {err}")))?;
    if &header[..4] != CACHE_FILE_MAGIC {
        return Err(PipelineError::corruption(path, "not a cache file (bad magic)"));
    }
    if header[4] != CACHE_FILE_VERSION {
        return Err(PipelineError::corruption(
            path,
            format!(
                "unsupported cache file version {} (expected {CACHE_FILE_VERSION})",
                header[4]
            ),
        ));
    }
    Ok(())
}

pub(crate) fn encode_batch(batch: &TokenBatch) -> Vec<u8> {
    let stored = StoredBatch {
        fields: batch
            .fields()
            .map(|(name, rows)| (name.to_string(), rows.to_vec()))
            .collect(),
    };
    encode_bitcode_payload(&bitcode::encode(&stored))
}

pub(crate) fn decode_batch(bytes: &[u8], path: &Path) -> Result<TokenBatch, PipelineError> {
    let raw = decode_bitcode_payload(bytes, path)?;
    let stored: StoredBatch = bitcode::decode(raw)
        .map_err(|err| PipelineError::corruption(path, format!("corrupt batch payload: {err}")))?;
    TokenBatch::from_fields(stored.fields)
        .map_err(|err| PipelineError::corruption(path, err.to_string()))
}

/// Write one length-prefixed frame.
pub(crate) fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)
}

/// Read one frame; `Ok(None)` at a clean end of file.
pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    path: &Path,
) -> Result<Option<Vec<u8>>, PipelineError> {
    let mut len_bytes = [0u8; 8];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(PipelineError::corruption(path, "truncated frame header"));
            }
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(PipelineError::corruption(path, format!("read failed: {err}")));
            }
        }
    }
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(PipelineError::corruption(
            path,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|err| PipelineError::corruption(path, format!("truncated frame: {err}")))?;
    Ok(Some(payload))
}

fn encode_bitcode_payload(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + bytes.len());
    out.push(BITCODE_PREFIX);
    out.extend_from_slice(bytes);
    out
}

fn decode_bitcode_payload<'a>(bytes: &'a [u8], path: &Path) -> Result<&'a [u8], PipelineError> {
    match bytes.split_first() {
        Some((&BITCODE_PREFIX, rest)) => Ok(rest),
        _ => Err(PipelineError::corruption(
            path,
            "bitcode payload missing expected prefix",
        )),
    }
}
