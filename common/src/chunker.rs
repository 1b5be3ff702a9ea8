//! Splitting payloads into bounded, text-safe chunks and decoding them
//! again on the far side.
//!
//! Every chunk is encoded as a standalone `data:` URL carrying base64, so
//! the assembler can decode each one without looking at its neighbours.

use std::num::NonZeroUsize;
use std::ops::Range;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::DecodeError;
use crate::payload::MediaPayload;

/// 512 KiB.
pub const DEFAULT_CHUNK_SIZE: NonZeroUsize = match NonZeroUsize::new(512 * 1024) {
    Some(n) => n,
    None => panic!("chunk size must be non-zero"),
};

const DATA_URL_PREFIX: &str = "data:application/octet-stream;base64,";

/// One slice of a payload, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position; chunks of one payload are dense.
    pub index: usize,
    /// Byte range `[start, end)` of the payload this chunk covers.
    pub range: Range<usize>,
    pub encoded: String,
}

impl Chunk {
    /// Raw (decoded) length in bytes.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Number of chunks a payload of `total` bytes splits into.
pub fn chunk_count(total: usize, chunk_size: NonZeroUsize) -> usize {
    total.div_ceil(chunk_size.get())
}

/// Expected raw length of chunk `index` of a `total`-byte payload.
/// Returns `None` when `index` is past the last chunk.
pub fn expected_chunk_len(total: u64, chunk_size: u64, index: u64) -> Option<u64> {
    if chunk_size == 0 {
        return None;
    }
    let start = index.checked_mul(chunk_size)?;
    if start >= total {
        return None;
    }
    Some((total - start).min(chunk_size))
}

/// Lazily slice `bytes` into encoded chunks.
pub fn chunks(bytes: &[u8], chunk_size: NonZeroUsize) -> impl Iterator<Item = Chunk> + '_ {
    let size = chunk_size.get();
    bytes.chunks(size).enumerate().map(move |(index, slice)| {
        let start = index * size;
        Chunk {
            index,
            range: start..start + slice.len(),
            encoded: encode(slice),
        }
    })
}

/// Split a payload into `ceil(len / chunk_size)` chunks, every one exactly
/// `chunk_size` bytes except possibly the last.
pub fn split(payload: &MediaPayload, chunk_size: NonZeroUsize) -> Vec<Chunk> {
    chunks(payload.bytes(), chunk_size).collect()
}

/// Encode raw bytes into the transport representation.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(bytes.len()));
    out.push_str(DATA_URL_PREFIX);
    STANDARD.encode_string(bytes, &mut out);
    out
}

/// Length of [`encode`]'s output for `raw_len` input bytes.
pub fn encoded_len(raw_len: usize) -> usize {
    DATA_URL_PREFIX.len() + raw_len.div_ceil(3) * 4
}

/// Decode one chunk. Accepts any `data:<type>;base64,` URL, or bare base64.
pub fn decode(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    let body = if encoded.starts_with("data:") {
        let (_, body) = encoded
            .split_once(";base64,")
            .ok_or(DecodeError::NotBase64DataUrl)?;
        body
    } else {
        encoded
    };
    STANDARD
        .decode(body.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}
