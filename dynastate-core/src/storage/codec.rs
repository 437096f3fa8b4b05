use crate::table::ChunkBody;
use crate::{Result, StateError};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::ops::Range;

/// Largest body stored in a single item. Leaves headroom under DynamoDB's
/// 400 KiB item limit for the key and link attributes.
pub const DEFAULT_ITEM_SIZE: usize = 400_000;

/// Smallest usable item size: one UTF-8 code point must always fit.
pub const MIN_ITEM_SIZE: usize = 4;

/// How a chain's concatenated bodies must be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Text,
    Gzip,
}

impl BodyEncoding {
    /// Any binary chunk means the payload was compressed when written.
    pub fn detect<'a>(bodies: impl IntoIterator<Item = &'a ChunkBody>) -> Self {
        if bodies.into_iter().any(ChunkBody::is_binary) {
            BodyEncoding::Gzip
        } else {
            BodyEncoding::Text
        }
    }
}

/// Payload after compression, cut into item-sized bodies
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    /// Exact bytes that end up in the table, used for the digest
    pub wire: Bytes,
    pub bodies: Vec<ChunkBody>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    compression: bool,
    item_size: usize,
}

impl ChunkCodec {
    pub fn new(compression: bool, item_size: usize) -> Result<Self> {
        if item_size < MIN_ITEM_SIZE {
            return Err(StateError::config(format!(
                "item size must be at least {} bytes, got {}",
                MIN_ITEM_SIZE, item_size
            )));
        }
        Ok(Self {
            compression,
            item_size,
        })
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Compress (when enabled) and split a payload into chunk bodies.
    ///
    /// Always yields at least one body so an empty payload still replaces the
    /// previous chain.
    pub fn encode(&self, payload: &[u8]) -> Result<EncodedPayload> {
        let mut bodies = Vec::new();

        let wire = if self.compression {
            let wire = Bytes::from(compress(payload)?);
            for range in split(&wire, self.item_size) {
                bodies.push(ChunkBody::Binary(wire.slice(range)));
            }
            wire
        } else {
            let text = std::str::from_utf8(payload).map_err(|e| {
                StateError::codec(format!(
                    "uncompressed payload must be valid UTF-8 ({}); enable compression to store binary data",
                    e
                ))
            })?;
            for range in split_text(text, self.item_size) {
                bodies.push(ChunkBody::Text(text[range].to_string()));
            }
            Bytes::copy_from_slice(payload)
        };

        if bodies.is_empty() {
            bodies.push(if self.compression {
                ChunkBody::Binary(Bytes::new())
            } else {
                ChunkBody::Text(String::new())
            });
        }

        Ok(EncodedPayload { wire, bodies })
    }
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| StateError::codec(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| StateError::codec(format!("gzip compression failed: {}", e)))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StateError::codec(format!("gzip decompression failed: {}", e)))?;
    Ok(out)
}

/// Cut `data` into contiguous ranges of at most `limit` bytes
pub fn split(data: &[u8], limit: usize) -> Vec<Range<usize>> {
    let limit = limit.max(1);
    (0..data.len())
        .step_by(limit)
        .map(|start| start..(start + limit).min(data.len()))
        .collect()
}

/// Like [`split`], but every range ends on a char boundary
pub fn split_text(text: &str, limit: usize) -> Vec<Range<usize>> {
    let limit = limit.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + limit).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // limit smaller than the code point; take the whole code point
            end = start + 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }
        ranges.push(start..end);
        start = end;
    }

    ranges
}

pub fn join<'a>(bodies: impl IntoIterator<Item = &'a ChunkBody>) -> Bytes {
    let mut out = Vec::new();
    for body in bodies {
        out.extend_from_slice(body.as_bytes());
    }
    Bytes::from(out)
}
