//! The value serializer collaborator: a thin encoding layer so callers can
//! hand the client strings, ints, or raw bytes directly and still exercise
//! the executor's `F`/`f` client-flag round-trip, with a size threshold past
//! which values are transparently zlib-compressed.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::key::Key;

pub const ENCODING_STR: u32 = 0;
pub const ENCODING_INT: u32 = 1;
pub const ENCODING_LONG: u32 = 2;
pub const ENCODING_BINARY: u32 = 8;
pub const ENCODING_ZLIB_COMPRESSED: u32 = 16;

/// A value a caller can hand to `set`/`delta*` without first converting it to
/// bytes themselves.
pub enum CacheValue<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
    Int(i64),
}

impl<'a> From<&'a str> for CacheValue<'a> {
    fn from(v: &'a str) -> Self {
        CacheValue::Str(v)
    }
}
impl<'a> From<&'a [u8]> for CacheValue<'a> {
    fn from(v: &'a [u8]) -> Self {
        CacheValue::Bytes(v)
    }
}
impl From<i64> for CacheValue<'static> {
    fn from(v: i64) -> Self {
        CacheValue::Int(v)
    }
}
impl From<u64> for CacheValue<'static> {
    fn from(v: u64) -> Self {
        CacheValue::Int(v as i64)
    }
}

/// A value decoded off the wire, tagged by the base encoding (independent of
/// whether it happened to be transmitted compressed).
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Str(String),
    Bytes(Vec<u8>),
    Int(i64),
}

impl DecodedValue {
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            DecodedValue::Str(s) => s.as_bytes().to_vec(),
            DecodedValue::Bytes(b) => b.clone(),
            DecodedValue::Int(i) => i.to_string().into_bytes(),
        }
    }
}

/// `serialize(key, value) -> (bytes, encoding_id); unserialize(bytes, encoding_id) -> value`.
/// Encoding-id meaning is opaque to the executor; it just round-trips it
/// through the `F`/`f` flags.
pub trait Serializer: Send + Sync {
    fn serialize(&self, key: &Key, value: &CacheValue) -> Result<(Vec<u8>, u32)>;
    fn unserialize(&self, bytes: &[u8], encoding_id: u32) -> Result<DecodedValue>;
}

/// STR/INT/BINARY encodings with an optional zlib compression pass above a
/// size threshold.
pub struct MixedSerializer {
    pub compression_threshold: usize,
}

impl Default for MixedSerializer {
    fn default() -> Self {
        MixedSerializer {
            compression_threshold: 128,
        }
    }
}

impl MixedSerializer {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(out)
    }
}

impl Serializer for MixedSerializer {
    fn serialize(&self, key: &Key, value: &CacheValue) -> Result<(Vec<u8>, u32)> {
        let (raw, base_id) = match value {
            CacheValue::Str(s) => (s.as_bytes().to_vec(), ENCODING_STR),
            CacheValue::Bytes(b) => (b.to_vec(), ENCODING_BINARY),
            CacheValue::Int(i) => (i.to_string().into_bytes(), ENCODING_LONG),
        };

        if !key.disable_compression() && raw.len() > self.compression_threshold {
            let compressed = self.compress(&raw)?;
            Ok((compressed, base_id | ENCODING_ZLIB_COMPRESSED))
        } else {
            Ok((raw, base_id))
        }
    }

    fn unserialize(&self, bytes: &[u8], encoding_id: u32) -> Result<DecodedValue> {
        let compressed = encoding_id & ENCODING_ZLIB_COMPRESSED != 0;
        let base_id = encoding_id & !ENCODING_ZLIB_COMPRESSED;
        let raw = if compressed {
            self.decompress(bytes)?
        } else {
            bytes.to_vec()
        };

        match base_id {
            ENCODING_STR => String::from_utf8(raw)
                .map(DecodedValue::Str)
                .map_err(|e| Error::Serialization(e.to_string())),
            ENCODING_INT | ENCODING_LONG => std::str::from_utf8(&raw)
                .map_err(|e| Error::Serialization(e.to_string()))
                .and_then(|s| s.parse::<i64>().map_err(|e| Error::Serialization(e.to_string())))
                .map(DecodedValue::Int),
            ENCODING_BINARY => Ok(DecodedValue::Bytes(raw)),
            other => Err(Error::Serialization(format!(
                "unknown encoding id {}",
                other
            ))),
        }
    }
}
