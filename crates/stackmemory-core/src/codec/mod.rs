//! Blob Codec
//!
//! Compression applied to frame snapshots per storage tier. Every stored blob
//! carries a one-byte codec tag so a record can never be decoded with the
//! wrong algorithm: the tag must agree with the `compression_type` column or
//! the read fails `CorruptRecord`.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// ZSTD level for old/archive tiers. Level 3 is the zstd default; cold blobs
/// are written once and read rarely.
const ZSTD_LEVEL: i32 = 3;

/// Codec applied to a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression (young tier)
    #[default]
    None,
    /// LZ4 block compression (mature tier)
    Lz4,
    /// ZSTD (old and archive tiers)
    Zstd,
}

impl Compression {
    /// Tag byte prepended to every stored blob
    pub fn tag(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd => 2,
        }
    }

    /// Parse a tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Column representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    /// Parse from the column representation
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Compression::None),
            "lz4" => Some(Compression::Lz4),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Encode a payload with the given codec, prepending the tag byte.
pub fn encode(payload: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() / 2 + 1);
    out.push(compression.tag());
    match compression {
        Compression::None => out.extend_from_slice(payload),
        Compression::Lz4 => out.extend_from_slice(&lz4_flex::compress_prepend_size(payload)),
        Compression::Zstd => {
            let compressed = zstd::encode_all(payload, ZSTD_LEVEL)
                .map_err(|e| EngineError::StoreUnavailable(format!("zstd encode: {}", e)))?;
            out.extend_from_slice(&compressed);
        }
    }
    Ok(out)
}

/// Decode a stored blob. `declared` is the codec recorded in the row; it must
/// match the embedded tag byte.
pub fn decode(blob: &[u8], declared: Compression) -> Result<Vec<u8>> {
    let (tag, body) = blob
        .split_first()
        .ok_or_else(|| EngineError::CorruptRecord("empty blob".to_string()))?;
    let tagged = Compression::from_tag(*tag)
        .ok_or_else(|| EngineError::CorruptRecord(format!("unknown codec tag {}", tag)))?;
    if tagged != declared {
        return Err(EngineError::CorruptRecord(format!(
            "codec tag {} does not match declared {}",
            tagged, declared
        )));
    }
    match declared {
        Compression::None => Ok(body.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| EngineError::CorruptRecord(format!("lz4 decode: {}", e))),
        Compression::Zstd => zstd::decode_all(body)
            .map_err(|e| EngineError::CorruptRecord(format!("zstd decode: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_codecs() {
        let payload = b"the same bytes must come back for every supported codec".repeat(20);
        for codec in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let encoded = encode(&payload, codec).unwrap();
            assert_eq!(encoded[0], codec.tag());
            let decoded = decode(&encoded, codec).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_payloads() {
        let payload = "tool_result ".repeat(200).into_bytes();
        let lz4 = encode(&payload, Compression::Lz4).unwrap();
        let zstd = encode(&payload, Compression::Zstd).unwrap();
        assert!(lz4.len() < payload.len());
        assert!(zstd.len() < payload.len());
    }

    #[test]
    fn test_declared_mismatch_is_corrupt() {
        let encoded = encode(b"data", Compression::Lz4).unwrap();
        let err = decode(&encoded, Compression::Zstd).unwrap_err();
        assert_eq!(err.error_code(), "CorruptRecord");
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let err = decode(&[9, 1, 2, 3], Compression::None).unwrap_err();
        assert_eq!(err.error_code(), "CorruptRecord");
    }

    #[test]
    fn test_empty_blob_is_corrupt() {
        assert!(decode(&[], Compression::None).is_err());
    }

    #[test]
    fn test_tag_roundtrip() {
        for codec in [Compression::None, Compression::Lz4, Compression::Zstd] {
            assert_eq!(Compression::from_tag(codec.tag()), Some(codec));
            assert_eq!(Compression::parse_name(codec.as_str()), Some(codec));
        }
        assert_eq!(Compression::from_tag(7), None);
    }
}
