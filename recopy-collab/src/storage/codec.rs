//! Value encoding for persisted records.
//!
//! Records are `bincode` (standard config) encoded. Request bodies kept
//! in delivery logs and retry jobs are LZ4 block-compressed with the
//! uncompressed size prepended.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Encode a record for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a stored record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// An LZ4-compressed payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedBody {
    original_size: u32,
    compressed: Vec<u8>,
}

impl CompressedBody {
    pub fn compress(data: &[u8]) -> Self {
        Self {
            original_size: data.len() as u32,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }

    /// Decompressed body as UTF-8 text.
    pub fn text(&self) -> Result<String, StoreError> {
        String::from_utf8(self.decompress()?).map_err(|e| StoreError::Compression(e.to_string()))
    }

    pub fn original_size(&self) -> usize {
        self.original_size as usize
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }

    /// Original / compressed.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

impl std::fmt::Debug for CompressedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedBody")
            .field("original_size", &self.original_size)
            .field("compressed_size", &self.compressed.len())
            .finish()
    }
}
