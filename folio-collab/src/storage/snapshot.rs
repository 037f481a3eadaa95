//! LZ4 compression for scene text.
//!
//! Scene snapshots are prose with markup, which compresses well; the size is
//! prepended so decompression needs no side channel.

use serde::{Deserialize, Serialize};

use super::StoreError;

/// A compressed copy of a scene's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedSnapshot {
    /// Uncompressed size in bytes.
    pub original_size: u32,
    /// LZ4 block, size-prepended.
    pub compressed: Vec<u8>,
}

impl CompressedSnapshot {
    pub fn compress(content: &str) -> Self {
        Self {
            original_size: content.len() as u32,
            compressed: lz4_flex::compress_prepend_size(content.as_bytes()),
        }
    }

    /// Rebuild from bytes produced by [`CompressedSnapshot::as_bytes`].
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        if bytes.len() < 4 {
            return Err(StoreError::Compression(format!(
                "snapshot too short: {} bytes",
                bytes.len()
            )));
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[..4]);
        Ok(Self {
            original_size: u32::from_le_bytes(size),
            compressed: bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.compressed
    }

    pub fn decompress(&self) -> Result<String, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Original / compressed size.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

/// Running totals over every snapshot a store has written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotStats {
    pub snapshot_count: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
}

impl SnapshotStats {
    pub fn record(&mut self, snapshot: &CompressedSnapshot) {
        self.snapshot_count += 1;
        self.total_original_bytes += snapshot.original_size as u64;
        self.total_compressed_bytes += snapshot.compressed_size() as u64;
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}
