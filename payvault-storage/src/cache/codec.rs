//! Transparent payload compression.
//!
//! Large payloads are gzip-compressed, but only kept compressed when that
//! actually saves enough space; otherwise the raw bytes are stored.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use payvault_core::{CacheError, PayvaultConfig, PayvaultResult};

/// Encoded payload ready for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Compression policy for cache payloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadCodec {
    threshold_bytes: usize,
    min_saving: f64,
}

impl PayloadCodec {
    pub fn new(threshold_bytes: usize, min_saving: f64) -> Self {
        Self {
            threshold_bytes,
            min_saving,
        }
    }

    pub fn from_config(config: &PayvaultConfig) -> Self {
        Self::new(
            config.compression_threshold_bytes,
            config.min_compression_saving,
        )
    }

    /// Compress `raw` when it exceeds the threshold and the result is at
    /// least `min_saving` smaller.
    pub fn encode(&self, raw: Vec<u8>) -> PayvaultResult<EncodedPayload> {
        if raw.len() <= self.threshold_bytes {
            return Ok(EncodedPayload {
                bytes: raw,
                compressed: false,
            });
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
        encoder.write_all(&raw).map_err(compression_error)?;
        let compressed = encoder.finish().map_err(compression_error)?;

        let max_len = raw.len() as f64 * (1.0 - self.min_saving);
        if (compressed.len() as f64) <= max_len {
            tracing::trace!(
                raw_bytes = raw.len(),
                compressed_bytes = compressed.len(),
                "Storing compressed cache payload"
            );
            Ok(EncodedPayload {
                bytes: compressed,
                compressed: true,
            })
        } else {
            Ok(EncodedPayload {
                bytes: raw,
                compressed: false,
            })
        }
    }

    /// Recover the raw bytes of a stored payload.
    pub fn decode(&self, bytes: &[u8], compressed: bool) -> PayvaultResult<Vec<u8>> {
        if !compressed {
            return Ok(bytes.to_vec());
        }
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = Vec::with_capacity(bytes.len() * 2);
        decoder.read_to_end(&mut raw).map_err(compression_error)?;
        Ok(raw)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::from_config(&PayvaultConfig::default())
    }
}

fn compression_error(e: std::io::Error) -> payvault_core::PayvaultError {
    CacheError::Compression {
        reason: e.to_string(),
    }
    .into()
}
