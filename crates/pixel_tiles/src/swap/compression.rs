//! Pluggable tile compression.
//!
//! The swap store compresses tile buffers before writing them out. Any byte
//! compressor can be plugged in; the store tolerates [`TileCompressor::compress`]
//! declining (destination too small, or output not smaller than the input)
//! by writing the raw bytes instead, and it must always be able to
//! decompress whatever it wrote itself.

use std::fmt;

use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};

/// Errors from [`TileCompressor::decompress`].
#[derive(Debug)]
pub enum CompressionError {
  /// Destination buffer cannot hold the decompressed payload.
  OutputTooSmall,
  /// Input bytes are not a valid stream for this compressor.
  Corrupt,
}

impl fmt::Display for CompressionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::OutputTooSmall => write!(f, "decompression output buffer too small"),
      Self::Corrupt => write!(f, "compressed data is corrupt"),
    }
  }
}

impl std::error::Error for CompressionError {}

/// Byte compressor used for swapped-out tiles.
pub trait TileCompressor: Send + Sync {
  /// Worst-case compressed length for `raw_len` input bytes.
  fn max_compressed_len(&self, raw_len: usize) -> usize;

  /// Compresses `input` into `output`.
  ///
  /// Returns the compressed length, or `None` when `output` is too small -
  /// the caller retries with a larger buffer or stores the bytes raw.
  fn compress(&self, input: &[u8], output: &mut [u8]) -> Option<usize>;

  /// Decompresses `input` into `output`, returning the decompressed length.
  fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError>;

  /// Optional tuning hook invoked with the tile byte-size before use.
  fn adjust_for_data_size(&self, _raw_len: usize) {}
}

/// LZ4 block compression.
///
/// Fast enough to run on the painting thread's eviction passes, and
/// decompression speed keeps swap-in stalls short.
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl TileCompressor for Lz4Compressor {
  fn max_compressed_len(&self, raw_len: usize) -> usize {
    get_maximum_output_size(raw_len)
  }

  fn compress(&self, input: &[u8], output: &mut [u8]) -> Option<usize> {
    compress_into(input, output).ok()
  }

  fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
    decompress_into(input, output).map_err(|_| CompressionError::Corrupt)
  }
}
