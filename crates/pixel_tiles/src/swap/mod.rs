//! Memory-pressure swapping of cold tiles to disk.

pub mod compression;
pub mod file;
pub mod store;

pub use compression::{CompressionError, Lz4Compressor, TileCompressor};
pub use file::{NativeSwapFile, SwapBackend, SwapFile, SwapSlot};
pub use store::{EvictionCandidate, EvictionPolicy, LeastRecentlyUsed, SwapError, TileDataStore};
