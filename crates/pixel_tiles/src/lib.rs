//! Tiled pixel storage for paint devices.
//!
//! Represents an effectively infinite, sparse 2D raster canvas as 64x64
//! pixel tiles with copy-on-write sharing, lazy allocation, and
//! memory-pressure-driven swapping of cold tiles to a compressed backing
//! file. Pixel data is opaque: the store only knows the device's fixed
//! bytes-per-pixel.
//!
//! The public surface is intentionally narrow:
//! - [`TileStorageContext`]: pool + swap store for one document
//! - [`DataManager`]: per-device pixel contract (point and rectangle
//!   read/write, extent, clear, cursors)
//! - [`StorageConfig`]: memory limits and swap location
//!
//! ```
//! use pixel_tiles::{DataManager, PixelRect, StorageConfig, TileStorageContext};
//!
//! let ctx = TileStorageContext::new(StorageConfig::default());
//! let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();
//!
//! device.write_pixel(32, 32, &[255, 0, 0, 255]).unwrap();
//! assert_eq!(device.read_pixel(32, 32).unwrap(), vec![255, 0, 0, 255]);
//! assert_eq!(device.extent(), Some(PixelRect::new(0, 0, 64, 64)));
//! ```

pub mod access;
pub mod config;
pub mod context;
pub mod coords;
pub mod data_manager;
pub mod hash_table;
pub mod pool;
pub mod swap;
pub mod tile;
pub mod tile_data;

pub use access::{PixelRun, PixelRunMut, RandomAccessor, RandomWriteAccessor, RectReader, RectWriter};
pub use config::StorageConfig;
pub use context::{MemoryStats, TileStorageContext};
pub use coords::{
  to_tile_and_local, LocalPos, PixelRect, TileCoord, MAX_CANVAS_COORD, TILE_HEIGHT, TILE_WIDTH,
};
pub use data_manager::{DataManager, DeviceCreateError};
pub use hash_table::TileHashTable;
pub use swap::{
  CompressionError, EvictionCandidate, EvictionPolicy, LeastRecentlyUsed, Lz4Compressor,
  SwapBackend, SwapError, TileCompressor,
};
pub use tile::{Tile, TileReadGuard, TileWriteGuard};
pub use tile_data::TileData;
