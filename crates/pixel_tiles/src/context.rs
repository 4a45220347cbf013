//! Storage context.
//!
//! One [`TileStorageContext`] owns the buffer pool and the swap store for a
//! document. It is created when the document opens, injected into every
//! [`DataManager`](crate::DataManager), and torn down (deleting the swap
//! file) when the last reference drops. Tests construct an isolated context
//! each, so nothing is process-global.

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::coords::{TileCoord, TILE_HEIGHT, TILE_WIDTH};
use crate::pool::TileDataPool;
use crate::swap::{EvictionPolicy, TileCompressor, TileDataStore};
use crate::tile_data::TileData;

/// Pool plus swap store shared by every device of one context.
pub(crate) struct StorageCore {
  pub(crate) pool: TileDataPool,
  pub(crate) store: TileDataStore,
}

impl StorageCore {
  /// Allocates tile data and fills every pixel with `pixel`.
  pub(crate) fn new_tile_data_filled(
    self: &Arc<Self>,
    coord: TileCoord,
    pixel_size: usize,
    pixel: &[u8],
  ) -> Arc<TileData> {
    let mut buf = self.pool.allocate(tile_byte_len(pixel_size));
    for chunk in buf.chunks_exact_mut(pixel_size) {
      chunk.copy_from_slice(pixel);
    }
    self.finish_tile_data(coord, pixel_size, buf)
  }

  /// Allocates tile data holding a copy of `src` (copy-on-write fork).
  pub(crate) fn new_tile_data_copied(
    self: &Arc<Self>,
    coord: TileCoord,
    pixel_size: usize,
    src: &[u8],
  ) -> Arc<TileData> {
    let mut buf = self.pool.allocate(tile_byte_len(pixel_size));
    buf.copy_from_slice(src);
    self.finish_tile_data(coord, pixel_size, buf)
  }

  fn finish_tile_data(
    self: &Arc<Self>,
    coord: TileCoord,
    pixel_size: usize,
    buf: Box<[u8]>,
  ) -> Arc<TileData> {
    let len = buf.len();
    let id = self.store.next_id();
    let stamp = self.store.next_stamp();
    let data = TileData::new(self.clone(), id, coord, pixel_size, buf, stamp);
    self.store.register(&data);
    self.store.note_resident_alloc(len);
    self.store.maybe_evict(&self.pool);
    data
  }
}

fn tile_byte_len(pixel_size: usize) -> usize {
  TILE_WIDTH as usize * TILE_HEIGHT as usize * pixel_size
}

/// Resource usage snapshot for diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct MemoryStats {
  /// Bytes of tile buffers resident in memory.
  pub resident_bytes: usize,
  /// Bytes of compressed payloads in the swap file.
  pub swapped_bytes: usize,
  /// Number of tiles currently swapped out.
  pub swapped_tiles: usize,
  /// Bytes of recycled buffers shelved in the pool.
  pub pool_held_bytes: usize,
}

/// Shared tile storage for one document.
#[derive(Clone)]
pub struct TileStorageContext {
  core: Arc<StorageCore>,
}

impl TileStorageContext {
  /// Creates a context with the default LZ4 compressor and LRU eviction.
  pub fn new(config: StorageConfig) -> Self {
    Self {
      core: Arc::new(StorageCore {
        pool: TileDataPool::new(config.pool_limit_bytes),
        store: TileDataStore::new(&config),
      }),
    }
  }

  /// Creates a context with a custom compressor and eviction policy.
  pub fn with_strategy(
    config: StorageConfig,
    compressor: Box<dyn TileCompressor>,
    policy: Box<dyn EvictionPolicy>,
  ) -> Self {
    Self {
      core: Arc::new(StorageCore {
        pool: TileDataPool::new(config.pool_limit_bytes),
        store: TileDataStore::with_strategy(&config, compressor, policy),
      }),
    }
  }

  pub(crate) fn core(&self) -> &Arc<StorageCore> {
    &self.core
  }

  /// Current memory usage across all devices of this context.
  pub fn memory_stats(&self) -> MemoryStats {
    MemoryStats {
      resident_bytes: self.core.store.resident_bytes(),
      swapped_bytes: self.core.store.swapped_bytes(),
      swapped_tiles: self.core.store.swapped_tiles(),
      pool_held_bytes: self.core.pool.held_bytes(),
    }
  }

  /// Swaps out every tile that is neither locked nor pinned, returning the
  /// bytes released. Hosts call this before memory-hungry operations.
  pub fn flush_to_swap(&self) -> usize {
    self.core.store.flush_all(&self.core.pool)
  }
}
