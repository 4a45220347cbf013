//! Tile swap store.
//!
//! Tracks every live [`TileData`], accounts resident memory, and relieves
//! memory pressure by compressing cold tiles out to the swap file:
//! - mark pass: flags unpinned resident tiles as swappable
//! - evict pass: compresses flagged tiles coldest-first and releases their
//!   buffers, skipping any tile that is currently locked
//! - swap-in: synchronous reload on next access
//!
//! Swap-out failure keeps the tile resident and is only logged; swap-in
//! failure is surfaced as a hard error, since the tile's pixels cannot be
//! recovered.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{trace, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::StorageConfig;
use crate::pool::TileDataPool;
use crate::swap::compression::{Lz4Compressor, TileCompressor};
use crate::swap::file::{SwapFile, SwapSlot};
use crate::tile_data::{TileBuffer, TileData};

/// Errors surfaced by swap-in.
#[derive(Debug)]
pub enum SwapError {
  /// Reading the backing file failed.
  Io(io::Error),
  /// The stored payload for the named tile could not be decompressed.
  Corrupt { col: i32, row: i32 },
}

impl fmt::Display for SwapError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(e) => write!(f, "swap file I/O error: {e}"),
      Self::Corrupt { col, row } => {
        write!(f, "swapped tile ({col}, {row}) is corrupt and cannot be reloaded")
      }
    }
  }
}

impl std::error::Error for SwapError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(e) => Some(e),
      Self::Corrupt { .. } => None,
    }
  }
}

impl From<io::Error> for SwapError {
  fn from(e: io::Error) -> Self {
    Self::Io(e)
  }
}

/// One eviction candidate as seen by an [`EvictionPolicy`].
#[derive(Clone, Copy, Debug)]
pub struct EvictionCandidate {
  /// Store-assigned tile data id.
  pub id: u64,
  /// Monotonic stamp of the most recent lock on the tile.
  pub last_access: u64,
  /// Resident buffer size in bytes.
  pub bytes: usize,
}

/// Orders eviction candidates; earlier entries are swapped out first.
pub trait EvictionPolicy: Send + Sync {
  fn prioritize(&self, candidates: &mut Vec<EvictionCandidate>);
}

/// Default policy: coldest tile first.
#[derive(Debug, Default)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
  fn prioritize(&self, candidates: &mut Vec<EvictionCandidate>) {
    candidates.sort_by_key(|c| c.last_access);
  }
}

/// Registry and eviction engine for all tile data of one storage context.
pub struct TileDataStore {
  registry: Mutex<HashMap<u64, Weak<TileData>>>,
  next_id: AtomicU64,
  clock: AtomicU64,
  resident_bytes: AtomicUsize,
  swapped_bytes: AtomicUsize,
  swapped_tiles: AtomicUsize,
  memory_limit_bytes: usize,
  swap_dir: PathBuf,
  /// Created lazily on the first eviction; most small documents never swap.
  swap_file: Mutex<Option<Arc<SwapFile>>>,
  compressor: Box<dyn TileCompressor>,
  policy: Box<dyn EvictionPolicy>,
}

impl TileDataStore {
  /// Creates a store with the default LZ4 compressor and LRU policy.
  pub fn new(config: &StorageConfig) -> Self {
    Self::with_strategy(config, Box::new(Lz4Compressor), Box::new(LeastRecentlyUsed))
  }

  /// Creates a store with a custom compressor and eviction policy.
  pub fn with_strategy(
    config: &StorageConfig,
    compressor: Box<dyn TileCompressor>,
    policy: Box<dyn EvictionPolicy>,
  ) -> Self {
    Self {
      registry: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(0),
      clock: AtomicU64::new(0),
      resident_bytes: AtomicUsize::new(0),
      swapped_bytes: AtomicUsize::new(0),
      swapped_tiles: AtomicUsize::new(0),
      memory_limit_bytes: config.memory_limit_bytes,
      swap_dir: config.swap_dir.clone(),
      swap_file: Mutex::new(None),
      compressor,
      policy,
    }
  }

  pub(crate) fn next_id(&self) -> u64 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn next_stamp(&self) -> u64 {
    self.clock.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn register(&self, data: &Arc<TileData>) {
    self.registry.lock().insert(data.id(), Arc::downgrade(data));
  }

  pub(crate) fn deregister(&self, id: u64) {
    self.registry.lock().remove(&id);
  }

  pub(crate) fn note_resident_alloc(&self, bytes: usize) {
    self.resident_bytes.fetch_add(bytes, Ordering::Relaxed);
  }

  pub(crate) fn note_resident_free(&self, bytes: usize) {
    self.resident_bytes.fetch_sub(bytes, Ordering::Relaxed);
  }

  /// Releases the swap region of a dropped tile.
  pub(crate) fn release_slot(&self, slot: SwapSlot) {
    self.swapped_bytes
      .fetch_sub(slot.stored_len as usize, Ordering::Relaxed);
    self.swapped_tiles.fetch_sub(1, Ordering::Relaxed);
    if let Some(file) = self.swap_file.lock().as_ref() {
      file.free_region(slot.offset, slot.stored_len);
    }
  }

  /// Bytes of tile buffers currently resident in memory.
  pub fn resident_bytes(&self) -> usize {
    self.resident_bytes.load(Ordering::Relaxed)
  }

  /// Bytes of compressed payloads currently in the swap file.
  pub fn swapped_bytes(&self) -> usize {
    self.swapped_bytes.load(Ordering::Relaxed)
  }

  /// Number of tiles currently swapped out.
  pub fn swapped_tiles(&self) -> usize {
    self.swapped_tiles.load(Ordering::Relaxed)
  }

  fn ensure_swap_file(&self) -> io::Result<Arc<SwapFile>> {
    let mut slot = self.swap_file.lock();
    if let Some(file) = slot.as_ref() {
      return Ok(file.clone());
    }
    let file = Arc::new(SwapFile::create(&self.swap_dir)?);
    trace!(
      "created swap file {}",
      file.path().map(|p| p.display().to_string()).unwrap_or_default()
    );
    *slot = Some(file.clone());
    Ok(file)
  }

  /// Reloads a swapped-out payload into a fresh buffer.
  ///
  /// Called with the tile's exclusive lock held; `state` flips back to
  /// resident before any accessor sees the buffer.
  pub(crate) fn swap_in(
    &self,
    pool: &TileDataPool,
    data: &TileData,
    state: &mut TileBuffer,
  ) -> Result<(), SwapError> {
    let TileBuffer::Swapped(slot) = &*state else {
      return Ok(());
    };
    let slot = *slot;

    let file = self
      .swap_file
      .lock()
      .clone()
      .ok_or(SwapError::Corrupt {
        col: data.col(),
        row: data.row(),
      })?;

    let mut stored = vec![0u8; slot.stored_len as usize];
    file.read_region(slot.offset, &mut stored)?;

    let mut buf = pool.allocate(slot.raw_len as usize);
    if slot.compressed {
      let n = self
        .compressor
        .decompress(&stored, &mut buf)
        .map_err(|_| SwapError::Corrupt {
          col: data.col(),
          row: data.row(),
        })?;
      if n != slot.raw_len as usize {
        return Err(SwapError::Corrupt {
          col: data.col(),
          row: data.row(),
        });
      }
    } else {
      buf.copy_from_slice(&stored);
    }

    file.free_region(slot.offset, slot.stored_len);
    self.swapped_bytes
      .fetch_sub(slot.stored_len as usize, Ordering::Relaxed);
    self.swapped_tiles.fetch_sub(1, Ordering::Relaxed);
    self.note_resident_alloc(buf.len());
    *state = TileBuffer::Resident(buf);
    trace!("swapped in tile ({}, {})", data.col(), data.row());
    Ok(())
  }

  /// Flags every unpinned resident tile as a swap candidate. Any lock taken
  /// afterwards clears the flag again, so only tiles that stay cold survive
  /// to the evict pass.
  fn mark_swappable_pass(&self) {
    let registry = self.registry.lock();
    for weak in registry.values() {
      if let Some(data) = weak.upgrade() {
        if !data.is_pinned() {
          data.mark_swappable();
        }
      }
    }
  }

  /// Swaps out flagged tiles until resident usage drops to `target`.
  ///
  /// Returns the number of bytes released. Tiles are compressed and written
  /// from a parallel iterator; the region allocator and backing file
  /// serialize internally.
  fn evict_below(&self, pool: &TileDataPool, target: usize) -> usize {
    let resident = self.resident_bytes();
    if resident <= target {
      return 0;
    }
    let need = resident - target;

    let mut by_id = HashMap::new();
    let mut candidates = Vec::new();
    {
      let registry = self.registry.lock();
      for (&id, weak) in registry.iter() {
        if let Some(data) = weak.upgrade() {
          if data.is_swappable() {
            candidates.push(EvictionCandidate {
              id,
              last_access: data.last_access(),
              bytes: data.byte_len(),
            });
            by_id.insert(id, data);
          }
        }
      }
    }

    self.policy.prioritize(&mut candidates);

    let mut victims = Vec::new();
    let mut planned = 0usize;
    for candidate in candidates {
      if planned >= need {
        break;
      }
      planned += candidate.bytes;
      victims.push(by_id.remove(&candidate.id).expect("candidate resolved"));
    }

    let freed = AtomicUsize::new(0);
    victims.par_iter().for_each(|data| {
      freed.fetch_add(self.evict_one(pool, data), Ordering::Relaxed);
    });
    freed.into_inner()
  }

  /// Attempts to swap out a single tile. Returns the bytes released, or 0
  /// when the tile was locked, already out, or the write failed.
  fn evict_one(&self, pool: &TileDataPool, data: &Arc<TileData>) -> usize {
    // Never block a painting thread: a locked tile is deferred to a later pass
    let Some(mut guard) = data.try_lock_exclusive() else {
      return 0;
    };
    if !data.take_swappable() {
      return 0;
    }
    let TileBuffer::Resident(buf) = &*guard else {
      return 0;
    };
    let raw_len = buf.len();

    self.compressor.adjust_for_data_size(raw_len);
    // The scratch buffer must also fit the raw fallback
    let mut scratch = vec![0u8; self.compressor.max_compressed_len(raw_len).max(raw_len)];
    let (stored_len, compressed) = match self.compressor.compress(buf, &mut scratch) {
      Some(n) if n < raw_len => (n, true),
      // Incompressible content is stored raw rather than grown
      _ => {
        scratch[..raw_len].copy_from_slice(buf);
        (raw_len, false)
      }
    };

    let file = match self.ensure_swap_file() {
      Ok(file) => file,
      Err(e) => {
        warn!("cannot open swap file, keeping tiles resident: {e}");
        return 0;
      }
    };

    let offset = file.allocate_region(stored_len as u32);
    if let Err(e) = file.write_region(offset, &scratch[..stored_len]) {
      warn!(
        "swap-out of tile ({}, {}) failed, keeping it resident: {e}",
        data.col(),
        data.row()
      );
      file.free_region(offset, stored_len as u32);
      return 0;
    }

    let slot = SwapSlot {
      offset,
      stored_len: stored_len as u32,
      raw_len: raw_len as u32,
      compressed,
    };
    let taken = std::mem::replace(&mut *guard, TileBuffer::Swapped(slot));
    drop(guard);

    let TileBuffer::Resident(buf) = taken else {
      unreachable!("tile state changed under exclusive lock");
    };
    pool.recycle(buf);

    self.note_resident_free(raw_len);
    self.swapped_bytes.fetch_add(stored_len, Ordering::Relaxed);
    self.swapped_tiles.fetch_add(1, Ordering::Relaxed);
    trace!("swapped out tile ({}, {})", data.col(), data.row());
    raw_len
  }

  /// Runs a mark + evict cycle when resident usage exceeds the configured
  /// limit. Cheap when under the limit: a single atomic load.
  pub(crate) fn maybe_evict(&self, pool: &TileDataPool) {
    let limit = self.memory_limit_bytes;
    if self.resident_bytes() <= limit {
      return;
    }
    self.mark_swappable_pass();
    // Low-water mark leaves headroom so each overshoot triggers one pass,
    // not one pass per tile
    let target = limit - limit / 8;
    let freed = self.evict_below(pool, target);
    if freed == 0 {
      trace!("memory limit exceeded but no tile was evictable");
    }
  }

  /// Swaps out everything not currently locked or pinned. Returns bytes
  /// released.
  pub(crate) fn flush_all(&self, pool: &TileDataPool) -> usize {
    self.mark_swappable_pass();
    self.evict_below(pool, 0)
  }
}
