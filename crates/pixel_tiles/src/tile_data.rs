//! Reference-counted tile pixel blocks.
//!
//! A [`TileData`] is one tile's raw pixel buffer plus the bookkeeping the
//! copy-on-write and swap machinery needs:
//! - holder count: long-lived owners (tile handles, the table default slot)
//! - buffer state: resident bytes or an on-disk swap slot, guarded by the
//!   per-tile reader/writer lock
//! - LRU stamp and swappable/pinned flags for the store's eviction passes

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::context::StorageCore;
use crate::coords::TileCoord;
use crate::swap::{SwapError, SwapSlot};

/// Owned read guard over a tile buffer.
pub(crate) type BufferReadGuard = ArcRwLockReadGuard<RawRwLock, TileBuffer>;

/// Owned write guard over a tile buffer.
pub(crate) type BufferWriteGuard = ArcRwLockWriteGuard<RawRwLock, TileBuffer>;

/// Where a tile's pixels currently live.
///
/// Exactly one variant holds at any instant observable under the buffer
/// lock; the store flips between them during swap-out and swap-in.
pub(crate) enum TileBuffer {
  Resident(Box<[u8]>),
  Swapped(SwapSlot),
}

impl TileBuffer {
  /// Replaces `self` with an empty resident marker and returns the previous
  /// state. Used during teardown.
  pub(crate) fn take(&mut self) -> TileBuffer {
    std::mem::replace(self, TileBuffer::Resident(Box::default()))
  }

  /// Resident pixel bytes. Only called under a lock that already ensured
  /// residency.
  pub(crate) fn resident_bytes(&self) -> &[u8] {
    match self {
      TileBuffer::Resident(buf) => buf,
      TileBuffer::Swapped(_) => unreachable!("swapped-out tile accessed while locked"),
    }
  }

  /// Mutable resident pixel bytes.
  pub(crate) fn resident_bytes_mut(&mut self) -> &mut [u8] {
    match self {
      TileBuffer::Resident(buf) => buf,
      TileBuffer::Swapped(_) => unreachable!("swapped-out tile accessed while locked"),
    }
  }
}

/// One tile's pixel block.
pub struct TileData {
  col: i32,
  row: i32,
  pixel_size: usize,
  id: u64,
  buffer: Arc<RwLock<TileBuffer>>,
  /// Long-lived owners; drives copy-on-write. Accessor guards share the
  /// allocation without counting here.
  holders: AtomicUsize,
  swappable: AtomicBool,
  pinned: AtomicBool,
  last_access: AtomicU64,
  core: Arc<StorageCore>,
}

impl TileData {
  pub(crate) fn new(
    core: Arc<StorageCore>,
    id: u64,
    coord: TileCoord,
    pixel_size: usize,
    buf: Box<[u8]>,
    stamp: u64,
  ) -> Arc<Self> {
    Arc::new(Self {
      col: coord.col,
      row: coord.row,
      pixel_size,
      id,
      buffer: Arc::new(RwLock::new(TileBuffer::Resident(buf))),
      holders: AtomicUsize::new(0),
      swappable: AtomicBool::new(false),
      pinned: AtomicBool::new(false),
      last_access: AtomicU64::new(stamp),
      core,
    })
  }

  /// Tile column this data belongs to.
  pub fn col(&self) -> i32 {
    self.col
  }

  /// Tile row this data belongs to.
  pub fn row(&self) -> i32 {
    self.row
  }

  /// Bytes per pixel.
  pub fn pixel_size(&self) -> usize {
    self.pixel_size
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  /// Buffer size in bytes, independent of swap state.
  pub(crate) fn byte_len(&self) -> usize {
    crate::coords::TILE_WIDTH as usize * crate::coords::TILE_HEIGHT as usize * self.pixel_size
  }

  pub(crate) fn holder_count(&self) -> usize {
    self.holders.load(Ordering::Acquire)
  }

  /// Pinned data never swaps out. Set on the shared default tile data,
  /// which backs every untouched coordinate.
  pub(crate) fn set_pinned(&self, pinned: bool) {
    self.pinned.store(pinned, Ordering::Release);
  }

  pub(crate) fn is_pinned(&self) -> bool {
    self.pinned.load(Ordering::Acquire)
  }

  pub(crate) fn mark_swappable(&self) {
    self.swappable.store(true, Ordering::Release);
  }

  pub(crate) fn is_swappable(&self) -> bool {
    self.swappable.load(Ordering::Acquire)
  }

  /// Atomically consumes the swappable flag; eviction proceeds only when it
  /// was still set after the exclusive lock was won.
  pub(crate) fn take_swappable(&self) -> bool {
    self.swappable.swap(false, Ordering::AcqRel)
  }

  pub(crate) fn last_access(&self) -> u64 {
    self.last_access.load(Ordering::Relaxed)
  }

  /// Stamps the data as recently used and withdraws it from eviction.
  fn touch(&self) {
    self.swappable.store(false, Ordering::Release);
    self
      .last_access
      .store(self.core.store.next_stamp(), Ordering::Relaxed);
  }

  /// Non-blocking exclusive lock for the eviction pass.
  pub(crate) fn try_lock_exclusive(&self) -> Option<BufferWriteGuard> {
    self.buffer.try_write_arc()
  }

  /// Shared lock on the pixel bytes, reloading them from swap first when
  /// needed. Blocks until the lock is available.
  pub(crate) fn acquire_read(&self) -> Result<BufferReadGuard, SwapError> {
    self.touch();
    let guard = self.buffer.read_arc();
    if matches!(&*guard, TileBuffer::Resident(_)) {
      return Ok(guard);
    }

    // Swapped out: upgrade to exclusive, reload, then downgrade atomically
    // so no reader can observe the swapped state.
    drop(guard);
    let mut guard = self.buffer.write_arc();
    self.core.store.swap_in(&self.core.pool, self, &mut guard)?;
    let guard = ArcRwLockWriteGuard::downgrade(guard);
    self.core.store.maybe_evict(&self.core.pool);
    Ok(guard)
  }

  /// Exclusive lock on the pixel bytes, reloading them from swap first when
  /// needed.
  pub(crate) fn acquire_write(&self) -> Result<BufferWriteGuard, SwapError> {
    self.touch();
    let mut guard = self.buffer.write_arc();
    self.core.store.swap_in(&self.core.pool, self, &mut guard)?;
    Ok(guard)
  }

  /// Copy-on-write duplication: allocates a private block through the pool
  /// and copies this data's bytes into it, registering the copy under the
  /// given coordinate.
  pub(crate) fn fork_as(&self, coord: TileCoord) -> Result<Arc<TileData>, SwapError> {
    let guard = self.acquire_read()?;
    let src = guard.resident_bytes();
    Ok(self.core.new_tile_data_copied(coord, self.pixel_size, src))
  }
}

impl Drop for TileData {
  fn drop(&mut self) {
    // Last owner: no accessor guard can exist, the lock is free.
    let taken = self.buffer.write().take();
    match taken {
      TileBuffer::Resident(buf) => {
        if !buf.is_empty() {
          self.core.store.note_resident_free(buf.len());
          self.core.pool.recycle(buf);
        }
      }
      TileBuffer::Swapped(slot) => self.core.store.release_slot(slot),
    }
    self.core.store.deregister(self.id);
  }
}

/// RAII holder handle for [`TileData`].
///
/// Tiles and the table default slot own their data through this wrapper so
/// the holder count tracks exactly the owners that matter for
/// copy-on-write. Cloning adds a holder; dropping removes one.
pub(crate) struct SharedTileData {
  data: Arc<TileData>,
}

impl SharedTileData {
  pub(crate) fn adopt(data: Arc<TileData>) -> Self {
    data.holders.fetch_add(1, Ordering::AcqRel);
    Self { data }
  }

  /// The underlying shared allocation, without a holder claim.
  pub(crate) fn arc(&self) -> &Arc<TileData> {
    &self.data
  }

  /// True when another tile (or the default slot) also holds this data, so
  /// a writer must fork before mutating.
  pub(crate) fn is_shared(&self) -> bool {
    self.data.holder_count() > 1
  }
}

impl Clone for SharedTileData {
  fn clone(&self) -> Self {
    Self::adopt(self.data.clone())
  }
}

impl Drop for SharedTileData {
  fn drop(&mut self) {
    self.data.holders.fetch_sub(1, Ordering::AcqRel);
  }
}

impl Deref for SharedTileData {
  type Target = TileData;

  fn deref(&self) -> &TileData {
    &self.data
  }
}
