//! Tile buffer pool.
//!
//! Painting creates and drops tile buffers at a high rate; the pool recycles
//! fixed-size blocks per byte-size class instead of round-tripping through
//! the system allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Free-list allocator for tile pixel buffers.
///
/// Blocks are keyed by exact byte length. A device normally produces a
/// single size class (`TILE_WIDTH * TILE_HEIGHT * pixel_size`); unseen sizes
/// simply start a new shelf.
pub struct TileDataPool {
  shelves: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
  held_bytes: AtomicUsize,
  limit_bytes: usize,
}

impl TileDataPool {
  /// Creates a pool that holds at most `limit_bytes` of recycled memory.
  pub fn new(limit_bytes: usize) -> Self {
    Self {
      shelves: Mutex::new(HashMap::new()),
      held_bytes: AtomicUsize::new(0),
      limit_bytes,
    }
  }

  /// Returns a block of exactly `len` bytes.
  ///
  /// Recycled blocks keep their previous contents; fresh blocks are
  /// zero-filled. Callers fill the buffer before sharing it either way.
  /// Allocation failure aborts the process - there is no painting without
  /// pixel storage.
  pub fn allocate(&self, len: usize) -> Box<[u8]> {
    let recycled = self.shelves.lock().get_mut(&len).and_then(Vec::pop);
    match recycled {
      Some(buf) => {
        self.held_bytes.fetch_sub(len, Ordering::Relaxed);
        buf
      }
      None => vec![0u8; len].into_boxed_slice(),
    }
  }

  /// Returns a block to its size class, or drops it once the pool holds
  /// `limit_bytes` of recycled memory.
  pub fn recycle(&self, buf: Box<[u8]>) {
    let len = buf.len();
    if len == 0 || self.held_bytes.load(Ordering::Relaxed) + len > self.limit_bytes {
      return;
    }
    self.shelves.lock().entry(len).or_default().push(buf);
    self.held_bytes.fetch_add(len, Ordering::Relaxed);
  }

  /// Bytes of recycled memory currently shelved.
  pub fn held_bytes(&self) -> usize {
    self.held_bytes.load(Ordering::Relaxed)
  }
}
