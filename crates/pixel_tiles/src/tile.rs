//! Coordinate-addressed tile handles.
//!
//! A [`Tile`] binds a grid coordinate to its current [`TileData`] and hands
//! out locked pixel accessors. Writers transparently fork shared data
//! (copy-on-write); the pre-fork version is retained as a single-generation
//! "previous" view until a transactional reader consumes it.
//!
//! Locks are not recursive: holding a write guard and requesting another
//! lock on the same tile from the same thread deadlocks. Callers hold
//! exactly one guard per tile at a time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::coords::{LocalPos, TileCoord};
use crate::swap::SwapError;
use crate::tile_data::{BufferReadGuard, BufferWriteGuard, SharedTileData, TileData};

struct Versions {
  current: SharedTileData,
  /// Pre-fork data, populated by copy-on-write and cleared once consumed.
  previous: Option<SharedTileData>,
}

/// A coordinate-addressed handle owning one version of tile pixel data.
pub struct Tile {
  coord: TileCoord,
  versions: Mutex<Versions>,
}

impl Tile {
  pub(crate) fn new(coord: TileCoord, data: SharedTileData) -> Self {
    Self {
      coord,
      versions: Mutex::new(Versions {
        current: data,
        previous: None,
      }),
    }
  }

  /// Grid coordinate; immutable for the tile's lifetime.
  pub fn coord(&self) -> TileCoord {
    self.coord
  }

  /// Acquires shared access to the pixel bytes, swapping them in first if
  /// needed. Blocks until the lock is available.
  pub fn lock_for_read(&self) -> Result<TileReadGuard, SwapError> {
    let data = self.versions.lock().current.arc().clone();
    let guard = data.acquire_read()?;
    Ok(TileReadGuard { data, guard })
  }

  /// Acquires exclusive access to the pixel bytes.
  ///
  /// When the current data is shared with another tile or the table default
  /// slot, a private copy is forked first, so no other handle ever observes
  /// these mutations. The displaced version stays available through
  /// [`Tile::take_previous`].
  pub fn lock_for_write(&self) -> Result<TileWriteGuard, SwapError> {
    let data = {
      let mut versions = self.versions.lock();
      if versions.current.is_shared() {
        let forked = SharedTileData::adopt(versions.current.fork_as(self.coord)?);
        let displaced = std::mem::replace(&mut versions.current, forked);
        versions.previous = Some(displaced);
      }
      versions.current.arc().clone()
    };
    let guard = data.acquire_write()?;
    Ok(TileWriteGuard { data, guard })
  }

  /// True while a pre-fork version is pending consumption.
  pub fn has_pending_change(&self) -> bool {
    self.versions.lock().previous.is_some()
  }

  /// Takes the pre-fork version for a "what changed" reader, clearing it.
  pub fn take_previous(&self) -> Result<Option<TileReadGuard>, SwapError> {
    let displaced = self.versions.lock().previous.take();
    match displaced {
      None => Ok(None),
      Some(shared) => {
        let data = shared.arc().clone();
        drop(shared);
        let guard = data.acquire_read()?;
        Ok(Some(TileReadGuard { data, guard }))
      }
    }
  }

  pub(crate) fn current_data(&self) -> SharedTileData {
    self.versions.lock().current.clone()
  }
}

/// Shared lock over one tile's pixel bytes.
pub struct TileReadGuard {
  data: Arc<TileData>,
  guard: BufferReadGuard,
}

impl TileReadGuard {
  /// The tile's full pixel buffer, row-major.
  pub fn bytes(&self) -> &[u8] {
    self.guard.resident_bytes()
  }

  /// Bytes per pixel.
  pub fn pixel_size(&self) -> usize {
    self.data.pixel_size()
  }

  /// One pixel's bytes at a local position.
  pub fn pixel(&self, local: LocalPos) -> &[u8] {
    let ps = self.data.pixel_size();
    let offset = local.byte_offset(ps);
    &self.bytes()[offset..offset + ps]
  }
}

/// Exclusive lock over one tile's pixel bytes.
pub struct TileWriteGuard {
  data: Arc<TileData>,
  guard: BufferWriteGuard,
}

impl TileWriteGuard {
  /// The tile's full pixel buffer, row-major.
  pub fn bytes(&self) -> &[u8] {
    self.guard.resident_bytes()
  }

  /// Mutable view of the full pixel buffer.
  pub fn bytes_mut(&mut self) -> &mut [u8] {
    self.guard.resident_bytes_mut()
  }

  /// Bytes per pixel.
  pub fn pixel_size(&self) -> usize {
    self.data.pixel_size()
  }

  /// Mutable bytes of one pixel at a local position.
  pub fn pixel_mut(&mut self, local: LocalPos) -> &mut [u8] {
    let ps = self.data.pixel_size();
    let offset = local.byte_offset(ps);
    &mut self.bytes_mut()[offset..offset + ps]
  }
}
