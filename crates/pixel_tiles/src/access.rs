//! Pixel cursors.
//!
//! Thin cursors over the tile grid that convert canvas coordinates into
//! (tile, intra-tile offset) pairs and only re-resolve a tile when the
//! cursor crosses a tile boundary:
//! - [`RectReader`] / [`RectWriter`]: raster-order walks over a rectangle,
//!   yielding per-tile-row pixel runs
//! - [`RandomAccessor`] / [`RandomWriteAccessor`]: point lookups with a
//!   cached current tile, fast for spatially local access patterns
//!
//! Cursors hold at most one tile lock at a time and release it before
//! acquiring the next, so concurrent cursors over overlapping rectangles
//! cannot deadlock. A cursor never fails mid-walk: the only internal error
//! source is a corrupt swap payload, which is unrecoverable pixel loss and
//! panics rather than serving wrong pixels.

use crate::coords::{to_tile_and_local, PixelRect, TileCoord};
use crate::data_manager::DataManager;
use crate::swap::SwapError;
use crate::tile::{TileReadGuard, TileWriteGuard};

fn swap_panic(e: SwapError) -> ! {
  panic!("unrecoverable pixel loss while iterating: {e}");
}

/// A horizontal run of pixels within one tile row.
pub struct PixelRun<'a> {
  /// Canvas x of the first pixel in the run.
  pub x: i64,
  /// Canvas y of the run.
  pub y: i64,
  /// The run's pixel bytes, `pixel_size` bytes per pixel.
  pub bytes: &'a [u8],
}

/// A mutable horizontal run of pixels within one tile row.
pub struct PixelRunMut<'a> {
  pub x: i64,
  pub y: i64,
  pub bytes: &'a mut [u8],
}

/// Raster-order read cursor over a rectangle.
pub struct RectReader<'a> {
  dm: &'a DataManager,
  rect: PixelRect,
  cursor_x: i64,
  cursor_y: i64,
  tile: Option<(TileCoord, TileReadGuard)>,
}

impl<'a> RectReader<'a> {
  pub(crate) fn new(dm: &'a DataManager, rect: PixelRect) -> Self {
    Self {
      dm,
      rect,
      cursor_x: rect.x,
      cursor_y: rect.y,
      tile: None,
    }
  }

  /// Yields the next run, or `None` once the rectangle is exhausted.
  pub fn next_run(&mut self) -> Option<PixelRun<'_>> {
    if self.rect.is_empty() || self.cursor_y >= self.rect.bottom() {
      return None;
    }

    let (coord, local) = to_tile_and_local(self.cursor_x, self.cursor_y);
    if self.tile.as_ref().map(|(c, _)| *c) != Some(coord) {
      // One lock at a time: release the old tile before taking the next
      self.tile = None;
      let tile = self.dm.read_only_tile(coord);
      let guard = tile.lock_for_read().unwrap_or_else(|e| swap_panic(e));
      self.tile = Some((coord, guard));
    }

    let run_end = self.rect.right().min(coord.pixel_rect().right());
    let len = (run_end - self.cursor_x) as usize;
    let ps = self.dm.pixel_size();
    let start = local.byte_offset(ps);

    let (x, y) = (self.cursor_x, self.cursor_y);
    self.cursor_x = run_end;
    if self.cursor_x >= self.rect.right() {
      self.cursor_x = self.rect.x;
      self.cursor_y += 1;
    }

    let (_, guard) = self.tile.as_ref().expect("tile resolved above");
    Some(PixelRun {
      x,
      y,
      bytes: &guard.bytes()[start..start + len * ps],
    })
  }
}

/// Raster-order write cursor over a rectangle.
///
/// Each touched tile is created lazily, forked if shared, and added to the
/// device extent, exactly as single-pixel writes are.
pub struct RectWriter<'a> {
  dm: &'a DataManager,
  rect: PixelRect,
  cursor_x: i64,
  cursor_y: i64,
  tile: Option<(TileCoord, TileWriteGuard)>,
}

impl<'a> RectWriter<'a> {
  pub(crate) fn new(dm: &'a DataManager, rect: PixelRect) -> Self {
    Self {
      dm,
      rect,
      cursor_x: rect.x,
      cursor_y: rect.y,
      tile: None,
    }
  }

  /// Yields the next mutable run, or `None` once the rectangle is
  /// exhausted.
  pub fn next_run(&mut self) -> Option<PixelRunMut<'_>> {
    if self.rect.is_empty() || self.cursor_y >= self.rect.bottom() {
      return None;
    }

    let (coord, local) = to_tile_and_local(self.cursor_x, self.cursor_y);
    if self.tile.as_ref().map(|(c, _)| *c) != Some(coord) {
      self.tile = None;
      let tile = self.dm.writable_tile(coord);
      let guard = tile.lock_for_write().unwrap_or_else(|e| swap_panic(e));
      self.tile = Some((coord, guard));
    }

    let run_end = self.rect.right().min(coord.pixel_rect().right());
    let len = (run_end - self.cursor_x) as usize;
    let ps = self.dm.pixel_size();
    let start = local.byte_offset(ps);

    let (x, y) = (self.cursor_x, self.cursor_y);
    self.cursor_x = run_end;
    if self.cursor_x >= self.rect.right() {
      self.cursor_x = self.rect.x;
      self.cursor_y += 1;
    }

    let (_, guard) = self.tile.as_mut().expect("tile resolved above");
    Some(PixelRunMut {
      x,
      y,
      bytes: &mut guard.bytes_mut()[start..start + len * ps],
    })
  }
}

/// Point-lookup read cursor with a cached current tile.
pub struct RandomAccessor<'a> {
  dm: &'a DataManager,
  tile: Option<(TileCoord, TileReadGuard)>,
}

impl<'a> RandomAccessor<'a> {
  pub(crate) fn new(dm: &'a DataManager) -> Self {
    Self { dm, tile: None }
  }

  /// Returns the pixel bytes at `(x, y)`; the slice is valid until the next
  /// call on this accessor.
  pub fn pixel(&mut self, x: i64, y: i64) -> Result<&[u8], SwapError> {
    let (coord, local) = to_tile_and_local(x, y);
    if self.tile.as_ref().map(|(c, _)| *c) != Some(coord) {
      self.tile = None;
      let tile = self.dm.read_only_tile(coord);
      let guard = tile.lock_for_read()?;
      self.tile = Some((coord, guard));
    }
    let (_, guard) = self.tile.as_ref().expect("tile resolved above");
    Ok(guard.pixel(local))
  }
}

/// Point-lookup write cursor with a cached current tile.
pub struct RandomWriteAccessor<'a> {
  dm: &'a DataManager,
  tile: Option<(TileCoord, TileWriteGuard)>,
}

impl<'a> RandomWriteAccessor<'a> {
  pub(crate) fn new(dm: &'a DataManager) -> Self {
    Self { dm, tile: None }
  }

  /// Returns mutable pixel bytes at `(x, y)`, creating and forking the
  /// tile as needed.
  pub fn pixel_mut(&mut self, x: i64, y: i64) -> Result<&mut [u8], SwapError> {
    let (coord, local) = to_tile_and_local(x, y);
    if self.tile.as_ref().map(|(c, _)| *c) != Some(coord) {
      self.tile = None;
      let tile = self.dm.writable_tile(coord);
      let guard = tile.lock_for_write()?;
      self.tile = Some((coord, guard));
    }
    let (_, guard) = self.tile.as_mut().expect("tile resolved above");
    Ok(guard.pixel_mut(local))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StorageConfig;
  use crate::context::TileStorageContext;
  use crate::coords::{TILE_HEIGHT, TILE_WIDTH};

  fn device() -> (TileStorageContext, DataManager) {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let dm = DataManager::new(&ctx, 2, &[0xAB, 0xCD]).unwrap();
    (ctx, dm)
  }

  #[test]
  fn reader_covers_rect_in_raster_order() {
    let (_ctx, dm) = device();
    let rect = PixelRect::new(TILE_WIDTH as i64 - 2, 0, 4, 2);

    let mut reader = dm.rect_reader(rect);
    let mut runs = Vec::new();
    while let Some(run) = reader.next_run() {
      runs.push((run.x, run.y, run.bytes.len()));
    }

    // Each row splits into a 2-pixel run per tile
    assert_eq!(
      runs,
      vec![
        (TILE_WIDTH as i64 - 2, 0, 4),
        (TILE_WIDTH as i64, 0, 4),
        (TILE_WIDTH as i64 - 2, 1, 4),
        (TILE_WIDTH as i64, 1, 4),
      ]
    );
  }

  #[test]
  fn reader_yields_default_for_untouched_area() {
    let (_ctx, dm) = device();
    let mut reader = dm.rect_reader(PixelRect::new(-100, -100, 3, 1));
    let run = reader.next_run().unwrap();
    assert_eq!(run.bytes, &[0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
    assert_eq!(dm.tile_count(), 0, "reading must not create tiles");
  }

  #[test]
  fn writer_round_trips_through_reader() {
    let (_ctx, dm) = device();
    let rect = PixelRect::new(10, TILE_HEIGHT as i64 - 1, TILE_WIDTH, 3);

    let mut writer = dm.rect_writer(rect);
    let mut counter = 0u8;
    while let Some(run) = writer.next_run() {
      for byte in run.bytes.iter_mut() {
        *byte = counter;
        counter = counter.wrapping_add(1);
      }
    }
    drop(writer);

    let mut reader = dm.rect_reader(rect);
    let mut expected = 0u8;
    while let Some(run) = reader.next_run() {
      for &byte in run.bytes.iter() {
        assert_eq!(byte, expected);
        expected = expected.wrapping_add(1);
      }
    }
  }

  #[test]
  fn random_accessor_caches_within_a_tile() {
    let (_ctx, dm) = device();
    dm.write_pixel(5, 5, &[1, 2]).unwrap();

    let mut accessor = dm.random_accessor();
    assert_eq!(accessor.pixel(5, 5).unwrap(), &[1, 2]);
    assert_eq!(accessor.pixel(6, 5).unwrap(), &[0xAB, 0xCD]);
    // Crossing into another tile re-resolves transparently
    assert_eq!(
      accessor.pixel(TILE_WIDTH as i64 + 1, 5).unwrap(),
      &[0xAB, 0xCD]
    );
  }

  #[test]
  fn random_write_accessor_grows_extent() {
    let (_ctx, dm) = device();
    let mut accessor = dm.random_write_accessor();
    accessor.pixel_mut(0, 0).unwrap().copy_from_slice(&[7, 7]);
    drop(accessor);

    assert_eq!(
      dm.extent(),
      Some(PixelRect::new(0, 0, TILE_WIDTH, TILE_HEIGHT))
    );
    assert_eq!(dm.read_pixel(0, 0).unwrap(), vec![7, 7]);
  }
}
