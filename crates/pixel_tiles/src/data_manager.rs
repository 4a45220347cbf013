//! Paint-device storage facade.
//!
//! [`DataManager`] is the entire pixel-storage contract the rest of a paint
//! engine sees: single-pixel and rectangular read/write, extent queries,
//! clearing, and the cursor factories painting code iterates with. Tiles,
//! hashing, and swapping never leak upward.

use std::fmt;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::access::{RandomAccessor, RandomWriteAccessor, RectReader, RectWriter};
use crate::context::{StorageCore, TileStorageContext};
use crate::coords::{to_tile_and_local, PixelRect, TileCoord, MAX_CANVAS_COORD, TILE_WIDTH};
use crate::hash_table::TileHashTable;
use crate::swap::SwapError;
use crate::tile::Tile;
use crate::tile_data::SharedTileData;

/// Errors from device construction and default-pixel changes.
#[derive(Debug)]
pub enum DeviceCreateError {
  /// `pixel_size` must be at least one byte.
  ZeroPixelSize,
  /// The default pixel's length does not match the device pixel size.
  DefaultPixelMismatch { pixel_size: usize, got: usize },
}

impl fmt::Display for DeviceCreateError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::ZeroPixelSize => write!(f, "pixel size must be nonzero"),
      Self::DefaultPixelMismatch { pixel_size, got } => {
        write!(
          f,
          "default pixel is {got} bytes but the device pixel size is {pixel_size}"
        )
      }
    }
  }
}

impl std::error::Error for DeviceCreateError {}

/// Tiled pixel storage for one paint device.
///
/// Pixel data is an opaque sequence of `pixel_size`-byte records; all
/// channel math happens a layer above. Methods take `&self` and are safe to
/// call from parallel painting threads.
pub struct DataManager {
  pixel_size: usize,
  core: Arc<StorageCore>,
  table: TileHashTable,
  default_pixel: Mutex<Box<[u8]>>,
  /// Tile-aligned bounds of all explicitly created tiles; grown on writes,
  /// recomputed after deletions.
  extent: Mutex<Option<PixelRect>>,
}

impl DataManager {
  /// Creates a device with the given pixel size and default pixel value.
  pub fn new(
    ctx: &TileStorageContext,
    pixel_size: usize,
    default_pixel: &[u8],
  ) -> Result<Self, DeviceCreateError> {
    if pixel_size == 0 {
      return Err(DeviceCreateError::ZeroPixelSize);
    }
    if default_pixel.len() != pixel_size {
      return Err(DeviceCreateError::DefaultPixelMismatch {
        pixel_size,
        got: default_pixel.len(),
      });
    }

    let core = ctx.core().clone();
    let data = core.new_tile_data_filled(TileCoord::new(0, 0), pixel_size, default_pixel);
    // The default backs every untouched coordinate; evicting it would make
    // cold-canvas reads hit the disk for no memory win
    data.set_pinned(true);

    Ok(Self {
      pixel_size,
      core,
      table: TileHashTable::new(SharedTileData::adopt(data)),
      default_pixel: Mutex::new(default_pixel.into()),
      extent: Mutex::new(None),
    })
  }

  /// Bytes per pixel, fixed for the device's lifetime.
  pub fn pixel_size(&self) -> usize {
    self.pixel_size
  }

  /// The pixel value untouched coordinates read back.
  pub fn default_pixel(&self) -> Vec<u8> {
    self.default_pixel.lock().to_vec()
  }

  /// Replaces the default pixel. Untouched coordinates immediately read
  /// back the new value; tiles already created keep their bytes.
  pub fn set_default_pixel(&self, pixel: &[u8]) -> Result<(), DeviceCreateError> {
    if pixel.len() != self.pixel_size {
      return Err(DeviceCreateError::DefaultPixelMismatch {
        pixel_size: self.pixel_size,
        got: pixel.len(),
      });
    }
    let data = self
      .core
      .new_tile_data_filled(TileCoord::new(0, 0), self.pixel_size, pixel);
    data.set_pinned(true);
    let old = self.table.set_default_data(SharedTileData::adopt(data));
    old.set_pinned(false);
    drop(old);
    *self.default_pixel.lock() = pixel.into();
    Ok(())
  }

  /// Number of explicitly created tiles.
  pub fn tile_count(&self) -> usize {
    self.table.tile_count()
  }

  /// Copies the pixel at `(x, y)` into `dst`. Reading never creates a
  /// tile; untouched coordinates yield the default pixel.
  pub fn read_pixel_into(&self, x: i64, y: i64, dst: &mut [u8]) -> Result<(), SwapError> {
    check_coord(x, y);
    assert_eq!(dst.len(), self.pixel_size);

    let (coord, local) = to_tile_and_local(x, y);
    let tile = self.table.get_read_only_tile_lazy(coord);
    let guard = tile.lock_for_read()?;
    dst.copy_from_slice(guard.pixel(local));
    Ok(())
  }

  /// Returns the pixel at `(x, y)` as an owned value.
  pub fn read_pixel(&self, x: i64, y: i64) -> Result<Vec<u8>, SwapError> {
    let mut out = vec![0u8; self.pixel_size];
    self.read_pixel_into(x, y, &mut out)?;
    Ok(out)
  }

  /// Writes one pixel, creating and forking tiles as needed. The extent
  /// grows to cover the touched tile (tile-aligned granularity).
  pub fn write_pixel(&self, x: i64, y: i64, src: &[u8]) -> Result<(), SwapError> {
    check_coord(x, y);
    assert_eq!(src.len(), self.pixel_size);

    let (coord, local) = to_tile_and_local(x, y);
    let tile = self.writable_tile(coord);
    let mut guard = tile.lock_for_write()?;
    guard.pixel_mut(local).copy_from_slice(src);
    Ok(())
  }

  /// Minimal tile-aligned rectangle covering all created tiles, or `None`
  /// for an untouched device.
  pub fn extent(&self) -> Option<PixelRect> {
    *self.extent.lock()
  }

  /// Drops every tile; the device reads back as all-default again.
  pub fn clear(&self) {
    self.table.clear();
    *self.extent.lock() = None;
  }

  /// Copies a rectangle of pixels into `dst` (row-major, tightly packed).
  pub fn read_rect_into(&self, rect: &PixelRect, dst: &mut [u8]) -> Result<(), SwapError> {
    check_rect(rect);
    let ps = self.pixel_size;
    assert_eq!(dst.len(), rect.width as usize * rect.height as usize * ps);
    if rect.is_empty() {
      return Ok(());
    }

    let dst_stride = rect.width as usize * ps;
    for coord in rect.tile_range() {
      let tile_rect = coord.pixel_rect();
      let inter = rect.intersection(&tile_rect).expect("tile overlaps rect");

      let tile = self.table.get_read_only_tile_lazy(coord);
      let guard = tile.lock_for_read()?;
      let bytes = guard.bytes();

      let run = inter.width as usize * ps;
      for y in inter.y..inter.bottom() {
        let local_x = (inter.x - tile_rect.x) as usize;
        let local_y = (y - tile_rect.y) as usize;
        let src_off = (local_y * TILE_WIDTH as usize + local_x) * ps;
        let dst_off = (y - rect.y) as usize * dst_stride + (inter.x - rect.x) as usize * ps;
        dst[dst_off..dst_off + run].copy_from_slice(&bytes[src_off..src_off + run]);
      }
    }
    Ok(())
  }

  /// Returns a rectangle of pixels as an owned buffer (row-major).
  pub fn read_rect(&self, rect: &PixelRect) -> Result<Vec<u8>, SwapError> {
    let mut out = vec![0u8; rect.width as usize * rect.height as usize * self.pixel_size];
    self.read_rect_into(rect, &mut out)?;
    Ok(out)
  }

  /// Writes a rectangle of pixels from `src` (row-major, tightly packed).
  pub fn write_rect(&self, rect: &PixelRect, src: &[u8]) -> Result<(), SwapError> {
    check_rect(rect);
    let ps = self.pixel_size;
    assert_eq!(src.len(), rect.width as usize * rect.height as usize * ps);
    if rect.is_empty() {
      return Ok(());
    }

    let src_stride = rect.width as usize * ps;
    for coord in rect.tile_range() {
      let tile_rect = coord.pixel_rect();
      let inter = rect.intersection(&tile_rect).expect("tile overlaps rect");

      let tile = self.writable_tile(coord);
      let mut guard = tile.lock_for_write()?;
      let bytes = guard.bytes_mut();

      let run = inter.width as usize * ps;
      for y in inter.y..inter.bottom() {
        let local_x = (inter.x - tile_rect.x) as usize;
        let local_y = (y - tile_rect.y) as usize;
        let dst_off = (local_y * TILE_WIDTH as usize + local_x) * ps;
        let src_off = (y - rect.y) as usize * src_stride + (inter.x - rect.x) as usize * ps;
        bytes[dst_off..dst_off + run].copy_from_slice(&src[src_off..src_off + run]);
      }
    }
    Ok(())
  }

  /// Fills a rectangle with one pixel value.
  pub fn fill_rect(&self, rect: &PixelRect, pixel: &[u8]) -> Result<(), SwapError> {
    check_rect(rect);
    let ps = self.pixel_size;
    assert_eq!(pixel.len(), ps);
    if rect.is_empty() {
      return Ok(());
    }

    for coord in rect.tile_range() {
      let tile_rect = coord.pixel_rect();
      let inter = rect.intersection(&tile_rect).expect("tile overlaps rect");

      let tile = self.writable_tile(coord);
      let mut guard = tile.lock_for_write()?;
      let bytes = guard.bytes_mut();

      for y in inter.y..inter.bottom() {
        let local_x = (inter.x - tile_rect.x) as usize;
        let local_y = (y - tile_rect.y) as usize;
        let off = (local_y * TILE_WIDTH as usize + local_x) * ps;
        let row = &mut bytes[off..off + inter.width as usize * ps];
        for chunk in row.chunks_exact_mut(ps) {
          chunk.copy_from_slice(pixel);
        }
      }
    }
    Ok(())
  }

  /// Resets a rectangle to the default pixel. Tiles fully covered by the
  /// rect are deleted outright (returning those coordinates to the cheap
  /// implicit-default state); partially covered tiles are filled pixel-wise.
  pub fn clear_rect(&self, rect: &PixelRect) -> Result<(), SwapError> {
    check_rect(rect);
    if rect.is_empty() {
      return Ok(());
    }

    let (min_col, min_row, max_col, max_row) = rect.tile_bounds();
    let tiles = self.table.tiles_in_band(min_col..=max_col, min_row..=max_row);
    let default_pixel = self.default_pixel.lock().clone();

    for tile in tiles {
      let tile_rect = tile.coord().pixel_rect();
      if rect.contains_rect(&tile_rect) {
        self.table.delete_tile(tile.coord());
      } else if let Some(inter) = rect.intersection(&tile_rect) {
        self.fill_rect(&inter, &default_pixel)?;
      }
    }

    self.recompute_extent();
    Ok(())
  }

  /// Sequential cursor over a rectangle for reading, raster order.
  pub fn rect_reader(&self, rect: PixelRect) -> RectReader<'_> {
    check_rect(&rect);
    RectReader::new(self, rect)
  }

  /// Sequential cursor over a rectangle for writing, raster order.
  pub fn rect_writer(&self, rect: PixelRect) -> RectWriter<'_> {
    check_rect(&rect);
    RectWriter::new(self, rect)
  }

  /// Random-access read cursor that caches the current tile.
  pub fn random_accessor(&self) -> RandomAccessor<'_> {
    RandomAccessor::new(self)
  }

  /// Random-access write cursor that caches the current tile.
  pub fn random_write_accessor(&self) -> RandomWriteAccessor<'_> {
    RandomWriteAccessor::new(self)
  }

  pub(crate) fn read_only_tile(&self, coord: TileCoord) -> Arc<Tile> {
    self.table.get_read_only_tile_lazy(coord)
  }

  /// Resolves a tile for writing: lazy creation plus tile-aligned extent
  /// growth.
  pub(crate) fn writable_tile(&self, coord: TileCoord) -> Arc<Tile> {
    let (tile, _created) = self.table.get_tile_lazy(coord);
    let tile_rect = coord.pixel_rect();
    let mut extent = self.extent.lock();
    *extent = Some(match *extent {
      None => tile_rect,
      Some(current) => current.union(&tile_rect),
    });
    tile
  }

  fn recompute_extent(&self) {
    let mut bounds: Option<PixelRect> = None;
    for coord in self.table.coords() {
      let rect = coord.pixel_rect();
      bounds = Some(match bounds {
        None => rect,
        Some(current) => current.union(&rect),
      });
    }
    *self.extent.lock() = bounds;
  }
}

#[inline]
fn check_coord(x: i64, y: i64) {
  debug_assert!(
    x.abs() <= MAX_CANVAS_COORD && y.abs() <= MAX_CANVAS_COORD,
    "pixel coordinate ({x}, {y}) outside the supported canvas"
  );
}

#[inline]
fn check_rect(rect: &PixelRect) {
  check_coord(rect.x, rect.y);
  check_coord(rect.right(), rect.bottom());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StorageConfig;
  use crate::coords::TILE_HEIGHT;

  fn device() -> (TileStorageContext, DataManager) {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let dm = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();
    (ctx, dm)
  }

  #[test]
  fn rejects_bad_construction() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    assert!(matches!(
      DataManager::new(&ctx, 0, &[]),
      Err(DeviceCreateError::ZeroPixelSize)
    ));
    assert!(matches!(
      DataManager::new(&ctx, 4, &[1, 2]),
      Err(DeviceCreateError::DefaultPixelMismatch { .. })
    ));
  }

  #[test]
  fn untouched_reads_are_default_and_allocate_nothing() {
    let (_ctx, dm) = device();
    for (x, y) in [(0, 0), (-500, 1000), (123_456, -7)] {
      assert_eq!(dm.read_pixel(x, y).unwrap(), vec![0, 0, 0, 0]);
    }
    assert_eq!(dm.tile_count(), 0);
    assert_eq!(dm.extent(), None);
  }

  #[test]
  fn rect_round_trip_across_tile_seams() {
    let (_ctx, dm) = device();
    // Straddles four tiles
    let rect = PixelRect::new(
      TILE_WIDTH as i64 - 3,
      TILE_HEIGHT as i64 - 2,
      7,
      5,
    );
    let src: Vec<u8> = (0..rect.width as usize * rect.height as usize * 4)
      .map(|i| i as u8)
      .collect();

    dm.write_rect(&rect, &src).unwrap();
    assert_eq!(dm.read_rect(&rect).unwrap(), src);
    assert_eq!(dm.tile_count(), 4);
  }

  #[test]
  fn fill_and_clear_rect() {
    let (_ctx, dm) = device();
    let rect = PixelRect::new(0, 0, TILE_WIDTH * 2, TILE_HEIGHT);
    dm.fill_rect(&rect, &[9, 9, 9, 9]).unwrap();
    assert_eq!(dm.read_pixel(10, 10).unwrap(), vec![9, 9, 9, 9]);
    assert_eq!(dm.tile_count(), 2);

    // Clearing the left tile deletes it; the right one survives
    dm.clear_rect(&PixelRect::new(0, 0, TILE_WIDTH, TILE_HEIGHT))
      .unwrap();
    assert_eq!(dm.tile_count(), 1);
    assert_eq!(dm.read_pixel(10, 10).unwrap(), vec![0, 0, 0, 0]);
    assert_eq!(
      dm.read_pixel(TILE_WIDTH as i64 + 1, 0).unwrap(),
      vec![9, 9, 9, 9]
    );
    assert_eq!(
      dm.extent(),
      Some(PixelRect::new(TILE_WIDTH as i64, 0, TILE_WIDTH, TILE_HEIGHT))
    );
  }

  #[test]
  fn partial_clear_fills_with_default() {
    let (_ctx, dm) = device();
    dm.fill_rect(&PixelRect::new(0, 0, TILE_WIDTH, TILE_HEIGHT), &[5, 5, 5, 5])
      .unwrap();

    // Clear only the left half of the tile
    dm.clear_rect(&PixelRect::new(0, 0, TILE_WIDTH / 2, TILE_HEIGHT))
      .unwrap();
    assert_eq!(dm.tile_count(), 1, "partially cleared tile survives");
    assert_eq!(dm.read_pixel(0, 0).unwrap(), vec![0, 0, 0, 0]);
    assert_eq!(
      dm.read_pixel(TILE_WIDTH as i64 / 2, 0).unwrap(),
      vec![5, 5, 5, 5]
    );
  }

  #[test]
  fn default_pixel_can_change() {
    let (_ctx, dm) = device();
    dm.write_pixel(0, 0, &[1, 1, 1, 1]).unwrap();

    dm.set_default_pixel(&[8, 8, 8, 8]).unwrap();
    // Untouched coordinates see the new default...
    assert_eq!(dm.read_pixel(10_000, 10_000).unwrap(), vec![8, 8, 8, 8]);
    // ...while written pixels keep their bytes
    assert_eq!(dm.read_pixel(0, 0).unwrap(), vec![1, 1, 1, 1]);
  }
}
