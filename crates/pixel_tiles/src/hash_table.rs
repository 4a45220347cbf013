//! Concurrent coordinate-to-tile map.
//!
//! Maps `TileCoord -> Arc<Tile>` with lazy creation: a never-written
//! coordinate costs nothing, and the first touch inserts a tile backed by
//! the shared default data (a pointer bump, not a buffer copy).
//!
//! Two-level locking discipline: the table lock guards only the map
//! structure and is never held while pixel bytes are touched; pixel
//! mutation is serialized by each tile's own lock. Tile drops (which
//! recycle buffers through the pool) also happen outside the table lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::coords::TileCoord;
use crate::tile::Tile;
use crate::tile_data::SharedTileData;

/// Coordinate-keyed table of live tiles plus the shared default data.
pub struct TileHashTable {
  tiles: RwLock<HashMap<TileCoord, Arc<Tile>>>,
  default_data: Mutex<SharedTileData>,
}

impl TileHashTable {
  pub(crate) fn new(default_data: SharedTileData) -> Self {
    Self {
      tiles: RwLock::new(HashMap::new()),
      default_data: Mutex::new(default_data),
    }
  }

  /// Returns the tile at `coord`, inserting a default-backed one when
  /// absent. The boolean reports whether this call created it.
  pub fn get_tile_lazy(&self, coord: TileCoord) -> (Arc<Tile>, bool) {
    if let Some(tile) = self.tiles.read().get(&coord) {
      return (tile.clone(), false);
    }

    // Build the tile before taking the write lock; insertion itself is
    // pointer bookkeeping only.
    let fresh = Arc::new(Tile::new(coord, self.default_data.lock().clone()));
    let mut tiles = self.tiles.write();
    match tiles.entry(coord) {
      Entry::Occupied(entry) => (entry.get().clone(), false),
      Entry::Vacant(entry) => {
        entry.insert(fresh.clone());
        (fresh, true)
      }
    }
  }

  /// Returns the tile at `coord` for reading without ever growing the
  /// table; absent coordinates get a transient tile over the shared
  /// default.
  pub fn get_read_only_tile_lazy(&self, coord: TileCoord) -> Arc<Tile> {
    if let Some(tile) = self.tiles.read().get(&coord) {
      return tile.clone();
    }
    Arc::new(Tile::new(coord, self.default_data.lock().clone()))
  }

  /// Returns the tile at `coord` if one was ever created there.
  pub fn get_existing(&self, coord: TileCoord) -> Option<Arc<Tile>> {
    self.tiles.read().get(&coord).cloned()
  }

  /// Removes the tile at `coord`. Returns true if one existed.
  pub fn delete_tile(&self, coord: TileCoord) -> bool {
    let removed = {
      let mut tiles = self.tiles.write();
      tiles.remove(&coord)
    };
    // Drops (and possible buffer recycling) happen after the lock is gone
    removed.is_some()
  }

  /// Removes every tile, returning the canvas to the fully sparse state.
  /// The shared default data itself is untouched.
  pub fn clear(&self) {
    let drained: Vec<Arc<Tile>> = {
      let mut tiles = self.tiles.write();
      tiles.drain().map(|(_, tile)| tile).collect()
    };
    drop(drained);
  }

  /// Number of explicitly created tiles.
  pub fn tile_count(&self) -> usize {
    self.tiles.read().len()
  }

  /// Snapshot of all tile coordinates.
  pub fn coords(&self) -> Vec<TileCoord> {
    self.tiles.read().keys().copied().collect()
  }

  /// Calls `f` for every live tile. Iterates over a snapshot, so `f` may
  /// lock tiles freely without holding up the table.
  pub fn for_each_tile(&self, mut f: impl FnMut(&Arc<Tile>)) {
    let snapshot: Vec<Arc<Tile>> = self.tiles.read().values().cloned().collect();
    for tile in &snapshot {
      f(tile);
    }
  }

  /// Tiles whose coordinates fall inside the given column/row bands.
  pub fn tiles_in_band(
    &self,
    cols: RangeInclusive<i32>,
    rows: RangeInclusive<i32>,
  ) -> Vec<Arc<Tile>> {
    self
      .tiles
      .read()
      .iter()
      .filter(|(coord, _)| cols.contains(&coord.col) && rows.contains(&coord.row))
      .map(|(_, tile)| tile.clone())
      .collect()
  }

  pub(crate) fn default_data(&self) -> SharedTileData {
    self.default_data.lock().clone()
  }

  /// Swaps in a new shared default, returning the old one.
  pub(crate) fn set_default_data(&self, data: SharedTileData) -> SharedTileData {
    std::mem::replace(&mut *self.default_data.lock(), data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StorageConfig;
  use crate::context::TileStorageContext;

  fn table_with_default(ctx: &TileStorageContext) -> TileHashTable {
    let data = ctx
      .core()
      .new_tile_data_filled(TileCoord::new(0, 0), 4, &[0, 0, 0, 0]);
    TileHashTable::new(SharedTileData::adopt(data))
  }

  #[test]
  fn lazy_creation_reports_once() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let table = table_with_default(&ctx);

    let (first, created) = table.get_tile_lazy(TileCoord::new(3, -2));
    assert!(created);
    let (second, created) = table.get_tile_lazy(TileCoord::new(3, -2));
    assert!(!created);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(table.tile_count(), 1);
  }

  #[test]
  fn read_only_lookup_never_inserts() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let table = table_with_default(&ctx);

    let tile = table.get_read_only_tile_lazy(TileCoord::new(10, 10));
    assert_eq!(tile.coord(), TileCoord::new(10, 10));
    assert_eq!(table.tile_count(), 0);

    // The transient tile reads the shared default bytes
    let guard = tile.lock_for_read().unwrap();
    assert!(guard.bytes().iter().all(|&b| b == 0));
  }

  #[test]
  fn delete_and_recreate() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let table = table_with_default(&ctx);

    let (tile, _) = table.get_tile_lazy(TileCoord::new(0, 0));
    tile.lock_for_write().unwrap().bytes_mut().fill(0xAA);

    assert!(table.delete_tile(TileCoord::new(0, 0)));
    assert!(!table.delete_tile(TileCoord::new(0, 0)));
    assert_eq!(table.tile_count(), 0);

    // Recreated lazily, again backed by the untouched default
    let (tile, created) = table.get_tile_lazy(TileCoord::new(0, 0));
    assert!(created);
    let guard = tile.lock_for_read().unwrap();
    assert!(guard.bytes().iter().all(|&b| b == 0));
  }

  #[test]
  fn band_query_selects_rows_and_cols() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let table = table_with_default(&ctx);

    for col in 0..4 {
      for row in 0..4 {
        table.get_tile_lazy(TileCoord::new(col, row));
      }
    }

    let band = table.tiles_in_band(1..=2, 0..=3);
    assert_eq!(band.len(), 8);
    assert!(band.iter().all(|t| (1..=2).contains(&t.coord().col)));
  }

  #[test]
  fn large_grid_delete_block_recreates_shared_default_tiles() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let table = table_with_default(&ctx);

    // Lazy tiles share the default data, so a 100 x 300 grid costs hash
    // entries, not pixel buffers
    for col in 0..100 {
      for row in 0..300 {
        table.get_tile_lazy(TileCoord::new(col, row));
      }
    }
    assert_eq!(table.tile_count(), 100 * 300);

    for col in 40..45 {
      for row in 60..65 {
        assert!(table.delete_tile(TileCoord::new(col, row)));
      }
    }
    assert_eq!(table.tile_count(), 100 * 300 - 25);

    // Re-requesting recreates tiles backed by the same shared default
    let default = table.default_data();
    let (tile, created) = table.get_tile_lazy(TileCoord::new(42, 62));
    assert!(created);
    assert!(Arc::ptr_eq(tile.current_data().arc(), default.arc()));
    assert_eq!(table.tile_count(), 100 * 300 - 24);
  }

  #[test]
  fn clear_resets_to_sparse() {
    let ctx = TileStorageContext::new(StorageConfig::default());
    let table = table_with_default(&ctx);

    for i in 0..16 {
      table.get_tile_lazy(TileCoord::new(i, i));
    }
    assert_eq!(table.tile_count(), 16);

    table.clear();
    assert_eq!(table.tile_count(), 0);

    // Default data is still usable afterwards
    let tile = table.get_read_only_tile_lazy(TileCoord::new(0, 0));
    assert!(tile.lock_for_read().unwrap().bytes().iter().all(|&b| b == 0));
  }
}
