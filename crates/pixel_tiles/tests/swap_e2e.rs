//! End-to-end tests for the swap subsystem.
//!
//! Forces tiles through swap-out and back and checks byte-exact recovery,
//! memory accounting, the locked-tile skip rule, and swap file lifecycle.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use pixel_tiles::{
  DataManager, PixelRect, StorageConfig, TileStorageContext, TILE_HEIGHT, TILE_WIDTH,
};

fn swap_context(temp: &TempDir, memory_limit_bytes: usize) -> TileStorageContext {
  TileStorageContext::new(StorageConfig {
    memory_limit_bytes,
    swap_dir: temp.path().to_path_buf(),
    ..StorageConfig::default()
  })
}

fn tile_sized_pattern(fill: impl Fn(usize) -> u8) -> Vec<u8> {
  (0..TILE_WIDTH as usize * TILE_HEIGHT as usize * 4)
    .map(fill)
    .collect()
}

#[test]
fn swap_round_trip_preserves_bytes() {
  let temp = TempDir::new().expect("temp dir");
  let ctx = swap_context(&temp, 1024 * 1024 * 1024);
  let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();

  let mut rng = StdRng::seed_from_u64(0x7155);
  let noise: Vec<u8> = (0..TILE_WIDTH as usize * TILE_HEIGHT as usize * 4)
    .map(|_| rng.r#gen())
    .collect();

  // All-zero and all-0xFF tiles are compressor edge cases; random noise
  // exercises the incompressible raw-storage fallback
  let patterns = [
    tile_sized_pattern(|_| 0x00),
    tile_sized_pattern(|_| 0xFF),
    noise,
  ];

  for (i, pattern) in patterns.iter().enumerate() {
    let rect = PixelRect::new(i as i64 * TILE_WIDTH as i64, 0, TILE_WIDTH, TILE_HEIGHT);
    device.write_rect(&rect, pattern).unwrap();
  }

  // 1. Force everything out to disk
  let released = ctx.flush_to_swap();
  assert!(released > 0, "flush should release resident bytes");

  let stats = ctx.memory_stats();
  assert_eq!(stats.swapped_tiles, patterns.len());

  // 2. Reads transparently swap tiles back in, byte-exact
  for (i, pattern) in patterns.iter().enumerate() {
    let rect = PixelRect::new(i as i64 * TILE_WIDTH as i64, 0, TILE_WIDTH, TILE_HEIGHT);
    assert_eq!(
      device.read_rect(&rect).unwrap(),
      *pattern,
      "pattern {i} must survive the swap round trip"
    );
  }
  assert_eq!(ctx.memory_stats().swapped_tiles, 0);
}

#[test]
fn double_swap_round_trip() {
  let temp = TempDir::new().expect("temp dir");
  let ctx = swap_context(&temp, 1024 * 1024 * 1024);
  let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();

  let pattern = tile_sized_pattern(|i| (i / 3) as u8);
  let rect = PixelRect::new(0, 0, TILE_WIDTH, TILE_HEIGHT);
  device.write_rect(&rect, &pattern).unwrap();

  // Out, in, out again, in again
  ctx.flush_to_swap();
  assert_eq!(device.read_rect(&rect).unwrap(), pattern);
  ctx.flush_to_swap();
  assert_eq!(device.read_rect(&rect).unwrap(), pattern);
}

#[test]
fn painting_past_the_memory_limit_stays_bounded() {
  let temp = TempDir::new().expect("temp dir");
  let tile_bytes = TILE_WIDTH as usize * TILE_HEIGHT as usize * 4;
  // Room for roughly 8 tiles; painting 64 must push the rest to disk
  let ctx = swap_context(&temp, tile_bytes * 8);
  let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();

  for i in 0..64i64 {
    let pixel = [i as u8, 0x5A, 0, 255];
    device.write_pixel(i * TILE_WIDTH as i64, 0, &pixel).unwrap();
  }

  let stats = ctx.memory_stats();
  assert!(
    stats.swapped_tiles > 0,
    "eviction should have kicked in: {stats:?}"
  );

  // Every tile reads back correctly whether resident or swapped
  for i in 0..64i64 {
    assert_eq!(
      device.read_pixel(i * TILE_WIDTH as i64, 0).unwrap(),
      vec![i as u8, 0x5A, 0, 255]
    );
  }
}

#[test]
fn locked_tiles_are_skipped_by_eviction() {
  let temp = TempDir::new().expect("temp dir");
  let ctx = swap_context(&temp, 1024 * 1024 * 1024);
  let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();

  for i in 0..4i64 {
    device
      .write_pixel(i * TILE_WIDTH as i64, 0, &[1, 2, 3, 4])
      .unwrap();
  }

  // Hold a read lock on tile 0 across the flush
  let mut accessor = device.random_accessor();
  let held = accessor.pixel(0, 0).unwrap();
  assert_eq!(held, &[1, 2, 3, 4]);

  ctx.flush_to_swap();
  let stats = ctx.memory_stats();
  assert_eq!(
    stats.swapped_tiles, 3,
    "the locked tile must be deferred, not swapped"
  );

  // The still-locked tile remains readable without touching the disk
  assert_eq!(accessor.pixel(1, 0).unwrap(), &[0, 0, 0, 0]);
}

#[test]
fn swap_file_is_created_and_removed_with_the_context() {
  let temp = TempDir::new().expect("temp dir");
  let files_in = |dir: &std::path::Path| {
    std::fs::read_dir(dir)
      .unwrap()
      .filter_map(|e| e.ok())
      .count()
  };

  {
    let ctx = swap_context(&temp, 1024 * 1024 * 1024);
    let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();
    assert_eq!(files_in(temp.path()), 0, "swap file is created lazily");

    device.write_pixel(0, 0, &[1, 1, 1, 1]).unwrap();
    ctx.flush_to_swap();
    assert_eq!(files_in(temp.path()), 1, "flush materializes the swap file");

    drop(device);
  }

  assert_eq!(
    files_in(temp.path()),
    0,
    "dropping the context removes the swap file"
  );
}

#[test]
fn corrupted_swap_file_surfaces_a_hard_error() {
  let temp = TempDir::new().expect("temp dir");
  let ctx = swap_context(&temp, 1024 * 1024 * 1024);
  let device = DataManager::new(&ctx, 4, &[0, 0, 0, 0]).unwrap();

  let pattern = tile_sized_pattern(|i| i as u8);
  let rect = PixelRect::new(0, 0, TILE_WIDTH, TILE_HEIGHT);
  device.write_rect(&rect, &pattern).unwrap();
  ctx.flush_to_swap();
  assert_eq!(ctx.memory_stats().swapped_tiles, 1);

  // Truncate the swap file behind the store's back
  let swap_path = std::fs::read_dir(temp.path())
    .unwrap()
    .filter_map(|e| e.ok())
    .map(|e| e.path())
    .next()
    .expect("swap file exists");
  std::fs::OpenOptions::new()
    .write(true)
    .open(&swap_path)
    .unwrap()
    .set_len(0)
    .unwrap();

  // Swap-in cannot recover the pixels; the error must be loud, not
  // silently-wrong bytes
  assert!(device.read_rect(&rect).is_err());
}

#[test]
fn mixed_painting_and_flushing_keeps_data_intact() {
  let temp = TempDir::new().expect("temp dir");
  let tile_bytes = TILE_WIDTH as usize * TILE_HEIGHT as usize * 2;
  let ctx = swap_context(&temp, tile_bytes * 4);
  let device = DataManager::new(&ctx, 2, &[0, 0]).unwrap();

  let mut rng = StdRng::seed_from_u64(42);
  let mut expected = Vec::new();
  for round in 0..6i64 {
    for i in 0..8i64 {
      let x = i * TILE_WIDTH as i64;
      let y = round * TILE_HEIGHT as i64;
      let pixel = [rng.r#gen(), rng.r#gen()];
      device.write_pixel(x, y, &pixel).unwrap();
      expected.push((x, y, pixel));
    }
    if round % 2 == 1 {
      ctx.flush_to_swap();
    }
  }

  for (x, y, pixel) in expected {
    assert_eq!(device.read_pixel(x, y).unwrap(), pixel.to_vec());
  }
}
