//! Storage engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables for a [`TileStorageContext`](crate::TileStorageContext).
///
/// All fields have working defaults; hosts typically load this from their
/// application config file and only override the memory limit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Soft cap on resident tile memory in bytes. When an allocation pushes
  /// resident bytes past this limit, cold tiles are compressed out to the
  /// swap file until usage drops below the low-water mark.
  pub memory_limit_bytes: usize,
  /// Cap on recycled buffer memory held by the tile pool.
  pub pool_limit_bytes: usize,
  /// Directory the swap file is created in. The file is removed when the
  /// owning context is dropped.
  pub swap_dir: PathBuf,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      memory_limit_bytes: 256 * 1024 * 1024,
      pool_limit_bytes: 16 * 1024 * 1024,
      swap_dir: std::env::temp_dir(),
    }
  }
}

impl StorageConfig {
  /// Parses a config from TOML text.
  pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(text)
  }
}
