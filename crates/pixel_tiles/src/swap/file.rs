//! Swap backing file.
//!
//! The store writes compressed tile payloads into a single scratch file,
//! addressed as opaque byte regions:
//! - [`SwapBackend`]: positioned read/write over some storage medium
//! - [`NativeSwapFile`]: `std::fs::File` backend
//! - [`SwapFile`]: region allocator (first-fit free list + bump end) on top
//!   of a backend
//!
//! The file never outlives its owning context, so it carries no header or
//! versioning; offsets recorded on swapped-out tiles are the only index.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// On-disk location of one swapped-out tile payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapSlot {
  /// Byte offset of the payload in the backing file.
  pub offset: u64,
  /// Stored payload length (compressed or raw).
  pub stored_len: u32,
  /// Uncompressed tile buffer length.
  pub raw_len: u32,
  /// Whether the payload went through the compressor.
  pub compressed: bool,
}

/// Positioned I/O over the swap medium.
///
/// Methods take `&self`; implementations synchronize internally so many
/// tiles can be evicted or reloaded concurrently with painting.
pub trait SwapBackend: Send + Sync {
  /// Reads exactly `buf.len()` bytes starting at `offset`.
  fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

  /// Writes `data` starting at `offset`.
  fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

  /// Truncates or extends the medium to `len` bytes.
  fn set_len(&self, len: u64) -> io::Result<()>;
}

/// Native swap file wrapping `std::fs::File`.
///
/// Uses a `Mutex<File>` because `seek + read/write` must be atomic on
/// platforms without `pread`/`pwrite`. Contention is low: the painting
/// threads only touch the file on swap-in misses and eviction passes.
pub struct NativeSwapFile {
  file: Mutex<fs::File>,
}

impl NativeSwapFile {
  /// Wraps an already-opened file.
  pub fn new(file: fs::File) -> Self {
    Self {
      file: Mutex::new(file),
    }
  }
}

impl SwapBackend for NativeSwapFile {
  fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut file = self.file.lock();
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
  }

  fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut file = self.file.lock();
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
  }

  fn set_len(&self, len: u64) -> io::Result<()> {
    self.file.lock().set_len(len)
  }
}

/// First-fit free list over file offsets.
///
/// Freed regions are kept sorted by offset and coalesced with their
/// neighbors; allocation falls back to bumping the end of the file.
struct RegionAllocator {
  /// Sorted, non-adjacent `(offset, len)` free spans.
  free: Vec<(u64, u64)>,
  /// End of the allocated portion of the file.
  end: u64,
}

impl RegionAllocator {
  fn new() -> Self {
    Self {
      free: Vec::new(),
      end: 0,
    }
  }

  fn allocate(&mut self, len: u64) -> u64 {
    if let Some(i) = self.free.iter().position(|&(_, flen)| flen >= len) {
      let (offset, flen) = self.free[i];
      if flen == len {
        self.free.remove(i);
      } else {
        self.free[i] = (offset + len, flen - len);
      }
      return offset;
    }
    let offset = self.end;
    self.end += len;
    offset
  }

  fn free(&mut self, offset: u64, len: u64) {
    if len == 0 {
      return;
    }
    let i = self
      .free
      .partition_point(|&(foffset, _)| foffset < offset);

    debug_assert!(
      i == 0 || {
        let (prev, plen) = self.free[i - 1];
        prev + plen <= offset
      },
      "double free in swap file"
    );

    self.free.insert(i, (offset, len));

    // Coalesce with the following span, then the preceding one
    if i + 1 < self.free.len() && self.free[i].0 + self.free[i].1 == self.free[i + 1].0 {
      self.free[i].1 += self.free[i + 1].1;
      self.free.remove(i + 1);
    }
    if i > 0 && self.free[i - 1].0 + self.free[i - 1].1 == self.free[i].0 {
      self.free[i - 1].1 += self.free[i].1;
      self.free.remove(i);
    }

    // Give trailing space back to the file end
    if let Some(&(last, llen)) = self.free.last() {
      if last + llen == self.end {
        self.end = last;
        self.free.pop();
      }
    }
  }
}

static SWAP_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Region-allocated scratch file for swapped-out tiles.
pub struct SwapFile {
  backend: Box<dyn SwapBackend>,
  regions: Mutex<RegionAllocator>,
  /// Set for files we created ourselves; removed on drop.
  path: Option<PathBuf>,
}

impl SwapFile {
  /// Creates a fresh swap file in `dir`.
  ///
  /// The name embeds the process id and a sequence number so concurrent
  /// documents (and crashed predecessors) never collide.
  pub fn create(dir: &Path) -> io::Result<Self> {
    fs::create_dir_all(dir)?;
    let seq = SWAP_FILE_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!("tileswap-{}-{}.bin", std::process::id(), seq));
    let file = fs::File::options()
      .read(true)
      .write(true)
      .create_new(true)
      .open(&path)?;
    Ok(Self {
      backend: Box::new(NativeSwapFile::new(file)),
      regions: Mutex::new(RegionAllocator::new()),
      path: Some(path),
    })
  }

  /// Builds a swap file over an arbitrary backend. The backend's lifetime
  /// is the caller's concern.
  pub fn with_backend(backend: Box<dyn SwapBackend>) -> Self {
    Self {
      backend,
      regions: Mutex::new(RegionAllocator::new()),
      path: None,
    }
  }

  /// Path of the underlying file, when created via [`SwapFile::create`].
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Reserves `len` bytes and returns their offset. Never fails; disk
  /// space is only committed by [`SwapFile::write_region`].
  pub fn allocate_region(&self, len: u32) -> u64 {
    self.regions.lock().allocate(len as u64)
  }

  /// Returns a region to the free list.
  pub fn free_region(&self, offset: u64, len: u32) {
    self.regions.lock().free(offset, len as u64);
  }

  /// Writes a payload into a previously allocated region.
  pub fn write_region(&self, offset: u64, data: &[u8]) -> io::Result<()> {
    self.backend.write_at(offset, data)
  }

  /// Reads a payload back from a region.
  pub fn read_region(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    self.backend.read_at(offset, buf)
  }

  /// End of the allocated portion of the file, in bytes.
  pub fn allocated_end(&self) -> u64 {
    self.regions.lock().end
  }
}

impl Drop for SwapFile {
  fn drop(&mut self) {
    if let Some(path) = &self.path {
      if let Err(e) = fs::remove_file(path) {
        log::warn!("failed to remove swap file {}: {}", path.display(), e);
      }
    }
  }
}
