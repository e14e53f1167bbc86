//! Direct-I/O backing store adapter.
//!
//! A [`BackingStore`] turns a raw block device or regular file into a
//! positional read/write surface with a fixed alignment requirement. All
//! access is block-aligned; callers that pass unaligned buffers are served
//! transparently through an aligned bounce buffer (see [`AlignedBuf`]).
//!
//! Two implementations ship here: [`FileBackingStore`], which opens the
//! backing object with `O_DIRECT` where the host filesystem allows it, and
//! [`MemoryBackingStore`], a `Vec<u8>`-backed store used by tests that have
//! no real file to open.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};

use log::{debug, warn};
use thiserror::Error;

/// Alignment, in bytes, that every `read_at`/`write_at` offset and length
/// must be a multiple of. Matches `dbs_core::BLOCK_SIZE` by construction;
/// kept as an independent constant here so `dbs-io` has no dependency on
/// `dbs-core`.
pub const ALIGN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("offset {offset} and length {len} must both be multiples of {align}")]
    Misaligned {
        offset: u64,
        len: usize,
        align: usize,
    },
    #[error("{direction} of {len} bytes at offset {offset} failed: {source}")]
    Io {
        direction: Direction,
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Aligned, heap-allocated byte buffer used as a bounce buffer for callers
/// whose own buffer isn't aligned to [`ALIGN`].
pub struct AlignedBuf {
    layout: std::alloc::Layout,
    ptr: *mut u8,
    len: usize,
}

impl AlignedBuf {
    pub fn new(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len.max(1), ALIGN)
            .expect("ALIGN is a valid power-of-two alignment");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Self { layout, ptr, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

fn is_aligned(ptr: *const u8, offset: u64, len: usize) -> bool {
    (ptr as usize) % ALIGN == 0 && (offset as usize) % ALIGN == 0 && len % ALIGN == 0
}

fn align_down(x: u64) -> u64 {
    x - (x % ALIGN as u64)
}

fn align_up(x: u64) -> u64 {
    align_down(x + ALIGN as u64 - 1)
}

/// A positional, block-aligned backing object.
pub trait BackingStore: Send {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;
    /// Write exactly `buf.len()` bytes starting at `offset`.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;
    /// Total size of the backing object, in bytes.
    fn size(&self) -> u64;
    /// Flush any buffered writes to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// A real file or block device, opened (where possible) with `O_DIRECT`.
pub struct FileBackingStore {
    file: File,
    size: u64,
}

impl FileBackingStore {
    /// Opens `path` for read/write. When `direct` is true, attempts to open
    /// with `O_DIRECT`; if the kernel rejects the flag (`EINVAL`, common on
    /// tmpfs/overlay test filesystems), logs a warning and retries without
    /// it rather than failing the open. Every on-device invariant holds
    /// independent of whether the page cache is bypassed.
    pub fn open(path: &std::path::Path, direct: bool) -> io::Result<Self> {
        let file = if direct {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_DIRECT)
                .open(path)
            {
                Ok(f) => f,
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    warn!(
                        "O_DIRECT rejected for {}, falling back to buffered I/O: {}",
                        path.display(),
                        e
                    );
                    OpenOptions::new().read(true).write(true).open(path)?
                }
                Err(e) => return Err(e),
            }
        } else {
            OpenOptions::new().read(true).write(true).open(path)?
        };
        let size = file.metadata()?.len();
        debug!("opened {} ({} bytes, direct={})", path.display(), size, direct);
        Ok(Self { file, size })
    }

    fn raw_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|source| StoreError::Io {
                direction: Direction::Read,
                offset,
                len: buf.len(),
                source,
            })
    }

    fn raw_write(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|source| StoreError::Io {
                direction: Direction::Write,
                offset,
                len: buf.len(),
                source,
            })
    }
}

impl BackingStore for FileBackingStore {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if is_aligned(buf.as_ptr(), offset, buf.len()) {
            return self.raw_read(buf, offset);
        }
        let start = align_down(offset);
        let end = align_up(offset + buf.len() as u64);
        let mut bounce = AlignedBuf::new((end - start) as usize);
        let readable = end.min(self.size).saturating_sub(start) as usize;
        if readable > 0 {
            self.raw_read(&mut bounce.as_mut_slice()[..readable], start)?;
        }
        let inner = (offset - start) as usize;
        buf.copy_from_slice(&bounce.as_slice()[inner..inner + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if is_aligned(buf.as_ptr(), offset, buf.len()) {
            return self.raw_write(buf, offset);
        }
        // Read-modify-write: load the smallest aligned region covering the
        // request, splice the caller's bytes in, write the whole region back.
        let start = align_down(offset);
        let end = align_up(offset + buf.len() as u64);
        let mut bounce = AlignedBuf::new((end - start) as usize);
        let readable = end.min(self.size).saturating_sub(start) as usize;
        if readable > 0 {
            self.raw_read(&mut bounce.as_mut_slice()[..readable], start)?;
        }
        let inner = (offset - start) as usize;
        bounce.as_mut_slice()[inner..inner + buf.len()].copy_from_slice(buf);
        self.raw_write(bounce.as_slice(), start)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|source| StoreError::Io {
            direction: Direction::Write,
            offset: 0,
            len: 0,
            source,
        })
    }
}

/// An in-memory backing store, used by `dbs-core`'s unit tests.
pub struct MemoryBackingStore {
    data: Vec<u8>,
}

impl MemoryBackingStore {
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0u8; size as usize],
        }
    }
}

impl BackingStore for MemoryBackingStore {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        if (offset as usize) % ALIGN != 0 || buf.len() % ALIGN != 0 {
            return Err(StoreError::Misaligned {
                offset,
                len: buf.len(),
                align: ALIGN,
            });
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(StoreError::Io {
                direction: Direction::Read,
                offset,
                len: buf.len(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device"),
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if (offset as usize) % ALIGN != 0 || buf.len() % ALIGN != 0 {
            return Err(StoreError::Misaligned {
                offset,
                len: buf.len(),
                align: ALIGN,
            });
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(StoreError::Io {
                direction: Direction::Write,
                offset,
                len: buf.len(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "write past end of device"),
            });
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryBackingStore::new(ALIGN as u64 * 4);
        let pattern = vec![0xA5u8; ALIGN];
        store.write_at(&pattern, ALIGN as u64).unwrap();
        let mut out = vec![0u8; ALIGN];
        store.read_at(&mut out, ALIGN as u64).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn memory_store_rejects_misaligned_access() {
        let mut store = MemoryBackingStore::new(ALIGN as u64 * 2);
        let mut out = vec![0u8; 10];
        assert!(matches!(
            store.read_at(&mut out, 0),
            Err(StoreError::Misaligned { .. })
        ));
    }

    #[test]
    fn memory_store_rejects_out_of_range() {
        let mut store = MemoryBackingStore::new(ALIGN as u64);
        let mut out = vec![0u8; ALIGN];
        assert!(matches!(
            store.read_at(&mut out, ALIGN as u64),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn file_store_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(ALIGN as u64 * 4).unwrap();
        let mut store = FileBackingStore::open(tmp.path(), false).unwrap();
        let pattern = vec![0x5Au8; ALIGN];
        store.write_at(&pattern, ALIGN as u64 * 2).unwrap();
        store.sync().unwrap();
        let mut out = vec![0u8; ALIGN];
        store.read_at(&mut out, ALIGN as u64 * 2).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn file_store_bounce_buffer_handles_unaligned_len() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(ALIGN as u64 * 2).unwrap();
        let mut store = FileBackingStore::open(tmp.path(), false).unwrap();
        // An unaligned length still round-trips through the bounce buffer
        // as long as offset+len stay within an aligned region on disk.
        let buf = vec![0x11u8; 100];
        // write_at requires offset/len alignment at the MemoryBackingStore
        // level only; FileBackingStore tolerates misalignment via bounce.
        store.write_at(&buf, 0).unwrap();
        let mut out = vec![0u8; 100];
        store.read_at(&mut out, 0).unwrap();
        assert_eq!(out, buf);
    }
}
