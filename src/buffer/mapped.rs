//! Memory-mapped buffer
//!
//! `MappedBuffer` owns the mapping of the whole page file. Readers take the
//! shared lock, writers the exclusive lock, and `grow()` swaps the mapping
//! under the exclusive lock.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::error::{PageKvError, Result};

use super::view::{ByteView, ByteViewMut};

/// The mapping plus the file backing it (if any)
struct Backing {
    map: MmapMut,
    file: Option<File>,
}

/// Shared, growable, bounds-checked view of the mapped page file
///
/// ## Concurrency:
/// - Reads (`read_all`, `get_*`): shared lock, run in parallel
/// - Writes (`write_all`, `set_*`, `move_bytes`): exclusive lock, held only for
///   the duration of one closure or primitive
/// - `grow()`: exclusive lock; remaps in place
pub struct MappedBuffer {
    inner: RwLock<Backing>,
}

impl MappedBuffer {
    /// Open `path` read/write, creating it with `len` bytes if it does not exist
    /// or is shorter than `len`.
    pub fn open_or_create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len();
        if current < len as u64 {
            file.set_len(len as u64)?;
        }

        // SAFETY: the file is opened read/write by this process and is not meant
        // to be modified externally. The map is only reached through the RwLock,
        // and no slice into it outlives a guard, so remapping cannot leave
        // dangling references.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(Self {
            inner: RwLock::new(Backing {
                map,
                file: Some(file),
            }),
        })
    }

    /// Anonymous (in-memory) mapping of `len` zeroed bytes
    pub fn anonymous(len: usize) -> Result<Self> {
        let map = MmapMut::map_anon(len)?;
        Ok(Self {
            inner: RwLock::new(Backing { map, file: None }),
        })
    }

    /// Current length in bytes
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the whole mapping under the shared lock
    pub fn read_all<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.read();
        f(&guard.map[..])
    }

    /// Run `f` over the whole mapping under the exclusive lock
    pub fn write_all<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard.map[..])
    }

    /// Run `f` over `[offset, offset + len)` under the shared lock
    pub fn read<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.read_all(|all| all.bytes_at(offset, len).map(f))
    }

    /// Run `f` over `[offset, offset + len)` under the exclusive lock
    pub fn write<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.write_all(|all| all.bytes_at_mut(offset, len).map(f))
    }

    // =========================================================================
    // Primitive Accessors
    // =========================================================================

    pub fn get_i8(&self, offset: usize) -> Result<i8> {
        self.read_all(|b| b.get_i8(offset))
    }

    pub fn get_i16(&self, offset: usize) -> Result<i16> {
        self.read_all(|b| b.get_i16(offset))
    }

    pub fn get_i32(&self, offset: usize) -> Result<i32> {
        self.read_all(|b| b.get_i32(offset))
    }

    pub fn get_i64(&self, offset: usize) -> Result<i64> {
        self.read_all(|b| b.get_i64(offset))
    }

    pub fn get_f32(&self, offset: usize) -> Result<f32> {
        self.read_all(|b| b.get_f32(offset))
    }

    pub fn get_f64(&self, offset: usize) -> Result<f64> {
        self.read_all(|b| b.get_f64(offset))
    }

    pub fn get_bool(&self, offset: usize) -> Result<bool> {
        self.read_all(|b| b.get_bool(offset))
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.read(offset, len, |b| b.to_vec())
    }

    pub fn set_i8(&self, offset: usize, value: i8) -> Result<()> {
        self.write_all(|b| b.set_i8(offset, value))
    }

    pub fn set_i16(&self, offset: usize, value: i16) -> Result<()> {
        self.write_all(|b| b.set_i16(offset, value))
    }

    pub fn set_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.write_all(|b| b.set_i32(offset, value))
    }

    pub fn set_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.write_all(|b| b.set_i64(offset, value))
    }

    pub fn set_f32(&self, offset: usize, value: f32) -> Result<()> {
        self.write_all(|b| b.set_f32(offset, value))
    }

    pub fn set_f64(&self, offset: usize, value: f64) -> Result<()> {
        self.write_all(|b| b.set_f64(offset, value))
    }

    pub fn set_bool(&self, offset: usize, value: bool) -> Result<()> {
        self.write_all(|b| b.set_bool(offset, value))
    }

    pub fn set_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.write_all(|b| b.set_bytes(offset, data))
    }

    /// Copy `len` bytes from `src` to `dst` inside the mapping
    pub fn move_bytes(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.write_all(|b| b.move_bytes(src, dst, len))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Grow the mapping to `new_len` bytes. Shrinking is rejected.
    ///
    /// File-backed: extend the file and remap it.
    /// Anonymous: allocate a larger anonymous map and copy the old contents.
    pub fn grow(&self, new_len: usize) -> Result<()> {
        let mut guard = self.inner.write();
        let old_len = guard.map.len();
        if new_len < old_len {
            return Err(PageKvError::Config(format!(
                "cannot shrink mapping from {} to {} bytes",
                old_len, new_len
            )));
        }
        if new_len == old_len {
            return Ok(());
        }

        let new_map = match guard.file.as_ref() {
            Some(file) => {
                guard.map.flush()?;
                file.set_len(new_len as u64)?;
                // SAFETY: same file, same exclusivity argument as in
                // `open_or_create`; the old map is dropped under the write lock.
                unsafe { MmapOptions::new().map_mut(file)? }
            }
            None => {
                let mut map = MmapMut::map_anon(new_len)?;
                map[..old_len].copy_from_slice(&guard.map[..]);
                map
            }
        };
        guard.map = new_map;

        tracing::debug!(old_len, new_len, "grew mapped buffer");
        Ok(())
    }

    /// Flush dirty pages of a file-backed mapping to disk
    pub fn flush(&self) -> Result<()> {
        let guard = self.inner.read();
        if guard.file.is_some() {
            guard.map.flush()?;
        }
        Ok(())
    }
}
