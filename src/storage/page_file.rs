//! Page file
//!
//! The mapped buffer seen as numbered pages: file header, free-space
//! allocator, growth, and the per-file lock that serialises mutations.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::buffer::{ByteView, ByteViewMut, MappedBuffer};
use crate::config::Config;
use crate::error::{PageKvError, Result};

use super::freespace::{self, FreeSpaceMap};
use super::slotted;
use super::{PageAccess, PageNo, PAGE_DB_MAGIC, PAGE_SIZE};

// =============================================================================
// Header Layout (page 0)
// =============================================================================

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const DIR_ROOT_OFFSET: usize = 32;
const PAGE_COUNT_OFFSET: usize = 36;
const CHECKSUM_OFFSET: usize = 40;

/// On-disk format version
pub const FORMAT_VERSION: u16 = 1;

fn header_checksum(buf: &[u8]) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(buf.bytes_at(0, CHECKSUM_OFFSET)?);
    Ok(hasher.finalize())
}

fn write_header(buf: &mut [u8], dir_root: PageNo, page_count: u32) -> Result<()> {
    buf.set_i32(MAGIC_OFFSET, PAGE_DB_MAGIC)?;
    buf.set_u16(VERSION_OFFSET, FORMAT_VERSION)?;
    buf.set_u32(DIR_ROOT_OFFSET, dir_root)?;
    buf.set_u32(PAGE_COUNT_OFFSET, page_count)?;
    let crc = header_checksum(buf)?;
    buf.set_u32(CHECKSUM_OFFSET, crc)
}

/// Bytes of data page `page` inside the whole mapped buffer
pub fn page_bytes(buf: &[u8], page: PageNo) -> Result<&[u8]> {
    let page_count = (buf.len() / PAGE_SIZE) as u32;
    if !freespace::is_data_page(page, page_count) {
        return Err(PageKvError::corruption(format!("page {} is not a data page", page)));
    }
    buf.bytes_at(page as usize * PAGE_SIZE, PAGE_SIZE)
}

/// Mutable counterpart of [`page_bytes`]
pub fn page_bytes_mut(buf: &mut [u8], page: PageNo) -> Result<&mut [u8]> {
    let page_count = (buf.len() / PAGE_SIZE) as u32;
    if !freespace::is_data_page(page, page_count) {
        return Err(PageKvError::corruption(format!("page {} is not a data page", page)));
    }
    buf.bytes_at_mut(page as usize * PAGE_SIZE, PAGE_SIZE)
}

/// Writer stamp of a page; unformatted pages carry none
pub fn page_stamp(page: &[u8]) -> Result<u64> {
    if slotted::is_formatted(page)? {
        slotted::last_writer(page)
    } else {
        Ok(0)
    }
}

/// Page-addressed view of the mapped file
///
/// ## Concurrency:
/// - Page reads/writes go through the buffer's RwLock, one closure at a time
/// - `lock()` is the per-file reentrant lock; callers hold it across any
///   multi-step mutation (copy-on-write, commit, structural tree writes)
/// - The allocator cursor has its own small mutex
pub struct PageFile {
    buffer: MappedBuffer,
    freespace: FreeSpaceMap,
    lock: ReentrantMutex<()>,
    grow_pages: u32,
}

impl PageFile {
    /// Open (or create) the page file described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let len = config.initial_pages as usize * PAGE_SIZE;
        let buffer = match &config.path {
            Some(path) => MappedBuffer::open_or_create(path, len)?,
            None => MappedBuffer::anonymous(len)?,
        };
        Self::with_buffer(buffer, config.grow_pages)
    }

    /// Fixed-size in-memory page file
    pub fn in_memory(pages: u32) -> Result<Self> {
        Self::open(&Config::builder().initial_pages(pages).grow_pages(0).build())
    }

    /// Initialise `buffer` if it carries no magic, otherwise validate it
    pub fn with_buffer(buffer: MappedBuffer, grow_pages: u32) -> Result<Self> {
        if buffer.len() % PAGE_SIZE != 0 {
            return Err(PageKvError::InvalidFile(format!(
                "length {} is not a multiple of the page size",
                buffer.len()
            )));
        }

        let file = Self {
            buffer,
            freespace: FreeSpaceMap::new(),
            lock: ReentrantMutex::new(()),
            grow_pages,
        };

        let magic = file.buffer.get_i32(MAGIC_OFFSET)?;
        if magic == PAGE_DB_MAGIC {
            file.validate()?;
        } else {
            file.initialize()?;
        }
        Ok(file)
    }

    fn initialize(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let page_count = self.page_count();

        self.buffer.write_all(|buf| {
            buf.fill_bytes(0, PAGE_SIZE, 0)?;
            FreeSpaceMap::format_regions(buf, 0, freespace::region_count(page_count))
        })?;

        let dir_root = self.new_page()?;
        self.buffer
            .write_all(|buf| write_header(buf, dir_root, page_count))?;

        tracing::debug!(page_count, dir_root, "initialized page file");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let page_count = self.page_count();
        self.buffer.read_all(|buf| -> Result<()> {
            let version = buf.get_u16(VERSION_OFFSET)?;
            if version != FORMAT_VERSION {
                return Err(PageKvError::InvalidFile(format!(
                    "unsupported format version {}",
                    version
                )));
            }
            let stored = buf.get_u32(CHECKSUM_OFFSET)?;
            let actual = header_checksum(buf)?;
            if stored != actual {
                return Err(PageKvError::InvalidFile(format!(
                    "header checksum mismatch: stored {:#x}, computed {:#x}",
                    stored, actual
                )));
            }
            let recorded = buf.get_u32(PAGE_COUNT_OFFSET)?;
            if recorded > page_count {
                return Err(PageKvError::InvalidFile(format!(
                    "header records {} pages but the file holds {}",
                    recorded, page_count
                )));
            }
            FreeSpaceMap::verify_regions(buf, recorded)
        })?;

        // A file longer than its header says was grown outside of us (or the
        // header update was lost): format the regions that are new.
        let recorded = self.buffer.read_all(|buf| buf.get_u32(PAGE_COUNT_OFFSET))?;
        if recorded < page_count {
            self.adopt_growth(recorded, page_count)?;
        }

        tracing::debug!(page_count, "opened page file");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of pages currently mapped
    pub fn page_count(&self) -> u32 {
        (self.buffer.len() / PAGE_SIZE) as u32
    }

    /// Root page of the Directory tree
    pub fn directory_root(&self) -> Result<PageNo> {
        let root = self.buffer.read_all(|buf| buf.get_u32(DIR_ROOT_OFFSET))?;
        if root == 0 {
            return Err(PageKvError::corruption("directory root page is not set"));
        }
        Ok(root)
    }

    /// The per-file lock serialising structural mutation
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Underlying mapped buffer
    pub fn buffer(&self) -> &MappedBuffer {
        &self.buffer
    }

    /// Flush a file-backed mapping
    pub fn flush(&self) -> Result<()> {
        self.buffer.flush()
    }

    /// All in-use data pages in file order
    pub fn used_pages(&self) -> Result<Vec<PageNo>> {
        let page_count = self.page_count();
        self.buffer
            .read_all(|buf| FreeSpaceMap::used_pages(buf, page_count))
    }

    /// Number of free data pages
    pub fn free_page_count(&self) -> Result<u32> {
        let page_count = self.page_count();
        self.buffer
            .read_all(|buf| FreeSpaceMap::free_count(buf, page_count))
    }

    fn page_range(&self, page: PageNo, page_count: u32) -> Result<usize> {
        if !freespace::is_data_page(page, page_count) {
            return Err(PageKvError::corruption(format!(
                "page {} is not a data page of a {}-page file",
                page, page_count
            )));
        }
        Ok(page as usize * PAGE_SIZE)
    }

    /// Copy the full contents of `from` onto `to`
    pub fn copy_page(&self, from: PageNo, to: PageNo) -> Result<()> {
        let page_count = self.page_count();
        let src = self.page_range(from, page_count)?;
        let dst = self.page_range(to, page_count)?;
        self.buffer.move_bytes(src, dst, PAGE_SIZE)
    }

    /// Writer stamp of `page`
    pub fn last_writer(&self, page: PageNo) -> Result<u64> {
        self.read_page(page, page_stamp)?
    }

    pub fn set_last_writer(&self, page: PageNo, writer: u64) -> Result<()> {
        self.write_page(page, |p| slotted::set_last_writer(p, writer))?
    }

    /// Highest writer stamp on any used page
    pub fn max_stamp(&self) -> Result<u64> {
        let pages = self.used_pages()?;
        self.buffer.read_all(|buf| {
            pages.iter().try_fold(0u64, |max, page| -> Result<u64> {
                Ok(max.max(page_stamp(page_bytes(buf, *page)?)?))
            })
        })
    }

    /// Zero the first word so the page is formatted on first use
    fn reset_page(&self, page: PageNo) -> Result<()> {
        self.write_page(page, |p| p.set_u32(0, 0))?
    }

    // =========================================================================
    // Growth
    // =========================================================================

    fn grow(&self) -> Result<bool> {
        if self.grow_pages == 0 {
            return Ok(false);
        }
        let old_count = self.page_count();
        let new_count = old_count
            .checked_add(self.grow_pages)
            .ok_or(PageKvError::FileFull)?;
        self.buffer.grow(new_count as usize * PAGE_SIZE)?;
        self.adopt_growth(old_count, new_count)?;
        Ok(true)
    }

    fn adopt_growth(&self, old_count: u32, new_count: u32) -> Result<()> {
        let from = freespace::region_count(old_count);
        let to = freespace::region_count(new_count);
        self.buffer.write_all(|buf| -> Result<()> {
            FreeSpaceMap::format_regions(buf, from, to)?;
            let dir_root = buf.get_u32(DIR_ROOT_OFFSET)?;
            write_header(buf, dir_root, new_count)
        })?;
        tracing::debug!(old_count, new_count, new_regions = to - from, "grew page file");
        Ok(())
    }
}

impl PageAccess for PageFile {
    fn read_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.buffer.read_all(|buf| {
            let start = self.page_range(page, (buf.len() / PAGE_SIZE) as u32)?;
            Ok(f(buf.bytes_at(start, PAGE_SIZE)?))
        })
    }

    fn write_page<R>(&self, page: PageNo, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.buffer.write_all(|buf| {
            let start = self.page_range(page, (buf.len() / PAGE_SIZE) as u32)?;
            Ok(f(buf.bytes_at_mut(start, PAGE_SIZE)?))
        })
    }

    fn new_page(&self) -> Result<PageNo> {
        let _guard = self.lock.lock();
        loop {
            let page_count = self.page_count();
            let page = self
                .buffer
                .write_all(|buf| self.freespace.allocate(buf, page_count))?;
            if let Some(page) = page {
                self.reset_page(page)?;
                tracing::trace!(page, "allocated page");
                return Ok(page);
            }
            if !self.grow()? {
                return Err(PageKvError::FileFull);
            }
        }
    }

    fn free_page(&self, page: PageNo) -> Result<()> {
        let _guard = self.lock.lock();
        let page_count = self.page_count();
        self.page_range(page, page_count)?;
        self.buffer
            .write_all(|buf| self.freespace.free(buf, page))?;
        tracing::trace!(page, "freed page");
        Ok(())
    }

    fn is_used(&self, page: PageNo) -> Result<bool> {
        self.buffer.read_all(|buf| FreeSpaceMap::is_used(buf, page))
    }
}
