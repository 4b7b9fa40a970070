//! Free-space bitmap allocator
//!
//! One bitmap page per region, one bit per data page. Page `n` (a data page)
//! lives in region `(n - 1) / PAGES_PER_REGION` at bit index
//! `(n - 1) % PAGES_PER_REGION - 1`; bit index `-1` is the bitmap page itself.

use parking_lot::Mutex;

use crate::buffer::{ByteView, ByteViewMut};
use crate::error::{PageKvError, Result};

use super::{PageNo, DATA_PAGES_PER_REGION, FREEMAP_HEADER, FREEMAP_MAGIC, PAGES_PER_REGION, PAGE_SIZE};

const BITMAP_BYTES: usize = PAGE_SIZE - FREEMAP_HEADER;

/// First page of region `region` (its bitmap page)
pub fn bitmap_page(region: u32) -> PageNo {
    1 + region * PAGES_PER_REGION
}

/// `(region, bit index)` of data page `page`, `None` for page 0 and bitmap pages
pub fn locate(page: PageNo) -> Option<(u32, u32)> {
    if page < 2 {
        return None;
    }
    let rel = page - 1;
    let idx = rel % PAGES_PER_REGION;
    if idx == 0 {
        return None;
    }
    Some((rel / PAGES_PER_REGION, idx - 1))
}

/// Data page for `(region, bit index)`
fn page_at(region: u32, idx: u32) -> PageNo {
    bitmap_page(region) + 1 + idx
}

/// Number of regions whose bitmap page exists in a file of `page_count` pages
pub fn region_count(page_count: u32) -> u32 {
    if page_count < 2 {
        return 0;
    }
    (page_count - 2) / PAGES_PER_REGION + 1
}

/// Whether `page` is a data page of a file with `page_count` pages
pub fn is_data_page(page: PageNo, page_count: u32) -> bool {
    page < page_count && locate(page).is_some()
}

/// Byte offset and mask of a data page's bit
fn bit_position(page: PageNo) -> Option<(usize, u8)> {
    let (region, idx) = locate(page)?;
    let offset = bitmap_page(region) as usize * PAGE_SIZE + FREEMAP_HEADER + (idx / 8) as usize;
    Some((offset, 1u8 << (idx % 8)))
}

/// Scan position, remembered between allocations
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    region: u32,
    byte: usize,
}

/// Bitmap allocator over the mapped file
///
/// Holds only the scan cursor; the bitmaps themselves live in the mapping and
/// are passed in by the caller, who holds the buffer's write lock.
#[derive(Debug, Default)]
pub struct FreeSpaceMap {
    cursor: Mutex<Cursor>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write empty bitmaps for regions `from..to`
    pub fn format_regions(buf: &mut [u8], from: u32, to: u32) -> Result<()> {
        for region in from..to {
            let offset = bitmap_page(region) as usize * PAGE_SIZE;
            buf.fill_bytes(offset, PAGE_SIZE, 0)?;
            buf.set_i32(offset, FREEMAP_MAGIC)?;
        }
        Ok(())
    }

    /// Verify that every region of a `page_count`-page file carries its magic
    pub fn verify_regions(buf: &[u8], page_count: u32) -> Result<()> {
        for region in 0..region_count(page_count) {
            let page = bitmap_page(region);
            let magic = buf.get_i32(page as usize * PAGE_SIZE)?;
            if magic != FREEMAP_MAGIC {
                return Err(PageKvError::InvalidFile(format!(
                    "free-space page {} has magic {:#x}, expected {:#x}",
                    page, magic, FREEMAP_MAGIC
                )));
            }
        }
        Ok(())
    }

    /// Find a free data page, mark it used and return it.
    ///
    /// Scanning starts where the last allocation succeeded and wraps around
    /// once. `None` means every data page below `page_count` is in use.
    pub fn allocate(&self, buf: &mut [u8], page_count: u32) -> Result<Option<PageNo>> {
        let regions = region_count(page_count);
        if regions == 0 {
            return Ok(None);
        }

        let mut cursor = self.cursor.lock();
        if cursor.region >= regions {
            *cursor = Cursor::default();
        }
        let start = *cursor;

        // Visit regions start.region, start.region + 1, ..., wrapping, and
        // finally the head of start.region that was skipped on the first pass.
        for step in 0..=regions {
            let region = (start.region + step) % regions;
            let (first_byte, last_byte) = if step == 0 {
                (start.byte, BITMAP_BYTES)
            } else if step == regions {
                (0, start.byte)
            } else {
                (0, BITMAP_BYTES)
            };

            let base = bitmap_page(region) as usize * PAGE_SIZE + FREEMAP_HEADER;
            for byte in first_byte..last_byte {
                let first_page = page_at(region, (byte * 8) as u32);
                if first_page >= page_count {
                    break;
                }
                let value = buf.get_u8(base + byte)?;
                if value == 0xFF {
                    continue;
                }
                for bit in 0..8u32 {
                    let page = first_page + bit;
                    if page >= page_count {
                        break;
                    }
                    let mask = 1u8 << bit;
                    if value & mask == 0 {
                        buf.set_u8(base + byte, value | mask)?;
                        *cursor = Cursor { region, byte };
                        return Ok(Some(page));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Clear the bit of `page`. Clearing an already clear bit is a double free.
    pub fn free(&self, buf: &mut [u8], page: PageNo) -> Result<()> {
        let (offset, mask) = bit_position(page)
            .ok_or_else(|| PageKvError::corruption(format!("page {} is not a data page", page)))?;
        let value = buf.get_u8(offset)?;
        if value & mask == 0 {
            return Err(PageKvError::DoubleFree { page });
        }
        buf.set_u8(offset, value & !mask)
    }

    /// Whether data page `page` is allocated. Page 0 and bitmap pages report `false`.
    pub fn is_used(buf: &[u8], page: PageNo) -> Result<bool> {
        match bit_position(page) {
            Some((offset, mask)) => Ok(buf.get_u8(offset)? & mask != 0),
            None => Ok(false),
        }
    }

    /// All allocated data pages in file order
    pub fn used_pages(buf: &[u8], page_count: u32) -> Result<Vec<PageNo>> {
        let mut pages = Vec::new();
        for region in 0..region_count(page_count) {
            for idx in 0..DATA_PAGES_PER_REGION {
                let page = page_at(region, idx);
                if page >= page_count {
                    break;
                }
                if Self::is_used(buf, page)? {
                    pages.push(page);
                }
            }
        }
        Ok(pages)
    }

    /// Count of free data pages
    pub fn free_count(buf: &[u8], page_count: u32) -> Result<u32> {
        let mut free = 0;
        for region in 0..region_count(page_count) {
            for idx in 0..DATA_PAGES_PER_REGION {
                let page = page_at(region, idx);
                if page >= page_count {
                    break;
                }
                if !Self::is_used(buf, page)? {
                    free += 1;
                }
            }
        }
        Ok(free)
    }
}
