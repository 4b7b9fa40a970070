//! Storage Module
//!
//! Pages, free-space bitmaps and the slotted-page record format.
//!
//! ## Responsibilities
//! - Partition the mapped buffer into 8 KB pages addressed by number
//! - Track used/free pages in bitmap regions
//! - Impose the slotted-page layout on data pages
//! - Define `PageAccess`, the seam through which the B+tree reaches pages
//!   (directly, or through an MVCC view)
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Page 0: file header                      │
//! │ ┌──────────┬─────────┬──────────────────┐│
//! │ │Magic (4) │Vers (2) │ ... DirRoot @32  ││
//! │ │          │         │ Pages @36 CRC @40││
//! │ └──────────┴─────────┴──────────────────┘│
//! ├──────────────────────────────────────────┤
//! │ Page 1: free-space bitmap, region 0      │
//! │ ┌───────────────┬──────────────────────┐ │
//! │ │FREEMAP_MAGIC  │ 1 bit per data page  │ │
//! │ └───────────────┴──────────────────────┘ │
//! ├──────────────────────────────────────────┤
//! │ Pages 2 ..= 65505: data pages, region 0  │
//! ├──────────────────────────────────────────┤
//! │ Page 65506: free-space bitmap, region 1  │
//! │ ... (repeated as the file grows)         │
//! └──────────────────────────────────────────┘
//! ```

pub mod freespace;
pub mod page_file;
pub mod slotted;

pub use freespace::FreeSpaceMap;
pub use page_file::PageFile;
pub use slotted::{IndexEntry, PageHeader, Record, SlotId, SlottedPage};

use crate::error::Result;

/// Page number inside the page file
pub type PageNo = u32;

/// Fixed page size in bytes
pub const PAGE_SIZE: usize = 8192;

/// Marks an initialised page file (stored at byte 0 of page 0)
pub const PAGE_DB_MAGIC: i32 = -0x1256_8762;

/// Marks an initialised free-space bitmap page
pub const FREEMAP_MAGIC: i32 = 0x1657_8954;

/// Bytes in front of the bitmap on a free-space page
pub const FREEMAP_HEADER: usize = 4;

/// Data pages governed by one bitmap page
pub const DATA_PAGES_PER_REGION: u32 = ((PAGE_SIZE - FREEMAP_HEADER) * 8) as u32;

/// Bitmap page plus its data pages
pub const PAGES_PER_REGION: u32 = DATA_PAGES_PER_REGION + 1;

/// Page-level access as seen by the B+tree.
///
/// Implemented by the raw [`PageFile`] and by the MVCC views, which redirect
/// page numbers to private copies or pre-images. Closures passed to
/// `read_page`/`write_page` run while the buffer lock is held and must not
/// call back into the same `PageAccess`.
pub trait PageAccess {
    /// Run `f` over the visible contents of `page`
    fn read_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Result<R>;

    /// Run `f` over the writable contents of `page`
    fn write_page<R>(&self, page: PageNo, f: impl FnOnce(&mut [u8]) -> R) -> Result<R>;

    /// Allocate a page
    fn new_page(&self) -> Result<PageNo>;

    /// Release a page
    fn free_page(&self, page: PageNo) -> Result<()>;

    /// Whether `page` is allocated
    fn is_used(&self, page: PageNo) -> Result<bool>;
}

impl<T: PageAccess + ?Sized> PageAccess for &T {
    fn read_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        (**self).read_page(page, f)
    }

    fn write_page<R>(&self, page: PageNo, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        (**self).write_page(page, f)
    }

    fn new_page(&self) -> Result<PageNo> {
        (**self).new_page()
    }

    fn free_page(&self, page: PageNo) -> Result<()> {
        (**self).free_page(page)
    }

    fn is_used(&self, page: PageNo) -> Result<bool> {
        (**self).is_used(page)
    }
}
