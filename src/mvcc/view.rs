//! Page views for MVCC trees
//!
//! ```text
//!            read                       write
//! TxView     private copy, else the     copy-on-write into a private
//!            version visible at base    page stamped with base
//! CommitView the shared page            save a pre-image, re-stamp with
//!                                       the commit id, then write
//! ```
//!
//! A page released by a commit stays allocated, untouched, until no open
//! snapshot predates the commit. Older snapshots may still walk into it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::ByteViewMut;
use crate::error::{PageKvError, Result};
use crate::storage::page_file::{page_bytes, page_bytes_mut, page_stamp};
use crate::storage::{slotted, PageAccess, PageFile, PageNo, PAGE_SIZE};

use super::{Mvcc, PreImage, Transaction};

fn format_stamped(page: &mut [u8], stamp: u64) -> Result<()> {
    slotted::format(page)?;
    slotted::set_last_writer(page, stamp)
}

// =============================================================================
// TxView
// =============================================================================

/// Pages as seen by one open transaction
pub struct TxView<'a> {
    file: &'a PageFile,
    mvcc: &'a Mvcc,
    tx: Arc<Transaction>,
}

impl<'a> TxView<'a> {
    pub fn new(file: &'a PageFile, mvcc: &'a Mvcc, tx: Arc<Transaction>) -> Self {
        Self { file, mvcc, tx }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    fn mapped(&self, page: PageNo) -> Option<PageNo> {
        self.tx.changes().lock().mapped.get(&page).copied()
    }

    /// Shared page holding the version of `page` visible at the snapshot.
    /// Must be called with the buffer lock held so the stamp cannot move.
    fn visible_source(&self, buf: &[u8], page: PageNo) -> Result<PageNo> {
        let base = self.tx.base();
        if page_stamp(page_bytes(buf, page)?)? <= base {
            return Ok(page);
        }
        self.mvcc
            .visible_preimage(page, base)
            .ok_or(PageKvError::MissingPreImage { page, base_id: base })
    }

    /// Private copy of `page`, created on first write
    fn private_copy(&self, page: PageNo) -> Result<PageNo> {
        if let Some(copy) = self.mapped(page) {
            return Ok(copy);
        }

        let copy = self.file.new_page()?;
        let base = self.tx.base();
        let copied = self.file.buffer().write_all(|buf| -> Result<()> {
            let source = self.visible_source(buf, page)?;
            buf.move_bytes(source as usize * PAGE_SIZE, copy as usize * PAGE_SIZE, PAGE_SIZE)?;
            slotted::set_last_writer(page_bytes_mut(buf, copy)?, base)
        });
        if let Err(err) = copied {
            self.file.free_page(copy)?;
            return Err(err);
        }

        self.tx.changes().lock().mapped.insert(page, copy);
        tracing::trace!(tx = self.tx.id(), page, copy, "copied page on write");
        Ok(copy)
    }
}

impl PageAccess for TxView<'_> {
    fn read_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if let Some(copy) = self.mapped(page) {
            return self.file.read_page(copy, f);
        }
        self.file.buffer().read_all(|buf| {
            let source = self.visible_source(buf, page)?;
            Ok(f(page_bytes(buf, source)?))
        })
    }

    fn write_page<R>(&self, page: PageNo, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let copy = self.private_copy(page)?;
        self.file.write_page(copy, f)
    }

    fn new_page(&self) -> Result<PageNo> {
        let page = self.file.new_page()?;
        let base = self.tx.base();
        self.file.write_page(page, |p| format_stamped(p, base))??;
        self.tx.changes().lock().mapped.insert(page, page);
        Ok(page)
    }

    fn free_page(&self, page: PageNo) -> Result<()> {
        let copy = {
            let mut changes = self.tx.changes().lock();
            if changes.freed.contains(&page) {
                return Err(PageKvError::DoubleFree { page });
            }
            let copy = changes.mapped.remove(&page);
            if copy != Some(page) {
                changes.freed.insert(page);
            }
            copy
        };
        if let Some(copy) = copy {
            self.file.free_page(copy)?;
        }
        Ok(())
    }

    fn is_used(&self, page: PageNo) -> Result<bool> {
        {
            let changes = self.tx.changes().lock();
            if changes.freed.contains(&page) {
                return Ok(false);
            }
            if changes.mapped.contains_key(&page) {
                return Ok(true);
            }
        }
        Ok(self.file.is_used(page)?
            || self.mvcc.visible_preimage(page, self.tx.base()).is_some())
    }
}

// =============================================================================
// CommitView
// =============================================================================

struct Touched {
    page: PageNo,
    preimage: PageNo,
}

#[derive(Default)]
struct CommitLog {
    touched: Vec<Touched>,
    touched_pages: HashSet<PageNo>,
    allocated: HashSet<PageNo>,
    freed: Vec<PageNo>,
}

/// What a finished commit changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub touched: usize,
    pub allocated: usize,
    pub freed: usize,
}

/// Shared pages as written by a commit in progress.
/// The caller holds the page-file lock for the lifetime of the view.
pub struct CommitView<'a> {
    file: &'a PageFile,
    mvcc: &'a Mvcc,
    commit_id: u64,
    log: Mutex<CommitLog>,
}

impl<'a> CommitView<'a> {
    pub fn new(file: &'a PageFile, mvcc: &'a Mvcc, commit_id: u64) -> Self {
        Self {
            file,
            mvcc,
            commit_id,
            log: Mutex::new(CommitLog::default()),
        }
    }

    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    /// Save `page` as a pre-image and stamp it, once per commit
    fn prepare_write(&self, page: PageNo) -> Result<()> {
        {
            let log = self.log.lock();
            if log.allocated.contains(&page) || log.touched_pages.contains(&page) {
                return Ok(());
            }
        }

        let owner = self.file.last_writer(page)?;
        let preimage = self.file.new_page()?;
        self.file.copy_page(page, preimage)?;
        self.mvcc.register_preimage(
            page,
            PreImage {
                owner,
                page: preimage,
                superseded_at: self.commit_id,
            },
        );
        self.file.set_last_writer(page, self.commit_id)?;

        let mut log = self.log.lock();
        log.touched.push(Touched { page, preimage });
        log.touched_pages.insert(page);
        Ok(())
    }

    /// Close the commit; pages it released are retired until no open
    /// snapshot can reach them
    pub fn finish(self) -> CommitSummary {
        let log = self.log.into_inner();
        let summary = CommitSummary {
            touched: log.touched.len(),
            allocated: log.allocated.len(),
            freed: log.freed.len(),
        };
        self.mvcc.retire_pages(log.freed, self.commit_id);
        summary
    }

    /// Put every shared page back the way it was before the commit started.
    /// Pages are restored newest first; released pages were never freed.
    pub fn abort(self) -> Result<()> {
        let log = self.log.into_inner();
        for touched in log.touched.iter().rev() {
            self.file.copy_page(touched.preimage, touched.page)?;
        }
        for page in &log.allocated {
            self.file.free_page(*page)?;
        }
        for touched in &log.touched {
            self.mvcc.unregister_preimage(touched.page, touched.preimage);
            self.file.free_page(touched.preimage)?;
        }
        tracing::debug!(
            commit_id = self.commit_id,
            restored = log.touched.len(),
            "undid failed commit"
        );
        Ok(())
    }
}

impl PageAccess for CommitView<'_> {
    fn read_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.file.read_page(page, f)
    }

    fn write_page<R>(&self, page: PageNo, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.prepare_write(page)?;
        self.file.write_page(page, f)
    }

    fn new_page(&self) -> Result<PageNo> {
        let page = self.file.new_page()?;
        let commit_id = self.commit_id;
        self.file.write_page(page, |p| format_stamped(p, commit_id))??;
        self.log.lock().allocated.insert(page);
        Ok(page)
    }

    fn free_page(&self, page: PageNo) -> Result<()> {
        let mut log = self.log.lock();
        if log.allocated.remove(&page) {
            drop(log);
            return self.file.free_page(page);
        }
        if log.freed.contains(&page) {
            return Err(PageKvError::DoubleFree { page });
        }
        log.freed.push(page);
        Ok(())
    }

    fn is_used(&self, page: PageNo) -> Result<bool> {
        if self.log.lock().freed.contains(&page) {
            return Ok(false);
        }
        self.file.is_used(page)
    }
}
