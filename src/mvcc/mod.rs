//! MVCC Module
//!
//! Snapshot isolation for B+trees flagged as MVCC.
//!
//! ## Responsibilities
//! - Hand out transaction ids and snapshot bases
//! - Keep the pre-image chain of overwritten pages
//! - Replay a transaction's buffered operations at commit
//! - Reclaim pre-images and released pages no active transaction can see
//!
//! ## Versioning
//! ```text
//! id      = (change counter << 16) | tx slot
//!
//! page p, stamp s   ── s <= base ──▶  read p
//!                   └─ s >  base ──▶  read the pre-image of p with the
//!                                     largest owner <= base
//! ```
//! Every data page carries the id of its last writer. A transaction works
//! on private copies of the pages it writes. At commit its operations are
//! replayed on the shared pages; before a shared page is first changed its
//! current content is saved as a pre-image owned by the old stamp, then the
//! page is re-stamped with the commit id.
//!
//! ## Concurrency:
//! - `begin` and `commit` serialise on the page-file lock
//! - The registry mutex is never held while waiting for the buffer lock;
//!   readers take it inside a buffer read (buffer, then registry)
//! - A pre-image is registered before the page it saves is re-stamped

mod transaction;
mod view;

pub use transaction::{OpKind, Transaction, TreeOp};
pub use view::{CommitView, TxView};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PageKvError, Result};
use crate::storage::{PageAccess, PageFile, PageNo};

/// Bits of an id reserved for the transaction slot
const TX_BITS: u32 = 16;

/// Saved content of a page, valid for snapshots in `[owner, superseded_at)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreImage {
    /// Stamp the page carried when it was saved
    pub owner: u64,
    /// Page holding the saved bytes
    pub page: PageNo,
    /// Commit that replaced this content
    pub superseded_at: u64,
}

impl PreImage {
    fn visible_to(&self, base: u64) -> bool {
        self.owner <= base && base < self.superseded_at
    }
}

/// Page released by a commit, kept for snapshots older than the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Retired {
    page: PageNo,
    retired_at: u64,
}

/// Snapshot of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MvccStats {
    pub active_transactions: usize,
    pub preimages: usize,
    pub retired_pages: usize,
}

#[derive(Default)]
struct MvccState {
    /// tx slot -> snapshot base
    active: HashMap<u16, u64>,
    preimages: HashMap<PageNo, Vec<PreImage>>,
    retired: Vec<Retired>,
}

/// Transaction registry and pre-image chain of one page file
pub struct Mvcc {
    changes: AtomicU64,
    next_slot: AtomicU16,
    state: Mutex<MvccState>,
}

impl Default for Mvcc {
    fn default() -> Self {
        Self::new()
    }
}

impl Mvcc {
    pub fn new() -> Self {
        Self {
            changes: AtomicU64::new(0),
            next_slot: AtomicU16::new(1),
            state: Mutex::new(MvccState::default()),
        }
    }

    /// Registry whose ids continue after `stamp`, the newest stamp found
    /// in a reopened file
    pub fn starting_after(stamp: u64) -> Self {
        let mvcc = Self::new();
        mvcc.changes.store(stamp >> TX_BITS, Ordering::SeqCst);
        mvcc
    }

    /// Next id in the change sequence, tagged with `slot`
    fn mint_id(&self, slot: u16) -> u64 {
        let seq = self.changes.fetch_add(1, Ordering::SeqCst) + 1;
        (seq << TX_BITS) | u64::from(slot)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a new transaction whose snapshot is the current committed state
    pub fn begin(&self, file: &PageFile) -> Result<Arc<Transaction>> {
        let _guard = file.lock();
        let mut state = self.state.lock();
        let mut slot = None;
        for _ in 0..=u32::from(u16::MAX) {
            let candidate = self.next_slot.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !state.active.contains_key(&candidate) {
                slot = Some(candidate);
                break;
            }
        }
        let slot = slot.ok_or(PageKvError::TooManyTransactions)?;
        let base = self.mint_id(slot);
        state.active.insert(slot, base);
        drop(state);

        tracing::debug!(tx = slot, base, "began transaction");
        Ok(Arc::new(Transaction::new(slot, base)))
    }

    /// Replay `tx` onto the shared pages and retire it.
    ///
    /// If replay fails every shared page is restored, the transaction is
    /// rolled back, and the failure comes back as `CommitConflict`.
    pub fn commit(&self, file: &PageFile, tx: &Transaction, check_after_write: bool) -> Result<()> {
        let _guard = file.lock();
        let commit_id = self.mint_id(tx.id());
        let ops = tx.take_ops();
        let view = CommitView::new(file, self, commit_id);

        let replay = ops
            .iter()
            .try_for_each(|op| op.apply(&view, check_after_write));

        match replay {
            Ok(()) => {
                let summary = view.finish();
                self.release(file, tx)?;
                tracing::debug!(
                    tx = tx.id(),
                    commit_id,
                    ops = ops.len(),
                    pages = summary.touched,
                    "committed transaction"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(tx = tx.id(), commit_id, error = %err, "commit failed, restoring pages");
                view.abort()?;
                self.release(file, tx)?;
                Err(PageKvError::CommitConflict(Box::new(err)))
            }
        }
    }

    /// Drop every private copy of `tx` and retire it
    pub fn rollback(&self, file: &PageFile, tx: &Transaction) -> Result<()> {
        let _guard = file.lock();
        tx.take_ops();
        self.release(file, tx)?;
        tracing::debug!(tx = tx.id(), "rolled back transaction");
        Ok(())
    }

    fn release(&self, file: &PageFile, tx: &Transaction) -> Result<()> {
        for copy in tx.take_private_pages() {
            file.free_page(copy)?;
        }
        self.deregister(tx.id());
        self.collect_garbage(file)
    }

    /// Forget a transaction without touching pages (read-only transactions)
    pub fn deregister(&self, slot: u16) {
        self.state.lock().active.remove(&slot);
    }

    // =========================================================================
    // Pre-image Chain
    // =========================================================================

    pub(crate) fn register_preimage(&self, page: PageNo, preimage: PreImage) {
        self.state
            .lock()
            .preimages
            .entry(page)
            .or_default()
            .push(preimage);
    }

    /// Remove the pre-image stored in `preimage_page` from the chain of `page`
    pub(crate) fn unregister_preimage(&self, page: PageNo, preimage_page: PageNo) {
        let mut state = self.state.lock();
        if let Some(chain) = state.preimages.get_mut(&page) {
            chain.retain(|p| p.page != preimage_page);
            if chain.is_empty() {
                state.preimages.remove(&page);
            }
        }
    }

    /// Version of `page` a snapshot taken at `base` must read
    pub(crate) fn visible_preimage(&self, page: PageNo, base: u64) -> Option<PageNo> {
        let state = self.state.lock();
        state
            .preimages
            .get(&page)?
            .iter()
            .filter(|p| p.visible_to(base))
            .max_by_key(|p| p.owner)
            .map(|p| p.page)
    }

    /// Keep `pages`, released by commit `commit_id`, until the snapshots
    /// older than that commit are gone
    pub(crate) fn retire_pages(&self, pages: Vec<PageNo>, commit_id: u64) {
        if pages.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.retired.extend(pages.into_iter().map(|page| Retired {
            page,
            retired_at: commit_id,
        }));
    }

    /// Free every pre-image no active snapshot falls into, and every retired
    /// page no active snapshot predates
    pub fn collect_garbage(&self, file: &PageFile) -> Result<()> {
        let doomed: Vec<PageNo> = {
            let mut state = self.state.lock();
            let bases: Vec<u64> = state.active.values().copied().collect();
            let mut doomed = Vec::new();
            state.preimages.retain(|_, chain| {
                chain.retain(|p| {
                    let keep = bases.iter().any(|b| p.visible_to(*b));
                    if !keep {
                        doomed.push(p.page);
                    }
                    keep
                });
                !chain.is_empty()
            });
            state.retired.retain(|r| {
                let keep = bases.iter().any(|b| *b < r.retired_at);
                if !keep {
                    doomed.push(r.page);
                }
                keep
            });
            doomed
        };

        for page in &doomed {
            file.free_page(*page)?;
        }
        if !doomed.is_empty() {
            tracing::trace!(freed = doomed.len(), "collected pre-images");
        }
        Ok(())
    }

    /// Pages currently holding pre-images
    pub fn preimage_pages(&self) -> Vec<PageNo> {
        let state = self.state.lock();
        state
            .preimages
            .values()
            .flat_map(|chain| chain.iter().map(|p| p.page))
            .collect()
    }

    /// Pages released by commits but still reachable from open snapshots
    pub fn retired_pages(&self) -> Vec<PageNo> {
        self.state.lock().retired.iter().map(|r| r.page).collect()
    }

    pub fn stats(&self) -> MvccStats {
        let state = self.state.lock();
        MvccStats {
            active_transactions: state.active.len(),
            preimages: state.preimages.values().map(Vec::len).sum(),
            retired_pages: state.retired.len(),
        }
    }
}
