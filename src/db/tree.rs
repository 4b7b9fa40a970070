//! Named tree handles
//!
//! A `Tree` resolves every operation to one of two page views:
//! - non-MVCC trees work on the page file directly, under the file lock
//! - MVCC trees work through the session's transaction, or through an
//!   implicit one when the session has none

use std::sync::Arc;

use parking_lot::ReentrantMutexGuard;

use crate::btree::{BTree, Cursor, TreeEntry};
use crate::codec::Entry;
use crate::error::{PageKvError, Result};
use crate::mvcc::{OpKind, Transaction, TreeOp, TxView};
use crate::storage::{PageAccess, PageFile, PageNo};

use super::{DbInner, Session, TreeInfo};

// =============================================================================
// View
// =============================================================================

/// Page access for one tree operation
pub(crate) enum View<'a> {
    Raw(&'a PageFile),
    Tx(TxView<'a>),
}

impl PageAccess for View<'_> {
    fn read_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        match self {
            View::Raw(file) => file.read_page(page, f),
            View::Tx(view) => view.read_page(page, f),
        }
    }

    fn write_page<R>(&self, page: PageNo, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        match self {
            View::Raw(file) => file.write_page(page, f),
            View::Tx(view) => view.write_page(page, f),
        }
    }

    fn new_page(&self) -> Result<PageNo> {
        match self {
            View::Raw(file) => file.new_page(),
            View::Tx(view) => view.new_page(),
        }
    }

    fn free_page(&self, page: PageNo) -> Result<()> {
        match self {
            View::Raw(file) => file.free_page(page),
            View::Tx(view) => view.free_page(page),
        }
    }

    fn is_used(&self, page: PageNo) -> Result<bool> {
        match self {
            View::Raw(file) => file.is_used(page),
            View::Tx(view) => view.is_used(page),
        }
    }
}

// =============================================================================
// Tree
// =============================================================================

/// Handle to a named B+tree
#[derive(Clone)]
pub struct Tree {
    db: Arc<DbInner>,
    name: String,
    info: TreeInfo,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("name", &self.name)
            .field("root", &self.info.root)
            .field("mvcc", &self.info.mvcc)
            .finish()
    }
}

impl Tree {
    pub(crate) fn new(db: Arc<DbInner>, name: &str, info: TreeInfo) -> Self {
        Self {
            db,
            name: name.to_string(),
            info,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> PageNo {
        self.info.root
    }

    pub fn is_mvcc(&self) -> bool {
        self.info.mvcc
    }

    fn btree<P: PageAccess>(&self, access: P) -> BTree<P> {
        BTree::new(access, self.info.root).with_check_after_write(self.db.config.check_after_write)
    }

    fn check_session(&self, session: &Session) -> Result<()> {
        if !Arc::ptr_eq(&self.db, session.db()) {
            return Err(PageKvError::Config(format!(
                "session belongs to a different database than tree {:?}",
                self.name
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append `value` to the values of `key`
    pub fn insert(&self, session: &Session, key: impl Into<Entry>, value: impl Into<Entry>) -> Result<()> {
        self.write(session, key.into(), OpKind::Insert(value.into()))
    }

    /// Remove one occurrence of `value` from `key`
    pub fn remove(&self, session: &Session, key: impl Into<Entry>, value: impl Into<Entry>) -> Result<()> {
        self.write(session, key.into(), OpKind::Remove(value.into()))
    }

    /// Remove `key` with all of its values
    pub fn remove_all(&self, session: &Session, key: impl Into<Entry>) -> Result<()> {
        self.write(session, key.into(), OpKind::RemoveAll)
    }

    fn write(&self, session: &Session, key: Entry, kind: OpKind) -> Result<()> {
        self.check_session(session)?;
        let op = TreeOp {
            root: self.info.root,
            key,
            kind,
        };
        let check = self.db.config.check_after_write;
        let file = &self.db.file;

        if !self.info.mvcc {
            let _guard = file.lock();
            return op.apply(file, check);
        }

        if let Some(tx) = session.transaction() {
            let view = TxView::new(file, &self.db.mvcc, Arc::clone(tx));
            op.apply(&view, check)?;
            tx.record(op);
            return Ok(());
        }

        // implicit single-operation transaction
        let tx = self.db.mvcc.begin(file)?;
        tx.record(op);
        match self.db.mvcc.commit(file, &tx, check) {
            Ok(()) => self.db.after_commit(),
            Err(PageKvError::CommitConflict(inner)) => Err(*inner),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Run `f` on the tree as `session` sees it
    fn read<R>(&self, session: &Session, f: impl FnOnce(&BTree<View<'_>>) -> Result<R>) -> Result<R> {
        self.check_session(session)?;
        let file = &self.db.file;
        if !self.info.mvcc {
            let _guard = file.lock();
            return f(&self.btree(View::Raw(file)));
        }
        if let Some(tx) = session.transaction() {
            let view = TxView::new(file, &self.db.mvcc, Arc::clone(tx));
            return f(&self.btree(View::Tx(view)));
        }

        let tx = self.db.mvcc.begin(file)?;
        let result = f(&self.btree(View::Tx(TxView::new(file, &self.db.mvcc, Arc::clone(&tx)))));
        self.db.mvcc.rollback(file, &tx)?;
        result
    }

    /// All values of `key`
    pub fn find(&self, session: &Session, key: impl Into<Entry>) -> Result<Option<Vec<Entry>>> {
        let key = key.into();
        self.read(session, |tree| tree.find(&key))
    }

    /// The only value of `key`; `AmbiguousValue` if it has several
    pub fn find_single(&self, session: &Session, key: impl Into<Entry>) -> Result<Option<Entry>> {
        let key = key.into();
        self.read(session, |tree| tree.find_single(&key))
    }

    /// Structural check; empty when sound
    pub fn check(&self, session: &Session) -> Result<String> {
        self.read(session, |tree| tree.check())
    }

    pub fn height(&self, session: &Session) -> Result<usize> {
        self.read(session, |tree| tree.height())
    }

    /// Every entry in key order
    pub fn entries(&self, session: &Session) -> Result<Vec<TreeEntry>> {
        self.iter(session)?.collect()
    }

    /// Lazy in-order iteration over a consistent view of the tree
    pub fn iter<'a>(&'a self, session: &Session) -> Result<TreeIter<'a>> {
        self.check_session(session)?;
        let file = &self.db.file;
        let mvcc = &self.db.mvcc;
        let cursor = Cursor::new(self.info.root);

        if !self.info.mvcc {
            return Ok(TreeIter {
                db: &self.db,
                view: View::Raw(file),
                cursor,
                implicit: None,
                _lock: Some(file.lock()),
            });
        }
        let (tx, implicit) = match session.transaction() {
            Some(tx) => (Arc::clone(tx), None),
            None => {
                let tx = mvcc.begin(file)?;
                (Arc::clone(&tx), Some(tx))
            }
        };
        Ok(TreeIter {
            db: &self.db,
            view: View::Tx(TxView::new(file, mvcc, tx)),
            cursor,
            implicit,
            _lock: None,
        })
    }
}

/// Iterator returned by [`Tree::iter`]
///
/// Holds its snapshot (or, for non-MVCC trees, the file lock) until dropped.
pub struct TreeIter<'a> {
    db: &'a DbInner,
    view: View<'a>,
    cursor: Cursor,
    implicit: Option<Arc<Transaction>>,
    _lock: Option<ReentrantMutexGuard<'a, ()>>,
}

impl Iterator for TreeIter<'_> {
    type Item = Result<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_entry(&self.view).transpose()
    }
}

impl Drop for TreeIter<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.implicit.take() {
            if let Err(err) = self.db.mvcc.rollback(&self.db.file, &tx) {
                tracing::warn!(tx = tx.id(), error = %err, "failed to release iteration snapshot");
            }
        }
    }
}
