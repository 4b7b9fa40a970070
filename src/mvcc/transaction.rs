//! Transactions
//!
//! A transaction owns a snapshot base, the map from shared pages to its
//! private copies, and the tree operations it will replay at commit.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::btree::BTree;
use crate::codec::Entry;
use crate::error::Result;
use crate::storage::{PageAccess, PageNo};

/// Kind of a buffered tree operation
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Insert(Entry),
    Remove(Entry),
    RemoveAll,
}

/// One tree operation, replayed on the shared pages at commit
#[derive(Debug, Clone, PartialEq)]
pub struct TreeOp {
    pub root: PageNo,
    pub key: Entry,
    pub kind: OpKind,
}

impl TreeOp {
    /// Run the operation on the tree rooted at `root`, reached through `access`
    pub fn apply<P: PageAccess>(&self, access: P, check_after_write: bool) -> Result<()> {
        let tree = BTree::new(access, self.root).with_check_after_write(check_after_write);
        match &self.kind {
            OpKind::Insert(value) => tree.insert(self.key.clone(), value.clone()),
            OpKind::Remove(value) => tree.remove(&self.key, value),
            OpKind::RemoveAll => tree.remove_all(&self.key),
        }
    }
}

/// Pages a transaction changed
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    /// shared page -> private copy; pages the transaction allocated map to themselves
    pub mapped: HashMap<PageNo, PageNo>,
    /// shared pages the transaction released
    pub freed: HashSet<PageNo>,
}

/// An open transaction
#[derive(Debug)]
pub struct Transaction {
    id: u16,
    base: u64,
    changes: Mutex<ChangeSet>,
    ops: Mutex<Vec<TreeOp>>,
}

impl Transaction {
    pub(crate) fn new(id: u16, base: u64) -> Self {
        Self {
            id,
            base,
            changes: Mutex::new(ChangeSet::default()),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Slot number
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Snapshot base: pages stamped at or below it are visible as they are
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Buffer an operation for commit
    pub fn record(&self, op: TreeOp) {
        self.ops.lock().push(op);
    }

    /// Number of buffered operations
    pub fn pending_ops(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether the transaction changed anything so far
    pub fn is_read_only(&self) -> bool {
        let changes = self.changes.lock();
        self.ops.lock().is_empty() && changes.mapped.is_empty() && changes.freed.is_empty()
    }

    pub(crate) fn take_ops(&self) -> Vec<TreeOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    pub(crate) fn changes(&self) -> &Mutex<ChangeSet> {
        &self.changes
    }

    /// Private pages (copies and own allocations), emptying the change set
    pub(crate) fn take_private_pages(&self) -> Vec<PageNo> {
        let mut changes = self.changes.lock();
        changes.freed.clear();
        changes.mapped.drain().map(|(_, copy)| copy).collect()
    }
}
