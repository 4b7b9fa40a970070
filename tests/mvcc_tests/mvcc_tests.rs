//! MVCC Tests
//!
//! Tests verify:
//! - Transaction ids and snapshot bases
//! - Copy-on-write isolation of uncommitted changes
//! - Snapshot reads through the pre-image chain after a commit
//! - Rollback releases private pages
//! - A failed replay is undone and reported as a commit conflict
//! - Pre-images and released pages are collected once unneeded

use std::sync::Arc;

use pagekv::btree::BTree;
use pagekv::codec::Entry;
use pagekv::mvcc::{Mvcc, OpKind, Transaction, TreeOp, TxView};
use pagekv::storage::{PageAccess, PageFile, PageNo};
use pagekv::{Config, PageKvError};

// =============================================================================
// Helper Functions
// =============================================================================

struct Fixture {
    file: PageFile,
    mvcc: Mvcc,
    root: PageNo,
}

impl Fixture {
    fn new() -> Self {
        let file = PageFile::open(&Config::builder().initial_pages(128).grow_pages(256).build()).unwrap();
        let root = file.new_page().unwrap();
        BTree::new(&file, root).ensure_root().unwrap();
        Self {
            file,
            mvcc: Mvcc::new(),
            root,
        }
    }

    fn begin(&self) -> Arc<Transaction> {
        self.mvcc.begin(&self.file).unwrap()
    }

    fn apply(&self, tx: &Arc<Transaction>, key: i64, kind: OpKind) -> pagekv::Result<()> {
        let op = TreeOp {
            root: self.root,
            key: Entry::Long(key),
            kind,
        };
        let view = TxView::new(&self.file, &self.mvcc, Arc::clone(tx));
        op.apply(&view, false)?;
        tx.record(op);
        Ok(())
    }

    fn insert(&self, tx: &Arc<Transaction>, key: i64, value: Entry) {
        self.apply(tx, key, OpKind::Insert(value)).unwrap();
    }

    fn find(&self, tx: &Arc<Transaction>, key: i64) -> Option<Vec<Entry>> {
        let view = TxView::new(&self.file, &self.mvcc, Arc::clone(tx));
        BTree::new(view, self.root).find(&Entry::Long(key)).unwrap()
    }

    fn count(&self, tx: &Arc<Transaction>) -> usize {
        let view = TxView::new(&self.file, &self.mvcc, Arc::clone(tx));
        BTree::new(view, self.root).entries().unwrap().len()
    }

    fn commit(&self, tx: &Arc<Transaction>) -> pagekv::Result<()> {
        self.mvcc.commit(&self.file, tx, false)
    }

    fn rollback(&self, tx: &Arc<Transaction>) {
        self.mvcc.rollback(&self.file, tx).unwrap();
    }

    /// Insert `keys` in one committed transaction
    fn seed(&self, keys: impl IntoIterator<Item = i64>, value_len: usize) {
        let tx = self.begin();
        for key in keys {
            self.insert(&tx, key, Entry::ByteArray(vec![key as u8; value_len]));
        }
        self.commit(&tx).unwrap();
    }

    fn tree_pages(&self) -> Vec<PageNo> {
        let mut pages = BTree::new(&self.file, self.root).pages().unwrap();
        pages.push(self.file.directory_root().unwrap());
        pages.sort_unstable();
        pages
    }

    fn assert_no_leaks(&self) {
        assert_eq!(self.file.used_pages().unwrap(), self.tree_pages());
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_begin_assigns_distinct_ids_and_rising_bases() {
    let fx = Fixture::new();
    let t1 = fx.begin();
    let t2 = fx.begin();

    assert_ne!(t1.id(), t2.id());
    assert!(t2.base() > t1.base());
    assert_eq!(t1.base() & 0xFFFF, u64::from(t1.id()));
    assert_eq!(fx.mvcc.stats().active_transactions, 2);

    fx.rollback(&t1);
    fx.rollback(&t2);
    assert_eq!(fx.mvcc.stats().active_transactions, 0);
}

#[test]
fn test_read_only_transaction() {
    let fx = Fixture::new();
    let tx = fx.begin();
    assert!(tx.is_read_only());
    assert_eq!(fx.find(&tx, 1), None);
    assert!(tx.is_read_only());
    fx.commit(&tx).unwrap();
    fx.assert_no_leaks();
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_uncommitted_writes_are_private() {
    let fx = Fixture::new();
    let writer = fx.begin();
    let reader = fx.begin();

    fx.insert(&writer, 1, Entry::Int(10));

    assert_eq!(fx.find(&writer, 1), Some(vec![Entry::Int(10)]));
    assert_eq!(fx.find(&reader, 1), None);
    assert!(!writer.is_read_only());
    assert_eq!(writer.pending_ops(), 1);
    // the shared tree is untouched until commit
    assert_eq!(BTree::new(&fx.file, fx.root).find(&Entry::Long(1)).unwrap(), None);

    fx.rollback(&writer);
    fx.rollback(&reader);
}

#[test]
fn test_snapshot_isolation_across_commit() {
    let fx = Fixture::new();
    let t1 = fx.begin();

    let t2 = fx.begin();
    for key in 1..=100 {
        fx.insert(&t2, key, Entry::Long(key * 10));
    }
    fx.commit(&t2).unwrap();

    // t1 began before the commit and keeps its snapshot
    assert_eq!(fx.find(&t1, 50), None);
    assert_eq!(fx.count(&t1), 0);
    assert!(fx.mvcc.stats().preimages > 0);

    let t3 = fx.begin();
    assert_eq!(fx.find(&t3, 50), Some(vec![Entry::Long(500)]));
    assert_eq!(fx.count(&t3), 100);

    fx.rollback(&t1);
    fx.rollback(&t3);
    assert_eq!(fx.mvcc.stats().preimages, 0);
    fx.assert_no_leaks();
}

#[test]
fn test_snapshot_sees_state_between_two_commits() {
    let fx = Fixture::new();
    fx.seed(0..20, 500);

    let middle = fx.begin();

    let tx = fx.begin();
    for key in 0..10 {
        fx.apply(&tx, key, OpKind::RemoveAll).unwrap();
    }
    fx.commit(&tx).unwrap();

    let tx = fx.begin();
    for key in 20..40 {
        fx.insert(&tx, key, Entry::Int(0));
    }
    fx.commit(&tx).unwrap();

    assert_eq!(fx.count(&middle), 20);
    assert!(fx.find(&middle, 5).is_some());
    assert!(fx.find(&middle, 25).is_none());

    let latest = fx.begin();
    assert_eq!(fx.count(&latest), 30);
    assert!(fx.find(&latest, 5).is_none());

    fx.rollback(&middle);
    fx.rollback(&latest);
    fx.assert_no_leaks();
}

#[test]
fn test_commit_without_readers_keeps_no_preimages() {
    let fx = Fixture::new();
    fx.seed(0..50, 100);

    let stats = fx.mvcc.stats();
    assert_eq!(stats.preimages, 0);
    assert_eq!(stats.retired_pages, 0);
    fx.assert_no_leaks();
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[test]
fn test_rollback_discards_changes_and_frees_pages() {
    let fx = Fixture::new();
    let used_before = fx.file.used_pages().unwrap();

    let tx = fx.begin();
    for key in 0..50 {
        fx.insert(&tx, key, Entry::ByteArray(vec![1; 400]));
    }
    assert!(fx.file.used_pages().unwrap().len() > used_before.len());
    fx.rollback(&tx);

    assert_eq!(fx.file.used_pages().unwrap(), used_before);
    let check = fx.begin();
    assert_eq!(fx.count(&check), 0);
    fx.rollback(&check);
}

#[test]
fn test_pages_are_reusable_after_rollback() {
    let fx = Fixture::new();
    let tx = fx.begin();
    for key in 0..50 {
        fx.insert(&tx, key, Entry::ByteArray(vec![2; 1000]));
    }
    fx.rollback(&tx);
    let free_after_rollback = fx.file.free_page_count().unwrap();

    fx.seed(0..50, 1000);
    assert!(fx.file.free_page_count().unwrap() < free_after_rollback);
    assert_eq!(fx.file.page_count(), 128);
    fx.assert_no_leaks();
}

// =============================================================================
// Commit Conflict Tests
// =============================================================================

#[test]
fn test_failed_replay_is_undone() {
    let fx = Fixture::new();
    fx.seed(0..30, 300);

    let t1 = fx.begin();
    let t2 = fx.begin();
    fx.insert(&t1, 100, Entry::Int(1));
    fx.apply(&t1, 7, OpKind::RemoveAll).unwrap();
    fx.apply(&t2, 7, OpKind::RemoveAll).unwrap();
    fx.commit(&t2).unwrap();

    let err = fx.commit(&t1).unwrap_err();
    match err {
        PageKvError::CommitConflict(inner) => assert!(matches!(*inner, PageKvError::KeyNotFound)),
        other => panic!("expected a commit conflict, got {}", other),
    }

    let after = fx.begin();
    assert_eq!(fx.find(&after, 7), None);
    // the insert that preceded the failing op was undone as well
    assert_eq!(fx.find(&after, 100), None);
    assert_eq!(fx.count(&after), 29);
    fx.rollback(&after);

    assert_eq!(fx.mvcc.stats(), Default::default());
    fx.assert_no_leaks();
}

#[test]
fn test_failed_op_inside_transaction_is_not_recorded() {
    let fx = Fixture::new();
    let tx = fx.begin();
    let err = fx.apply(&tx, 1, OpKind::RemoveAll).unwrap_err();
    assert!(matches!(err, PageKvError::KeyNotFound));
    assert_eq!(tx.pending_ops(), 0);
    fx.commit(&tx).unwrap();
}

// =============================================================================
// Garbage Collection Tests
// =============================================================================

#[test]
fn test_released_pages_stay_readable_for_older_snapshots() {
    let fx = Fixture::new();
    fx.seed(0..60, 1500);

    let old = fx.begin();

    let tx = fx.begin();
    for key in 0..60 {
        fx.apply(&tx, key, OpKind::RemoveAll).unwrap();
    }
    fx.commit(&tx).unwrap();

    let stats = fx.mvcc.stats();
    assert!(stats.retired_pages > 0);
    assert!(stats.preimages > 0);

    // pages allocated meanwhile never reuse what `old` can still reach
    fx.seed(100..130, 1500);

    assert_eq!(fx.count(&old), 60);
    assert_eq!(fx.find(&old, 42), Some(vec![Entry::ByteArray(vec![42; 1500])]));

    fx.rollback(&old);
    let stats = fx.mvcc.stats();
    assert_eq!(stats.retired_pages, 0);
    assert_eq!(stats.preimages, 0);
    fx.assert_no_leaks();
}

#[test]
fn test_concurrent_reader_during_commits() {
    let fx = Fixture::new();
    fx.seed(0..100, 200);

    crossbeam::scope(|s| {
        s.spawn(|_| {
            for round in 0..20i64 {
                let tx = fx.begin();
                for key in 0..5 {
                    fx.insert(&tx, 1000 + round * 5 + key, Entry::Int(0));
                }
                fx.commit(&tx).unwrap();
            }
        });
        s.spawn(|_| {
            for _ in 0..20 {
                let tx = fx.begin();
                let first = fx.count(&tx);
                assert!(first >= 100);
                assert_eq!(first % 5, 0);
                // a snapshot never changes underneath its reader
                assert_eq!(fx.count(&tx), first);
                fx.rollback(&tx);
            }
        });
    })
    .unwrap();

    let tx = fx.begin();
    assert_eq!(fx.count(&tx), 200);
    fx.rollback(&tx);
    fx.assert_no_leaks();
}
