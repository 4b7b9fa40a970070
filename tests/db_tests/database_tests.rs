//! Database Tests
//!
//! Tests verify:
//! - Directory: create / get / open / list trees
//! - Plain and MVCC trees through sessions
//! - Explicit transactions: begin, commit, rollback, detach / attach
//! - Implicit single-operation transactions
//! - Whole-file check and statistics
//! - Persistence across reopen

use pagekv::{Config, Database, Entry, PageKvError, Session, Tree};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_db() -> Database {
    Database::open(Config::builder().initial_pages(256).build()).unwrap()
}

fn assert_db_sound(db: &Database) {
    let report = db.check().unwrap();
    assert!(report.is_empty(), "database check failed:\n{}", report);
}

fn fill(tree: &Tree, session: &Session, keys: std::ops::Range<i64>) {
    for key in keys {
        tree.insert(session, key, format!("value-{}", key)).unwrap();
    }
}

// =============================================================================
// Directory Tests
// =============================================================================

#[test]
fn test_create_and_get_tree() {
    let db = open_db();
    let created = db.create_tree("users", true).unwrap();
    let fetched = db.get_tree("users").unwrap();

    assert_eq!(created.root(), fetched.root());
    assert!(fetched.is_mvcc());
    assert_eq!(fetched.name(), "users");
}

#[test]
fn test_create_existing_tree_fails() {
    let db = open_db();
    db.create_tree("t", false).unwrap();
    assert!(matches!(db.create_tree("t", true), Err(PageKvError::TreeExists(_))));
}

#[test]
fn test_get_missing_tree_fails() {
    let db = open_db();
    assert!(matches!(db.get_tree("nope"), Err(PageKvError::TreeNotFound(_))));
}

#[test]
fn test_open_tree_creates_with_default_flag() {
    let db = Database::open(Config::builder().initial_pages(64).default_mvcc(false).build()).unwrap();
    let tree = db.open_tree("lazy").unwrap();
    assert!(!tree.is_mvcc());

    let again = db.open_tree("lazy").unwrap();
    assert_eq!(again.root(), tree.root());
}

#[test]
fn test_tree_names_are_sorted() {
    let db = open_db();
    for name in ["gamma", "alpha", "beta"] {
        db.create_tree_default(name).unwrap();
    }
    assert_eq!(db.tree_names().unwrap(), vec!["alpha", "beta", "gamma"]);
}

// =============================================================================
// Plain Tree Tests
// =============================================================================

#[test]
fn test_plain_tree_operations() {
    let db = open_db();
    let tree = db.create_tree("plain", false).unwrap();
    let session = db.session();

    tree.insert(&session, "k", 1i64).unwrap();
    tree.insert(&session, "k", 2i64).unwrap();
    assert_eq!(
        tree.find(&session, "k").unwrap(),
        Some(vec![Entry::Long(1), Entry::Long(2)])
    );

    tree.remove(&session, "k", 1i64).unwrap();
    assert_eq!(tree.find_single(&session, "k").unwrap(), Some(Entry::Long(2)));

    tree.remove_all(&session, "k").unwrap();
    assert_eq!(tree.find(&session, "k").unwrap(), None);
    assert_db_sound(&db);
}

#[test]
fn test_plain_tree_ignores_transactions() {
    let db = open_db();
    let tree = db.create_tree("plain", false).unwrap();
    let mut session = db.session();

    session.begin().unwrap();
    tree.insert(&session, 1i64, true).unwrap();
    session.rollback().unwrap();

    assert_eq!(tree.find_single(&db.session(), 1i64).unwrap(), Some(Entry::Boolean(true)));
}

// =============================================================================
// MVCC Tree Tests
// =============================================================================

#[test]
fn test_implicit_transactions() {
    let db = open_db();
    let tree = db.create_tree("mvcc", true).unwrap();
    let session = db.session();

    fill(&tree, &session, 0..50);

    assert_eq!(
        tree.find_single(&session, 7i64).unwrap(),
        Some(Entry::from("value-7"))
    );
    assert_eq!(tree.entries(&session).unwrap().len(), 50);
    assert_eq!(db.mvcc_stats().active_transactions, 0);
    assert_db_sound(&db);
}

#[test]
fn test_implicit_write_reports_plain_error() {
    let db = open_db();
    let tree = db.create_tree("mvcc", true).unwrap();
    let session = db.session();

    let err = tree.remove_all(&session, "missing").unwrap_err();
    assert!(matches!(err, PageKvError::KeyNotFound), "got {:?}", err);
    assert_db_sound(&db);
}

#[test]
fn test_snapshot_isolation_between_sessions() {
    let db = open_db();
    let tree = db.create_tree("iso", true).unwrap();

    let mut s1 = db.session();
    s1.begin().unwrap();

    let mut s2 = db.session();
    s2.begin().unwrap();
    fill(&tree, &s2, 1..101);
    s2.commit().unwrap();

    assert_eq!(tree.find(&s1, 50i64).unwrap(), None);

    let mut s3 = db.session();
    s3.begin().unwrap();
    assert_eq!(
        tree.find_single(&s3, 50i64).unwrap(),
        Some(Entry::from("value-50"))
    );
    s3.commit().unwrap();

    s1.rollback().unwrap();
    assert_db_sound(&db);
}

#[test]
fn test_rollback_discards_writes() {
    let db = open_db();
    let tree = db.create_tree("rb", true).unwrap();
    let used_before = db.stats().unwrap().used_pages;

    let mut session = db.session();
    session.begin().unwrap();
    fill(&tree, &session, 0..50);
    assert_eq!(tree.entries(&session).unwrap().len(), 50);
    session.rollback().unwrap();

    assert!(tree.entries(&session).unwrap().is_empty());
    assert_eq!(db.stats().unwrap().used_pages, used_before);
    assert_db_sound(&db);
}

#[test]
fn test_transaction_state_errors() {
    let db = open_db();
    let mut session = db.session();

    assert!(matches!(session.commit(), Err(PageKvError::NoTransaction)));
    assert!(matches!(session.rollback(), Err(PageKvError::NoTransaction)));

    session.begin().unwrap();
    let err = session.begin().unwrap_err();
    assert!(matches!(err, PageKvError::TransactionActive));
    assert!(err.is_fatal());
    assert!(session.in_transaction());
    session.commit().unwrap();
    assert!(!session.in_transaction());
}

#[test]
fn test_detach_and_attach() {
    let db = open_db();
    let tree = db.create_tree("handoff", true).unwrap();

    let mut first = db.session();
    first.begin().unwrap();
    tree.insert(&first, "moved", 1i32).unwrap();
    let tx = first.detach().unwrap();
    assert!(!first.in_transaction());

    let mut second = db.session();
    second.attach(tx).unwrap();
    assert_eq!(tree.find_single(&second, "moved").unwrap(), Some(Entry::Int(1)));
    second.commit().unwrap();

    assert_eq!(tree.find_single(&first, "moved").unwrap(), Some(Entry::Int(1)));
}

#[test]
fn test_session_moves_to_another_thread() {
    let db = open_db();
    let tree = db.create_tree("threads", true).unwrap();

    let mut session = db.session();
    session.begin().unwrap();
    tree.insert(&session, 1i64, 1i64).unwrap();

    let handle = {
        let tree = tree.clone();
        std::thread::spawn(move || {
            tree.insert(&session, 2i64, 2i64).unwrap();
            session.commit().unwrap();
        })
    };
    handle.join().unwrap();

    assert_eq!(tree.entries(&db.session()).unwrap().len(), 2);
}

#[test]
fn test_dropped_session_rolls_back() {
    let db = open_db();
    let tree = db.create_tree("drop", true).unwrap();
    {
        let mut session = db.session();
        session.begin().unwrap();
        fill(&tree, &session, 0..10);
    }
    assert_eq!(db.mvcc_stats().active_transactions, 0);
    assert!(tree.entries(&db.session()).unwrap().is_empty());
    assert_db_sound(&db);
}

#[test]
fn test_iterator_keeps_its_snapshot() {
    let db = open_db();
    let tree = db.create_tree("iter", true).unwrap();
    let session = db.session();
    fill(&tree, &session, 0..20);

    let reader = db.session();
    let mut iter = tree.iter(&reader).unwrap();
    let first = iter.next().unwrap().unwrap();
    assert_eq!(first.key, Entry::Long(0));

    fill(&tree, &session, 100..120);
    tree.remove_all(&session, 5i64).unwrap();

    let rest: Vec<_> = iter.map(|e| e.unwrap().key).collect();
    assert_eq!(rest.len(), 19);
    assert!(rest.contains(&Entry::Long(5)));
    assert!(!rest.contains(&Entry::Long(100)));

    assert_eq!(db.mvcc_stats().active_transactions, 0);
    assert_eq!(tree.entries(&session).unwrap().len(), 39);
    assert_db_sound(&db);
}

#[test]
fn test_session_of_other_database_is_rejected() {
    let db = open_db();
    let other = open_db();
    let tree = db.create_tree("t", true).unwrap();
    let err = tree.insert(&other.session(), 1i64, 1i64).unwrap_err();
    assert!(matches!(err, PageKvError::Config(_)));
}

// =============================================================================
// Maintenance Tests
// =============================================================================

#[test]
fn test_fresh_and_drained_trees_pass_check() {
    let db = Database::in_memory().unwrap();
    assert_db_sound(&db);

    let versioned = db.create_tree("versioned", true).unwrap();
    let plain = db.create_tree("plain", false).unwrap();
    assert_db_sound(&db);

    let session = db.session();
    fill(&versioned, &session, 0..40);
    fill(&plain, &session, 0..40);
    for key in 0..40i64 {
        versioned.remove_all(&session, key).unwrap();
        plain.remove_all(&session, key).unwrap();
    }
    assert_eq!(versioned.check(&session).unwrap(), "");
    assert_eq!(plain.check(&session).unwrap(), "");
    assert_db_sound(&db);
}

#[test]
fn test_check_after_heavy_churn() {
    let db = Database::open(
        Config::builder()
            .initial_pages(128)
            .check_after_write(true)
            .build(),
    )
    .unwrap();
    let plain = db.create_tree("plain", false).unwrap();
    let versioned = db.create_tree("versioned", true).unwrap();
    let mut session = db.session();

    for round in 0..3i64 {
        session.begin().unwrap();
        for key in 0..200i64 {
            let value = vec![(key + round) as u8; 50 + ((key * 13) % 400) as usize];
            plain.insert(&session, key, value.clone()).unwrap();
            versioned.insert(&session, key, value).unwrap();
        }
        session.commit().unwrap();

        session.begin().unwrap();
        for key in (0..200i64).filter(|k| k % 3 != round) {
            plain.remove_all(&session, key).unwrap();
            versioned.remove_all(&session, key).unwrap();
        }
        session.commit().unwrap();
        assert_db_sound(&db);
    }

    let plain_keys = plain.entries(&session).unwrap().len();
    let versioned_keys = versioned.entries(&session).unwrap().len();
    assert_eq!(plain_keys, versioned_keys);
    assert!(plain_keys > 0);
}

#[test]
fn test_check_skips_accounting_with_open_transaction() {
    let db = open_db();
    let tree = db.create_tree("t", true).unwrap();
    let mut session = db.session();
    session.begin().unwrap();
    fill(&tree, &session, 0..30);

    // private copies are not owned by any tree yet
    assert_db_sound(&db);
    session.commit().unwrap();
    assert_db_sound(&db);
}

#[test]
fn test_stats() {
    let db = open_db();
    db.create_tree("a", true).unwrap();
    db.create_tree("b", false).unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.trees, 2);
    assert_eq!(stats.page_count, 256);
    // directory root + leaf, and root + leaf for each tree
    assert_eq!(stats.used_pages, 6);
    assert_eq!(stats.free_pages as usize + stats.used_pages, 256 - 2);
    assert_eq!(stats.mvcc.active_transactions, 0);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_file_backed_database() {
    let dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(dir.path().join("store.db"))
        .initial_pages(64)
        .flush_on_commit(true)
        .build();

    {
        let db = Database::open(config.clone()).unwrap();
        let versioned = db.create_tree("versioned", true).unwrap();
        let plain = db.create_tree("plain", false).unwrap();
        let mut session = db.session();
        session.begin().unwrap();
        fill(&versioned, &session, 0..100);
        session.commit().unwrap();
        fill(&plain, &session, 0..10);
        db.flush().unwrap();
    }

    let db = Database::open(config).unwrap();
    assert_eq!(db.tree_names().unwrap(), vec!["plain", "versioned"]);
    let versioned = db.get_tree("versioned").unwrap();
    let session = db.session();
    assert_eq!(versioned.entries(&session).unwrap().len(), 100);
    assert_eq!(
        db.get_tree("plain").unwrap().find_single(&session, 3i64).unwrap(),
        Some(Entry::from("value-3"))
    );

    // new transactions see pages written before the reopen
    fill(&versioned, &session, 100..110);
    let mut tx = db.session();
    tx.begin().unwrap();
    assert_eq!(versioned.entries(&tx).unwrap().len(), 110);
    tx.rollback().unwrap();
    assert_db_sound(&db);
}
