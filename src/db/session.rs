//! Sessions
//!
//! A session is the explicit "current transaction" of its owner. It holds
//! at most one transaction; tree operations take the session as a
//! parameter. A session can be moved to another thread, and a transaction
//! can be detached from one session and attached to another.

use std::sync::Arc;

use crate::error::{PageKvError, Result};
use crate::mvcc::Transaction;

use super::DbInner;

/// Transaction context for tree operations
pub struct Session {
    db: Arc<DbInner>,
    tx: Option<Arc<Transaction>>,
}

impl Session {
    pub(crate) fn new(db: Arc<DbInner>) -> Self {
        Self { db, tx: None }
    }

    pub(crate) fn db(&self) -> &Arc<DbInner> {
        &self.db
    }

    /// The current transaction, if any
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.tx.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Start a transaction; its snapshot is the state committed so far
    pub fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(PageKvError::TransactionActive);
        }
        self.tx = Some(self.db.mvcc.begin(&self.db.file)?);
        Ok(())
    }

    /// Make the current transaction's changes visible to later snapshots
    pub fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(PageKvError::NoTransaction)?;
        self.db
            .mvcc
            .commit(&self.db.file, &tx, self.db.config.check_after_write)?;
        self.db.after_commit()
    }

    /// Discard the current transaction's changes
    pub fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(PageKvError::NoTransaction)?;
        self.db.mvcc.rollback(&self.db.file, &tx)
    }

    /// Take the current transaction out of this session
    pub fn detach(&mut self) -> Result<Arc<Transaction>> {
        self.tx.take().ok_or(PageKvError::NoTransaction)
    }

    /// Make `tx` this session's current transaction
    pub fn attach(&mut self, tx: Arc<Transaction>) -> Result<()> {
        if self.tx.is_some() {
            return Err(PageKvError::TransactionActive);
        }
        self.tx = Some(tx);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::debug!(tx = tx.id(), "session dropped with an open transaction, rolling back");
            if let Err(err) = self.db.mvcc.rollback(&self.db.file, &tx) {
                tracing::warn!(tx = tx.id(), error = %err, "rollback on drop failed");
            }
        }
    }
}
