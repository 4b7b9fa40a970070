//! # PageKV
//!
//! An embedded key-value storage engine over a memory-mapped page file:
//! - Bitmap free-space allocator over fixed 8 KB pages
//! - Slotted pages holding variable-length records
//! - Multi-valued B+trees with typed keys and values
//! - MVCC snapshot isolation with copy-on-write pages and a pre-image chain
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Database / Directory / Session                  │
//! │          (named trees, explicit transaction context)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │ MVCC trees              │ plain trees
//!          ▼                         │
//!   ┌─────────────┐                  │
//!   │    MVCC     │ TxView /         │
//!   │ (pre-images)│ CommitView       │
//!   └──────┬──────┘                  │
//!          └────────────┬────────────┘
//!                       ▼
//!               ┌──────────────┐      ┌─────────────┐
//!               │   B+tree     │─────▶│ Entry codec │
//!               └──────┬───────┘      └─────────────┘
//!                      ▼ PageAccess
//!               ┌──────────────┐
//!               │ Slotted page │
//!               └──────┬───────┘
//!                      ▼
//!               ┌──────────────┐
//!               │  Page file   │ header, free-space bitmaps, growth
//!               └──────┬───────┘
//!                      ▼
//!               ┌──────────────┐
//!               │ Mapped buffer│ memmap2, RwLock
//!               └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod buffer;
pub mod storage;
pub mod codec;
pub mod btree;
pub mod mvcc;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{PageKvError, Result};
pub use config::Config;
pub use codec::Entry;
pub use btree::TreeEntry;
pub use db::{Database, DbStats, Session, Tree, TreeIter};
pub use mvcc::MvccStats;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of PageKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
