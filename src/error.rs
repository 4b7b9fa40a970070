//! Error types for PageKV
//!
//! Provides a unified error type for all operations.
//!
//! Errors fall into three groups:
//! - **Fatal invariant violations**: storage corruption or a programming error.
//!   The operation is aborted and the error is tagged so callers can tell
//!   (see [`PageKvError::is_fatal`]).
//! - **Caller errors**: the request itself was wrong (unknown key, unknown tree).
//! - **Capacity errors**: the request can never be satisfied (entry too large,
//!   file cannot grow).

use thiserror::Error;

use crate::storage::PageNo;

/// Result type alias using PageKvError
pub type Result<T> = std::result::Result<T, PageKvError>;

/// Unified error type for PageKV operations
#[derive(Debug, Error)]
pub enum PageKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Invariant Violations (fatal)
    // -------------------------------------------------------------------------
    #[error("Storage corruption: {0}")]
    Corruption(String),

    #[error("Double free of page {page}")]
    DoubleFree { page: PageNo },

    #[error("Slot {slot} of page {page} is already removed")]
    SlotAlreadyRemoved { page: PageNo, slot: u16 },

    #[error("No pre-image of page {page} visible to transaction {base_id:#x}")]
    MissingPreImage { page: PageNo, base_id: u64 },

    #[error("A transaction is already active in this session")]
    TransactionActive,

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Value not found for key")]
    ValueNotFound,

    #[error("Key holds more than one value")]
    AmbiguousValue,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Tree already exists: {0}")]
    TreeExists(String),

    #[error("No active transaction in this session")]
    NoTransaction,

    #[error("Slot {slot} out of range on page {page}")]
    SlotOutOfRange { page: PageNo, slot: u16 },

    #[error("Page {page} cannot hold {requested} more bytes")]
    PageFull { page: PageNo, requested: usize },

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Entry of {size} bytes exceeds the maximum of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Page file is full and cannot grow")]
    FileFull,

    #[error("Access of {len} bytes at offset {offset} is outside the {size}-byte buffer")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    // -------------------------------------------------------------------------
    // Codec Errors
    // -------------------------------------------------------------------------
    #[error("Codec error: {0}")]
    Codec(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Commit failed and was undone: {0}")]
    CommitConflict(Box<PageKvError>),

    #[error("Every transaction slot is in use")]
    TooManyTransactions,

    // -------------------------------------------------------------------------
    // Configuration / File Format Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid page file: {0}")]
    InvalidFile(String),
}

impl PageKvError {
    /// True for errors that indicate corruption or a broken invariant.
    pub fn is_fatal(&self) -> bool {
        match self {
            PageKvError::Corruption(_)
            | PageKvError::DoubleFree { .. }
            | PageKvError::SlotAlreadyRemoved { .. }
            | PageKvError::MissingPreImage { .. }
            | PageKvError::TransactionActive => true,
            PageKvError::CommitConflict(inner) => inner.is_fatal(),
            _ => false,
        }
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        PageKvError::Corruption(msg.into())
    }
}
