//! Configuration for PageKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{PageKvError, Result};

/// Main configuration for a PageKV database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Backing file of the page store.
    /// `None` maps an anonymous (in-memory) region instead.
    pub path: Option<PathBuf>,

    /// Number of pages a freshly created file starts with
    pub initial_pages: u32,

    /// Number of pages added whenever the allocator runs out.
    /// `0` disables growth.
    pub grow_pages: u32,

    /// msync the mapping after every commit
    pub flush_on_commit: bool,

    // -------------------------------------------------------------------------
    // Tree Configuration
    // -------------------------------------------------------------------------
    /// Run the full tree self-check after every mutating tree operation
    pub check_after_write: bool,

    /// MVCC flag used when a tree is created without an explicit one
    pub default_mvcc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            initial_pages: 1024, // 8 MB
            grow_pages: 1024,
            flush_on_commit: false,
            check_after_write: false,
            default_mvcc: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// In-memory configuration with the given initial size
    pub fn in_memory(initial_pages: u32) -> Self {
        Self::builder().initial_pages(initial_pages).build()
    }

    /// Reject configurations the page file cannot honour
    pub fn validate(&self) -> Result<()> {
        // page 0 (header), page 1 (first bitmap), one data page
        if self.initial_pages < 3 {
            return Err(PageKvError::Config(format!(
                "initial_pages must be at least 3, got {}",
                self.initial_pages
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backing file
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Use an anonymous in-memory mapping
    pub fn in_memory(mut self) -> Self {
        self.config.path = None;
        self
    }

    /// Set the initial number of pages
    pub fn initial_pages(mut self, pages: u32) -> Self {
        self.config.initial_pages = pages;
        self
    }

    /// Set the growth step in pages (0 = fixed size)
    pub fn grow_pages(mut self, pages: u32) -> Self {
        self.config.grow_pages = pages;
        self
    }

    /// Flush the mapping after each commit
    pub fn flush_on_commit(mut self, flush: bool) -> Self {
        self.config.flush_on_commit = flush;
        self
    }

    /// Self-check trees after every write
    pub fn check_after_write(mut self, check: bool) -> Self {
        self.config.check_after_write = check;
        self
    }

    /// Set the default MVCC flag for new trees
    pub fn default_mvcc(mut self, mvcc: bool) -> Self {
        self.config.default_mvcc = mvcc;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
