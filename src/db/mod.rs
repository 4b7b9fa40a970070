//! Database Module
//!
//! The page file, its transaction registry and the Directory of named trees.
//!
//! ## Responsibilities
//! - Open or create the backing file
//! - Create and look up named trees through the Directory
//! - Hand out sessions (explicit transaction context)
//! - Whole-file consistency check and statistics
//!
//! ## Directory
//! A non-MVCC B+tree rooted at the page recorded in the file header:
//! ```text
//! String(name) -> List[ Int(root page), Boolean(mvcc) ]
//! ```

mod session;
mod tree;

pub use session::Session;
pub use tree::{Tree, TreeIter};

use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;

use crate::btree::BTree;
use crate::codec::Entry;
use crate::config::Config;
use crate::error::{PageKvError, Result};
use crate::mvcc::{Mvcc, MvccStats};
use crate::storage::{PageAccess, PageFile, PageNo};

/// Where a named tree lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeInfo {
    pub root: PageNo,
    pub mvcc: bool,
}

impl TreeInfo {
    fn to_entry(self) -> Result<Entry> {
        let root = i32::try_from(self.root)
            .map_err(|_| PageKvError::corruption(format!("root page {} does not fit an Int entry", self.root)))?;
        Ok(Entry::List(vec![Entry::Int(root), Entry::Boolean(self.mvcc)]))
    }

    fn from_entry(name: &str, entry: &Entry) -> Result<Self> {
        match entry.as_list() {
            Some([Entry::Int(root), Entry::Boolean(mvcc)]) if *root > 0 => Ok(Self {
                root: *root as PageNo,
                mvcc: *mvcc,
            }),
            _ => Err(PageKvError::corruption(format!(
                "directory entry of tree {:?} is malformed: {}",
                name, entry
            ))),
        }
    }
}

/// File-wide statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    pub page_count: u32,
    pub used_pages: usize,
    pub free_pages: u32,
    pub trees: usize,
    pub mvcc: MvccStats,
}

pub(crate) struct DbInner {
    pub(crate) file: PageFile,
    pub(crate) mvcc: Mvcc,
    pub(crate) config: Config,
}

impl DbInner {
    fn directory(&self) -> Result<BTree<&PageFile>> {
        Ok(BTree::new(&self.file, self.file.directory_root()?)
            .with_check_after_write(self.config.check_after_write))
    }

    pub(crate) fn after_commit(&self) -> Result<()> {
        if self.config.flush_on_commit {
            self.file.flush()?;
        }
        Ok(())
    }
}

/// An open page store
///
/// ## Concurrency:
/// - `Database` is a cheap handle (`Arc`) and may be cloned across threads
/// - Directory changes and non-MVCC tree access hold the page-file lock
/// - MVCC trees are read lock-free through snapshots; commits serialise
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open or create the store described by `config`
    pub fn open(config: Config) -> Result<Self> {
        let file = PageFile::open(&config)?;
        let mvcc = Mvcc::starting_after(file.max_stamp()?);
        let inner = Arc::new(DbInner { file, mvcc, config });
        {
            let _guard = inner.file.lock();
            inner.directory()?.ensure_root()?;
        }
        tracing::debug!(
            path = ?inner.config.path,
            pages = inner.file.page_count(),
            "opened database"
        );
        Ok(Self { inner })
    }

    /// Anonymous store that lives as long as the handle
    pub fn in_memory() -> Result<Self> {
        Self::open(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// New session without a transaction
    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    // =========================================================================
    // Directory
    // =========================================================================

    /// Create the tree `name`; `TreeExists` if the name is taken
    pub fn create_tree(&self, name: &str, mvcc: bool) -> Result<Tree> {
        let _guard = self.inner.file.lock();
        let directory = self.inner.directory()?;
        let key = Entry::from(name);
        if directory.find(&key)?.is_some() {
            return Err(PageKvError::TreeExists(name.to_string()));
        }

        let root = self.inner.file.new_page()?;
        BTree::new(&self.inner.file, root).ensure_root()?;
        let info = TreeInfo { root, mvcc };
        directory.insert(key, info.to_entry()?)?;

        tracing::debug!(tree = name, root, mvcc, "created tree");
        Ok(Tree::new(Arc::clone(&self.inner), name, info))
    }

    /// Create `name` with the configured default MVCC flag
    pub fn create_tree_default(&self, name: &str) -> Result<Tree> {
        self.create_tree(name, self.inner.config.default_mvcc)
    }

    /// Handle to the existing tree `name`
    pub fn get_tree(&self, name: &str) -> Result<Tree> {
        let _guard = self.inner.file.lock();
        let value = self
            .inner
            .directory()?
            .find_single(&Entry::from(name))?
            .ok_or_else(|| PageKvError::TreeNotFound(name.to_string()))?;
        let info = TreeInfo::from_entry(name, &value)?;
        Ok(Tree::new(Arc::clone(&self.inner), name, info))
    }

    /// Existing tree, or a new one with the default MVCC flag
    pub fn open_tree(&self, name: &str) -> Result<Tree> {
        match self.get_tree(name) {
            Err(PageKvError::TreeNotFound(_)) => self.create_tree_default(name),
            other => other,
        }
    }

    /// Names of all trees in order
    pub fn tree_names(&self) -> Result<Vec<String>> {
        Ok(self
            .trees()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    fn trees(&self) -> Result<Vec<(String, TreeInfo)>> {
        let _guard = self.inner.file.lock();
        self.inner
            .directory()?
            .entries()?
            .into_iter()
            .map(|entry| {
                let Entry::String(name) = entry.key else {
                    return Err(PageKvError::corruption(format!(
                        "directory key {} is not a string",
                        entry.key
                    )));
                };
                let value = entry
                    .values
                    .first()
                    .ok_or_else(|| PageKvError::corruption(format!("tree {:?} has no directory value", name)))?;
                let info = TreeInfo::from_entry(&name, value)?;
                Ok((name, info))
            })
            .collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Check the Directory and every tree; empty when all is sound.
    ///
    /// With no transaction open, also checks that every used page is owned by
    /// exactly one tree or pre-image.
    pub fn check(&self) -> Result<String> {
        let mut out = String::new();
        let trees = self.trees()?;
        {
            let _guard = self.inner.file.lock();
            let report = self.inner.directory()?.check()?;
            if !report.is_empty() {
                let _ = writeln!(out, "directory:");
                out.push_str(&report);
            }
        }
        for (name, info) in &trees {
            let report = Tree::new(Arc::clone(&self.inner), name, *info).check(&self.session())?;
            if !report.is_empty() {
                let _ = writeln!(out, "tree {:?}:", name);
                out.push_str(&report);
            }
        }

        let _guard = self.inner.file.lock();
        if self.inner.mvcc.stats().active_transactions == 0 {
            out.push_str(&self.check_page_accounting(&trees)?);
        }
        Ok(out)
    }

    fn check_page_accounting(&self, trees: &[(String, TreeInfo)]) -> Result<String> {
        let file = &self.inner.file;
        let mut out = String::new();
        let mut owned = BTreeSet::new();
        let mut claim = |page: PageNo, owner: &str, out: &mut String| {
            if !owned.insert(page) {
                let _ = writeln!(out, "page({}): owned twice (second owner {})", page, owner);
            }
        };

        for page in self.inner.directory()?.pages()? {
            claim(page, "directory", &mut out);
        }
        for (name, info) in trees {
            for page in BTree::new(file, info.root).pages()? {
                claim(page, name, &mut out);
            }
        }
        for page in self.inner.mvcc.preimage_pages() {
            claim(page, "pre-image", &mut out);
        }
        for page in self.inner.mvcc.retired_pages() {
            claim(page, "retired", &mut out);
        }

        for page in file.used_pages()? {
            if !owned.remove(&page) {
                let _ = writeln!(out, "page({}): in use but not owned", page);
            }
        }
        for page in owned {
            if !file.is_used(page)? {
                let _ = writeln!(out, "page({}): owned but free", page);
            }
        }
        Ok(out)
    }

    /// msync a file-backed store
    pub fn flush(&self) -> Result<()> {
        self.inner.file.flush()
    }

    pub fn mvcc_stats(&self) -> MvccStats {
        self.inner.mvcc.stats()
    }

    pub fn stats(&self) -> Result<DbStats> {
        let trees = self.tree_names()?.len();
        let file = &self.inner.file;
        Ok(DbStats {
            page_count: file.page_count(),
            used_pages: file.used_pages()?.len(),
            free_pages: file.free_page_count()?,
            trees,
            mvcc: self.inner.mvcc.stats(),
        })
    }
}
