//! B+tree Module
//!
//! Multi-valued B+tree over slotted pages.
//!
//! ## Responsibilities
//! - Map each key to a non-empty ordered list of values
//! - Split pages on insert, merge / redistribute them on delete
//! - Ordered iteration and point lookup
//! - Structural self-check
//!
//! ## Node Layout
//! ```text
//! inner page:  [ sentinel → c0 ][ k1 → c1 ][ k2 → c2 ] ...
//! leaf page:   [ k1 ][ k2 ][ k3 ] ...
//!
//! c0 holds keys < k1, c1 holds keys in (k1, k2), ...
//! ```
//! The root page number never changes: a root split moves the old root's
//! contents to a fresh page, and collapsing a level copies the only child
//! back into the root.
//!
//! Every page is reached through a [`PageAccess`], so the same code runs on
//! the raw page file and inside an MVCC view.

mod check;
mod cursor;
mod delete;
mod insert;
mod node;

pub use cursor::Cursor;
pub use node::{load_entries, NodeEntry};

use crate::codec::Entry;
use crate::error::{PageKvError, Result};
use crate::storage::slotted::END_OF_HEADER;
use crate::storage::{PageAccess, PageNo, SlottedPage, PAGE_SIZE};

/// Largest serialized node entry, child pointer included
pub const MAX_ENTRY_SIZE: usize = (PAGE_SIZE - END_OF_HEADER) / 4;

/// Free space kept on a page after a non-splitting insert
const SPLIT_RESERVE: usize = PAGE_SIZE / 3;

/// A page with more free space than this is under-full
const UNDERFLOW_THRESHOLD: usize = PAGE_SIZE * 2 / 3;

/// Guard against cycles in a damaged tree
const MAX_DEPTH: usize = 64;

/// What a recursive insert/delete did to the page it was called on
#[derive(Debug)]
pub enum Restructure {
    Unchanged,
    /// The page split; the entry must be inserted into the parent
    SplitProduced(NodeEntry),
    /// Entries moved between pages; nothing more to propagate
    MergeCompleted,
}

/// Key with all of its values, as returned by iteration
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub key: Entry,
    pub values: Vec<Entry>,
}

/// B+tree rooted at a fixed page, operating through `P`
pub struct BTree<P: PageAccess> {
    access: P,
    root: PageNo,
    check_after_write: bool,
}

impl<P: PageAccess> BTree<P> {
    pub fn new(access: P, root: PageNo) -> Self {
        Self {
            access,
            root,
            check_after_write: false,
        }
    }

    /// Run `check()` after every insert/remove and fail on findings
    pub fn with_check_after_write(mut self, enabled: bool) -> Self {
        self.check_after_write = enabled;
        self
    }

    pub fn root(&self) -> PageNo {
        self.root
    }

    pub fn access(&self) -> &P {
        &self.access
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Give an empty root a sentinel pointing at a fresh leaf
    pub fn ensure_root(&self) -> Result<()> {
        let root = self.page(self.root)?;
        if !root.is_empty()? {
            return Ok(());
        }
        let leaf = self.access.new_page()?;
        self.page(leaf)?;
        root.add(&NodeEntry::sentinel(leaf))?;
        tracing::trace!(root = self.root, leaf, "initialized tree root");
        Ok(())
    }

    /// Append `value` to the values of `key`
    pub fn insert(&self, key: Entry, value: Entry) -> Result<()> {
        validate_key(&key)?;
        let entry = NodeEntry::leaf(key, vec![value]);
        check_entry_size(&entry)?;
        self.ensure_root()?;
        let outcome = self.insert_into(self.root, entry, false)?;
        self.fix_root(outcome)?;
        self.verify_if_configured()
    }

    /// Remove one occurrence of `value` from `key`
    pub fn remove(&self, key: &Entry, value: &Entry) -> Result<()> {
        self.remove_inner(key, Some(value))
    }

    /// Remove `key` with all of its values
    pub fn remove_all(&self, key: &Entry) -> Result<()> {
        self.remove_inner(key, None)
    }

    fn remove_inner(&self, key: &Entry, value: Option<&Entry>) -> Result<()> {
        validate_key(key)?;
        let mut reinsert = Vec::new();
        let outcome = self.delete_from(self.root, key, value, &mut reinsert, 0)?;
        self.fix_root(outcome)?;
        for entry in reinsert {
            self.ensure_root()?;
            let outcome = self.insert_into(self.root, entry, true)?;
            self.fix_root(outcome)?;
        }
        self.ensure_root()?;
        self.verify_if_configured()
    }

    /// All values of `key`, or `None` if absent
    pub fn find(&self, key: &Entry) -> Result<Option<Vec<Entry>>> {
        let mut page = self.root;
        for _ in 0..MAX_DEPTH {
            let entries = load_entries(&self.access, page)?;
            match entries.binary_search_by(|e| e.key.cmp(key)) {
                Ok(idx) => return Ok(Some(entries[idx].values.clone())),
                Err(0) => return Ok(None),
                Err(idx) => match entries[idx - 1].child {
                    Some(child) => page = child,
                    None => return Ok(None),
                },
            }
        }
        Err(PageKvError::corruption(format!(
            "tree at page {} is deeper than {} levels",
            self.root, MAX_DEPTH
        )))
    }

    /// The single value of `key`; `AmbiguousValue` if it has several
    pub fn find_single(&self, key: &Entry) -> Result<Option<Entry>> {
        match self.find(key)? {
            None => Ok(None),
            Some(mut values) if values.len() == 1 => Ok(values.pop()),
            Some(_) => Err(PageKvError::AmbiguousValue),
        }
    }

    /// Cursor over all entries in key order
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.root)
    }

    /// Collect every entry in key order
    pub fn entries(&self) -> Result<Vec<TreeEntry>> {
        let mut cursor = self.cursor();
        let mut out = Vec::new();
        while let Some(entry) = cursor.next_entry(&self.access)? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Number of levels, root and leaves included.
    ///
    /// The root is always an inner page, so an empty tree (root sentinel over
    /// one empty leaf) has height 2. Only a root split adds a level.
    pub fn height(&self) -> Result<usize> {
        let mut height = 1;
        let mut page = self.root;
        while let Some(child) = load_entries(&self.access, page)?.first().and_then(|e| e.child) {
            height += 1;
            page = child;
            if height > MAX_DEPTH {
                return Err(PageKvError::corruption("tree height exceeds the depth limit"));
            }
        }
        Ok(height)
    }

    fn verify_if_configured(&self) -> Result<()> {
        if !self.check_after_write {
            return Ok(());
        }
        let report = self.check()?;
        if report.is_empty() {
            Ok(())
        } else {
            Err(PageKvError::Corruption(report))
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn page(&self, number: PageNo) -> Result<SlottedPage<'_, P>> {
        SlottedPage::open(&self.access, number)
    }

    fn entries_of(&self, page: PageNo) -> Result<Vec<NodeEntry>> {
        load_entries(&self.access, page)
    }

    /// Root split or root collapse after a top-level insert/delete
    fn fix_root(&self, outcome: Restructure) -> Result<()> {
        match outcome {
            Restructure::SplitProduced(split) => self.grow_root(split),
            Restructure::Unchanged | Restructure::MergeCompleted => self.shrink_root(),
        }
    }

    fn grow_root(&self, split: NodeEntry) -> Result<()> {
        if split.is_sentinel() {
            return Err(PageKvError::corruption("root split produced a sentinel"));
        }
        let root = self.page(self.root)?;
        let left = self.access.new_page()?;
        let left_page = self.page(left)?;
        for entry in self.entries_of(self.root)? {
            left_page.add(&entry.detached())?;
        }
        root.clear_contents()?;
        root.add(&NodeEntry::sentinel(left))?;
        root.add(&split.detached())?;
        tracing::trace!(root = self.root, left, right = ?split.child, "split root");
        Ok(())
    }

    fn shrink_root(&self) -> Result<()> {
        for _ in 0..MAX_DEPTH {
            let entries = self.entries_of(self.root)?;
            let only_child = match entries.as_slice() {
                [only] => only.child,
                _ => None,
            };
            let Some(child) = only_child else {
                return Ok(());
            };
            let child_entries = self.entries_of(child)?;
            if child_entries.first().and_then(|e| e.child).is_none() {
                return Ok(());
            }
            let root = self.page(self.root)?;
            root.clear_contents()?;
            for entry in &child_entries {
                root.add(&entry.detached())?;
            }
            self.access.free_page(child)?;
            tracing::trace!(root = self.root, child, "collapsed root level");
        }
        Ok(())
    }

    /// Smallest entry in the subtree under `page`
    fn smallest_entry(&self, page: PageNo) -> Result<Option<NodeEntry>> {
        let entries = self.entries_of(page)?;
        match entries.first() {
            None => Ok(None),
            Some(first) => match first.child {
                Some(child) => match self.smallest_entry(child)? {
                    Some(found) => Ok(Some(found)),
                    None => Ok(entries.get(1).cloned()),
                },
                None => Ok(Some(first.clone())),
            },
        }
    }

    /// Release `page` and every page below it
    fn free_subtree(&self, page: PageNo) -> Result<()> {
        for entry in self.entries_of(page)? {
            if let Some(child) = entry.child {
                self.free_subtree(child)?;
            }
        }
        self.access.free_page(page)
    }
}

/// Empty is reserved for sentinels
pub fn validate_key(key: &Entry) -> Result<()> {
    if key.is_empty_entry() {
        return Err(PageKvError::InvalidKey(
            "the empty entry cannot be used as a key".into(),
        ));
    }
    Ok(())
}

/// Leaf entries are sized as if they carried a child pointer, since a
/// split can promote them into an inner page.
fn check_entry_size(entry: &NodeEntry) -> Result<()> {
    let size = entry.encoded_len() + if entry.child.is_none() { 4 } else { 0 };
    if size > MAX_ENTRY_SIZE {
        return Err(PageKvError::EntryTooLarge {
            size,
            max: MAX_ENTRY_SIZE,
        });
    }
    Ok(())
}
