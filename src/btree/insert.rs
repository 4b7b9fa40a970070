//! Insert with page splits

use crate::error::{PageKvError, Result};
use crate::storage::{PageAccess, PageNo};

use super::node::NodeEntry;
use super::{check_entry_size, BTree, Restructure, SPLIT_RESERVE};

impl<P: PageAccess> BTree<P> {
    /// Insert `to_insert` into the subtree under `page_no`.
    ///
    /// An existing key gets the new values appended. With `force_unique`
    /// an existing key is an error (used when re-inserting whole entries).
    pub(crate) fn insert_into(
        &self,
        page_no: PageNo,
        to_insert: NodeEntry,
        force_unique: bool,
    ) -> Result<Restructure> {
        let page = self.page(page_no)?;
        let mut entries = self.entries_of(page_no)?;
        let position = entries.iter().position(|e| e.key >= to_insert.key);
        let idx = position.unwrap_or(entries.len());

        if position.is_some_and(|i| entries[i].key == to_insert.key) {
            if force_unique {
                return Err(PageKvError::corruption(format!(
                    "re-inserted key {} already present on page {}",
                    to_insert.key, page_no
                )));
            }
            let existing = entries.remove(idx);
            let slot = existing.slot()?;
            let mut grown = existing.detached();
            grown.values.extend(to_insert.values);
            check_entry_size(&grown)?;

            page.remove(slot)?;
            if page.allocation_fits(grown.encoded_len())? {
                page.add(&grown)?;
                return Ok(Restructure::Unchanged);
            }
            let is_inner = grown.child.is_some();
            return self.insert_and_split(page_no, grown, idx, entries, is_inner);
        }

        let is_leaf = entries.first().map_or(true, |e| e.child.is_none());
        if is_leaf {
            return self.insert_and_split(page_no, to_insert, idx, entries, false);
        }
        if to_insert.child.is_some() {
            return self.insert_and_split(page_no, to_insert, idx, entries, true);
        }
        if idx == 0 {
            return Err(PageKvError::corruption(format!(
                "key {} sorts before the sentinel of page {}",
                to_insert.key, page_no
            )));
        }

        let referring = &entries[idx - 1];
        let child = referring
            .child
            .ok_or_else(|| PageKvError::corruption(format!("inner page {} entry without child", page_no)))?;

        match self.insert_into(child, to_insert, force_unique)? {
            Restructure::Unchanged | Restructure::MergeCompleted => Ok(Restructure::Unchanged),
            Restructure::SplitProduced(split) if split.is_sentinel() => {
                let redirected = referring.detached().with_child(split.child);
                page.remove(referring.slot()?)?;
                page.add(&redirected)?;
                Ok(Restructure::Unchanged)
            }
            Restructure::SplitProduced(split) => self.insert_into(page_no, split, force_unique),
        }
    }

    /// Add `to_insert` at position `idx` of `entries` (the page contents
    /// without it), splitting the page if it would get too full.
    ///
    /// On a split the entries from the split point onwards move to a new
    /// right sibling and the split entry is returned for the parent, with
    /// its child pointing at the sibling.
    pub(crate) fn insert_and_split(
        &self,
        page_no: PageNo,
        to_insert: NodeEntry,
        idx: usize,
        entries: Vec<NodeEntry>,
        is_inner: bool,
    ) -> Result<Restructure> {
        let page = self.page(page_no)?;
        if page.allocation_fits(to_insert.encoded_len() + SPLIT_RESERVE)? {
            page.add(&to_insert)?;
            return Ok(Restructure::Unchanged);
        }

        let mut all = entries;
        all.insert(idx, to_insert);
        let total: usize = all.iter().map(NodeEntry::encoded_len).sum();

        let sibling_no = self.access.new_page()?;
        let sibling = self.page(sibling_no)?;
        let mut running = 0;
        let mut split: Option<NodeEntry> = None;
        let mut insert_left = false;

        for (i, entry) in all.iter().enumerate() {
            running += entry.encoded_len();
            if running < total / 2 {
                if i == idx {
                    insert_left = true;
                }
                continue;
            }
            if i != idx {
                page.remove(entry.slot()?)?;
            }
            if split.is_none() {
                if is_inner {
                    let child = entry.child.ok_or_else(|| {
                        PageKvError::corruption(format!("inner page {} entry without child", page_no))
                    })?;
                    sibling.add(&NodeEntry::sentinel(child))?;
                }
                split = Some(entry.detached().with_child(Some(sibling_no)));
            } else {
                sibling.add(&entry.detached())?;
            }
        }

        if insert_left {
            page.add(&all[idx].detached())?;
        }
        let split = split.ok_or_else(|| PageKvError::corruption(format!("page {} split found no split entry", page_no)))?;
        tracing::trace!(page = page_no, sibling = sibling_no, "split page");
        Ok(Restructure::SplitProduced(split))
    }
}
