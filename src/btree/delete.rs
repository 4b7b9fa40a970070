//! Delete with merge / redistribution
//!
//! ## Rebalancing
//! A child page with more than two thirds of its space free after a
//! delete is under-full. It is, in order of preference:
//! - dropped, if it became empty (its separator is queued for re-insert)
//! - merged into its left sibling, or has its right sibling merged in
//! - topped up from a sibling by moving entries across the separator

use crate::codec::Entry;
use crate::error::{PageKvError, Result};
use crate::storage::slotted::INDEX_ENTRY_SIZE;
use crate::storage::{PageAccess, PageNo, SlottedPage, PAGE_SIZE};

use super::node::NodeEntry;
use super::{BTree, Restructure, MAX_DEPTH, UNDERFLOW_THRESHOLD};

/// Page cost of an entry: record plus slot
fn cost(entry: &NodeEntry) -> usize {
    entry.encoded_len() + INDEX_ENTRY_SIZE
}

fn absorb(outcome: Restructure) -> Restructure {
    match outcome {
        Restructure::Unchanged => Restructure::MergeCompleted,
        other => other,
    }
}

fn missing_child(page: PageNo) -> PageKvError {
    PageKvError::corruption(format!("inner page {} entry without child", page))
}

impl<P: PageAccess> BTree<P> {
    /// Delete `value` from `key` (or the whole key when `value` is `None`)
    /// in the subtree under `page_no`.
    ///
    /// Entries whose subtree disappeared are pushed to `reinsert`; the
    /// caller inserts them again once the tree is consistent.
    pub(crate) fn delete_from(
        &self,
        page_no: PageNo,
        key: &Entry,
        value: Option<&Entry>,
        reinsert: &mut Vec<NodeEntry>,
        depth: usize,
    ) -> Result<Restructure> {
        if depth > MAX_DEPTH {
            return Err(PageKvError::corruption("tree deeper than the depth limit"));
        }
        let entries = self.entries_of(page_no)?;
        let position = entries.iter().position(|e| e.key >= *key);
        let idx = position.unwrap_or(entries.len());

        let Some(found) = position.filter(|&i| entries[i].key == *key) else {
            if idx == 0 {
                return Err(PageKvError::KeyNotFound);
            }
            let child = entries[idx - 1].child.ok_or(PageKvError::KeyNotFound)?;
            match self.delete_from(child, key, value, reinsert, depth + 1)? {
                Restructure::SplitProduced(split) => {
                    return Ok(absorb(self.insert_into(page_no, split, false)?))
                }
                Restructure::MergeCompleted => return Ok(Restructure::MergeCompleted),
                Restructure::Unchanged => {}
            }
            self.rebalance_child(page_no, &entries, idx, child, reinsert)?;
            return Ok(Restructure::Unchanged);
        };

        let target = &entries[found];
        let mut remaining = target.detached();
        match value {
            Some(value) => {
                let at = remaining
                    .values
                    .iter()
                    .position(|v| v == value)
                    .ok_or(PageKvError::ValueNotFound)?;
                remaining.values.remove(at);
            }
            None => remaining.values.clear(),
        }

        let page = self.page(page_no)?;
        if !remaining.values.is_empty() {
            page.remove(target.slot()?)?;
            page.add(&remaining)?;
            return Ok(Restructure::Unchanged);
        }

        match target.child {
            None => {
                page.remove(target.slot()?)?;
                Ok(Restructure::Unchanged)
            }
            Some(child) => self.replace_inner_entry(page_no, &entries, found, child, reinsert, depth),
        }
    }

    /// `entries[index]` lost its last value but still separates two
    /// subtrees: replace it by the smallest entry of its child subtree.
    fn replace_inner_entry(
        &self,
        page_no: PageNo,
        entries: &[NodeEntry],
        index: usize,
        child: PageNo,
        reinsert: &mut Vec<NodeEntry>,
        depth: usize,
    ) -> Result<Restructure> {
        let page = self.page(page_no)?;
        let target = &entries[index];

        let Some(smallest) = self.smallest_entry(child)? else {
            self.free_subtree(child)?;
            page.remove(target.slot()?)?;
            return Ok(Restructure::Unchanged);
        };

        let outcome = self.delete_from(child, &smallest.key, None, reinsert, depth + 1)?;
        let replacement = smallest.detached().with_child(Some(child));
        page.remove(target.slot()?)?;

        match outcome {
            Restructure::Unchanged => {}
            Restructure::MergeCompleted => {
                return Ok(absorb(self.place_replacement(page_no, replacement)?));
            }
            Restructure::SplitProduced(pending) => {
                return self.place_with_pending(page_no, replacement, pending);
            }
        }

        let child_page = self.page(child)?;
        if child_page.free_space()? > UNDERFLOW_THRESHOLD {
            if child_page.is_empty()? {
                self.access.free_page(child)?;
                reinsert.push(replacement.without_child());
                return Ok(Restructure::Unchanged);
            }

            let left_no = index
                .checked_sub(1)
                .and_then(|i| entries[i].child)
                .ok_or_else(|| missing_child(page_no))?;
            let left = self.page(left_no)?;
            let child_used = PAGE_SIZE - child_page.free_space()?;
            if left.free_space()? as i64 - cost(&replacement) as i64 > child_used as i64 {
                let mut separator = replacement.without_child();
                for entry in self.entries_of(child)? {
                    if entry.is_sentinel() {
                        separator.child = entry.child;
                        continue;
                    }
                    left.add(&entry.detached())?;
                }
                left.add(&separator)?;
                self.access.free_page(child)?;
                tracing::trace!(page = child, into = left_no, "merged page into left sibling");
                return Ok(Restructure::Unchanged);
            }
        }

        self.place_replacement(page_no, replacement)
    }

    /// Put a replacement separator back into `page_no`
    fn place_replacement(&self, page_no: PageNo, replacement: NodeEntry) -> Result<Restructure> {
        let page = self.page(page_no)?;
        if page.allocation_fits(replacement.encoded_len())? {
            page.add(&replacement)?;
            return Ok(Restructure::Unchanged);
        }
        let entries = self.entries_of(page_no)?;
        let idx = entries
            .iter()
            .position(|e| e.key > replacement.key)
            .unwrap_or(entries.len());
        self.insert_and_split(page_no, replacement, idx, entries, true)
    }

    /// Place the replacement separator and a split entry produced below
    fn place_with_pending(
        &self,
        page_no: PageNo,
        replacement: NodeEntry,
        pending: NodeEntry,
    ) -> Result<Restructure> {
        match self.place_replacement(page_no, replacement)? {
            Restructure::SplitProduced(split) => {
                let target = if pending.key < split.key {
                    page_no
                } else {
                    split.child.ok_or_else(|| missing_child(page_no))?
                };
                let page = self.page(target)?;
                if !page.allocation_fits(pending.encoded_len())? {
                    return Err(PageKvError::PageFull {
                        page: target,
                        requested: pending.encoded_len(),
                    });
                }
                page.add(&pending)?;
                Ok(Restructure::SplitProduced(split))
            }
            _ => Ok(absorb(self.insert_into(page_no, pending, false)?)),
        }
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    /// `entries[idx - 1]` refers to `child`, which just lost an entry
    fn rebalance_child(
        &self,
        parent_no: PageNo,
        entries: &[NodeEntry],
        idx: usize,
        child: PageNo,
        reinsert: &mut Vec<NodeEntry>,
    ) -> Result<()> {
        let child_page = self.page(child)?;
        if child_page.free_space()? <= UNDERFLOW_THRESHOLD {
            return Ok(());
        }
        if child_page.is_empty()? {
            return self.handle_empty_child(parent_no, entries, idx - 1, child, reinsert);
        }

        let mut rebalanced = false;
        if idx > 1 {
            let left = entries[idx - 2].child.ok_or_else(|| missing_child(parent_no))?;
            rebalanced = self.merge_right_to_left(parent_no, left, child, &entries[idx - 1])?;
        }
        if !rebalanced && idx < entries.len() {
            let right = entries[idx].child.ok_or_else(|| missing_child(parent_no))?;
            self.merge_right_to_left(parent_no, child, right, &entries[idx])?;
        }
        Ok(())
    }

    /// Drop the empty page `child` referred to by `entries[index]`
    fn handle_empty_child(
        &self,
        parent_no: PageNo,
        entries: &[NodeEntry],
        index: usize,
        child: PageNo,
        reinsert: &mut Vec<NodeEntry>,
    ) -> Result<()> {
        let parent = self.page(parent_no)?;
        let referring = &entries[index];
        if index == 0 {
            if let Some(second) = entries.get(1) {
                // the second entry's subtree becomes the leftmost one
                parent.remove(second.slot()?)?;
                parent.remove(referring.slot()?)?;
                parent.add(&referring.detached().with_child(second.child))?;
                reinsert.push(second.without_child());
            } else {
                parent.remove(referring.slot()?)?;
            }
        } else {
            parent.remove(referring.slot()?)?;
            reinsert.push(referring.without_child());
        }
        self.access.free_page(child)?;
        tracing::trace!(page = child, parent = parent_no, "dropped empty page");
        Ok(())
    }

    /// Merge `right_no` into `left_no`, or move entries between them so both
    /// are reasonably filled. `right_entry` is the parent entry referring to
    /// `right_no`. Returns whether anything changed.
    fn merge_right_to_left(
        &self,
        parent_no: PageNo,
        left_no: PageNo,
        right_no: PageNo,
        right_entry: &NodeEntry,
    ) -> Result<bool> {
        let parent = self.page(parent_no)?;
        let left = self.page(left_no)?;
        let right = self.page(right_no)?;
        left.compact_index_area()?;
        right.compact_index_area()?;

        let left_free = left.free_space()? as i64;
        let right_used = (PAGE_SIZE - right.free_space()?) as i64;
        if left_free - cost(right_entry) as i64 > right_used {
            let mut separator = right_entry.without_child();
            for entry in self.entries_of(right_no)? {
                if entry.is_sentinel() {
                    separator.child = entry.child;
                    continue;
                }
                left.add(&entry.detached())?;
            }
            left.add(&separator)?;
            parent.remove(right_entry.slot()?)?;
            self.access.free_page(right_no)?;
            tracing::trace!(page = right_no, into = left_no, "merged page into left sibling");
            return Ok(true);
        }

        self.redistribute(&parent, &left, &right, right_entry)
    }

    fn redistribute(
        &self,
        parent: &SlottedPage<'_, P>,
        left: &SlottedPage<'_, P>,
        right: &SlottedPage<'_, P>,
        right_entry: &NodeEntry,
    ) -> Result<bool> {
        let left_entries = self.entries_of(left.number())?;
        let right_entries = self.entries_of(right.number())?;
        let first_child_right = right_entries.first().and_then(|e| e.child);

        let left_len: usize = left_entries.iter().map(cost).sum();
        let right_len: usize = right_entries.iter().map(cost).sum();
        let parent_free = parent.free_space()? as i64;
        let limit = PAGE_SIZE * 2 / 3;
        let fits_parent = |e: &NodeEntry| {
            parent_free + right_entry.encoded_len() as i64 - e.encoded_len() as i64 >= 0
        };

        // (entry, whether it is the parent's separator)
        let mut pool: Vec<(NodeEntry, bool)>;

        if left_len > right_len {
            pool = left_entries.into_iter().map(|e| (e, false)).collect();
            pool.push((right_entry.clone(), true));

            let mut filled = right_len;
            let mut take = 0;
            for (entry, _) in pool.iter().rev() {
                filled += cost(entry);
                if filled >= limit {
                    break;
                }
                take += 1;
            }
            let mut moving = &pool[pool.len() - take..];
            while let Some((first, _)) = moving.first() {
                if fits_parent(first) {
                    break;
                }
                moving = &moving[1..];
            }
            if moving.len() < 2 || moving.iter().any(|(e, _)| e.is_sentinel()) {
                return Ok(false);
            }

            let (split, _) = &moving[0];
            if first_child_right.is_some() {
                let sentinel = &right_entries[0];
                right.remove(sentinel.slot()?)?;
                right.add(&sentinel.detached().with_child(split.child))?;
            }
            left.remove(split.slot()?)?;
            for (entry, is_separator) in &moving[1..] {
                if *is_separator {
                    parent.remove(entry.slot()?)?;
                    right.add(&entry.detached().with_child(first_child_right))?;
                } else {
                    left.remove(entry.slot()?)?;
                    right.add(&entry.detached())?;
                }
            }
            parent.add(&split.detached().with_child(Some(right.number())))?;
        } else {
            let right_sentinel = first_child_right.map(|_| right_entries[0].clone());
            pool = vec![(right_entry.clone(), true)];
            pool.extend(
                right_entries
                    .into_iter()
                    .filter(|e| !e.is_sentinel())
                    .map(|e| (e, false)),
            );

            let mut filled = left_len;
            let mut take = 0;
            for (entry, _) in pool.iter() {
                filled += cost(entry);
                if filled >= limit {
                    break;
                }
                take += 1;
            }
            let mut moving = &pool[..take];
            while let Some((last, _)) = moving.last() {
                if fits_parent(last) {
                    break;
                }
                moving = &moving[..moving.len() - 1];
            }
            if moving.len() < 2 {
                return Ok(false);
            }

            let (split, _) = &moving[moving.len() - 1];
            right.remove(split.slot()?)?;
            for (entry, is_separator) in &moving[..moving.len() - 1] {
                if *is_separator {
                    parent.remove(entry.slot()?)?;
                    left.add(&entry.detached().with_child(first_child_right))?;
                } else {
                    right.remove(entry.slot()?)?;
                    left.add(&entry.detached())?;
                }
            }
            if let Some(sentinel) = right_sentinel {
                right.remove(sentinel.slot()?)?;
                right.add(&sentinel.detached().with_child(split.child))?;
            }
            parent.add(&split.detached().with_child(Some(right.number())))?;
        }

        tracing::trace!(
            left = left.number(),
            right = right.number(),
            "redistributed entries between siblings"
        );
        Ok(true)
    }
}
