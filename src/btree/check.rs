//! Structural self-check

use std::collections::HashSet;
use std::fmt::Write;

use crate::codec::Entry;
use crate::error::Result;
use crate::storage::{PageAccess, PageNo, SlottedPage};

use super::node::load_entries;
use super::{BTree, MAX_DEPTH};

struct CheckState {
    visited: HashSet<PageNo>,
    leaf_depth: Option<usize>,
    out: String,
}

impl<P: PageAccess> BTree<P> {
    /// Walk the whole tree and describe every inconsistency found.
    /// An empty string means the tree is sound.
    pub fn check(&self) -> Result<String> {
        let mut state = CheckState {
            visited: HashSet::new(),
            leaf_depth: None,
            out: String::new(),
        };
        self.check_page(self.root, None, None, 0, false, &mut state)?;
        Ok(state.out)
    }

    /// Every page reachable from the root, root included
    pub fn pages(&self) -> Result<Vec<PageNo>> {
        let mut pages = Vec::new();
        let mut pending = vec![self.root];
        let mut seen = HashSet::new();
        while let Some(page) = pending.pop() {
            if !seen.insert(page) {
                continue;
            }
            pages.push(page);
            pending.extend(load_entries(&self.access, page)?.iter().filter_map(|e| e.child));
        }
        Ok(pages)
    }

    fn check_page(
        &self,
        page: PageNo,
        lower: Option<&Entry>,
        upper: Option<&Entry>,
        depth: usize,
        only_leaf: bool,
        state: &mut CheckState,
    ) -> Result<()> {
        if !state.visited.insert(page) {
            let _ = writeln!(state.out, "page({}): reached twice", page);
            return Ok(());
        }
        if depth > MAX_DEPTH {
            let _ = writeln!(state.out, "page({}): deeper than {} levels", page, MAX_DEPTH);
            return Ok(());
        }

        let page_report = SlottedPage::attach(&self.access, page).check()?;
        if !page_report.is_empty() {
            state.out.push_str(&page_report);
            return Ok(());
        }

        let entries = load_entries(&self.access, page)?;
        // an empty tree is the root sentinel over one empty leaf
        let Some(first) = entries.first() else {
            if page != self.root && !only_leaf {
                let _ = writeln!(state.out, "page({}): empty non-root page", page);
            }
            return Ok(());
        };
        let is_inner = first.child.is_some();
        if is_inner && !first.is_sentinel() {
            let _ = writeln!(state.out, "page({}): inner page does not start with a sentinel", page);
        }
        if !is_inner {
            match state.leaf_depth {
                None => state.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    let _ = writeln!(
                        state.out,
                        "page({}): leaf at depth {}, expected {}",
                        page, depth, expected
                    );
                }
                Some(_) => {}
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            if entry.is_sentinel() && i != 0 {
                let _ = writeln!(state.out, "page({}): sentinel at position {}", page, i);
            }
            if is_inner != entry.child.is_some() {
                let _ = writeln!(
                    state.out,
                    "page({}): entry {} {} a child pointer",
                    page,
                    entry.key,
                    if is_inner { "lacks" } else { "has" }
                );
            }
            if !entry.is_sentinel() {
                if entry.values.is_empty() {
                    let _ = writeln!(state.out, "page({}): key {} has no values", page, entry.key);
                }
                if lower.is_some_and(|l| entry.key <= *l) || upper.is_some_and(|u| entry.key >= *u) {
                    let _ = writeln!(
                        state.out,
                        "page({}): key {} outside bounds ({:?}, {:?})",
                        page, entry.key, lower, upper
                    );
                }
            }
            if i > 0 && entries[i - 1].key >= entry.key {
                let _ = writeln!(state.out, "page({}): duplicate key {}", page, entry.key);
            }
        }

        if !is_inner {
            return Ok(());
        }
        for (i, entry) in entries.iter().enumerate() {
            let Some(child) = entry.child else { continue };
            if !self.access.is_used(child)? {
                let _ = writeln!(state.out, "page({}): child {} is not allocated", page, child);
                continue;
            }
            let child_lower = if entry.is_sentinel() { lower } else { Some(&entry.key) };
            let child_upper = entries.get(i + 1).map(|e| &e.key).or(upper);
            let only_leaf = page == self.root && entries.len() == 1;
            self.check_page(child, child_lower, child_upper, depth + 1, only_leaf, state)?;
        }
        Ok(())
    }
}
