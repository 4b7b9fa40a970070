//! In-order cursor
//!
//! Keeps an explicit stack of visited pages instead of recursing. Each
//! page's entries are read once, when the cursor first descends into it.

use crate::error::{PageKvError, Result};
use crate::storage::{PageAccess, PageNo};

use super::node::{load_entries, NodeEntry};
use super::{TreeEntry, MAX_DEPTH};

struct Frame {
    entries: Vec<NodeEntry>,
    next: usize,
}

/// Position inside a tree walk
pub struct Cursor {
    root: PageNo,
    stack: Vec<Frame>,
    started: bool,
}

impl Cursor {
    pub fn new(root: PageNo) -> Self {
        Self {
            root,
            stack: Vec::new(),
            started: false,
        }
    }

    fn descend<P: PageAccess + ?Sized>(&mut self, access: &P, page: PageNo) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(PageKvError::corruption(format!(
                "cursor descended more than {} levels",
                MAX_DEPTH
            )));
        }
        self.stack.push(Frame {
            entries: load_entries(access, page)?,
            next: 0,
        });
        Ok(())
    }

    /// Next entry in key order, `None` once the tree is exhausted
    pub fn next_entry<P: PageAccess + ?Sized>(&mut self, access: &P) -> Result<Option<TreeEntry>> {
        if !self.started {
            self.started = true;
            self.descend(access, self.root)?;
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = frame.entries.get(frame.next) else {
                self.stack.pop();
                continue;
            };
            frame.next += 1;

            let child = entry.child;
            if entry.is_sentinel() {
                if let Some(child) = child {
                    self.descend(access, child)?;
                }
                continue;
            }

            let found = TreeEntry {
                key: entry.key.clone(),
                values: entry.values.clone(),
            };
            // the subtree right of this key comes next
            if let Some(child) = child {
                self.descend(access, child)?;
            }
            return Ok(Some(found));
        }
    }
}
