//! Node entries
//!
//! One record per entry: `key | List(values) | child (u32, optional)`.
//! The child pointer is present exactly when four bytes remain after the
//! value list.

use bytes::BufMut;

use crate::codec::{tag, Entry};
use crate::error::{PageKvError, Result};
use crate::storage::{PageAccess, PageNo, Record, SlotId, SlottedPage};

const CHILD_LEN: usize = 4;

/// `(key, values, child)` as stored in a B+tree node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub key: Entry,
    pub values: Vec<Entry>,
    pub child: Option<PageNo>,
    /// Slot the entry was read from; `None` once detached from its page
    pub slot: Option<SlotId>,
}

impl NodeEntry {
    /// Leaf entry
    pub fn leaf(key: Entry, values: Vec<Entry>) -> Self {
        Self {
            key,
            values,
            child: None,
            slot: None,
        }
    }

    /// First entry of every inner node: Empty key, leftmost child
    pub fn sentinel(child: PageNo) -> Self {
        Self {
            key: Entry::Empty,
            values: vec![Entry::Empty],
            child: Some(child),
            slot: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.key.is_empty_entry()
    }

    /// Copy without the slot it was read from
    pub fn detached(&self) -> Self {
        Self {
            slot: None,
            ..self.clone()
        }
    }

    /// Copy without slot and child
    pub fn without_child(&self) -> Self {
        Self {
            child: None,
            slot: None,
            ..self.clone()
        }
    }

    pub fn with_child(mut self, child: Option<PageNo>) -> Self {
        self.child = child;
        self
    }

    /// Slot of an entry read from a page
    pub fn slot(&self) -> Result<SlotId> {
        self.slot
            .ok_or_else(|| PageKvError::corruption("node entry has no slot"))
    }

    fn values_payload_len(&self) -> usize {
        self.values.iter().map(Entry::encoded_len).sum()
    }

    /// Exact record length
    pub fn encoded_len(&self) -> usize {
        self.key.encoded_len()
            + 3
            + self.values_payload_len()
            + if self.child.is_some() { CHILD_LEN } else { 0 }
    }

    /// Decode a record read from `slot`
    pub fn decode(slot: SlotId, bytes: &[u8]) -> Result<Self> {
        let (key, key_len) = Entry::decode(bytes)?;
        let (values, values_len) = Entry::decode(&bytes[key_len..])?;
        let values = match values {
            Entry::List(items) => items,
            other => {
                return Err(PageKvError::corruption(format!(
                    "node entry values are a {} entry, not a list",
                    other.tag()
                )))
            }
        };
        let rest = &bytes[key_len + values_len..];
        let child = match rest.len() {
            0 => None,
            CHILD_LEN => {
                let mut raw = [0u8; CHILD_LEN];
                raw.copy_from_slice(rest);
                Some(u32::from_le_bytes(raw))
            }
            n => {
                return Err(PageKvError::corruption(format!(
                    "node entry has {} trailing bytes",
                    n
                )))
            }
        };
        Ok(Self {
            key,
            values,
            child,
            slot: Some(slot),
        })
    }
}

impl Record for NodeEntry {
    fn encoded_len(&self) -> usize {
        NodeEntry::encoded_len(self)
    }

    fn encode_into(&self, mut out: &mut [u8]) -> Result<()> {
        self.key.marshal(&mut out)?;
        let payload = u16::try_from(self.values_payload_len())
            .map_err(|_| PageKvError::Codec("value list longer than 65535 bytes".into()))?;
        out.put_u8(tag::LIST);
        out.put_u16_le(payload);
        for value in &self.values {
            value.marshal(&mut out)?;
        }
        if let Some(child) = self.child {
            out.put_u32_le(child);
        }
        Ok(())
    }
}

/// Entries of `page` sorted by key (sentinel first). Read-only: an
/// unformatted page reads as empty.
pub fn load_entries<P: PageAccess + ?Sized>(access: &P, page: PageNo) -> Result<Vec<NodeEntry>> {
    let mut entries = SlottedPage::attach(access, page)
        .read_records(|index, bytes| NodeEntry::decode(index.slot, bytes))?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}
