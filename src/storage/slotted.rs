//! Slotted page
//!
//! Record format imposed on one data page:
//!
//! ```text
//! 0        2        4            8             12              16              24
//! ┌────────┬────────┬────────────┬─────────────┬───────────────┬───────────────┐
//! │reusable│ flags  │ free space │ end of slots│ payload start │  last writer  │
//! │  (2)   │  (2)   │    (4)     │     (4)     │      (4)      │      (8)      │
//! ├────────┴────────┴────────────┴─────────────┴───────────────┴───────────────┤
//! │ slot 0 │ slot 1 │ ... →                                                     │
//! │                                                                            │
//! │                                           ← ... │ record 1 │ record 0     │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each slot is a 4-byte index entry
//! `offset << 17 | reusable << 16 | deleted << 15 | length`.
//! The slot array grows upward from the header, the payload grows downward
//! from the page end.
//!
//! Invariant: `free space == payload start - end of slots + sum(lengths of
//! deleted slots)`. `check()` verifies it together with bounds and overlap.
//!
//! A page is formatted lazily: a page whose first word is zero is formatted
//! the first time `SlottedPage::open` sees it.

use crate::buffer::{ByteView, ByteViewMut};
use crate::error::{PageKvError, Result};

use super::{PageAccess, PageNo, PAGE_SIZE};

/// Size of the page header
pub const END_OF_HEADER: usize = 24;

/// Size of one slot in the index area
pub const INDEX_ENTRY_SIZE: usize = 4;

/// Marker bit always present in the flags of a formatted page
pub const PAGE_MARKER: u16 = 0x4000;

/// Largest record a slot can describe (15-bit length)
pub const MAX_RECORD_LEN: usize = 0x7FFF;

const REUSABLE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 2;
const FREE_SPACE_OFFSET: usize = 4;
const SLOT_END_OFFSET: usize = 8;
const PAYLOAD_START_OFFSET: usize = 12;
const LAST_WRITER_OFFSET: usize = 16;

const DELETED_BIT: u32 = 0x8000;
const REUSABLE_BIT: u32 = 0x1_0000;
const LEN_MASK: u32 = 0x7FFF;

/// Slot number inside a page
pub type SlotId = u16;

/// Anything that can be stored as one record
pub trait Record {
    /// Exact number of bytes `encode_into` writes
    fn encoded_len(&self) -> usize;

    /// Serialize into `out`, which is exactly `encoded_len()` bytes long
    fn encode_into(&self, out: &mut [u8]) -> Result<()>;
}

impl Record for [u8] {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self);
        Ok(())
    }
}

impl Record for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self);
        Ok(())
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded page header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub reusable_slots: u16,
    pub flags: u16,
    pub free_space: u32,
    pub slot_end: u32,
    pub payload_start: u32,
    pub last_writer: u64,
}

impl PageHeader {
    /// Header of a freshly formatted page
    pub fn empty() -> Self {
        Self {
            reusable_slots: 0,
            flags: PAGE_MARKER,
            free_space: (PAGE_SIZE - END_OF_HEADER) as u32,
            slot_end: END_OF_HEADER as u32,
            payload_start: PAGE_SIZE as u32,
            last_writer: 0,
        }
    }

    pub fn read(page: &[u8]) -> Result<Self> {
        Ok(Self {
            reusable_slots: page.get_u16(REUSABLE_OFFSET)?,
            flags: page.get_u16(FLAGS_OFFSET)?,
            free_space: page.get_u32(FREE_SPACE_OFFSET)?,
            slot_end: page.get_u32(SLOT_END_OFFSET)?,
            payload_start: page.get_u32(PAYLOAD_START_OFFSET)?,
            last_writer: page.get_u64(LAST_WRITER_OFFSET)?,
        })
    }

    pub fn write(&self, page: &mut [u8]) -> Result<()> {
        page.set_u16(REUSABLE_OFFSET, self.reusable_slots)?;
        page.set_u16(FLAGS_OFFSET, self.flags)?;
        page.set_u32(FREE_SPACE_OFFSET, self.free_space)?;
        page.set_u32(SLOT_END_OFFSET, self.slot_end)?;
        page.set_u32(PAYLOAD_START_OFFSET, self.payload_start)?;
        page.set_u64(LAST_WRITER_OFFSET, self.last_writer)
    }

    /// Number of slots in the index area, deleted ones included
    pub fn slot_count(&self) -> u16 {
        ((self.slot_end as usize).saturating_sub(END_OF_HEADER) / INDEX_ENTRY_SIZE) as u16
    }

    /// Whether a record of `len` bytes can be added
    pub fn allocation_fits(&self, len: usize) -> bool {
        let slot_cost = if self.reusable_slots > 0 { 0 } else { INDEX_ENTRY_SIZE };
        self.free_space as usize >= len + slot_cost
    }
}

// =============================================================================
// Index Entries
// =============================================================================

/// One slot, read out of the index area as a plain value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub slot: SlotId,
    pub offset: u16,
    pub len: u16,
    pub deleted: bool,
    pub reusable: bool,
}

impl IndexEntry {
    fn unpack(slot: SlotId, raw: u32) -> Self {
        Self {
            slot,
            offset: (raw >> 17) as u16,
            len: (raw & LEN_MASK) as u16,
            deleted: raw & DELETED_BIT != 0,
            reusable: raw & REUSABLE_BIT != 0,
        }
    }

    fn pack(&self) -> u32 {
        let mut raw = (u32::from(self.offset) << 17) | (u32::from(self.len) & LEN_MASK);
        if self.deleted {
            raw |= DELETED_BIT;
        }
        if self.reusable {
            raw |= REUSABLE_BIT;
        }
        raw
    }

    /// A live (not deleted) slot
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Deleted but pinned: the slot number must stay stable
    pub fn is_tombstone(&self) -> bool {
        self.deleted && !self.reusable
    }

    fn slot_offset(slot: SlotId) -> usize {
        END_OF_HEADER + slot as usize * INDEX_ENTRY_SIZE
    }
}

fn read_index(page: &[u8], number: PageNo, slot: SlotId) -> Result<IndexEntry> {
    let header = PageHeader::read(page)?;
    if slot >= header.slot_count() {
        return Err(PageKvError::SlotOutOfRange { page: number, slot });
    }
    let raw = page.get_u32(IndexEntry::slot_offset(slot))?;
    Ok(IndexEntry::unpack(slot, raw))
}

fn write_index(page: &mut [u8], entry: &IndexEntry) -> Result<()> {
    page.set_u32(IndexEntry::slot_offset(entry.slot), entry.pack())
}

fn all_index_entries(page: &[u8]) -> Result<Vec<IndexEntry>> {
    if !is_formatted(page)? {
        return Ok(Vec::new());
    }
    let header = PageHeader::read(page)?;
    (0..header.slot_count())
        .map(|slot| {
            page.get_u32(IndexEntry::slot_offset(slot))
                .map(|raw| IndexEntry::unpack(slot, raw))
        })
        .collect()
}

// =============================================================================
// Page Operations (on raw page bytes)
// =============================================================================

/// Whether the page has been formatted
pub fn is_formatted(page: &[u8]) -> Result<bool> {
    Ok(page.get_u32(0)? != 0)
}

/// Format the page as an empty slotted page
pub fn format(page: &mut [u8]) -> Result<()> {
    page.fill_bytes(0, END_OF_HEADER, 0)?;
    PageHeader::empty().write(page)
}

/// Writer stamp of the page
pub fn last_writer(page: &[u8]) -> Result<u64> {
    page.get_u64(LAST_WRITER_OFFSET)
}

pub fn set_last_writer(page: &mut [u8], writer: u64) -> Result<()> {
    page.set_u64(LAST_WRITER_OFFSET, writer)
}

/// Slide live records over deleted ones so the free space becomes contiguous.
/// Deleted slots keep their flags; their length drops to zero.
fn compact_payload(page: &mut [u8], header: &mut PageHeader) -> Result<()> {
    let mut entries: Vec<IndexEntry> = all_index_entries(page)?
        .into_iter()
        .filter(|e| e.len > 0)
        .collect();
    entries.sort_by(|a, b| b.offset.cmp(&a.offset));

    let mut to_move = 0usize;
    for mut entry in entries {
        if entry.deleted {
            to_move += entry.len as usize;
            entry.len = 0;
            write_index(page, &entry)?;
        } else if to_move > 0 {
            let src = entry.offset as usize;
            page.move_bytes(src, src + to_move, entry.len as usize)?;
            entry.offset = (src + to_move) as u16;
            write_index(page, &entry)?;
        }
    }
    header.payload_start += to_move as u32;
    Ok(())
}

fn find_reusable(page: &[u8]) -> Result<Option<IndexEntry>> {
    Ok(all_index_entries(page)?
        .into_iter()
        .find(|e| e.deleted && e.reusable && e.len == 0))
}

/// Reserve `len` payload bytes and a slot for them
fn allocate(page: &mut [u8], number: PageNo, header: &mut PageHeader, len: usize) -> Result<IndexEntry> {
    let reuse = header.reusable_slots > 0;
    let slot_cost = if reuse { 0 } else { INDEX_ENTRY_SIZE };

    if (header.payload_start as usize) < header.slot_end as usize + slot_cost + len {
        compact_payload(page, header)?;
    }

    let new_start = header.payload_start as usize - len;
    let entry = if reuse {
        let mut candidate = find_reusable(page)?;
        if candidate.is_none() {
            // reusable slots still hold their old length until compacted
            compact_payload(page, header)?;
            candidate = find_reusable(page)?;
        }
        let mut entry = candidate.ok_or_else(|| {
            PageKvError::corruption(format!(
                "page({}): {} reusable slots counted but none found",
                number, header.reusable_slots
            ))
        })?;
        let new_start = header.payload_start as usize - len;
        entry.offset = new_start as u16;
        entry.len = len as u16;
        entry.deleted = false;
        entry.reusable = false;
        header.reusable_slots -= 1;
        header.free_space -= len as u32;
        header.payload_start = new_start as u32;
        entry
    } else {
        let entry = IndexEntry {
            slot: header.slot_count(),
            offset: new_start as u16,
            len: len as u16,
            deleted: false,
            reusable: false,
        };
        header.slot_end += INDEX_ENTRY_SIZE as u32;
        header.free_space -= (len + INDEX_ENTRY_SIZE) as u32;
        header.payload_start = new_start as u32;
        entry
    };

    write_index(page, &entry)?;
    Ok(entry)
}

fn add_record<T: Record + ?Sized>(page: &mut [u8], number: PageNo, record: &T) -> Result<SlotId> {
    let len = record.encoded_len();
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(PageKvError::EntryTooLarge {
            size: len,
            max: MAX_RECORD_LEN,
        });
    }
    let mut header = PageHeader::read(page)?;
    if !header.allocation_fits(len) {
        return Err(PageKvError::PageFull {
            page: number,
            requested: len,
        });
    }
    let entry = allocate(page, number, &mut header, len)?;
    header.write(page)?;
    record.encode_into(page.bytes_at_mut(entry.offset as usize, len)?)?;
    Ok(entry.slot)
}

fn remove_record(page: &mut [u8], number: PageNo, slot: SlotId, keep_slot: bool) -> Result<()> {
    let mut entry = read_index(page, number, slot)?;
    if entry.deleted || entry.offset == 0 {
        return Err(PageKvError::SlotAlreadyRemoved { page: number, slot });
    }
    let mut header = PageHeader::read(page)?;
    entry.deleted = true;
    if !keep_slot {
        entry.reusable = true;
        header.reusable_slots += 1;
    }
    header.free_space += u32::from(entry.len);
    write_index(page, &entry)?;
    header.write(page)
}

fn compact_index_area(page: &mut [u8], number: PageNo) -> Result<()> {
    let entries = all_index_entries(page)?;
    if entries.iter().any(IndexEntry::is_tombstone) {
        return Err(PageKvError::corruption(format!(
            "page({}): index area holds pinned slots and cannot be compacted",
            number
        )));
    }

    let mut header = PageHeader::read(page)?;
    compact_payload(page, &mut header)?;

    let live: Vec<IndexEntry> = all_index_entries(page)?
        .into_iter()
        .filter(IndexEntry::is_live)
        .collect();
    let removed = entries.len() - live.len();
    if removed != header.reusable_slots as usize {
        return Err(PageKvError::corruption(format!(
            "page({}): {} reusable slots counted, {} found",
            number,
            header.reusable_slots,
            removed
        )));
    }

    for (slot, entry) in live.iter().enumerate() {
        let moved = IndexEntry {
            slot: slot as SlotId,
            ..*entry
        };
        write_index(page, &moved)?;
    }
    header.slot_end -= (removed * INDEX_ENTRY_SIZE) as u32;
    header.free_space += (removed * INDEX_ENTRY_SIZE) as u32;
    header.reusable_slots = 0;
    header.write(page)
}

/// Remove every record but keep the writer stamp
fn clear_contents(page: &mut [u8]) -> Result<()> {
    let writer = last_writer(page)?;
    format(page)?;
    set_last_writer(page, writer)
}

/// Diagnostics for one page; empty when consistent
pub fn check_bytes(page: &[u8], number: PageNo) -> Result<String> {
    let mut out = String::new();
    let header = PageHeader::read(page)?;

    if header.flags & PAGE_MARKER == 0 {
        out.push_str(&format!("page({}): page marker missing in flags {:#x}\n", number, header.flags));
        return Ok(out);
    }
    if (header.slot_end as usize) < END_OF_HEADER
        || header.slot_end > header.payload_start
        || header.payload_start as usize > PAGE_SIZE
    {
        out.push_str(&format!(
            "page({}): slot end {} and payload start {} out of order\n",
            number, header.slot_end, header.payload_start
        ));
        return Ok(out);
    }

    let entries = all_index_entries(page)?;
    let mut deleted_len = 0usize;
    let mut reusable = 0usize;
    let mut live_ranges: Vec<(usize, usize, SlotId)> = Vec::new();

    for e in &entries {
        if e.reusable && !e.deleted {
            out.push_str(&format!("page({}): slot {} reusable but not deleted\n", number, e.slot));
        }
        if e.reusable {
            reusable += 1;
        }
        if e.deleted {
            deleted_len += e.len as usize;
        }
        if e.len > 0 {
            let start = e.offset as usize;
            let end = start + e.len as usize;
            if start < header.payload_start as usize || end > PAGE_SIZE {
                out.push_str(&format!(
                    "page({}): slot {} range {}..{} outside payload {}..{}\n",
                    number, e.slot, start, end, header.payload_start, PAGE_SIZE
                ));
            } else {
                live_ranges.push((start, end, e.slot));
            }
        }
    }

    let expected_free = header.payload_start as usize - header.slot_end as usize + deleted_len;
    if expected_free != header.free_space as usize {
        out.push_str(&format!(
            "page({}): free space {} but layout accounts for {}\n",
            number, header.free_space, expected_free
        ));
    }
    if reusable != header.reusable_slots as usize {
        out.push_str(&format!(
            "page({}): {} reusable slots counted, {} found\n",
            number, header.reusable_slots, reusable
        ));
    }

    live_ranges.sort_unstable();
    for pair in live_ranges.windows(2) {
        if pair[0].1 > pair[1].0 {
            out.push_str(&format!(
                "page({}): slots {} and {} overlap\n",
                number, pair[0].2, pair[1].2
            ));
        }
    }
    Ok(out)
}

// =============================================================================
// SlottedPage
// =============================================================================

/// Slotted-page view of one data page reached through a [`PageAccess`]
///
/// Holds no borrow into the page: every operation reads the slot or header it
/// needs, changes the plain value, and writes it back in one step.
pub struct SlottedPage<'a, P: PageAccess + ?Sized> {
    access: &'a P,
    number: PageNo,
}

impl<'a, P: PageAccess + ?Sized> SlottedPage<'a, P> {
    /// Open `number`, formatting it if it was never touched
    pub fn open(access: &'a P, number: PageNo) -> Result<Self> {
        if !access.read_page(number, is_formatted)?? {
            access.write_page(number, format)??;
        }
        Ok(Self { access, number })
    }

    /// Read-only view of `number`; an unformatted page reads as empty
    pub fn attach(access: &'a P, number: PageNo) -> Self {
        Self { access, number }
    }

    pub fn number(&self) -> PageNo {
        self.number
    }

    pub fn header(&self) -> Result<PageHeader> {
        self.access.read_page(self.number, |p| PageHeader::read(p))?
    }

    /// Bytes available for records (slot cost not included)
    pub fn free_space(&self) -> Result<usize> {
        Ok(self.header()?.free_space as usize)
    }

    pub fn allocation_fits(&self, len: usize) -> Result<bool> {
        Ok(self.header()?.allocation_fits(len))
    }

    /// Store `record`, returning its slot
    pub fn add<T: Record + ?Sized>(&self, record: &T) -> Result<SlotId> {
        let number = self.number;
        self.access
            .write_page(number, |p| add_record(p, number, record))?
    }

    /// Delete the record in `slot`; the slot may be recycled
    pub fn remove(&self, slot: SlotId) -> Result<()> {
        let number = self.number;
        self.access
            .write_page(number, |p| remove_record(p, number, slot, false))?
    }

    /// Delete the record in `slot` but keep the slot number allocated
    pub fn remove_keep_slot(&self, slot: SlotId) -> Result<()> {
        let number = self.number;
        self.access
            .write_page(number, |p| remove_record(p, number, slot, true))?
    }

    /// Every slot, deleted ones included
    pub fn index_entries(&self) -> Result<Vec<IndexEntry>> {
        self.access.read_page(self.number, |p| all_index_entries(p))?
    }

    /// Live slots only
    pub fn entries(&self) -> Result<Vec<IndexEntry>> {
        Ok(self
            .index_entries()?
            .into_iter()
            .filter(IndexEntry::is_live)
            .collect())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.index_entries()?.iter().all(|e| e.deleted))
    }

    /// Decode one live record
    pub fn read_record<R>(&self, slot: SlotId, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let number = self.number;
        self.access.read_page(number, |p| {
            let entry = read_index(p, number, slot)?;
            if entry.deleted {
                return Err(PageKvError::SlotAlreadyRemoved { page: number, slot });
            }
            f(p.bytes_at(entry.offset as usize, entry.len as usize)?)
        })?
    }

    /// Decode every live record under one read of the page
    pub fn read_records<R>(&self, mut f: impl FnMut(IndexEntry, &[u8]) -> Result<R>) -> Result<Vec<R>> {
        self.access.read_page(self.number, |p| {
            let mut out = Vec::new();
            for entry in all_index_entries(p)?.into_iter().filter(IndexEntry::is_live) {
                out.push(f(entry, p.bytes_at(entry.offset as usize, entry.len as usize)?)?);
            }
            Ok(out)
        })?
    }

    /// Make all free payload space contiguous
    pub fn compact(&self) -> Result<()> {
        self.access.write_page(self.number, |p| {
            let mut header = PageHeader::read(p)?;
            compact_payload(p, &mut header)?;
            header.write(p)
        })?
    }

    /// Drop deleted slots from the index area. Slot numbers of live records change.
    pub fn compact_index_area(&self) -> Result<()> {
        let number = self.number;
        self.access.write_page(number, |p| compact_index_area(p, number))?
    }

    /// Remove every record, keeping the writer stamp
    pub fn clear_contents(&self) -> Result<()> {
        self.access.write_page(self.number, clear_contents)?
    }

    pub fn last_writer(&self) -> Result<u64> {
        self.access.read_page(self.number, last_writer)?
    }

    /// Consistency diagnostics, empty when the page is sound
    pub fn check(&self) -> Result<String> {
        let mut out = String::new();
        if !self.access.is_used(self.number)? {
            out.push_str(&format!("page({}): page is not in use\n", self.number));
        }
        let number = self.number;
        out.push_str(&self.access.read_page(number, |p| check_bytes(p, number))??);
        Ok(out)
    }
}
