//! Buffer Module
//!
//! Byte-addressable access to the memory-mapped page file.
//!
//! ## Responsibilities
//! - Own the `memmap2` mapping (file-backed or anonymous)
//! - Bounds-checked little-endian get/set of primitive values
//! - Intra-buffer byte-range moves
//! - Growing the mapping when the page file runs out of pages
//!
//! ## Layering
//! ```text
//! ┌────────────────────────────┐
//! │ MappedBuffer               │  RwLock<MmapMut>: many readers, one writer
//! └─────────────┬──────────────┘
//!               │ read_all / write_all closures
//!               ▼
//! ┌────────────────────────────┐
//! │ ByteView / ByteViewMut     │  checked accessors on any &[u8] / &mut [u8]
//! └────────────────────────────┘
//! ```
//!
//! No reference into the mapping ever escapes a lock guard, so the mapping
//! can be replaced by `grow()` while other threads hold a `MappedBuffer`.

mod mapped;
mod view;

pub use mapped::MappedBuffer;
pub use view::{ByteView, ByteViewMut};
