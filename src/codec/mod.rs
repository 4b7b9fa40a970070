//! Codec Module
//!
//! Tagged binary format for typed keys and values.
//!
//! ## Responsibilities
//! - Closed set of value types (`Entry`)
//! - Exact serialized length (slotted-page accounting depends on it)
//! - Marshal / unmarshal with `bytes::{Buf, BufMut}`
//! - Total order used as the B+tree key order
//!
//! ## Wire Format
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ Tag (1) │ Payload                                      │
//! ├─────────┼──────────────────────────────────────────────┤
//! │ Byte    │ i8                                           │
//! │ Short   │ i16 (LE)                                     │
//! │ Int     │ i32 (LE)                                     │
//! │ Long    │ i64 (LE)                                     │
//! │ Float   │ f32 (LE)                                     │
//! │ Double  │ f64 (LE)                                     │
//! │ Boolean │ u8 (0 / 1)                                   │
//! │ String  │ len: u16 (LE) │ UTF-8 bytes                  │
//! │ Bytes   │ len: u16 (LE) │ raw bytes                    │
//! │ List    │ len: u16 (LE) │ child entries back to back   │
//! │ Empty   │ (nothing)                                    │
//! └─────────┴──────────────────────────────────────────────┘
//! ```

mod entry;

pub use entry::{Entry, MAX_VARIABLE_LEN};

/// Type tags (first byte of every serialized entry)
pub mod tag {
    pub const BYTE_ARRAY: u8 = 1;
    pub const LIST: u8 = 2;
    pub const BYTE: u8 = 4;
    pub const SHORT: u8 = 5;
    pub const INT: u8 = 6;
    pub const LONG: u8 = 7;
    pub const FLOAT: u8 = 8;
    pub const DOUBLE: u8 = 9;
    pub const STRING: u8 = 10;
    pub const BOOLEAN: u8 = 12;
    pub const EMPTY: u8 = 13;
}
