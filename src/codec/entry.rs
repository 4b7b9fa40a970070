//! Entry: typed value with a total order

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{PageKvError, Result};
use crate::storage::Record;

use super::tag;

/// Largest payload of a String, ByteArray or List (16-bit length field)
pub const MAX_VARIABLE_LEN: usize = u16::MAX as usize;

/// A typed value
///
/// Ordering across variants: `Empty` < numerics < `Boolean` < `String` <
/// `ByteArray` < `List`. Numerics compare by value; equal values of different
/// widths are ordered by tag, so `Int(1)` and `Long(1)` are distinct keys.
#[derive(Debug, Clone)]
pub enum Entry {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    ByteArray(Vec<u8>),
    List(Vec<Entry>),
    Empty,
}

impl Entry {
    /// Type tag written as the first byte
    pub fn tag(&self) -> u8 {
        match self {
            Entry::Byte(_) => tag::BYTE,
            Entry::Short(_) => tag::SHORT,
            Entry::Int(_) => tag::INT,
            Entry::Long(_) => tag::LONG,
            Entry::Float(_) => tag::FLOAT,
            Entry::Double(_) => tag::DOUBLE,
            Entry::Boolean(_) => tag::BOOLEAN,
            Entry::String(_) => tag::STRING,
            Entry::ByteArray(_) => tag::BYTE_ARRAY,
            Entry::List(_) => tag::LIST,
            Entry::Empty => tag::EMPTY,
        }
    }

    /// Serialized length in bytes, tag included
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Entry::Byte(_) | Entry::Boolean(_) => 1,
            Entry::Short(_) => 2,
            Entry::Int(_) | Entry::Float(_) => 4,
            Entry::Long(_) | Entry::Double(_) => 8,
            Entry::String(s) => 2 + s.len(),
            Entry::ByteArray(b) => 2 + b.len(),
            Entry::List(items) => 2 + Self::list_payload_len(items),
            Entry::Empty => 0,
        }
    }

    fn list_payload_len(items: &[Entry]) -> usize {
        items.iter().map(Entry::encoded_len).sum()
    }

    pub fn is_empty_entry(&self) -> bool {
        matches!(self, Entry::Empty)
    }

    /// Elements of a List entry
    pub fn as_list(&self) -> Option<&[Entry]> {
        match self {
            Entry::List(items) => Some(items),
            _ => None,
        }
    }

    fn variable_len(len: usize) -> Result<u16> {
        u16::try_from(len).map_err(|_| {
            PageKvError::Codec(format!(
                "payload of {} bytes exceeds {} bytes",
                len, MAX_VARIABLE_LEN
            ))
        })
    }

    /// Every length prefix of this entry and its nested entries, outermost first
    fn length_prefixes(&self, out: &mut Vec<u16>) -> Result<()> {
        match self {
            Entry::String(s) => out.push(Self::variable_len(s.len())?),
            Entry::ByteArray(b) => out.push(Self::variable_len(b.len())?),
            Entry::List(items) => {
                out.push(Self::variable_len(Self::list_payload_len(items))?);
                for item in items {
                    item.length_prefixes(out)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Marshal / Unmarshal
    // =========================================================================

    /// Append the serialized form to `buf`
    pub fn marshal(&self, buf: &mut impl BufMut) -> Result<()> {
        let len = self.encoded_len();
        if buf.remaining_mut() < len {
            return Err(PageKvError::Codec(format!(
                "{} bytes needed, {} available",
                len,
                buf.remaining_mut()
            )));
        }
        let mut prefixes = Vec::new();
        self.length_prefixes(&mut prefixes)?;
        self.put(buf, &mut prefixes.into_iter());
        Ok(())
    }

    /// Write the entry; `prefixes` come from `length_prefixes`, so nothing
    /// is written unless every length is valid
    fn put(&self, buf: &mut impl BufMut, prefixes: &mut impl Iterator<Item = u16>) {
        buf.put_u8(self.tag());
        match self {
            Entry::Byte(v) => buf.put_i8(*v),
            Entry::Short(v) => buf.put_i16_le(*v),
            Entry::Int(v) => buf.put_i32_le(*v),
            Entry::Long(v) => buf.put_i64_le(*v),
            Entry::Float(v) => buf.put_f32_le(*v),
            Entry::Double(v) => buf.put_f64_le(*v),
            Entry::Boolean(v) => buf.put_u8(u8::from(*v)),
            Entry::String(s) => {
                buf.put_u16_le(prefixes.next().unwrap_or_default());
                buf.put_slice(s.as_bytes());
            }
            Entry::ByteArray(b) => {
                buf.put_u16_le(prefixes.next().unwrap_or_default());
                buf.put_slice(b);
            }
            Entry::List(items) => {
                buf.put_u16_le(prefixes.next().unwrap_or_default());
                for item in items {
                    item.put(buf, prefixes);
                }
            }
            Entry::Empty => {}
        }
    }

    /// Serialize into a fresh vector
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.marshal(&mut out)?;
        Ok(out)
    }

    /// Read one entry from the front of `buf`
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Entry> {
        need(buf, 1)?;
        let kind = buf.get_u8();
        let entry = match kind {
            tag::BYTE => {
                need(buf, 1)?;
                Entry::Byte(buf.get_i8())
            }
            tag::SHORT => {
                need(buf, 2)?;
                Entry::Short(buf.get_i16_le())
            }
            tag::INT => {
                need(buf, 4)?;
                Entry::Int(buf.get_i32_le())
            }
            tag::LONG => {
                need(buf, 8)?;
                Entry::Long(buf.get_i64_le())
            }
            tag::FLOAT => {
                need(buf, 4)?;
                Entry::Float(buf.get_f32_le())
            }
            tag::DOUBLE => {
                need(buf, 8)?;
                Entry::Double(buf.get_f64_le())
            }
            tag::BOOLEAN => {
                need(buf, 1)?;
                Entry::Boolean(buf.get_u8() != 0)
            }
            tag::STRING => {
                let raw = take_variable(buf)?;
                let s = String::from_utf8(raw)
                    .map_err(|e| PageKvError::Codec(format!("invalid UTF-8 in string: {}", e)))?;
                Entry::String(s)
            }
            tag::BYTE_ARRAY => Entry::ByteArray(take_variable(buf)?),
            tag::LIST => {
                need(buf, 2)?;
                let len = buf.get_u16_le() as usize;
                need(buf, len)?;
                let mut payload = buf.copy_to_bytes(len);
                let mut items = Vec::new();
                while payload.has_remaining() {
                    items.push(Entry::unmarshal(&mut payload)?);
                }
                Entry::List(items)
            }
            tag::EMPTY => Entry::Empty,
            other => return Err(PageKvError::Codec(format!("unknown entry tag {}", other))),
        };
        Ok(entry)
    }

    /// Decode one entry from the start of `bytes`, returning it and its length
    pub fn decode(bytes: &[u8]) -> Result<(Entry, usize)> {
        let mut cursor = bytes;
        let entry = Entry::unmarshal(&mut cursor)?;
        Ok((entry, bytes.len() - cursor.len()))
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    fn rank(&self) -> u8 {
        match self {
            Entry::Empty => 0,
            Entry::Byte(_)
            | Entry::Short(_)
            | Entry::Int(_)
            | Entry::Long(_)
            | Entry::Float(_)
            | Entry::Double(_) => 1,
            Entry::Boolean(_) => 2,
            Entry::String(_) => 3,
            Entry::ByteArray(_) => 4,
            Entry::List(_) => 5,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Entry::Byte(v) => Some(i64::from(*v)),
            Entry::Short(v) => Some(i64::from(*v)),
            Entry::Int(v) => Some(i64::from(*v)),
            Entry::Long(v) => Some(*v),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            Entry::Float(v) => Some(f64::from(*v)),
            Entry::Double(v) => Some(*v),
            other => other.as_integer().map(|v| v as f64),
        }
    }

    fn compare(&self, other: &Entry) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (Entry::Empty, Entry::Empty) => Ordering::Equal,
            (Entry::Boolean(a), Entry::Boolean(b)) => a.cmp(b),
            (Entry::String(a), Entry::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Entry::ByteArray(a), Entry::ByteArray(b)) => a.cmp(b),
            (Entry::List(a), Entry::List(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| x.compare(y))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (a, b) => {
                let by_value = match (a.as_integer(), b.as_integer()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => match (a.as_float(), b.as_float()) {
                        (Some(x), Some(y)) => x.total_cmp(&y),
                        _ => Ordering::Equal,
                    },
                };
                by_value.then_with(|| a.tag().cmp(&b.tag()))
            }
        }
    }
}

fn need(buf: &mut impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(PageKvError::Codec(format!(
            "truncated entry: {} bytes needed, {} left",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_variable(buf: &mut impl Buf) -> Result<Vec<u8>> {
    need(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Record for Entry {
    fn encoded_len(&self) -> usize {
        Entry::encoded_len(self)
    }

    fn encode_into(&self, mut out: &mut [u8]) -> Result<()> {
        self.marshal(&mut out)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Byte(v) => write!(f, "{}b", v),
            Entry::Short(v) => write!(f, "{}s", v),
            Entry::Int(v) => write!(f, "{}", v),
            Entry::Long(v) => write!(f, "{}L", v),
            Entry::Float(v) => write!(f, "{}f", v),
            Entry::Double(v) => write!(f, "{}d", v),
            Entry::Boolean(v) => write!(f, "{}", v),
            Entry::String(s) => write!(f, "{:?}", s),
            Entry::ByteArray(b) => write!(f, "bytes[{}]", b.len()),
            Entry::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Entry::Empty => write!(f, "<empty>"),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<i8> for Entry {
    fn from(v: i8) -> Self {
        Entry::Byte(v)
    }
}

impl From<i16> for Entry {
    fn from(v: i16) -> Self {
        Entry::Short(v)
    }
}

impl From<i32> for Entry {
    fn from(v: i32) -> Self {
        Entry::Int(v)
    }
}

impl From<i64> for Entry {
    fn from(v: i64) -> Self {
        Entry::Long(v)
    }
}

impl From<f32> for Entry {
    fn from(v: f32) -> Self {
        Entry::Float(v)
    }
}

impl From<f64> for Entry {
    fn from(v: f64) -> Self {
        Entry::Double(v)
    }
}

impl From<bool> for Entry {
    fn from(v: bool) -> Self {
        Entry::Boolean(v)
    }
}

impl From<&str> for Entry {
    fn from(v: &str) -> Self {
        Entry::String(v.to_string())
    }
}

impl From<String> for Entry {
    fn from(v: String) -> Self {
        Entry::String(v)
    }
}

impl From<Vec<u8>> for Entry {
    fn from(v: Vec<u8>) -> Self {
        Entry::ByteArray(v)
    }
}

impl From<Vec<Entry>> for Entry {
    fn from(v: Vec<Entry>) -> Self {
        Entry::List(v)
    }
}
