//! Checked primitive accessors over byte slices
//!
//! All values are little-endian. Every accessor validates `offset + size`
//! against the slice length and returns `OutOfBounds` instead of panicking.

use crate::error::{PageKvError, Result};

#[inline]
fn check(len: usize, offset: usize, size: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(PageKvError::OutOfBounds {
            offset,
            len: size,
            size: len,
        }),
    }
}

macro_rules! getter {
    ($name:ident, $ty:ty) => {
        fn $name(&self, offset: usize) -> Result<$ty> {
            let bytes = self.bytes_at(offset, std::mem::size_of::<$ty>())?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_le_bytes(raw))
        }
    };
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, offset: usize, value: $ty) -> Result<()> {
            self.bytes_at_mut(offset, std::mem::size_of::<$ty>())?
                .copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
    };
}

/// Read access to a byte region
pub trait ByteView {
    /// Checked sub-slice `[offset, offset + len)`
    fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8]>;

    getter!(get_i8, i8);
    getter!(get_u8, u8);
    getter!(get_i16, i16);
    getter!(get_u16, u16);
    getter!(get_i32, i32);
    getter!(get_u32, u32);
    getter!(get_i64, i64);
    getter!(get_u64, u64);
    getter!(get_f32, f32);
    getter!(get_f64, f64);

    fn get_bool(&self, offset: usize) -> Result<bool> {
        Ok(self.get_u8(offset)? != 0)
    }
}

/// Write access to a byte region
pub trait ByteViewMut: ByteView {
    /// Checked mutable sub-slice `[offset, offset + len)`
    fn bytes_at_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]>;

    /// Copy `len` bytes from `src` to `dst` (ranges may overlap)
    fn move_bytes(&mut self, src: usize, dst: usize, len: usize) -> Result<()>;

    setter!(set_i8, i8);
    setter!(set_u8, u8);
    setter!(set_i16, i16);
    setter!(set_u16, u16);
    setter!(set_i32, i32);
    setter!(set_u32, u32);
    setter!(set_i64, i64);
    setter!(set_u64, u64);
    setter!(set_f32, f32);
    setter!(set_f64, f64);

    fn set_bool(&mut self, offset: usize, value: bool) -> Result<()> {
        self.set_u8(offset, u8::from(value))
    }

    fn set_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.bytes_at_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn fill_bytes(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.bytes_at_mut(offset, len)?.fill(value);
        Ok(())
    }
}

impl ByteView for [u8] {
    fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        check(self.len(), offset, len)?;
        Ok(&self[offset..offset + len])
    }
}

impl ByteViewMut for [u8] {
    fn bytes_at_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        check(self.len(), offset, len)?;
        Ok(&mut self[offset..offset + len])
    }

    fn move_bytes(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        check(self.len(), src, len)?;
        check(self.len(), dst, len)?;
        self.copy_within(src..src + len, dst);
        Ok(())
    }
}
