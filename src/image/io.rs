//! Bounds-checked little-endian scalar access for PE parsing.
//!
//! All directory readers in [`crate::image`] go through these helpers instead of
//! indexing slices directly, so a truncated or malformed image surfaces as
//! [`crate::Error::OutOfBounds`] rather than a panic.

use crate::{Error::OutOfBounds, Result};

/// Trait implemented by the primitive scalar types the PE format stores.
pub trait PeIO: Sized {
    /// The byte-array form of the value
    type Bytes: for<'a> TryFrom<&'a [u8]>;

    /// Decodes the value from its little-endian byte form.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    /// Encodes the value into its little-endian byte form.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_pe_io {
    ($($ty:ty),*) => {
        $(
            impl PeIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_pe_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Reads a `T` in little-endian byte order from the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` holds fewer bytes than `T` needs.
pub fn read_le<T: PeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a `T` in little-endian byte order at `offset`, advancing the offset.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the read would pass the end of `data`.
pub fn read_le_at<T: PeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Writes a `T` in little-endian byte order at `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the write would pass the end of `data`.
pub fn write_le_at<T: PeIO>(data: &mut [u8], offset: usize, value: T) -> Result<()>
where
    T::Bytes: AsRef<[u8]>,
{
    let bytes = value.to_le_bytes();
    let Some(end) = offset.checked_add(bytes.as_ref().len()) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[offset..end].copy_from_slice(bytes.as_ref());

    Ok(())
}

/// Reads the NUL-terminated UTF-8 string starting at `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] when no terminator exists before the end of
/// `data`.
pub fn read_string(data: &[u8], offset: usize) -> Result<String> {
    if offset >= data.len() {
        return Err(OutOfBounds);
    }

    let Some(length) = data[offset..].iter().position(|byte| *byte == 0) else {
        return Err(OutOfBounds);
    };

    Ok(String::from_utf8_lossy(&data[offset..offset + length]).into_owned())
}
