//! Little-endian scalar codec. Every on-disk scalar in this format is little-endian; there is no
//! native-endian path, unlike the ELF reader in [`crate::reader`] which has to handle both.

use thiserror::Error;

/// Error returned by the little-endian codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The input slice was shorter than the scalar being read.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// The output cursor did not have enough remaining capacity for the scalar being written.
    #[error("no space left in output buffer")]
    NoSpace,
}

/// Reads a little-endian [`u16`] at `offset`, or [`CodecError::UnexpectedEof`] if `buf` is too short.
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or(CodecError::UnexpectedEof)?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

/// Reads a little-endian [`u32`] at `offset`, or [`CodecError::UnexpectedEof`] if `buf` is too short.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(CodecError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// A cursor over a mutable byte slice that writes little-endian scalars and advances as it goes.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    /// Wraps `buf` for little-endian writes starting at position 0.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The number of bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Writes a little-endian `u16`, advancing the cursor by 2 and returning the bytes written, or
    /// [`CodecError::NoSpace`] if the remaining capacity is insufficient.
    pub fn write_u16(&mut self, value: u16) -> Result<usize, CodecError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `u32`, advancing the cursor by 4 and returning the bytes written, or
    /// [`CodecError::NoSpace`] if the remaining capacity is insufficient.
    pub fn write_u32(&mut self, value: u32) -> Result<usize, CodecError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        let end = self.pos + bytes.len();
        let dest = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(CodecError::NoSpace)?;
        dest.copy_from_slice(bytes);
        self.pos = end;
        Ok(bytes.len())
    }
}

/// Extends [`std::io::Write`] with little-endian scalar writes, for the host-side builders that
/// accumulate a file into a growing `Vec<u8>` rather than a fixed-size cursor.
pub trait WriteLeExt: std::io::Write {
    /// Writes a little-endian `u16`.
    fn write_u16_le(&mut self, value: u16) -> std::io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a little-endian `u32`.
    fn write_u32_le(&mut self, value: u32) -> std::io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }
}

impl<W: std::io::Write + ?Sized> WriteLeExt for W {}
