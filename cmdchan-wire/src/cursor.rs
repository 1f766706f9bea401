//! A zero-copy cursor over an in-memory byte slice, used to walk a wire
//! message without copying it up front.

use crate::error::WireError;

/// Specialized `Result` for cursor reads.
pub type Result<T> = std::result::Result<T, WireError>;

/// A cursor over a borrowed byte slice. Every read either advances the
/// position and returns bytes borrowed from the original slice, or fails
/// with [`WireError::UnexpectedEnd`] and leaves the position unspecified.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or(WireError::UnexpectedEnd("byte"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Borrow the next `n` bytes without copying, advancing the cursor.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(WireError::UnexpectedEnd("length overflow"))?;
        if end > self.buf.len() {
            return Err(WireError::UnexpectedEnd("not enough bytes"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Borrow a sub-cursor over exactly the next `n` bytes, advancing past
    /// them in the parent.
    pub fn sub_cursor(&mut self, n: usize) -> Result<Cursor<'a>> {
        Ok(Cursor::from_slice(self.take(n)?))
    }
}
