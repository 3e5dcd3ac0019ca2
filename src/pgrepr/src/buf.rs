//! Reading and writing bytes in the format the PostgreSQL wire protocol
//! expects: big-endian scalars and NUL-terminated strings.
//!
//! This mirrors the `Pgbuf`/`Cursor` split in a typical pgwire codec: writing
//! happens against anything that implements [`bytes::BufMut`], reading
//! against a borrowed byte slice that tracks its own position and never
//! panics on a short buffer.

use bytes::BufMut;
use common::error::{PgError, Result};

/// Extension methods for encoding pgwire scalars onto a [`BufMut`].
pub trait PgBufMut: BufMut {
    /// Writes a NUL-terminated string.
    fn put_cstr(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }

    /// Writes a length-prefixed byte field: an `i32` length followed by the
    /// bytes, or a length of `-1` and no bytes for `None` (the wire
    /// representation of SQL NULL).
    fn put_field(&mut self, value: Option<&[u8]>) {
        match value {
            Some(bytes) => {
                self.put_i32(bytes.len() as i32);
                self.put_slice(bytes);
            }
            None => self.put_i32(-1),
        }
    }
}

impl<B: BufMut + ?Sized> PgBufMut for B {}

/// A cursor over a decoded message payload.
///
/// Every read method returns a [`PgError::Protocol`] instead of panicking,
/// since a short or malformed buffer here always means a misbehaving client,
/// never a programming error on our side.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    fn advance(&mut self, n: usize) {
        self.buf = &self.buf[n..];
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(PgError::protocol("unexpected end of message"));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let b = self.buf[0];
        self.advance(1);
        Ok(b)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        let v = i16::from_be_bytes([self.buf[0], self.buf[1]]);
        self.advance(2);
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let v = i32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.advance(4);
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_i32().map(|v| v as u32)
    }

    /// Reads a NUL-terminated string, validating it as UTF-8.
    pub fn read_cstr(&mut self) -> Result<&'a str> {
        let pos = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| PgError::protocol("string has no NUL terminator"))?;
        let s = std::str::from_utf8(&self.buf[..pos])
            .map_err(|e| PgError::protocol(format!("invalid utf-8 in message: {}", e)))?;
        self.advance(pos + 1);
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        let mut buf = Vec::new();
        buf.put_i32(7);
        buf.put_cstr("hello");
        buf.put_field(Some(b"abc"));
        buf.put_field(None);

        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.read_i32().unwrap(), 7);
        assert_eq!(cur.read_cstr().unwrap(), "hello");
        assert_eq!(cur.read_i32().unwrap(), 3);
        assert_eq!(cur.read_bytes(3).unwrap(), b"abc");
        assert_eq!(cur.read_i32().unwrap(), -1);
        assert!(cur.is_empty());
    }

    #[test]
    fn missing_terminator_is_protocol_error() {
        let mut cur = Cursor::new(b"no-nul-here");
        assert!(matches!(cur.read_cstr(), Err(PgError::Protocol(_))));
    }
}
