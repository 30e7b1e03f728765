//! Jute primitive encoding and checked decoding.
//!
//! The write side appends to a `Vec<u8>` through [`bytes::BufMut`], whose
//! `put_*` methods are big-endian. The read side goes through [`Reader`], a
//! cursor over a borrowed slice where running out of bytes is an error, never
//! a panic: payloads come off the network and are untrusted.

use bytes::BufMut;

/// Decoding failure for a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before the record did.
    Truncated {
        /// Bytes the current field needed.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },
    /// A string, buffer, or vector declared a negative length (other than the
    /// `-1` null marker).
    NegativeLength(i32),
    /// A declared length exceeds the bytes actually present.
    LengthOverrun {
        /// The declared length.
        declared: i32,
        /// Bytes that were left.
        remaining: usize,
    },
    /// A string field was not valid UTF-8.
    Utf8(std::str::Utf8Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated { needed, remaining } => {
                write!(f, "truncated record: needed {needed} bytes, {remaining} left")
            }
            DecodeError::NegativeLength(len) => write!(f, "negative length: {len}"),
            DecodeError::LengthOverrun { declared, remaining } => {
                write!(f, "declared length {declared} exceeds {remaining} remaining bytes")
            }
            DecodeError::Utf8(e) => write!(f, "invalid utf-8 in string field: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(e: std::str::Utf8Error) -> Self {
        DecodeError::Utf8(e)
    }
}

/// A record that serializes itself onto the end of a buffer.
pub trait Encode {
    /// Append the record's Jute encoding to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Convenience: encode into a fresh buffer.
    fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// A record that parses itself out of a [`Reader`].
pub trait Decode: Sized {
    /// Parse one record, advancing the reader past it.
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

/// Checked cursor over a received payload.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }

    /// Length-prefixed run of bytes. The `-1` null marker decodes as `None`.
    fn read_len_prefixed(&mut self) -> Result<Option<&'a [u8]>, DecodeError> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(DecodeError::NegativeLength(len));
        }
        let len = len as usize;
        if self.buf.len() < len {
            return Err(DecodeError::LengthOverrun {
                declared: len as i32,
                remaining: self.buf.len(),
            });
        }
        Ok(Some(self.take(len)?))
    }

    /// Jute buffer. Null decodes as empty.
    pub fn read_buffer(&mut self) -> Result<Vec<u8>, DecodeError> {
        Ok(self.read_len_prefixed()?.unwrap_or_default().to_vec())
    }

    /// Jute string. Null decodes as empty.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        match self.read_len_prefixed()? {
            Some(bytes) => Ok(std::str::from_utf8(bytes)?.to_owned()),
            None => Ok(String::new()),
        }
    }

    /// Jute vector of strings. Null decodes as empty.
    pub fn read_string_vec(&mut self) -> Result<Vec<String>, DecodeError> {
        let count = self.read_i32()?;
        if count == -1 {
            return Ok(Vec::new());
        }
        if count < 0 {
            return Err(DecodeError::NegativeLength(count));
        }
        let mut out = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }
}

pub(crate) fn write_bool(out: &mut Vec<u8>, v: bool) {
    out.put_u8(v as u8);
}

pub(crate) fn write_i32(out: &mut Vec<u8>, v: i32) {
    out.put_i32(v);
}

pub(crate) fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.put_i64(v);
}

pub(crate) fn write_buffer(out: &mut Vec<u8>, v: &[u8]) {
    out.put_i32(v.len() as i32);
    out.put_slice(v);
}

pub(crate) fn write_string(out: &mut Vec<u8>, v: &str) {
    out.put_i32(v.len() as i32);
    out.put_slice(v.as_bytes());
}

pub(crate) fn write_string_vec(out: &mut Vec<u8>, v: &[String]) {
    out.put_i32(v.len() as i32);
    for s in v {
        write_string(out, s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut out = Vec::new();
        write_i32(&mut out, 0x0102_0304);
        write_i64(&mut out, 0x1122_3344_5566_7788);
        assert_eq!(
            out,
            [0x01, 0x02, 0x03, 0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );

        let mut r = Reader::new(&out);
        assert_eq!(r.read_i32().unwrap(), 0x0102_0304);
        assert_eq!(r.read_i64().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn string_layout() {
        let mut out = Vec::new();
        write_string(&mut out, "/a");
        assert_eq!(out, [0, 0, 0, 2, b'/', b'a']);

        let mut r = Reader::new(&out);
        assert_eq!(r.read_string().unwrap(), "/a");
    }

    #[test]
    fn null_markers_decode_as_empty() {
        let bytes = (-1i32).to_be_bytes();
        assert_eq!(Reader::new(&bytes).read_string().unwrap(), "");
        assert_eq!(Reader::new(&bytes).read_buffer().unwrap(), Vec::<u8>::new());
        assert_eq!(Reader::new(&bytes).read_string_vec().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn truncated_reads_error_out() {
        let mut r = Reader::new(&[0x00, 0x01]);
        let err = r.read_i32().unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 4, remaining: 2 }));
    }

    #[test]
    fn overlong_declared_length_is_rejected() {
        // String claiming 100 bytes with only 2 present.
        let mut bytes = 100i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"ab");
        let err = Reader::new(&bytes).read_string().unwrap_err();
        assert!(matches!(err, DecodeError::LengthOverrun { declared: 100, .. }));
    }

    #[test]
    fn bogus_negative_length_is_rejected() {
        let bytes = (-7i32).to_be_bytes();
        let err = Reader::new(&bytes).read_buffer().unwrap_err();
        assert_eq!(err, DecodeError::NegativeLength(-7));
    }

    #[test]
    fn string_vec_round_trips() {
        let paths = vec!["/a".to_string(), "/b/c".to_string(), String::new()];
        let mut out = Vec::new();
        write_string_vec(&mut out, &paths);
        let mut r = Reader::new(&out);
        assert_eq!(r.read_string_vec().unwrap(), paths);
    }
}
