//! Header codecs and the checked cursor used by response parsers.
//!
//! All multi-byte integers on the wire are big-endian. Encoders write into
//! a caller-supplied `BytesMut`; decoders take a byte slice and fail with a
//! typed [`WireError`] instead of panicking on short input.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::{
    crc,
    xattr_limits,
    READAHEAD_HEADER_LEN,
    REQUEST_HEADER_LEN,
    RESPONSE_HEADER_LEN,
    STATUS_FRAME_LEN,
};
use crate::sid::StreamId;

/// Errors produced while decoding wire structures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The input ended before the structure was complete.
    #[error("truncated input: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes the decoder required.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// A text field was not valid UTF-8.
    #[error("malformed text field")]
    MalformedText,
    /// The self-checksum of a status sub-frame did not match.
    #[error("status frame checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    StatusChecksum {
        /// Checksum carried on the wire.
        expected: u32,
        /// Checksum computed over the received bytes.
        computed: u32,
    },
    /// An extended-attribute vector exceeded a protocol limit.
    #[error("extended-attribute vector over limit: {0}")]
    XAttrOverLimit(&'static str),
}

/// Marshalled request header: stream id, operation code, 16 parameter
/// bytes and the body length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    /// Stream id the request is multiplexed under.
    pub stream_id: StreamId,
    /// Wire value of the operation code.
    pub request_code: u16,
    /// Operation-specific parameter bytes.
    pub params: [u8; 16],
    /// Length of the body following the header.
    pub dlen: u32,
}

impl RequestHeader {
    /// Decode a request header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] when fewer than
    /// [`REQUEST_HEADER_LEN`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < REQUEST_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: REQUEST_HEADER_LEN,
                available: bytes.len(),
            });
        }
        let mut params = [0u8; 16];
        params.copy_from_slice(&bytes[4..20]);
        Ok(Self {
            stream_id: StreamId::from_bytes([bytes[0], bytes[1]]),
            request_code: u16::from_be_bytes([bytes[2], bytes[3]]),
            params,
            dlen: u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        })
    }

    /// Append this header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.stream_id.to_bytes());
        dst.put_u16(self.request_code);
        dst.put_slice(&self.params);
        dst.put_u32(self.dlen);
    }
}

/// Response header: stream id, status word and body length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Stream id the response belongs to.
    pub stream_id: StreamId,
    /// Raw status word; decode with
    /// [`ResponseCode::from_wire`](super::ResponseCode::from_wire).
    pub status: u16,
    /// Length of the body following the header.
    pub dlen: u32,
}

impl ResponseHeader {
    /// Decode a response header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] when fewer than
    /// [`RESPONSE_HEADER_LEN`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: RESPONSE_HEADER_LEN,
                available: bytes.len(),
            });
        }
        Ok(Self {
            stream_id: StreamId::from_bytes([bytes[0], bytes[1]]),
            status: u16::from_be_bytes([bytes[2], bytes[3]]),
            dlen: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Append this header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.stream_id.to_bytes());
        dst.put_u16(self.status);
        dst.put_u32(self.dlen);
    }
}

/// Alias kept for call sites that deal with headers generically.
pub type RawHeader = ResponseHeader;

/// Per-chunk header inside a vector-read reply: file handle, chunk length
/// and chunk offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadAheadHeader {
    /// Server-side file handle the chunk belongs to.
    pub fhandle: [u8; 4],
    /// Length of the chunk payload that follows.
    pub rlen: u32,
    /// File offset of the chunk.
    pub offset: u64,
}

impl ReadAheadHeader {
    /// Decode a readahead header from exactly [`READAHEAD_HEADER_LEN`]
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] on short input.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < READAHEAD_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: READAHEAD_HEADER_LEN,
                available: bytes.len(),
            });
        }
        Ok(Self {
            fhandle: [bytes[0], bytes[1], bytes[2], bytes[3]],
            rlen: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            offset: u64::from_be_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
        })
    }

    /// Append this header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.fhandle);
        dst.put_u32(self.rlen);
        dst.put_u64(self.offset);
    }
}

/// Body of a pre-final `status` sub-frame.
///
/// The first word checksums the remainder of the frame itself; the last
/// two words announce the checksum and length of the final response body
/// that follows on the same stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusFrame {
    /// Stream id repeated inside the checksummed region.
    pub stream_id: StreamId,
    /// Kind discriminator for the final response (operation specific).
    pub resp_kind: u8,
    /// CRC32C the final response body must hash to.
    pub body_crc32c: u32,
    /// Announced length of the final response body.
    pub body_len: u32,
}

impl StatusFrame {
    /// Decode and self-verify a status frame body.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] on short input and
    /// [`WireError::StatusChecksum`] when the frame fails its own CRC.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < STATUS_FRAME_LEN {
            return Err(WireError::Truncated {
                needed: STATUS_FRAME_LEN,
                available: bytes.len(),
            });
        }
        let expected = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let computed = crc::crc32c(&bytes[4..STATUS_FRAME_LEN]);
        if expected != computed {
            return Err(WireError::StatusChecksum { expected, computed });
        }
        Ok(Self {
            stream_id: StreamId::from_bytes([bytes[4], bytes[5]]),
            resp_kind: bytes[6],
            body_crc32c: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            body_len: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Encode this frame, computing the leading self-checksum.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut tail = [0u8; STATUS_FRAME_LEN - 4];
        tail[..2].copy_from_slice(&self.stream_id.to_bytes());
        tail[2] = self.resp_kind;
        tail[4..8].copy_from_slice(&self.body_crc32c.to_be_bytes());
        tail[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        dst.put_u32(crc::crc32c(&tail));
        dst.put_slice(&tail);
    }
}

/// Checked big-endian cursor over a response body.
///
/// Parsers advance through the body field by field; any read past the end
/// fails with [`WireError::Truncated`] instead of panicking.
///
/// # Examples
///
/// ```
/// use rootwire::protocol::BodyReader;
///
/// let mut reader = BodyReader::new(&[0x01, 0x02, 0x03, 0x04, b'h', b'i']);
/// assert_eq!(reader.get_u32().expect("four bytes"), 0x0102_0304);
/// assert_eq!(reader.get_str(2).expect("two bytes"), "hi");
/// assert_eq!(reader.remaining(), 0);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct BodyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    /// Wrap a body slice.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self { Self { bytes, pos: 0 } }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize { self.bytes.len() - self.pos }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read one byte.
    pub fn get_u8(&mut self) -> Result<u8, WireError> { Ok(self.take(1)?[0]) }

    /// Read a big-endian `u16`.
    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read a big-endian `i64`.
    pub fn get_i64(&mut self) -> Result<i64, WireError> { Ok(self.get_u64()? as i64) }

    /// Read `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> { self.take(len) }

    /// Read `len` bytes as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MalformedText`] when the bytes are not UTF-8.
    pub fn get_str(&mut self, len: usize) -> Result<&'a str, WireError> {
        std::str::from_utf8(self.take(len)?).map_err(|_| WireError::MalformedText)
    }

    /// Read text up to (and consuming) the next NUL byte, or to the end of
    /// the body when no NUL is present.
    pub fn get_cstr(&mut self) -> Result<&'a str, WireError> {
        let rest = &self.bytes[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                let text = self.get_str(nul)?;
                self.pos += 1;
                Ok(text)
            }
            None => self.get_str(rest.len()),
        }
    }
}

/// Encode an extended-attribute name vector: `rc[2] name NUL` per entry.
///
/// # Errors
///
/// Returns [`WireError::XAttrOverLimit`] when the request exceeds the
/// protocol's attribute-count or vector-length limits.
pub fn encode_xattr_names(names: &[&str]) -> Result<Vec<u8>, WireError> {
    if names.len() > xattr_limits::MAX_VARS {
        return Err(WireError::XAttrOverLimit("too many attributes"));
    }
    let total: usize = names.iter().map(|n| n.len() + 3).sum();
    if total > xattr_limits::MAX_NAME_VEC {
        return Err(WireError::XAttrOverLimit("name vector too long"));
    }
    let mut vec = Vec::with_capacity(total);
    for name in names {
        vec.extend_from_slice(&[0, 0]);
        vec.extend_from_slice(name.as_bytes());
        vec.push(0);
    }
    Ok(vec)
}

/// Encode an extended-attribute value vector: `len[4] value` per entry.
///
/// # Errors
///
/// Returns [`WireError::XAttrOverLimit`] when the total exceeds the value
/// vector limit.
pub fn encode_xattr_values(values: &[&[u8]]) -> Result<Vec<u8>, WireError> {
    let total: usize = values.iter().map(|v| v.len() + 4).sum();
    if total > xattr_limits::MAX_VALUE_VEC {
        return Err(WireError::XAttrOverLimit("value vector too long"));
    }
    let mut vec = Vec::with_capacity(total);
    for value in values {
        vec.extend_from_slice(&(u32::try_from(value.len()).unwrap_or(u32::MAX)).to_be_bytes());
        vec.extend_from_slice(value);
    }
    Ok(vec)
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
