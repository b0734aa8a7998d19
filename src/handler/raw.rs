//! Resumable raw-body transfer between socket and chunk buffers.
//!
//! When a response body is too large to buffer (big reads, vector reads,
//! oversized metadata) the connection layer hands the socket to the
//! handler and the body bypasses the normal frame buffer. Each reader here
//! is an explicit struct-of-state with a step function: it consumes
//! whatever the socket has, records progress, and asks to be called again
//! when the socket is readable. Splitting the byte stream at any boundary
//! yields the same result as delivering it whole.

use std::io;

use crate::{
    chunk::{ChunkList, ChunkStatus},
    protocol::{wire::ReadAheadHeader, READAHEAD_HEADER_LEN},
};

/// Byte source the readers pull from; `WouldBlock` is the resumption
/// signal, a zero-length read means the peer closed mid-body.
pub trait SocketRead {
    /// Read into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// `io::ErrorKind::WouldBlock` when no data is available right now;
    /// any other error is a transport failure.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Byte sink the raw writer pushes to, with the same `WouldBlock`
/// convention as [`SocketRead`].
pub trait SocketWrite {
    /// Write from `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// `io::ErrorKind::WouldBlock` when the socket cannot accept data
    /// right now; any other error is a transport failure.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl SocketRead for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.len().min(buf.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

/// Outcome of one step of a raw transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawStep {
    /// The body (or the current frame's slice of it) is fully transferred.
    Done,
    /// Progress was made or the socket blocked; call again when ready.
    Retry,
}

fn read_some(socket: &mut dyn SocketRead, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match socket.read(buf) {
        Ok(0) => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed mid-body",
        )),
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Streams one contiguous read reply into the caller's single chunk.
///
/// The cursor survives across frames: a reply split into several partial
/// frames keeps appending where the previous frame stopped.
#[derive(Debug)]
pub struct PlainReader {
    /// Write position within the chunk, across all frames so far.
    chunk_cursor: usize,
    /// Bytes of the current frame still to consume.
    frame_remaining: usize,
    /// Set when the reply overran the chunk; excess bytes are discarded.
    overflow: bool,
}

impl PlainReader {
    /// Start a plain raw read.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_cursor: 0,
            frame_remaining: 0,
            overflow: false,
        }
    }

    /// Begin consuming a frame of `dlen` body bytes.
    pub fn begin_frame(&mut self, dlen: u32) { self.frame_remaining = dlen as usize; }

    /// Total bytes delivered into the chunk.
    #[must_use]
    pub const fn bytes_delivered(&self) -> usize { self.chunk_cursor }

    /// Whether the reply tried to overrun the chunk.
    #[must_use]
    pub const fn overflowed(&self) -> bool { self.overflow }

    /// Consume socket bytes for the current frame.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the socket.
    pub fn step(
        &mut self,
        socket: &mut dyn SocketRead,
        chunk: &mut [u8],
        bytes_read: &mut u32,
    ) -> io::Result<RawStep> {
        while self.frame_remaining > 0 {
            let space = chunk.len().saturating_sub(self.chunk_cursor);
            if space == 0 {
                // Keep the stream framed: swallow the excess and flag it.
                self.overflow = true;
                let mut sink = [0u8; 4096];
                let want = self.frame_remaining.min(sink.len());
                match read_some(socket, &mut sink[..want])? {
                    Some(n) => {
                        self.frame_remaining -= n;
                        *bytes_read += u32::try_from(n).unwrap_or(u32::MAX);
                    }
                    None => return Ok(RawStep::Retry),
                }
                continue;
            }
            let want = self.frame_remaining.min(space);
            let dst = &mut chunk[self.chunk_cursor..self.chunk_cursor + want];
            match read_some(socket, dst)? {
                Some(n) => {
                    self.chunk_cursor += n;
                    self.frame_remaining -= n;
                    *bytes_read += u32::try_from(n).unwrap_or(u32::MAX);
                }
                None => return Ok(RawStep::Retry),
            }
        }
        Ok(RawStep::Done)
    }
}

impl Default for PlainReader {
    fn default() -> Self { Self::new() }
}

#[derive(Debug)]
enum VectorState {
    /// Collecting the 16-byte readahead header.
    Header { got: usize },
    /// Filling the matched chunk.
    Body { index: usize, got: usize, rlen: usize },
    /// Swallowing a payload that matched no chunk slot.
    Discard { remaining: usize },
}

/// Streams a vector-read reply: alternating readahead headers and chunk
/// payloads, delivered into the caller's chunks by `(offset, length)`
/// identity rather than arrival order.
#[derive(Debug)]
pub struct VectorReader {
    state: VectorState,
    header_buf: [u8; READAHEAD_HEADER_LEN],
    /// Bytes of the current frame still to consume.
    frame_remaining: usize,
    /// Payload bytes delivered into chunks across all frames.
    delivered: u32,
}

impl VectorReader {
    /// Start a vector raw read.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: VectorState::Header { got: 0 },
            header_buf: [0; READAHEAD_HEADER_LEN],
            frame_remaining: 0,
            delivered: 0,
        }
    }

    /// Begin consuming a frame of `dlen` body bytes.
    pub fn begin_frame(&mut self, dlen: u32) { self.frame_remaining = dlen as usize; }

    /// Payload bytes delivered into chunks so far.
    #[must_use]
    pub const fn bytes_delivered(&self) -> u32 { self.delivered }

    /// Consume socket bytes for the current frame.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the socket.
    pub fn step(
        &mut self,
        socket: &mut dyn SocketRead,
        chunks: &mut ChunkList,
        statuses: &mut [ChunkStatus],
        bytes_read: &mut u32,
    ) -> io::Result<RawStep> {
        while self.frame_remaining > 0 {
            match self.state {
                VectorState::Header { got } => {
                    let want = (READAHEAD_HEADER_LEN - got).min(self.frame_remaining);
                    match read_some(socket, &mut self.header_buf[got..got + want])? {
                        Some(n) => {
                            self.frame_remaining -= n;
                            *bytes_read += u32::try_from(n).unwrap_or(u32::MAX);
                            let got = got + n;
                            if got < READAHEAD_HEADER_LEN {
                                self.state = VectorState::Header { got };
                            } else {
                                self.state = Self::classify_header(
                                    &self.header_buf,
                                    chunks,
                                    statuses,
                                );
                            }
                        }
                        None => return Ok(RawStep::Retry),
                    }
                }
                VectorState::Body { index, got, rlen } => {
                    let want = (rlen - got).min(self.frame_remaining);
                    let dst = &mut chunks[index].data[got..got + want];
                    match read_some(socket, dst)? {
                        Some(n) => {
                            self.frame_remaining -= n;
                            *bytes_read += u32::try_from(n).unwrap_or(u32::MAX);
                            let got = got + n;
                            if got < rlen {
                                self.state = VectorState::Body { index, got, rlen };
                            } else {
                                statuses[index].done = true;
                                self.delivered += u32::try_from(rlen).unwrap_or(u32::MAX);
                                self.state = VectorState::Header { got: 0 };
                            }
                        }
                        None => return Ok(RawStep::Retry),
                    }
                }
                VectorState::Discard { remaining } => {
                    let mut sink = [0u8; 4096];
                    let want = remaining.min(sink.len()).min(self.frame_remaining);
                    match read_some(socket, &mut sink[..want])? {
                        Some(n) => {
                            self.frame_remaining -= n;
                            *bytes_read += u32::try_from(n).unwrap_or(u32::MAX);
                            let remaining = remaining - n;
                            self.state = if remaining == 0 {
                                VectorState::Header { got: 0 }
                            } else {
                                VectorState::Discard { remaining }
                            };
                        }
                        None => return Ok(RawStep::Retry),
                    }
                }
            }
        }
        Ok(RawStep::Done)
    }

    fn classify_header(
        header_buf: &[u8; READAHEAD_HEADER_LEN],
        chunks: &ChunkList,
        statuses: &mut [ChunkStatus],
    ) -> VectorState {
        let header = ReadAheadHeader {
            fhandle: [header_buf[0], header_buf[1], header_buf[2], header_buf[3]],
            rlen: u32::from_be_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]),
            offset: u64::from_be_bytes([
                header_buf[8],
                header_buf[9],
                header_buf[10],
                header_buf[11],
                header_buf[12],
                header_buf[13],
                header_buf[14],
                header_buf[15],
            ]),
        };
        let matched = chunks
            .iter()
            .position(|c| c.offset == header.offset && c.length == header.rlen);
        match matched {
            Some(index) => VectorState::Body {
                index,
                got: 0,
                rlen: header.rlen as usize,
            },
            None => {
                if let Some(index) = chunks.iter().position(|c| c.offset == header.offset) {
                    statuses[index].size_error = true;
                }
                VectorState::Discard {
                    remaining: header.rlen as usize,
                }
            }
        }
    }
}

impl Default for VectorReader {
    fn default() -> Self { Self::new() }
}

/// Streams an oversized non-data reply into an internally owned buffer,
/// later attached to the header frame as its body.
#[derive(Debug)]
pub struct OtherReader {
    buffer: Vec<u8>,
    cursor: usize,
}

impl OtherReader {
    /// Start an internal-buffer read of `dlen` bytes.
    #[must_use]
    pub fn new(dlen: u32) -> Self {
        Self {
            buffer: vec![0; dlen as usize],
            cursor: 0,
        }
    }

    /// Take the completed buffer.
    #[must_use]
    pub fn into_body(self) -> Vec<u8> { self.buffer }

    /// Consume socket bytes.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the socket.
    pub fn step(&mut self, socket: &mut dyn SocketRead, bytes_read: &mut u32) -> io::Result<RawStep> {
        while self.cursor < self.buffer.len() {
            let dst = &mut self.buffer[self.cursor..];
            match read_some(socket, dst)? {
                Some(n) => {
                    self.cursor += n;
                    *bytes_read += u32::try_from(n).unwrap_or(u32::MAX);
                }
                None => return Ok(RawStep::Retry),
            }
        }
        Ok(RawStep::Done)
    }
}

/// Streams the request's chunk list to the socket for large writes.
///
/// After a chunk completes the writer returns instead of touching the
/// socket again; the next step call starts the next chunk.
#[derive(Debug)]
pub struct RawWriter {
    chunk_index: usize,
    offset_in_chunk: usize,
    /// Total bytes pushed to the socket.
    async_offset: u32,
}

impl RawWriter {
    /// Start writing from the first chunk.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_index: 0,
            offset_in_chunk: 0,
            async_offset: 0,
        }
    }

    /// Total bytes written so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u32 { self.async_offset }

    /// Push bytes of the current chunk to the socket.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the socket.
    pub fn step(
        &mut self,
        socket: &mut dyn SocketWrite,
        chunks: &ChunkList,
        bytes_written: &mut u32,
    ) -> io::Result<RawStep> {
        if self.chunk_index >= chunks.len() {
            return Ok(RawStep::Done);
        }
        let chunk = &chunks[self.chunk_index];
        while self.offset_in_chunk < chunk.data.len() {
            match socket.write(&chunk.data[self.offset_in_chunk..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(n) => {
                    self.offset_in_chunk += n;
                    self.async_offset += u32::try_from(n).unwrap_or(u32::MAX);
                    *bytes_written += u32::try_from(n).unwrap_or(u32::MAX);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(RawStep::Retry),
                Err(e) => return Err(e),
            }
        }
        self.chunk_index += 1;
        self.offset_in_chunk = 0;
        if self.chunk_index >= chunks.len() {
            Ok(RawStep::Done)
        } else {
            Ok(RawStep::Retry)
        }
    }
}

impl Default for RawWriter {
    fn default() -> Self { Self::new() }
}

/// The raw reader a handler is currently driving, when any.
#[derive(Debug)]
pub enum RawReader {
    /// Contiguous read into the caller's chunk.
    Plain(PlainReader),
    /// Vector read with interleaved per-chunk headers.
    Vector(VectorReader),
    /// Oversized non-data reply into an internal buffer.
    Other(OtherReader),
}

#[cfg(test)]
#[path = "raw_tests.rs"]
mod tests;
