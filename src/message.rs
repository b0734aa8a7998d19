//! Owned framed messages and their in-place rewriting.
//!
//! A [`Message`] is a single marshalled frame: for requests the 24-byte
//! header plus body, for responses the 8-byte header plus body. Requests
//! are rewritten in place across retries and redirects (new stream id,
//! refreshed CGI, possibly a new path), so the buffer is mutable for the
//! whole handler lifetime.

use bytes::{BufMut, BytesMut};

use crate::{
    chunk::ChunkList,
    protocol::{
        wire::{ReadAheadHeader, RequestHeader, ResponseHeader},
        RequestCode,
        WireError,
        REQUEST_HEADER_LEN,
        RESPONSE_HEADER_LEN,
    },
    sid::StreamId,
    url::{merge_params, params_to_query, parse_params, ParamsMap},
};

/// Bit in the open-request option word asking the server to refresh any
/// cached location information. Switched on when a wait would otherwise
/// make the retried open loop on stale data.
pub const OPEN_OPTION_REFRESH: u16 = 0x0080;

/// An owned, marshalled protocol frame.
///
/// # Examples
///
/// ```
/// use rootwire::{message::Message, protocol::RequestCode, sid::StreamId};
///
/// let mut request = Message::request(RequestCode::Stat, [0; 16], b"/data/file");
/// request.set_stream_id(StreamId(5));
/// assert_eq!(request.stream_id(), StreamId(5));
/// assert_eq!(request.description(), "stat /data/file");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    buffer: BytesMut,
    session_id: Option<u64>,
    description: String,
}

impl Message {
    /// Build a marshalled request frame with a zeroed stream id.
    #[must_use]
    pub fn request(code: RequestCode, params: [u8; 16], body: &[u8]) -> Self {
        let header = RequestHeader {
            stream_id: StreamId(0),
            request_code: code.wire_value(),
            params,
            dlen: u32::try_from(body.len()).unwrap_or(u32::MAX),
        };
        let mut buffer = BytesMut::with_capacity(REQUEST_HEADER_LEN + body.len());
        header.encode(&mut buffer);
        buffer.put_slice(body);
        let mut msg = Self {
            buffer,
            session_id: None,
            description: String::new(),
        };
        msg.refresh_description();
        msg
    }

    /// Wrap raw frame bytes, typically a response received off the wire.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<BytesMut>) -> Self {
        Self {
            buffer: bytes.into(),
            session_id: None,
            description: String::new(),
        }
    }

    /// The whole frame.
    #[must_use]
    pub fn bytes(&self) -> &[u8] { &self.buffer }

    /// Frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize { self.buffer.len() }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    /// Bind the request to a server session; session-bound requests stay
    /// alive with the session layer when the handler goes away.
    pub fn set_session_id(&mut self, session_id: u64) { self.session_id = Some(session_id); }

    /// Session the request is bound to, when any.
    #[must_use]
    pub const fn session_id(&self) -> Option<u64> { self.session_id }

    /// One-line summary (`operation path`) for log output.
    #[must_use]
    pub fn description(&self) -> &str { &self.description }

    /// Stream id in the frame header (requests and responses share the
    /// leading two bytes).
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        if self.buffer.len() < 2 {
            return StreamId(0);
        }
        StreamId::from_bytes([self.buffer[0], self.buffer[1]])
    }

    /// Stamp a stream id into the frame header.
    pub fn set_stream_id(&mut self, sid: StreamId) {
        if self.buffer.len() >= 2 {
            self.buffer[..2].copy_from_slice(&sid.to_bytes());
        }
    }

    /// Parsed request header, when the frame is large enough to hold one.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for undersized frames.
    pub fn request_header(&self) -> Result<RequestHeader, WireError> {
        RequestHeader::parse(&self.buffer)
    }

    /// Parsed response header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for undersized frames.
    pub fn response_header(&self) -> Result<ResponseHeader, WireError> {
        ResponseHeader::parse(&self.buffer)
    }

    /// Decoded operation code of a request frame.
    #[must_use]
    pub fn request_code(&self) -> Option<RequestCode> {
        self.request_header()
            .ok()
            .and_then(|h| RequestCode::from_wire(h.request_code))
    }

    /// Request body (bytes after the 24-byte request header).
    #[must_use]
    pub fn request_body(&self) -> &[u8] {
        self.buffer.get(REQUEST_HEADER_LEN..).unwrap_or(&[])
    }

    /// Response body (bytes after the 8-byte response header).
    #[must_use]
    pub fn response_body(&self) -> &[u8] {
        self.buffer.get(RESPONSE_HEADER_LEN..).unwrap_or(&[])
    }

    /// Replace the response body, fixing up the header length. Used when a
    /// raw-streamed body is attached to its header frame after the fact.
    pub fn set_response_body(&mut self, body: &[u8]) {
        self.buffer.truncate(RESPONSE_HEADER_LEN);
        self.buffer.put_slice(body);
        let dlen = u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes();
        self.buffer[4..8].copy_from_slice(&dlen);
    }

    /// The 16 parameter bytes of a request header.
    #[must_use]
    pub fn request_params(&self) -> [u8; 16] {
        let mut params = [0u8; 16];
        if let Some(slice) = self.buffer.get(4..20) {
            params.copy_from_slice(slice);
        }
        params
    }

    /// Switch on the refresh option of an open request. No effect on other
    /// operations.
    pub fn switch_on_refresh_flag(&mut self) {
        if self.request_code() != Some(RequestCode::Open) || self.buffer.len() < 20 {
            return;
        }
        // Open params: mode[2] options[2] reserved[12]; options start at
        // frame offset 6.
        let mut options = u16::from_be_bytes([self.buffer[6], self.buffer[7]]);
        options |= OPEN_OPTION_REFRESH;
        self.buffer[6..8].copy_from_slice(&options.to_be_bytes());
    }

    /// CGI parameters currently embedded in the request path, when the
    /// operation carries a path.
    #[must_use]
    pub fn path_params(&self) -> ParamsMap {
        match self.split_path_region() {
            Some((_, region)) => match region.split_once('?') {
                Some((_, query)) => parse_params(query),
                None => ParamsMap::new(),
            },
            None => ParamsMap::new(),
        }
    }

    /// Rewrite the path and CGI region of a path-carrying request in
    /// place, updating the header length.
    ///
    /// `new_cgi` is merged into the existing parameters; `replace` selects
    /// overwrite semantics, otherwise values accumulate with a comma join.
    /// When `new_path` is given it replaces the path component. Requests
    /// whose operation carries no path are left untouched.
    pub fn rewrite_path_and_cgi(&mut self, new_cgi: &ParamsMap, replace: bool, new_path: Option<&str>) {
        let Some((prefix_len, region)) = self.split_path_region() else {
            return;
        };

        let (path, query) = match region.split_once('?') {
            Some((path, query)) => (path.to_owned(), query.to_owned()),
            None => (region.to_owned(), String::new()),
        };
        let mut params = parse_params(&query);
        merge_params(&mut params, new_cgi, replace);

        let mut rebuilt = new_path.map_or(path, str::to_owned);
        if !params.is_empty() {
            rebuilt.push('?');
            rebuilt.push_str(&params_to_query(&params));
        }

        self.buffer.truncate(REQUEST_HEADER_LEN + prefix_len);
        self.buffer.put_slice(rebuilt.as_bytes());
        let dlen = u32::try_from(self.buffer.len() - REQUEST_HEADER_LEN)
            .unwrap_or(u32::MAX)
            .to_be_bytes();
        self.buffer[20..24].copy_from_slice(&dlen);
        self.refresh_description();
    }

    /// Locate the rewritable path region of the request body. For `mv` the
    /// body holds `source target` and only the target is rewritable; the
    /// returned prefix length covers `source `.
    fn split_path_region(&self) -> Option<(usize, &str)> {
        let code = self.request_code()?;
        if !code.carries_path() {
            return None;
        }
        let body = std::str::from_utf8(self.request_body()).ok()?;
        if code == RequestCode::Mv {
            let space = body.find(' ')?;
            Some((space + 1, &body[space + 1..]))
        } else {
            Some((0, body))
        }
    }

    fn refresh_description(&mut self) {
        let Some(code) = self.request_code() else {
            self.description = String::from("response");
            return;
        };
        let path = self
            .split_path_region()
            .map(|(_, region)| region.split('?').next().unwrap_or("").to_owned());
        self.description = match path {
            Some(path) if !path.is_empty() => format!("{} {path}", code.as_str()),
            _ => code.as_str().to_owned(),
        };
    }
}

/// Encode the body of a vector-read request: one readahead header per
/// requested chunk.
#[must_use]
pub fn readv_request_body(fhandle: [u8; 4], chunks: &ChunkList) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(chunks.len() * 16);
    for chunk in chunks {
        ReadAheadHeader {
            fhandle,
            rlen: chunk.length,
            offset: chunk.offset,
        }
        .encode(&mut buf);
    }
    buf.to_vec()
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
