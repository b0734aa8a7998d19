//! Per-operation response parsers and partial-response merging.
//!
//! The handler collects partial frames in arrival order and calls
//! [`merge_response_bodies`] once the final frame lands; the merged body is
//! then decoded by [`parse_typed_response`] according to the operation that
//! was sent. Decoding is total over the operation set: every code maps to
//! exactly one shape (possibly "no body").

use super::{
    Buffer,
    DirectoryList,
    LocateInfo,
    Location,
    LocationType,
    LoginInfo,
    OpenInfo,
    ProtocolInfo,
    ResponseBody,
    StatInfo,
    XAttr,
    XAttrStatus,
};
use crate::{
    chunk::{ChunkList, ChunkStatus},
    message::Message,
    protocol::{
        wire::ReadAheadHeader,
        BodyReader,
        RequestCode,
        WireError,
        READAHEAD_HEADER_LEN,
    },
};

/// Subcodes of the extended-attribute operation, carried in the request
/// parameter bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum XAttrSubcode {
    Delete,
    Get,
    List,
    Set,
}

impl XAttrSubcode {
    fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Delete,
            1 => Self::Get,
            2 => Self::List,
            3 => Self::Set,
            _ => return None,
        })
    }
}

/// Concatenate partial response bodies with the final body, in arrival
/// order.
#[must_use]
pub fn merge_response_bodies(partials: &[Message], final_msg: &Message) -> Vec<u8> {
    let mut merged = Vec::with_capacity(
        partials.iter().map(|m| m.response_body().len()).sum::<usize>()
            + final_msg.response_body().len(),
    );
    for partial in partials {
        merged.extend_from_slice(partial.response_body());
    }
    merged.extend_from_slice(final_msg.response_body());
    merged
}

/// Decode the merged body of a successful response into its typed shape.
///
/// Returns `Ok(None)` for operations that complete without a payload.
/// Contiguous and vector reads are not handled here; their payloads land
/// directly in the caller's chunks while frames arrive.
///
/// # Errors
///
/// Returns [`WireError`] when the body does not decode as the shape the
/// operation requires.
pub fn parse_typed_response(
    request: &Message,
    body: &[u8],
) -> Result<Option<ResponseBody>, WireError> {
    let Some(code) = request.request_code() else {
        return Ok(Some(ResponseBody::Buffer(Buffer(body.to_vec()))));
    };
    match code {
        RequestCode::Open => parse_open(body).map(Some),
        RequestCode::Stat => parse_stat(body).map(|s| Some(ResponseBody::Stat(s))),
        RequestCode::DirList => parse_dirlist(body).map(Some),
        RequestCode::Locate => parse_locate(body).map(Some),
        RequestCode::Protocol => parse_protocol(body).map(Some),
        RequestCode::Login => parse_login(body).map(Some),
        RequestCode::FAttr => parse_xattr(request, body).map(Some),
        RequestCode::Query | RequestCode::Set | RequestCode::Prepare => {
            Ok(Some(ResponseBody::Buffer(Buffer(body.to_vec()))))
        }
        RequestCode::Auth
        | RequestCode::Chmod
        | RequestCode::Close
        | RequestCode::EndSess
        | RequestCode::MkDir
        | RequestCode::Mv
        | RequestCode::Ping
        | RequestCode::Rm
        | RequestCode::RmDir
        | RequestCode::Sync
        | RequestCode::Truncate
        | RequestCode::Write => Ok(None),
        RequestCode::Read | RequestCode::ReadV => Ok(None),
    }
}

fn parse_open(body: &[u8]) -> Result<ResponseBody, WireError> {
    let mut reader = BodyReader::new(body);
    let handle = reader.get_bytes(4)?;
    let mut info = OpenInfo {
        file_handle: [handle[0], handle[1], handle[2], handle[3]],
        stat: None,
    };
    // Optional compression words followed by optional ASCII stat data.
    if reader.remaining() >= 8 {
        reader.get_u32()?;
        reader.get_u32()?;
        if reader.remaining() > 0 {
            let text = reader.get_str(reader.remaining())?;
            info.stat = Some(parse_stat(text.as_bytes())?);
        }
    }
    Ok(ResponseBody::Open(info))
}

fn parse_stat(body: &[u8]) -> Result<StatInfo, WireError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| WireError::MalformedText)?
        .trim_end_matches(['\0', '\n', ' ']);
    let mut fields = text.split_whitespace();
    let id = fields.next().ok_or(WireError::MalformedText)?.to_owned();
    let size = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(WireError::MalformedText)?;
    let flags = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(WireError::MalformedText)?;
    let mod_time = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(WireError::MalformedText)?;
    Ok(StatInfo {
        id,
        size,
        flags,
        mod_time,
    })
}

fn parse_dirlist(body: &[u8]) -> Result<ResponseBody, WireError> {
    let text = std::str::from_utf8(body).map_err(|_| WireError::MalformedText)?;
    let entries = text
        .split('\n')
        .map(|line| line.trim_end_matches('\0'))
        .filter(|line| !line.is_empty() && *line != ".")
        .map(str::to_owned)
        .collect();
    Ok(ResponseBody::DirList(DirectoryList { entries }))
}

fn parse_locate(body: &[u8]) -> Result<ResponseBody, WireError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| WireError::MalformedText)?
        .trim_end_matches('\0');
    let mut locations = Vec::new();
    for token in text.split(' ').filter(|t| !t.is_empty()) {
        if token.len() < 3 {
            return Err(WireError::MalformedText);
        }
        let mut chars = token.chars();
        let node = chars.next().ok_or(WireError::MalformedText)?;
        let access = chars.next().ok_or(WireError::MalformedText)?;
        let location_type = match node {
            'M' => LocationType::ManagerOnline,
            'm' => LocationType::ManagerPending,
            'S' => LocationType::ServerOnline,
            's' => LocationType::ServerPending,
            _ => return Err(WireError::MalformedText),
        };
        locations.push(Location {
            address: token[2..].to_owned(),
            location_type,
            is_writable: access == 'w',
        });
    }
    Ok(ResponseBody::Locate(LocateInfo { locations }))
}

fn parse_protocol(body: &[u8]) -> Result<ResponseBody, WireError> {
    let mut reader = BodyReader::new(body);
    Ok(ResponseBody::Protocol(ProtocolInfo {
        version: reader.get_u32()?,
        flags: reader.get_u32()?,
    }))
}

fn parse_login(body: &[u8]) -> Result<ResponseBody, WireError> {
    let mut reader = BodyReader::new(body);
    let bytes = reader.get_bytes(16)?;
    let mut session_id = [0u8; 16];
    session_id.copy_from_slice(bytes);
    Ok(ResponseBody::Login(LoginInfo { session_id }))
}

fn parse_xattr(request: &Message, body: &[u8]) -> Result<ResponseBody, WireError> {
    let params = request.request_params();
    let subcode = XAttrSubcode::from_wire(params[4]).ok_or(WireError::MalformedText)?;
    let count = usize::from(params[5]);
    match subcode {
        XAttrSubcode::Get => parse_xattr_values(body, count),
        XAttrSubcode::List => parse_xattr_names(body),
        XAttrSubcode::Set | XAttrSubcode::Delete => parse_xattr_statuses(body, count),
    }
}

/// Get responses carry the name vector (`rc[2] name NUL` per attribute)
/// followed by the value vector (`len[4] value` per attribute).
fn parse_xattr_values(body: &[u8], count: usize) -> Result<ResponseBody, WireError> {
    let mut reader = BodyReader::new(body);
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        reader.get_u16()?;
        names.push(reader.get_cstr()?.to_owned());
    }
    let mut attrs = Vec::with_capacity(count);
    for name in names {
        let len = reader.get_u32()? as usize;
        attrs.push(XAttr {
            name,
            value: reader.get_bytes(len)?.to_vec(),
        });
    }
    Ok(ResponseBody::XAttrValues(attrs))
}

fn parse_xattr_names(body: &[u8]) -> Result<ResponseBody, WireError> {
    let mut reader = BodyReader::new(body);
    let mut attrs = Vec::new();
    while reader.remaining() > 0 {
        let name = reader.get_cstr()?.to_owned();
        if name.is_empty() {
            break;
        }
        attrs.push(XAttr {
            name,
            value: Vec::new(),
        });
    }
    Ok(ResponseBody::XAttrValues(attrs))
}

fn parse_xattr_statuses(body: &[u8], count: usize) -> Result<ResponseBody, WireError> {
    let mut reader = BodyReader::new(body);
    let mut statuses = Vec::with_capacity(count);
    for _ in 0..count {
        let status = reader.get_u16()?;
        statuses.push(XAttrStatus {
            name: reader.get_cstr()?.to_owned(),
            status,
        });
    }
    Ok(ResponseBody::XAttrStatus(statuses))
}

/// Unpack one buffered vector-read body: a run of readahead headers, each
/// followed by its payload.
///
/// Payloads land in the chunk whose `(offset, length)` matches the header
/// exactly; anything else is discarded and flagged. Returns the number of
/// payload bytes delivered into chunks.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] when a header or payload runs past the
/// end of the body, which indicates a framing violation.
pub fn unpack_readv_body(
    body: &[u8],
    chunks: &mut ChunkList,
    statuses: &mut [ChunkStatus],
) -> Result<u32, WireError> {
    let mut cursor = 0usize;
    let mut delivered = 0u32;
    while cursor < body.len() {
        let header = ReadAheadHeader::parse(&body[cursor..])?;
        cursor += READAHEAD_HEADER_LEN;
        let payload_len = header.rlen as usize;
        if body.len() - cursor < payload_len {
            return Err(WireError::Truncated {
                needed: payload_len,
                available: body.len() - cursor,
            });
        }
        let payload = &body[cursor..cursor + payload_len];
        cursor += payload_len;

        let matched = chunks
            .iter()
            .position(|c| c.offset == header.offset && c.length == header.rlen);
        match matched {
            Some(index) => {
                chunks[index].data[..payload_len].copy_from_slice(payload);
                statuses[index].done = true;
                delivered += header.rlen;
            }
            None => {
                // Flag the slot at that offset if one exists, then skip the
                // payload so the stream stays framed.
                if let Some(index) = chunks.iter().position(|c| c.offset == header.offset) {
                    statuses[index].size_error = true;
                }
            }
        }
    }
    Ok(delivered)
}

#[cfg(test)]
#[path = "parse_tests.rs"]
mod tests;
