//! Typed results delivered to the response callback.
//!
//! Every operation maps to exactly one result shape; [`ResponseBody`] is
//! the closed variant over all of them. Pure status operations (remove,
//! sync, ping and friends) produce no body at all.

mod parse;

pub use parse::{merge_response_bodies, parse_typed_response, unpack_readv_body};

use crate::{
    chunk::{Chunk, ChunkStatus},
    url::Url,
};

/// Result of a successful open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenInfo {
    /// Server-side file handle quoted in subsequent file operations.
    pub file_handle: [u8; 4],
    /// Stat information, when the open asked for it and the server
    /// supplied it.
    pub stat: Option<StatInfo>,
}

/// Stat information for a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatInfo {
    /// Opaque object id.
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    /// Flag bits describing the object.
    pub flags: u32,
    /// Modification time, seconds since the epoch.
    pub mod_time: u64,
}

/// A directory listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryList {
    /// Entry names in server order.
    pub entries: Vec<String>,
}

/// Uninterpreted response payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer(pub Vec<u8>);

/// Result of a contiguous read: the caller's chunk filled with data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadInfo {
    /// The chunk that was read into.
    pub chunk: Chunk,
    /// Bytes actually delivered (at most the chunk length).
    pub bytes_read: u32,
}

/// Result of a vector read, including per-chunk outcomes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VectorReadInfo {
    /// Total bytes delivered across all chunks.
    pub size: u32,
    /// The caller's chunks, filled where the server answered.
    pub chunks: Vec<Chunk>,
    /// Outcome per chunk, index-aligned with `chunks`.
    pub statuses: Vec<ChunkStatus>,
}

impl VectorReadInfo {
    /// Whether every chunk was fully delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(|s| s.done && !s.size_error)
    }
}

/// Node type within a clustered namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationType {
    /// Manager node holding authoritative placement data.
    ManagerOnline,
    /// Manager node that must be woken up first.
    ManagerPending,
    /// Data server ready to serve.
    ServerOnline,
    /// Data server that must be woken up first.
    ServerPending,
}

/// One location returned by a locate request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// `host:port` of the node.
    pub address: String,
    /// Kind of node.
    pub location_type: LocationType,
    /// Whether the node serves writes as well as reads.
    pub is_writable: bool,
}

/// Result of a locate request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocateInfo {
    /// Locations in server preference order.
    pub locations: Vec<Location>,
}

/// Result of protocol negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Protocol version the server speaks.
    pub version: u32,
    /// Capability flag bits.
    pub flags: u32,
}

/// Result of a login.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoginInfo {
    /// Session identifier quoted by session-bound requests.
    pub session_id: [u8; 16],
}

/// One extended attribute with its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XAttr {
    /// Attribute name.
    pub name: String,
    /// Attribute value bytes.
    pub value: Vec<u8>,
}

/// Per-attribute outcome of a set or delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XAttrStatus {
    /// Attribute name.
    pub name: String,
    /// Server return code for this attribute; zero on success.
    pub status: u16,
}

/// The closed set of typed results, tagged by shape.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    /// Open result.
    Open(OpenInfo),
    /// Stat result.
    Stat(StatInfo),
    /// Directory listing.
    DirList(DirectoryList),
    /// Contiguous read result.
    Read(ReadInfo),
    /// Vector read result.
    VectorRead(VectorReadInfo),
    /// Locate result.
    Locate(LocateInfo),
    /// Protocol negotiation result.
    Protocol(ProtocolInfo),
    /// Login result.
    Login(LoginInfo),
    /// Extended attributes with values (get, list).
    XAttrValues(Vec<XAttr>),
    /// Extended attribute statuses (set, delete).
    XAttrStatus(Vec<XAttrStatus>),
    /// Raw payload for query-style operations.
    Buffer(Buffer),
    /// The redirect target, when redirects are reported instead of
    /// followed.
    Redirect(Url),
}
