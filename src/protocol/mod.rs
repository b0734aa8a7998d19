//! Wire-level constants for the XRootD-style protocol.
//!
//! Everything here is a direct rendering of the on-wire vocabulary: request
//! operation codes, response status words, server error numbers and
//! asynchronous attention subcodes. Header codecs live in [`wire`], the
//! body checksum in [`crc`].

pub mod crc;
pub mod wire;

pub use wire::{
    BodyReader,
    RawHeader,
    ReadAheadHeader,
    RequestHeader,
    ResponseHeader,
    StatusFrame,
    WireError,
};

/// Size of a marshalled request header in bytes.
pub const REQUEST_HEADER_LEN: usize = 24;
/// Size of a response header in bytes.
pub const RESPONSE_HEADER_LEN: usize = 8;
/// Size of a per-chunk readahead header inside a vector-read reply.
pub const READAHEAD_HEADER_LEN: usize = 16;
/// Size of a pre-final `status` sub-frame body.
pub const STATUS_FRAME_LEN: usize = 16;

/// Limits on extended-attribute request vectors.
pub mod xattr_limits {
    /// Maximum number of attributes per request.
    pub const MAX_VARS: usize = 16;
    /// Maximum total length of the encoded name vector.
    pub const MAX_NAME_VEC: usize = 1024;
    /// Maximum total length of the encoded value vector.
    pub const MAX_VALUE_VEC: usize = 64 * 1024;
}

/// Operation requested by the client, as carried in the request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestCode {
    /// Authentication exchange.
    Auth = 3000,
    /// Information query.
    Query = 3001,
    /// Change path permissions.
    Chmod = 3002,
    /// Close an open file.
    Close = 3003,
    /// Directory listing.
    DirList = 3004,
    /// Protocol version and capability negotiation.
    Protocol = 3006,
    /// Session login.
    Login = 3007,
    /// Create a directory.
    MkDir = 3008,
    /// Rename a path; the body carries two space-separated paths.
    Mv = 3009,
    /// Open a file.
    Open = 3010,
    /// Liveness probe.
    Ping = 3011,
    /// Contiguous read from an open file.
    Read = 3013,
    /// Remove a file.
    Rm = 3014,
    /// Remove a directory.
    RmDir = 3015,
    /// Flush server-side buffers.
    Sync = 3016,
    /// Stat a path.
    Stat = 3017,
    /// Set a client parameter on the server.
    Set = 3018,
    /// Contiguous write to an open file.
    Write = 3019,
    /// Extended-attribute operations (get, set, list, delete).
    FAttr = 3020,
    /// Prepare paths for future access.
    Prepare = 3021,
    /// End a server session.
    EndSess = 3023,
    /// Vector read: many (offset, length) pairs in one request.
    ReadV = 3025,
    /// Locate a path in a clustered namespace.
    Locate = 3027,
    /// Truncate a file.
    Truncate = 3028,
}

impl RequestCode {
    /// Decode a request code from its wire value.
    #[must_use]
    pub const fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            3000 => Self::Auth,
            3001 => Self::Query,
            3002 => Self::Chmod,
            3003 => Self::Close,
            3004 => Self::DirList,
            3006 => Self::Protocol,
            3007 => Self::Login,
            3008 => Self::MkDir,
            3009 => Self::Mv,
            3010 => Self::Open,
            3011 => Self::Ping,
            3013 => Self::Read,
            3014 => Self::Rm,
            3015 => Self::RmDir,
            3016 => Self::Sync,
            3017 => Self::Stat,
            3018 => Self::Set,
            3019 => Self::Write,
            3020 => Self::FAttr,
            3021 => Self::Prepare,
            3023 => Self::EndSess,
            3025 => Self::ReadV,
            3027 => Self::Locate,
            3028 => Self::Truncate,
            _ => return None,
        })
    }

    /// The wire value of this code.
    #[must_use]
    pub const fn wire_value(self) -> u16 { self as u16 }

    /// Lowercase operation name for log lines and request descriptions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Query => "query",
            Self::Chmod => "chmod",
            Self::Close => "close",
            Self::DirList => "dirlist",
            Self::Protocol => "protocol",
            Self::Login => "login",
            Self::MkDir => "mkdir",
            Self::Mv => "mv",
            Self::Open => "open",
            Self::Ping => "ping",
            Self::Read => "read",
            Self::Rm => "rm",
            Self::RmDir => "rmdir",
            Self::Sync => "sync",
            Self::Stat => "stat",
            Self::Set => "set",
            Self::Write => "write",
            Self::FAttr => "fattr",
            Self::Prepare => "prepare",
            Self::EndSess => "endsess",
            Self::ReadV => "readv",
            Self::Locate => "locate",
            Self::Truncate => "truncate",
        }
    }

    /// Whether the request body starts with a file path that can be
    /// rewritten during redirects (for [`Mv`](Self::Mv) the second of the
    /// two space-separated paths).
    #[must_use]
    pub const fn carries_path(self) -> bool {
        matches!(
            self,
            Self::Chmod
                | Self::MkDir
                | Self::Mv
                | Self::Open
                | Self::Rm
                | Self::RmDir
                | Self::Stat
                | Self::Truncate
        )
    }

    /// Whether the operation may be reissued at another endpoint without
    /// risking duplicated side effects.
    #[must_use]
    pub const fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::Query
                | Self::DirList
                | Self::Protocol
                | Self::Open
                | Self::Ping
                | Self::Read
                | Self::ReadV
                | Self::Stat
                | Self::Locate
                | Self::Prepare
                | Self::FAttr
        )
    }
}

/// Response status word, the second field of every response header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseCode {
    /// Final, successful answer.
    Ok = 0,
    /// Partial answer; more frames follow for the same stream id.
    OkSoFar = 4000,
    /// Asynchronous attention frame.
    Attn = 4001,
    /// Authentication needs another round trip.
    AuthMore = 4002,
    /// Final error answer carrying an errno and a message.
    Error = 4003,
    /// Retarget the request at another endpoint.
    Redirect = 4004,
    /// Resend the request after a server-chosen delay.
    Wait = 4005,
    /// Keep waiting; the response will arrive on this stream without a
    /// resend.
    WaitResp = 4006,
    /// Pre-final metadata frame, checksummed when negotiated.
    Status = 4007,
}

impl ResponseCode {
    /// Decode a status word from its wire value.
    #[must_use]
    pub const fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            4000 => Self::OkSoFar,
            4001 => Self::Attn,
            4002 => Self::AuthMore,
            4003 => Self::Error,
            4004 => Self::Redirect,
            4005 => Self::Wait,
            4006 => Self::WaitResp,
            4007 => Self::Status,
            _ => return None,
        })
    }

    /// The wire value of this status word.
    #[must_use]
    pub const fn wire_value(self) -> u16 { self as u16 }
}

/// Error numbers carried by error responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerErrno {
    /// An argument was invalid.
    ArgInvalid = 3000,
    /// A required argument was missing.
    ArgMissing = 3001,
    /// An argument was too long.
    ArgTooLong = 3002,
    /// The target file is locked.
    FileLocked = 3003,
    /// The target file is not open.
    FileNotOpen = 3004,
    /// Filesystem-level failure.
    FsError = 3005,
    /// The request itself was invalid.
    InvalidRequest = 3006,
    /// Input or output failure.
    IoError = 3007,
    /// The server ran out of memory.
    NoMemory = 3008,
    /// The server ran out of space.
    NoSpace = 3009,
    /// The client is not authorised.
    NotAuthorized = 3010,
    /// The path does not exist.
    NotFound = 3011,
    /// Internal server failure.
    ServerError = 3012,
    /// The operation is not supported.
    Unsupported = 3013,
    /// No servers are available to serve the request.
    NoServers = 3014,
    /// The target is not a file.
    NotFile = 3015,
    /// The target is a directory.
    IsDirectory = 3016,
    /// The request was cancelled.
    Cancelled = 3017,
    /// The requested operation is already in progress.
    InProgress = 3020,
}

impl ServerErrno {
    /// Decode an errno from its wire value.
    #[must_use]
    pub const fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            3000 => Self::ArgInvalid,
            3001 => Self::ArgMissing,
            3002 => Self::ArgTooLong,
            3003 => Self::FileLocked,
            3004 => Self::FileNotOpen,
            3005 => Self::FsError,
            3006 => Self::InvalidRequest,
            3007 => Self::IoError,
            3008 => Self::NoMemory,
            3009 => Self::NoSpace,
            3010 => Self::NotAuthorized,
            3011 => Self::NotFound,
            3012 => Self::ServerError,
            3013 => Self::Unsupported,
            3014 => Self::NoServers,
            3015 => Self::NotFile,
            3016 => Self::IsDirectory,
            3017 => Self::Cancelled,
            3020 => Self::InProgress,
            _ => return None,
        })
    }

    /// The wire value of this errno.
    #[must_use]
    pub const fn wire_value(self) -> u32 { self as u32 }

    /// Mnemonic recorded in the `triedrc=` CGI when this error sends the
    /// request back to the load balancer. `None` for errors that never
    /// trigger that path.
    #[must_use]
    pub const fn tried_mnemonic(self) -> Option<&'static str> {
        match self {
            Self::IoError => Some("ioerr"),
            Self::FsError => Some("fserr"),
            Self::ServerError => Some("srverr"),
            Self::NotFound => Some("nfsrv"),
            _ => None,
        }
    }
}

/// Subcode of an asynchronous attention frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AttnCode {
    /// Abort the request.
    Abort = 5000,
    /// The server is about to disconnect.
    Disconnect = 5001,
    /// Informational message for the log.
    Message = 5002,
    /// Redirect carried asynchronously; body holds `port host`.
    Redirect = 5003,
    /// Wait directive carried asynchronously.
    Wait = 5004,
    /// A complete response frame is embedded after the attention header.
    Response = 5005,
}

impl AttnCode {
    /// Decode an attention subcode from its wire value.
    #[must_use]
    pub const fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            5000 => Self::Abort,
            5001 => Self::Disconnect,
            5002 => Self::Message,
            5003 => Self::Redirect,
            5004 => Self::Wait,
            5005 => Self::Response,
            _ => return None,
        })
    }
}
