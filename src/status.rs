//! Terminal outcome types delivered to the response callback.
//!
//! Every request ends in exactly one [`Status`]. Partial success (a vector
//! read where some chunks failed) is still an ok status; the per-chunk
//! detail travels in the typed response body, not in the status.

use std::fmt;

use crate::protocol::ServerErrno;

/// Classification of a finished (or failed) request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    /// The request completed successfully.
    Ok,
    /// The request completed, but parts of it were not honoured (vector
    /// reads with per-chunk failures).
    OkPartial,
    /// The server answered with an error response that is not recoverable.
    ErrorResponse,
    /// The peer violated the protocol (malformed header, checksum mismatch,
    /// body length inconsistencies, unexpected frame).
    InvalidResponse,
    /// A redirect response could not be parsed or targeted an unusable
    /// location.
    InvalidRedirect,
    /// The redirect budget was exhausted.
    RedirectLimitReached,
    /// The wall-clock deadline passed before the request could finish.
    OperationExpired,
    /// A socket-level read or write failed while streaming a raw body.
    SocketError,
    /// The stream carrying the request reported a broken or fatal
    /// condition and the request could not be retried.
    StreamBroken,
    /// The request asked for something this client cannot do.
    NotSupported,
    /// Arguments supplied by the caller were rejected before any network
    /// activity (for example oversized extended-attribute vectors).
    InvalidArgs,
    /// An internal invariant failed; never expected in normal operation.
    Internal,
}

impl StatusCode {
    /// Short lowercase name used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::OkPartial => "ok-partial",
            Self::ErrorResponse => "error-response",
            Self::InvalidResponse => "invalid-response",
            Self::InvalidRedirect => "invalid-redirect",
            Self::RedirectLimitReached => "redirect-limit",
            Self::OperationExpired => "expired",
            Self::SocketError => "socket-error",
            Self::StreamBroken => "stream-broken",
            Self::NotSupported => "not-supported",
            Self::InvalidArgs => "invalid-args",
            Self::Internal => "internal",
        }
    }
}

/// Outcome of a request, as handed to the response callback.
///
/// # Examples
///
/// ```
/// use rootwire::status::{Status, StatusCode};
///
/// let ok = Status::ok();
/// assert!(ok.is_ok());
///
/// let failed = Status::error(StatusCode::OperationExpired, "deadline passed");
/// assert!(!failed.is_ok());
/// assert_eq!(failed.code, StatusCode::OperationExpired);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// Outcome classification.
    pub code: StatusCode,
    /// Protocol-level error number reported by the server, when the server
    /// produced the failure. Zero otherwise.
    pub server_errno: u32,
    /// Human-readable context; for server errors this is the message the
    /// server sent.
    pub message: String,
}

impl Status {
    /// Successful completion.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            server_errno: 0,
            message: String::new(),
        }
    }

    /// Completion with per-chunk failures folded into the response body.
    #[must_use]
    pub fn partial() -> Self {
        Self {
            code: StatusCode::OkPartial,
            server_errno: 0,
            message: String::new(),
        }
    }

    /// A failure with the given classification and context.
    #[must_use]
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            server_errno: 0,
            message: message.into(),
        }
    }

    /// A failure caused by a server error response.
    #[must_use]
    pub fn server_error(errno: ServerErrno, message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::ErrorResponse,
            server_errno: errno.wire_value(),
            message: message.into(),
        }
    }

    /// Whether the request is considered successful (fully or partially).
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.code, StatusCode::Ok | StatusCode::OkPartial)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "[{}]", self.code.as_str())
        } else {
            write!(f, "[{}] {}", self.code.as_str(), self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Status, StatusCode};
    use crate::protocol::ServerErrno;

    #[test]
    fn ok_and_partial_count_as_success() {
        assert!(Status::ok().is_ok());
        assert!(Status::partial().is_ok());
        assert!(!Status::error(StatusCode::SocketError, "boom").is_ok());
    }

    #[test]
    fn server_error_carries_wire_errno() {
        let status = Status::server_error(ServerErrno::NotFound, "no such file");
        assert_eq!(status.code, StatusCode::ErrorResponse);
        assert_eq!(status.server_errno, ServerErrno::NotFound.wire_value());
    }

    #[test]
    fn display_includes_code_and_message() {
        let status = Status::error(StatusCode::RedirectLimitReached, "gave up");
        assert_eq!(status.to_string(), "[redirect-limit] gave up");
        assert_eq!(Status::ok().to_string(), "[ok]");
    }
}
