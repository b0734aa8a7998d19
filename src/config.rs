//! Tunable limits applied to every request the handler drives.
//!
//! A [`Config`] travels inside the handler context rather than living in a
//! process-wide environment, so tests can tighten or loosen limits per case.

use std::time::Duration;

/// Limits and defaults for a single request lifecycle.
///
/// # Examples
///
/// ```
/// use rootwire::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.redirect_limit, 16);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// How many redirects a request may follow before it fails with
    /// [`StatusCode::RedirectLimitReached`](crate::status::StatusCode).
    pub redirect_limit: u16,
    /// Wall-clock budget for the whole request when the caller does not
    /// supply an explicit expiration.
    pub request_timeout: Duration,
    /// Total server-directed wait time honoured before further waits are
    /// capped, and before a metalink replica is preferred over waiting.
    pub wait_threshold: Duration,
    /// Upper bound on the internally allocated buffer for oversized
    /// non-data responses streamed from the socket.
    pub max_raw_buffer: u32,
    /// Body size above which a non-data response is streamed from the
    /// socket instead of buffered with its frame.
    pub raw_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redirect_limit: 16,
            request_timeout: Duration::from_secs(300),
            wait_threshold: Duration::from_secs(60),
            max_raw_buffer: 64 * 1024 * 1024,
            raw_threshold: 256 * 1024,
        }
    }
}
