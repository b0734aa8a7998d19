//! Redirect bookkeeping: target construction, tried-host accumulation and
//! the postmortem trace-back.

use std::fmt;

use crate::{
    protocol::BodyReader,
    url::{parse_params, ParamsMap, Url},
    status::Status,
};

/// Parsed redirect directive from a server reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectTarget {
    /// The endpoint to reissue the request at.
    pub url: Url,
    /// Parameters the server sent; merged into the request CGI with
    /// replace semantics.
    pub cgi: ParamsMap,
    /// Replacement path, when the reply supplied one.
    pub path: Option<String>,
}

/// Decode a redirect body: a 4-byte port followed by either a bare host
/// or a full location, and optionally `?` plus opaque CGI.
///
/// Scheme and any component the reply omits are inherited from
/// `current`; the request path is preserved unless the reply names one.
/// Returns `None` when the body is too short or the location does not
/// parse.
#[must_use]
pub fn parse_redirect_body(body: &[u8], current: &Url) -> Option<RedirectTarget> {
    let mut reader = BodyReader::new(body);
    let port = reader.get_u32().ok()? as i32;
    let text = reader.get_str(reader.remaining()).ok()?;
    let text = text.trim_end_matches('\0');

    if text.contains("://") {
        let url: Url = text.parse().ok()?;
        let cgi = url.params().clone();
        let path = (!url.path().is_empty()).then(|| url.path().to_owned());
        return Some(RedirectTarget {
            url: Url::new(url.scheme(), url.host(), url.port(), ""),
            cgi,
            path,
        });
    }

    let (host_part, query) = match text.split_once('?') {
        Some((host, query)) => (host, Some(query)),
        None => (text, None),
    };
    if host_part.is_empty() {
        return None;
    }

    let (host, port) = match host_part.rsplit_once(':') {
        Some((host, port_text)) => (host, port_text.parse::<u16>().ok()?),
        None => {
            let port = u16::try_from(port).ok().filter(|p| *p != 0)?;
            (host_part, port)
        }
    };

    Some(RedirectTarget {
        url: Url::new(current.scheme(), host, port, ""),
        cgi: query.map(parse_params).unwrap_or_default(),
        path: None,
    })
}

/// Accumulator for the `tried=` / `triedrc=` CGI keys.
///
/// Hosts are kept unique and in first-failure order; the error mnemonic
/// recorded alongside each host keeps the two lists aligned.
///
/// # Examples
///
/// ```
/// use rootwire::handler::redirect::TriedCgi;
///
/// let mut tried = TriedCgi::default();
/// tried.record("host1", Some("ioerr"));
/// tried.record("host2", None);
/// let params = tried.to_params(None);
/// assert_eq!(params.get("tried").map(String::as_str), Some("host1,host2"));
/// assert_eq!(params.get("triedrc").map(String::as_str), Some("ioerr"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriedCgi {
    hosts: Vec<String>,
    codes: Vec<&'static str>,
}

impl TriedCgi {
    /// Record a failed host, optionally with its error mnemonic. A host
    /// already recorded is not repeated.
    pub fn record(&mut self, host: &str, code: Option<&'static str>) {
        if self.hosts.iter().any(|h| h == host) {
            return;
        }
        self.hosts.push(host.to_owned());
        if let Some(code) = code {
            self.codes.push(code);
        }
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.hosts.is_empty() }

    /// Serialise into `tried=` / `triedrc=` parameters, excluding
    /// `exclude` (the host about to be contacted must never appear in its
    /// own tried list).
    #[must_use]
    pub fn to_params(&self, exclude: Option<&str>) -> ParamsMap {
        let mut params = ParamsMap::new();
        let hosts: Vec<&str> = self
            .hosts
            .iter()
            .map(String::as_str)
            .filter(|h| Some(*h) != exclude)
            .collect();
        if hosts.is_empty() {
            return params;
        }
        params.insert("tried".to_owned(), hosts.join(","));
        if !self.codes.is_empty() {
            params.insert("triedrc".to_owned(), self.codes.join(","));
        }
        params
    }
}

/// One hop in the redirect history of a request.
#[derive(Clone, Debug)]
pub struct RedirectEntry {
    /// Where the request was when the hop was decided.
    pub from: Url,
    /// Where it went.
    pub to: Url,
    /// Outcome observed at `from` that caused the hop.
    pub status: Status,
}

impl RedirectEntry {
    /// Render the hop for the trace-back log, phrased by whether the
    /// previous endpoint had failed or redirected.
    #[must_use]
    pub fn describe(&self, previous_ok: bool) -> String {
        let from = self.from.host_id();
        let to = self.to.host_id();
        if previous_ok {
            if from == to {
                format!("retrying {to}")
            } else {
                format!("redirected from {from} to {to}")
            }
        } else {
            format!("failed at {from}, retrying at {to}")
        }
    }
}

/// Ordered redirect history, rendered into the log when the handler goes
/// away so a failed request leaves a usable postmortem trail.
#[derive(Clone, Debug, Default)]
pub struct RedirectTraceBack {
    entries: Vec<RedirectEntry>,
}

impl RedirectTraceBack {
    /// Append a hop.
    pub fn push(&mut self, entry: RedirectEntry) { self.entries.push(entry); }

    /// Number of hops recorded.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether any hops were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

impl fmt::Display for RedirectTraceBack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut previous_ok = true;
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}. {}", index + 1, entry.describe(previous_ok))?;
            previous_ok = entry.status.is_ok();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "redirect_tests.rs"]
mod tests;
