//! Locations in `scheme://host:port/path?cgi` form.
//!
//! The parameter map is ordered so rewritten requests serialise the same
//! way every time, which keeps protocol traces reproducible. Values are
//! opaque tokens; merging follows the protocol convention of either
//! replacing a key outright or appending to it with a comma join.

use std::{
    collections::BTreeMap,
    fmt,
};

use thiserror::Error;

/// Default port assumed when a location omits one.
pub const DEFAULT_PORT: u16 = 1094;

/// Ordered CGI parameter map.
pub type ParamsMap = BTreeMap<String, String>;

/// Errors produced while parsing a location.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    /// The host component was empty.
    #[error("location has no host: {0}")]
    MissingHost(String),
    /// The port component was not a number.
    #[error("invalid port in location: {0}")]
    InvalidPort(String),
}

/// A parsed absolute location.
///
/// # Examples
///
/// ```
/// use rootwire::url::Url;
///
/// let url: Url = "root://data.example.org:2094//store/file?tag=a".parse().expect("valid");
/// assert_eq!(url.host(), "data.example.org");
/// assert_eq!(url.port(), 2094);
/// assert_eq!(url.path(), "/store/file");
/// assert_eq!(url.params().get("tag").map(String::as_str), Some("a"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Url {
    scheme: String,
    host: String,
    port: u16,
    path: String,
    params: ParamsMap,
}

impl Url {
    /// Build a location from parts.
    #[must_use]
    pub fn new(scheme: &str, host: &str, port: u16, path: &str) -> Self {
        Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
            path: normalise_path(path),
            params: ParamsMap::new(),
        }
    }

    /// Scheme, lowercase.
    #[must_use]
    pub fn scheme(&self) -> &str { &self.scheme }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str { &self.host }

    /// Port, with [`DEFAULT_PORT`] filled in when the text omitted one.
    #[must_use]
    pub const fn port(&self) -> u16 { self.port }

    /// Path component, always starting with a slash (empty when absent).
    #[must_use]
    pub fn path(&self) -> &str { &self.path }

    /// CGI parameters.
    #[must_use]
    pub const fn params(&self) -> &ParamsMap { &self.params }

    /// Replace the whole parameter map.
    pub fn set_params(&mut self, params: ParamsMap) { self.params = params; }

    /// Replace the path component.
    pub fn set_path(&mut self, path: &str) { self.path = normalise_path(path); }

    /// `host:port`, the form used in log lines and the host list.
    #[must_use]
    pub fn host_id(&self) -> String { format!("{}:{}", self.host, self.port) }

    /// Whether the location names a local file rather than a server.
    #[must_use]
    pub fn is_local_file(&self) -> bool { self.scheme == "file" }

    /// Path plus serialised parameters, as embedded in request bodies.
    #[must_use]
    pub fn path_with_params(&self) -> String {
        let mut out = self.path.clone();
        if !self.params.is_empty() {
            out.push('?');
            out.push_str(&serialise_params(&self.params));
        }
        out
    }

    /// Merge `other` into this location's parameters.
    ///
    /// With `replace` set an incoming key overwrites any existing value;
    /// otherwise the incoming value is appended to the existing one with a
    /// comma join (the accumulation rule used by `tried=`).
    pub fn merge_params(&mut self, other: &ParamsMap, replace: bool) {
        merge_params(&mut self.params, other, replace);
    }
}

impl std::str::FromStr for Url {
    type Err = UrlError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("root".to_owned(), input),
        };

        let (authority, path_and_params) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (path, query) = match path_and_params.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_params, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_text)) => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| UrlError::InvalidPort(input.to_owned()))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() && scheme != "file" {
            return Err(UrlError::MissingHost(input.to_owned()));
        }

        let params = query.map(parse_params).unwrap_or_default();

        Ok(Self {
            scheme,
            host: host.to_owned(),
            port,
            path: normalise_path(path),
            params,
        })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)?;
        if !self.params.is_empty() {
            write!(f, "?{}", serialise_params(&self.params))?;
        }
        Ok(())
    }
}

fn normalise_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if path.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn serialise_params(params: &ParamsMap) -> String {
    let mut out = String::new();
    for (key, value) in params {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(key);
        if !value.is_empty() {
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

/// Parse a query string (`key=value&flag`) into a parameter map.
#[must_use]
pub fn parse_params(query: &str) -> ParamsMap {
    let mut params = ParamsMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => params.insert(key.to_owned(), value.to_owned()),
            None => params.insert(pair.to_owned(), String::new()),
        };
    }
    params
}

/// Serialise a parameter map back into a query string.
#[must_use]
pub fn params_to_query(params: &ParamsMap) -> String { serialise_params(params) }

/// Merge `src` into `dst` (see [`Url::merge_params`]).
pub fn merge_params(dst: &mut ParamsMap, src: &ParamsMap, replace: bool) {
    for (key, value) in src {
        match dst.get_mut(key) {
            Some(existing) if !replace => {
                if existing.is_empty() {
                    existing.clone_from(value);
                } else {
                    // The comma lands even for an empty incoming value;
                    // accumulated lists keep every slot the server sent.
                    existing.push(',');
                    existing.push_str(value);
                }
            }
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
#[path = "url_tests.rs"]
mod tests;
