//! Endpoint parsing and request URI composition.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use http::Uri;
use url::{Host, Url};

use crate::error::ClientError;

/// URL scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP (default for bare endpoints).
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// Scheme name as written in a URL.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the endpoint host is a literal address or a name to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    /// IPv4 or IPv6 literal.
    LiteralIp,
    /// DNS name.
    Named,
}

/// Parsed service endpoint, fixed at client construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    kind: HostKind,
}

impl Endpoint {
    /// Parses `http://host[:port]`, `https://host[:port]` or a bare `host[:port]`.
    ///
    /// Any path on the endpoint is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidEndpoint`] when no host can be extracted.
    pub fn parse(endpoint: &str) -> Result<Self, ClientError> {
        let trimmed = endpoint.trim();
        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(trimmed, "https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(trimmed, "http://") {
            (Scheme::Http, rest)
        } else {
            (Scheme::Http, trimmed)
        };
        if rest.is_empty() {
            return Err(ClientError::invalid_endpoint(endpoint, "missing host"));
        }

        let parsed = Url::parse(&format!("{scheme}://{rest}"))
            .map_err(|e| ClientError::invalid_endpoint(endpoint, e.to_string()))?;
        let (host, kind) = match parsed.host() {
            Some(Host::Domain(domain)) => (domain.to_string(), classify_host(domain)),
            Some(Host::Ipv4(addr)) => (addr.to_string(), HostKind::LiteralIp),
            Some(Host::Ipv6(addr)) => (format!("[{addr}]"), HostKind::LiteralIp),
            None => return Err(ClientError::invalid_endpoint(endpoint, "missing host")),
        };
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        Ok(Self { scheme, host, kind })
    }

    /// Endpoint scheme.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host and non-default port, IPv6 literals bracketed.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host classification.
    #[must_use]
    pub fn host_kind(&self) -> HostKind {
        self.kind
    }

    /// Composes `scheme://host/path?query`.
    ///
    /// A missing leading slash on `path` is added.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUri`] when the composed string is not a
    /// valid URI.
    pub fn url(&self, path: &str, query: &BTreeMap<String, Option<String>>) -> Result<Uri, ClientError> {
        let mut composed = format!("{}://{}", self.scheme, self.host);
        if !path.starts_with('/') {
            composed.push('/');
        }
        composed.push_str(path);
        let query = canonical_query(query);
        if !query.is_empty() {
            composed.push('?');
            composed.push_str(&query);
        }
        composed
            .parse::<Uri>()
            .map_err(|source| ClientError::InvalidUri {
                uri: composed,
                source,
            })
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn classify_host(host: &str) -> HostKind {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        HostKind::LiteralIp
    } else {
        HostKind::Named
    }
}

/// Serializes query parameters in key order.
///
/// Keys and values are percent-escaped with spaces as `%20`; a key without a
/// value is written without `=`.
#[must_use]
pub fn canonical_query(params: &BTreeMap<String, Option<String>>) -> String {
    let mut out = String::new();
    for (key, value) in params {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&urlencoding::encode(key));
        if let Some(value) = value {
            out.push('=');
            out.push_str(&urlencoding::encode(value));
        }
    }
    out
}
