//! Request signing.
//!
//! A [`Signer`] turns the parts of an outgoing request plus the caller's
//! [`Credentials`] into an `Authorization` header value. [`HmacSigner`] is the
//! default: HMAC-SHA256 over a canonical string, base64 encoded.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use http::header::{CONTENT_TYPE, DATE, HeaderValue, InvalidHeaderValue};
use http::{HeaderMap, HeaderName, Method};
use sha2::Sha256;
use thiserror::Error;

use crate::config::AuthVersion;
use crate::constants::CONTENT_MD5;
use crate::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Signing failures.
#[derive(Debug, Error)]
pub enum SignError {
    /// The secret was rejected as an HMAC key.
    #[error("invalid signing key")]
    InvalidKey,

    /// The computed value cannot be used as a header.
    #[error("signature is not a valid header value: {0}")]
    InvalidHeaderValue(#[from] InvalidHeaderValue),

    /// A custom signer failure.
    #[error("{0}")]
    Other(String),
}

/// Request parts covered by a signature.
#[derive(Debug, Clone, Copy)]
pub struct SigningContext<'a> {
    /// Request method.
    pub method: &'a Method,
    /// Request path, beginning with `/`.
    pub path: &'a str,
    /// Canonical query string (keys sorted), empty when there is none.
    pub query: &'a str,
    /// Headers as they will be sent, before `Authorization`.
    pub headers: &'a HeaderMap,
}

/// Computes the `Authorization` header for a request.
///
/// Implementations must be deterministic for identical inputs.
pub trait Signer: Send + Sync + fmt::Debug {
    /// Signs `ctx` with `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`SignError`] when no valid header can be produced.
    fn sign(
        &self,
        ctx: &SigningContext<'_>,
        credentials: &dyn Credentials,
    ) -> Result<HeaderValue, SignError>;
}

/// HMAC-SHA256 signer supporting both auth versions.
#[derive(Debug, Clone, Default)]
pub struct HmacSigner {
    version: AuthVersion,
    additional_headers: Vec<String>,
}

impl HmacSigner {
    /// Creates a signer; `additional_headers` only matter under v2.
    #[must_use]
    pub fn new(version: AuthVersion, additional_headers: &[String]) -> Self {
        let mut additional_headers: Vec<String> = additional_headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        additional_headers.sort();
        additional_headers.dedup();
        Self {
            version,
            additional_headers,
        }
    }

    /// The string the signature is computed over.
    #[must_use]
    pub fn string_to_sign(&self, ctx: &SigningContext<'_>) -> String {
        let mut out = format!(
            "{}\n{}\n{}\n{}\n",
            ctx.method,
            header_value(ctx.headers, &CONTENT_MD5),
            header_value(ctx.headers, &CONTENT_TYPE),
            header_value(ctx.headers, &DATE)
        );
        for (name, value) in self.canonical_headers(ctx.headers) {
            out.push_str(&name);
            out.push(':');
            out.push_str(&value);
            out.push('\n');
        }
        out.push_str(ctx.path);
        if self.version == AuthVersion::V2 && !ctx.query.is_empty() {
            out.push('?');
            out.push_str(ctx.query);
        }
        out
    }

    /// `x-*` headers (plus additional headers under v2), sorted by name.
    fn canonical_headers(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        let mut names: Vec<&str> = headers
            .keys()
            .map(HeaderName::as_str)
            .filter(|name| {
                name.starts_with("x-")
                    || (self.version == AuthVersion::V2
                        && self.additional_headers.iter().any(|h| h == name))
            })
            .collect();
        names.sort_unstable();
        names.dedup();

        names
            .into_iter()
            .map(|name| {
                let value = headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(str::trim)
                    .collect::<Vec<_>>()
                    .join(",");
                (name.to_string(), value)
            })
            .collect()
    }

    /// Additional headers present on the request, in signing order.
    fn signed_additional_headers(&self, headers: &HeaderMap) -> Vec<&str> {
        self.additional_headers
            .iter()
            .map(String::as_str)
            .filter(|name| headers.contains_key(*name))
            .collect()
    }
}

fn header_value<'h>(headers: &'h HeaderMap, name: &HeaderName) -> &'h str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

impl Signer for HmacSigner {
    fn sign(
        &self,
        ctx: &SigningContext<'_>,
        credentials: &dyn Credentials,
    ) -> Result<HeaderValue, SignError> {
        let string_to_sign = self.string_to_sign(ctx);
        let mut mac = HmacSha256::new_from_slice(credentials.app_secret().as_bytes())
            .map_err(|_| SignError::InvalidKey)?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let value = match self.version {
            AuthVersion::V1 => format!("XHTTP {}:{signature}", credentials.app_id()),
            AuthVersion::V2 => format!(
                "XHTTP2 AccessKeyId:{},AdditionalHeaders:{},Signature:{signature}",
                credentials.app_id(),
                self.signed_additional_headers(ctx.headers).join(";")
            ),
        };
        let mut value = HeaderValue::from_str(&value)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_v1_string_to_sign_layout() {
        let headers = headers(&[
            ("date", "Mon, 19 Oct 2026 10:00:00 GMT"),
            ("content-type", "application/json"),
            ("content-md5", "XrY7u+Ae7tCTyyK7j1rNww=="),
            ("x-track", "t"),
            ("x-b", "2"),
            ("x-a", "1"),
            ("host", "api.example.com"),
        ]);
        let ctx = SigningContext {
            method: &Method::PUT,
            path: "/v1/objects/key",
            query: "a=1",
            headers: &headers,
        };
        let signer = HmacSigner::new(AuthVersion::V1, &[]);
        assert_eq!(
            signer.string_to_sign(&ctx),
            "PUT\nXrY7u+Ae7tCTyyK7j1rNww==\napplication/json\nMon, 19 Oct 2026 10:00:00 GMT\n\
             x-a:1\nx-b:2\nx-track:t\n/v1/objects/key"
        );
    }

    #[test]
    fn test_v2_includes_additional_headers_and_query() {
        let headers = headers(&[("date", "D"), ("host", "h"), ("range", "bytes=0-1")]);
        let ctx = SigningContext {
            method: &Method::GET,
            path: "/p",
            query: "a=1&b",
            headers: &headers,
        };
        let signer = HmacSigner::new(
            AuthVersion::V2,
            &["Range".to_string(), "Host".to_string(), "x-absent".to_string()],
        );
        assert_eq!(
            signer.string_to_sign(&ctx),
            "GET\n\n\nD\nhost:h\nrange:bytes=0-1\n/p?a=1&b"
        );

        let creds = StaticCredentials::new("ak", "sk");
        let value = signer.sign(&ctx, &creds).unwrap();
        let value = value.to_str().unwrap();
        assert!(
            value.starts_with("XHTTP2 AccessKeyId:ak,AdditionalHeaders:host;range,Signature:"),
            "{value}"
        );
    }

    #[test]
    fn test_signature_is_deterministic_and_key_dependent() {
        let headers = headers(&[("date", "D")]);
        let ctx = SigningContext {
            method: &Method::GET,
            path: "/",
            query: "",
            headers: &headers,
        };
        let signer = HmacSigner::default();
        let a = signer.sign(&ctx, &StaticCredentials::new("id", "secret")).unwrap();
        let b = signer.sign(&ctx, &StaticCredentials::new("id", "secret")).unwrap();
        let c = signer.sign(&ctx, &StaticCredentials::new("id", "other")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_str().unwrap().starts_with("XHTTP id:"));
        assert!(a.is_sensitive());
    }

    #[test]
    fn test_v1_ignores_query() {
        let headers = HeaderMap::new();
        let signer = HmacSigner::new(AuthVersion::V1, &[]);
        let with_query = SigningContext {
            method: &Method::GET,
            path: "/p",
            query: "a=1",
            headers: &headers,
        };
        assert!(signer.string_to_sign(&with_query).ends_with("\n/p"));
    }
}
