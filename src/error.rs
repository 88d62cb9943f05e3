//! Error types for the client.
//!
//! Every failure a request can produce is a [`ClientError`]. Errors raised
//! after a response was received (service errors, undecodable error bodies,
//! redirects) carry that response so callers can still inspect its headers
//! and body.

use std::fmt;
use std::time::Duration;

use http::{Method, StatusCode};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::body::BodyError;
use crate::response::Response;
use crate::sign::SignError;

/// Structured error returned by the service in a 4xx/5xx response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceError {
    /// Service error code; numeric codes are kept in their decimal form.
    #[serde(rename = "code", alias = "Code", deserialize_with = "code_as_string")]
    pub code: String,
    /// Human-readable message.
    #[serde(rename = "msg", alias = "Message", alias = "message")]
    pub message: String,
    /// Track identifier.
    #[serde(rename = "track_id", alias = "TrackId")]
    pub track_id: String,
    /// Request identifier.
    #[serde(rename = "request_id", alias = "RequestId")]
    pub request_id: String,
    /// Identifier of the serving cluster.
    #[serde(rename = "HostId", alias = "host_id")]
    pub host_id: String,
    /// Endpoint the service suggests using instead.
    #[serde(rename = "Endpoint", alias = "endpoint")]
    pub endpoint: String,
    /// Raw response body.
    #[serde(skip)]
    pub raw_message: String,
    /// HTTP status code of the response.
    #[serde(skip)]
    pub status_code: u16,
}

fn code_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(code)) => code,
            Some(other) => other.to_string(),
        },
    )
}

impl ServiceError {
    /// Error for an error status that came with no body.
    pub fn empty(status_code: u16, request_id: impl Into<String>) -> Self {
        Self {
            status_code,
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Decodes an error payload and stamps the response details onto it.
    ///
    /// The header request id wins over the payload's when it is non-empty.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when `body` is not a valid error payload.
    pub fn from_json(
        body: &[u8],
        status_code: u16,
        header_request_id: &str,
    ) -> Result<Self, serde_json::Error> {
        let mut error: Self = serde_json::from_slice(body)?;
        error.status_code = status_code;
        if !header_request_id.is_empty() {
            error.request_id = header_request_id.to_string();
        }
        error.raw_message = String::from_utf8_lossy(body).into_owned();
        Ok(error)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service returned error: StatusCode={}, ErrorCode={}, ErrorMessage=\"{}\", RequestId={}",
            self.status_code, self.code, self.message, self.request_id
        )?;
        if !self.endpoint.is_empty() {
            write!(f, ", Endpoint={}", self.endpoint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

/// Failures of the network round-trip itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dial, TLS, I/O or protocol failure reported by the pooled client.
    #[error(transparent)]
    Client(#[from] hyper_util::client::legacy::Error),

    /// No response headers arrived within the header timeout.
    #[error("timed out after {0:?} waiting for response headers")]
    HeaderTimeout(Duration),

    /// Redirect following exceeded the hop limit.
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),

    /// A redirect `Location` could not be turned into a request URI.
    #[error("invalid redirect location {0:?}")]
    InvalidLocation(String),

    /// The request could not be assembled from its parts.
    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    /// The materialized request body could not be reopened for sending.
    #[error("failed to open request body: {0}")]
    Body(#[source] std::io::Error),
}

impl TransportError {
    /// Whether the failure was a timeout at any layer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::HeaderTimeout(_) => true,
            Self::Client(error) => {
                let mut source = std::error::Error::source(error);
                while let Some(inner) = source {
                    if let Some(io) = inner.downcast_ref::<std::io::Error>()
                        && io.kind() == std::io::ErrorKind::TimedOut
                    {
                        return true;
                    }
                    source = inner.source();
                }
                false
            }
            _ => false,
        }
    }
}

/// Errors returned by [`crate::Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint string could not be parsed.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// The rejected endpoint.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The composed request URI is malformed.
    #[error("invalid request URI {uri:?}: {source}")]
    InvalidUri {
        /// The composed URI.
        uri: String,
        /// The parse failure.
        #[source]
        source: http::uri::InvalidUri,
    },

    /// A caller header name or value is not valid HTTP.
    #[error("invalid header {name:?}")]
    InvalidHeader {
        /// The offending header name.
        name: String,
    },

    /// The proxy address could not be parsed.
    #[error("invalid proxy {proxy:?}: {reason}")]
    InvalidProxy {
        /// The rejected proxy address.
        proxy: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request body could not be materialized; nothing was sent.
    #[error("failed to prepare request body: {source}")]
    Body {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The signer could not produce an Authorization header.
    #[error("failed to sign request: {source}")]
    Signing {
        /// The signer failure.
        #[source]
        source: SignError,
    },

    /// The request did not complete; the response was never classified.
    #[error("transport error on {method} {uri}: {source}")]
    Transport {
        /// Request method.
        method: Method,
        /// Request URI.
        uri: String,
        /// The transport failure.
        #[source]
        source: TransportError,
    },

    /// Reading the response body failed.
    #[error("failed to read response body: {source}")]
    ReadBody {
        /// The body read failure.
        #[source]
        source: hyper::Error,
    },

    /// The service answered 300-307 and the redirect was not followed.
    #[error("service returned {status}")]
    Redirect {
        /// The redirect status.
        status: StatusCode,
        /// The redirect response, headers intact.
        response: Box<Response>,
    },

    /// The service answered 4xx/5xx with a decodable (or empty) error body.
    #[error("{error}")]
    Service {
        /// Decoded service error.
        #[source]
        error: ServiceError,
        /// The error response with a replayable body.
        response: Box<Response>,
    },

    /// The service answered 4xx/5xx with a body that is not an error payload.
    #[error("service returned invalid response body, status = {status}, RequestId = {request_id}")]
    InvalidErrorBody {
        /// Response status.
        status: StatusCode,
        /// Request id from the response headers.
        request_id: String,
        /// Why the body did not decode.
        #[source]
        source: serde_json::Error,
        /// The error response with a replayable body.
        response: Box<Response>,
    },

    /// The response body was already taken by the caller.
    #[error("response body already consumed")]
    BodyConsumed,
}

impl From<BodyError> for ClientError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::Io(source) => Self::Body { source },
            BodyError::UnknownLength => Self::Body {
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "body length is unknown without consuming it",
                ),
            },
        }
    }
}

impl ClientError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an invalid-endpoint error.
    pub fn invalid_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-proxy error.
    pub fn invalid_proxy(proxy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProxy {
            proxy: proxy.into(),
            reason: reason.into(),
        }
    }

    /// Creates a body materialization error.
    pub fn body(source: std::io::Error) -> Self {
        Self::Body { source }
    }

    /// Creates a transport error.
    pub fn transport(method: Method, uri: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            method,
            uri: uri.into(),
            source,
        }
    }

    /// Response attached to the error, when one was received.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Redirect { response, .. }
            | Self::Service { response, .. }
            | Self::InvalidErrorBody { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Takes ownership of the attached response.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Redirect { response, .. }
            | Self::Service { response, .. }
            | Self::InvalidErrorBody { response, .. } => Some(*response),
            _ => None,
        }
    }

    /// Decoded service error, for 4xx/5xx responses with a valid payload.
    #[must_use]
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service { error, .. } => Some(error),
            _ => None,
        }
    }

    /// HTTP status of the attached response.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(Response::status)
    }

    /// Whether the request failed before a response was received.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether the failure was a connect, read/write or header timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_timeout())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_decodes_capitalized_fields() {
        let body = br#"{"Code":"NoSuchKey","Message":"x","RequestId":"r1"}"#;
        let error = ServiceError::from_json(body, 404, "").unwrap();
        assert_eq!(error.code, "NoSuchKey");
        assert_eq!(error.message, "x");
        assert_eq!(error.request_id, "r1");
        assert_eq!(error.status_code, 404);
        assert_eq!(error.raw_message, String::from_utf8_lossy(body));
    }

    #[test]
    fn test_service_error_decodes_numeric_code() {
        let body = br#"{"code":40001,"msg":"bad sign","track_id":"t9","request_id":"r2"}"#;
        let error = ServiceError::from_json(body, 400, "").unwrap();
        assert_eq!(error.code, "40001");
        assert_eq!(error.message, "bad sign");
        assert_eq!(error.track_id, "t9");
        assert_eq!(error.request_id, "r2");
    }

    #[test]
    fn test_header_request_id_wins_over_payload() {
        let body = br#"{"code":"Denied","request_id":"from-body"}"#;
        let error = ServiceError::from_json(body, 403, "from-header").unwrap();
        assert_eq!(error.request_id, "from-header");
    }

    #[test]
    fn test_service_error_rejects_non_json() {
        assert!(ServiceError::from_json(b"<html>oops</html>", 500, "r").is_err());
    }

    #[test]
    fn test_empty_service_error_keeps_status_and_request_id() {
        let error = ServiceError::empty(404, "r3");
        assert_eq!(error.code, "");
        assert_eq!(error.message, "");
        assert_eq!(error.status_code, 404);
        assert_eq!(error.request_id, "r3");
    }

    #[test]
    fn test_service_error_display() {
        let mut error = ServiceError::empty(404, "r1");
        error.code = "NoSuchKey".to_string();
        error.message = "missing".to_string();
        let msg = error.to_string();
        assert_eq!(
            msg,
            "service returned error: StatusCode=404, ErrorCode=NoSuchKey, ErrorMessage=\"missing\", RequestId=r1"
        );

        error.endpoint = "other.example.com".to_string();
        assert!(error.to_string().ends_with(", Endpoint=other.example.com"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ClientError::config("md5_threshold must be > 0");
        assert_eq!(
            error.to_string(),
            "invalid configuration: md5_threshold must be > 0"
        );
        assert!(error.response().is_none());
        assert!(!error.is_transport());
    }

    #[test]
    fn test_header_timeout_counts_as_timeout() {
        let error = ClientError::transport(
            Method::GET,
            "http://127.0.0.1/",
            TransportError::HeaderTimeout(Duration::from_secs(1)),
        );
        assert!(error.is_transport());
        assert!(error.is_timeout());
        assert!(error.to_string().contains("GET http://127.0.0.1/"));
    }
}
