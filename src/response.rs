//! Response classification and body decoding.
//!
//! [`classify`] turns a raw HTTP response into either a [`Response`] with an
//! unread, streaming body or a [`ClientError`] carrying the response. Error
//! responses are drained first so their body stays replayable.

use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::constants::{X_REQUEST_ID, X_TRACK_ID};
use crate::error::{ClientError, ServiceError};

/// Body type produced by the transport.
pub type IncomingBody = BoxBody<Bytes, hyper::Error>;

/// State of a response body.
pub enum ResponseBody {
    /// Not yet read; can be consumed once.
    Streaming(IncomingBody),
    /// Fully read and replayable.
    Buffered(Bytes),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("Streaming"),
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
        }
    }
}

/// An HTTP response from the service.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    request_id: String,
    track_id: String,
    body: Option<ResponseBody>,
    body_text: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &http::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

impl Response {
    /// Wraps response parts and an unread body.
    #[must_use]
    pub fn new(status: StatusCode, version: Version, headers: HeaderMap, body: ResponseBody) -> Self {
        let request_id = header_str(&headers, &X_REQUEST_ID);
        let track_id = header_str(&headers, &X_TRACK_ID);
        Self {
            status,
            version,
            headers,
            request_id,
            track_id,
            body: Some(body),
            body_text: None,
        }
    }

    /// Status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Protocol version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers; repeated headers keep their order.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// All values of header `name`, in received order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// `X-Request-Id` header, empty when absent.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// `X-Track-Id` header, empty when absent.
    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Whether the body has been read into memory.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self.body, Some(ResponseBody::Buffered(_)))
    }

    /// Reads the whole body, buffering it for later calls.
    ///
    /// # Errors
    ///
    /// [`ClientError::ReadBody`] if reading fails, [`ClientError::BodyConsumed`]
    /// if the body was taken.
    pub async fn bytes(&mut self) -> Result<Bytes, ClientError> {
        let bytes = match self.body.take() {
            None => return Err(ClientError::BodyConsumed),
            Some(ResponseBody::Buffered(bytes)) => bytes,
            Some(ResponseBody::Streaming(body)) => body
                .collect()
                .await
                .map_err(|source| ClientError::ReadBody { source })?
                .to_bytes(),
        };
        self.body = Some(ResponseBody::Buffered(bytes.clone()));
        Ok(bytes)
    }

    /// Body as text, read and cached on first call.
    ///
    /// # Errors
    ///
    /// Same as [`Response::bytes`].
    pub async fn body_text(&mut self) -> Result<&str, ClientError> {
        if self.body_text.is_none() {
            let bytes = self.bytes().await?;
            self.body_text = Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(self.body_text.as_deref().unwrap_or_default())
    }

    /// Takes the body for streaming consumption.
    ///
    /// # Errors
    ///
    /// [`ClientError::BodyConsumed`] if the body was already taken.
    pub fn take_body(&mut self) -> Result<IncomingBody, ClientError> {
        match self.body.take() {
            None => Err(ClientError::BodyConsumed),
            Some(ResponseBody::Streaming(body)) => Ok(body),
            Some(ResponseBody::Buffered(bytes)) => Ok(Full::new(bytes)
                .map_err(|never| match never {})
                .boxed()),
        }
    }
}

/// A successful response whose body was decoded as JSON.
#[derive(Debug)]
pub struct JsonResponse<T> {
    /// The response, body buffered.
    pub response: Response,
    /// Decoding result, kept apart from transport and service failures.
    pub body_json: Result<T, serde_json::Error>,
}

/// Converts a raw response into a typed outcome.
///
/// - 300 to 307: [`ClientError::Redirect`].
/// - 400 to 505: the body is drained, then [`ClientError::Service`] or
///   [`ClientError::InvalidErrorBody`].
/// - anything else: returned with a streaming body.
///
/// # Errors
///
/// As listed above, plus [`ClientError::ReadBody`] when draining fails.
pub async fn classify<B>(raw: http::Response<B>) -> Result<Response, ClientError>
where
    B: hyper::body::Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (parts, body) = raw.into_parts();
    let mut response = Response::new(
        parts.status,
        parts.version,
        parts.headers,
        ResponseBody::Streaming(body.boxed()),
    );
    let status = response.status;
    let code = status.as_u16();

    match code {
        300..=307 => {
            debug!(status = code, "redirect response treated as error");
            Err(ClientError::Redirect {
                status,
                response: Box::new(response),
            })
        }
        400..=505 => {
            let body = response.bytes().await?;
            let request_id = response.request_id.clone();
            if body.is_empty() {
                return Err(ClientError::Service {
                    error: ServiceError::empty(code, request_id),
                    response: Box::new(response),
                });
            }
            match ServiceError::from_json(&body, code, &request_id) {
                Ok(error) => {
                    debug!(status = code, code = %error.code, request_id = %error.request_id, "service error");
                    Err(ClientError::Service {
                        error,
                        response: Box::new(response),
                    })
                }
                Err(source) => Err(ClientError::InvalidErrorBody {
                    status,
                    request_id,
                    source,
                    response: Box::new(response),
                }),
            }
        }
        _ => Ok(response),
    }
}

/// Reads the whole body and decodes it as JSON.
///
/// The outer error reports read failures; the inner result is the decode
/// outcome. The raw text is cached on the response.
///
/// # Errors
///
/// Same as [`Response::bytes`].
pub async fn decode_json<T: DeserializeOwned>(
    response: &mut Response,
) -> Result<Result<T, serde_json::Error>, ClientError> {
    let text = response.body_text().await?;
    Ok(serde_json::from_str(text))
}
