//! Request execution.
//!
//! [`Client`] turns a [`Request`] into a signed HTTP exchange: it measures and
//! optionally hashes the body, assembles mandatory headers, signs, reports
//! progress, performs the round-trip (following redirects when enabled) and
//! classifies the response.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, DATE, HOST, LOCATION,
    PROXY_AUTHORIZATION, USER_AGENT,
};
use http::uri::Scheme;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use hyper::body::Incoming;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::body::{BodyError, PreparedBody, RequestBody, calc_digest, empty_body};
use crate::config::{Config, HttpTimeout, ProxyConfig};
use crate::constants::{CONTENT_MD5, MAX_REDIRECTS, X_SECURITY_TOKEN};
use crate::credentials::{Credentials, StaticCredentials};
use crate::error::{ClientError, TransportError};
use crate::progress::{ProgressEventType, ProgressListener, ProgressTracker};
use crate::response::{JsonResponse, Response, classify, decode_json};
use crate::sign::{HmacSigner, Signer, SigningContext};
use crate::transport::Transport;
use crate::url::Endpoint;

/// Headers whose values never reach the logs.
const SECRET_HEADERS: [HeaderName; 3] = [AUTHORIZATION, PROXY_AUTHORIZATION, X_SECURITY_TOKEN];

/// Description of one request against the client's endpoint.
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    query: BTreeMap<String, Option<String>>,
    headers: Vec<(String, String)>,
    body: Option<RequestBody>,
}

impl Request {
    /// Request with `method` on `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// PUT request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// HEAD request.
    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    /// Adds a `key=value` query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), Some(value.into()));
        self
    }

    /// Adds a query key with no value.
    #[must_use]
    pub fn query_key(mut self, key: impl Into<String>) -> Self {
        self.query.insert(key.into(), None);
        self
    }

    /// Adds a header; it replaces any client-set header of the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns the serialization error.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header(CONTENT_TYPE.as_str(), "application/json").body(body))
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn header_map(&self) -> Result<HeaderMap, ClientError> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let invalid = || ClientError::InvalidHeader { name: name.clone() };
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            map.append(name, value);
        }
        Ok(map)
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    endpoint: String,
    config: Config,
    credentials: Option<Arc<dyn Credentials>>,
    signer: Option<Arc<dyn Signer>>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            config: Config::default(),
            credentials: None,
            signer: None,
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Credentials used for signing; anonymous when unset.
    #[must_use]
    pub fn credentials(mut self, credentials: impl Credentials + 'static) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Custom signer; an [`HmacSigner`] for the configured auth version when unset.
    #[must_use]
    pub fn signer(mut self, signer: impl Signer + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Routes requests through `proxy`.
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Enables `Content-MD5` on request bodies.
    #[must_use]
    pub fn enable_md5(mut self, enabled: bool) -> Self {
        self.config.enable_md5 = enabled;
        self
    }

    /// Size above which bodies are hashed through a temp file.
    #[must_use]
    pub fn md5_threshold(mut self, threshold: u64) -> Self {
        self.config.md5_threshold = threshold;
        self
    }

    /// Directory for spill files.
    #[must_use]
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    /// Follows redirects instead of returning them as errors.
    #[must_use]
    pub fn redirect(mut self, enabled: bool) -> Self {
        self.config.redirect_enabled = enabled;
        self
    }

    /// Replaces all timeouts.
    #[must_use]
    pub fn http_timeout(mut self, timeout: HttpTimeout) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    /// Overrides the User-Agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Binds outgoing connections to `addr`.
    #[must_use]
    pub fn local_addr(mut self, addr: IpAddr) -> Self {
        self.config.local_addr = Some(addr);
        self
    }

    /// Validates the configuration and builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`], [`ClientError::InvalidEndpoint`] or
    /// [`ClientError::InvalidProxy`].
    pub fn build(self) -> Result<Client, ClientError> {
        self.config.validate()?;
        let endpoint = Endpoint::parse(&self.endpoint)?;
        let transport = Transport::new(&self.config)?;
        let signer = self.signer.unwrap_or_else(|| {
            Arc::new(HmacSigner::new(
                self.config.auth_version,
                &self.config.additional_headers,
            ))
        });
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(StaticCredentials::anonymous()));

        debug!(endpoint = %endpoint, "client built");
        Ok(Client {
            inner: Arc::new(ClientInner {
                endpoint,
                config: self.config,
                credentials,
                signer,
                transport,
            }),
        })
    }
}

struct ClientInner {
    endpoint: Endpoint,
    config: Config,
    credentials: Arc<dyn Credentials>,
    signer: Arc<dyn Signer>,
    transport: Transport,
}

/// Signed HTTP client for one service endpoint.
///
/// Cheap to clone; clones share the connection pool.
///
/// # Example
///
/// ```no_run
/// use xhttp_client::{Client, Request, StaticCredentials};
///
/// # async fn example() -> Result<(), xhttp_client::ClientError> {
/// let client = Client::builder("https://api.example.com")
///     .credentials(StaticCredentials::new("app-id", "app-secret"))
///     .build()?;
/// let mut response = client.send(Request::get("/v1/status"), None).await?;
/// println!("{}", response.body_text().await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("signer", &self.inner.signer)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Starts building a client for `endpoint`.
    pub fn builder(endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// Client with default configuration.
    ///
    /// # Errors
    ///
    /// Same as [`ClientBuilder::build`].
    pub fn new(endpoint: &str, credentials: impl Credentials + 'static) -> Result<Self, ClientError> {
        Self::builder(endpoint).credentials(credentials).build()
    }

    /// Parsed endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Sends `request` to the endpoint.
    ///
    /// # Errors
    ///
    /// Everything [`Client::execute`] returns, plus URI and header errors.
    pub async fn send(
        &self,
        request: Request,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> Result<Response, ClientError> {
        let uri = self.inner.endpoint.url(&request.path, &request.query)?;
        let headers = request.header_map()?;
        self.execute(request.method, uri, headers, request.body, listener)
            .await
    }

    /// Sends `request` and decodes a successful response body as JSON.
    ///
    /// A body that does not decode is reported in
    /// [`JsonResponse::body_json`], not as an error.
    ///
    /// # Errors
    ///
    /// Same as [`Client::send`], plus body read failures.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: Request,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> Result<JsonResponse<T>, ClientError> {
        let mut response = self.send(request, listener).await?;
        let body_json = decode_json(&mut response).await?;
        Ok(JsonResponse {
            response,
            body_json,
        })
    }

    /// Executes one exchange.
    ///
    /// `headers` override client-set headers of the same name. Any spill file
    /// created for the body is removed before this returns.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Body`] if the body cannot be materialized (nothing is sent)
    /// - [`ClientError::Signing`] if the signer fails
    /// - [`ClientError::Transport`] if no response was received
    /// - [`ClientError::Redirect`], [`ClientError::Service`] or
    ///   [`ClientError::InvalidErrorBody`] from classification
    #[instrument(skip(self, headers, body, listener), fields(method = %method, uri = %uri))]
    pub async fn execute(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Option<RequestBody>,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> Result<Response, ClientError> {
        let mut request_headers = HeaderMap::new();
        let (mut prepared, total) = self.prepare_body(body, &headers, &mut request_headers).await?;
        if let Some(path) = prepared.temp_path() {
            debug!(path = %path.display(), "request body spilled");
        }

        self.set_mandatory_headers(&uri, &mut request_headers)?;
        merge_headers(&mut request_headers, &headers);
        self.sign(&method, &uri, &mut request_headers)?;
        debug!(headers = ?RedactedHeaders(&request_headers), "sending request");

        let tracker = ProgressTracker::new(listener, total);
        tracker.publish(ProgressEventType::Started);

        match self
            .round_trip(method.clone(), uri.clone(), request_headers, &mut prepared, &tracker)
            .await
        {
            Ok(raw) => {
                tracker.publish(ProgressEventType::Completed);
                debug!(
                    status = raw.status().as_u16(),
                    headers = ?RedactedHeaders(raw.headers()),
                    "response received"
                );
                classify(raw).await
            }
            Err(source) => {
                tracker.publish(ProgressEventType::Failed);
                warn!(error = %source, "request failed");
                Err(ClientError::transport(method, uri.to_string(), source))
            }
        }
    }

    /// Sets Content-Length and, when enabled, Content-MD5.
    async fn prepare_body(
        &self,
        body: Option<RequestBody>,
        caller_headers: &HeaderMap,
        headers: &mut HeaderMap,
    ) -> Result<(PreparedBody, u64), ClientError> {
        let Some(mut body) = body else {
            return Ok((PreparedBody::Empty, 0));
        };
        let measured = match body.measure().await {
            Ok(length) => Some(length),
            Err(BodyError::UnknownLength) => None,
            Err(err) => return Err(err.into()),
        };

        let config = &self.inner.config;
        if config.enable_md5 && !caller_headers.contains_key(&CONTENT_MD5) {
            let materialized = calc_digest(
                body,
                measured.unwrap_or(0),
                config.md5_threshold,
                config.temp_dir.as_deref(),
            )
            .await?;
            let length = materialized.content_length();
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            headers.insert(
                CONTENT_MD5,
                HeaderValue::from_str(materialized.content_md5()).map_err(|_| {
                    ClientError::InvalidHeader {
                        name: CONTENT_MD5.to_string(),
                    }
                })?,
            );
            return Ok((PreparedBody::Materialized(materialized), length));
        }

        if let Some(length) = measured {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        Ok((PreparedBody::Direct(Some(body)), measured.unwrap_or(0)))
    }

    fn set_mandatory_headers(&self, uri: &Uri, headers: &mut HeaderMap) -> Result<(), ClientError> {
        let invalid = |name: &HeaderName| ClientError::InvalidHeader {
            name: name.to_string(),
        };

        let date = httpdate::fmt_http_date(SystemTime::now());
        headers.insert(DATE, HeaderValue::from_str(&date).map_err(|_| invalid(&DATE))?);
        if let Some(authority) = uri.authority() {
            headers.insert(
                HOST,
                HeaderValue::from_str(authority.as_str()).map_err(|_| invalid(&HOST))?,
            );
        }
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.inner.config.user_agent).map_err(|_| invalid(&USER_AGENT))?,
        );
        if let Some(auth) = self.proxy_authorization(uri) {
            let mut value = HeaderValue::from_str(auth).map_err(|_| invalid(&PROXY_AUTHORIZATION))?;
            value.set_sensitive(true);
            headers.insert(PROXY_AUTHORIZATION, value);
        }
        if let Some(token) = self.inner.credentials.security_token() {
            let mut value = HeaderValue::from_str(&token).map_err(|_| invalid(&X_SECURITY_TOKEN))?;
            value.set_sensitive(true);
            headers.insert(X_SECURITY_TOKEN, value);
        }
        Ok(())
    }

    /// Proxy credential for plain-http requests; tunnels authenticate on CONNECT.
    fn proxy_authorization(&self, uri: &Uri) -> Option<&str> {
        if uri.scheme() == Some(&Scheme::HTTPS) {
            return None;
        }
        self.inner.transport.proxy()?.authorization()
    }

    fn sign(&self, method: &Method, uri: &Uri, headers: &mut HeaderMap) -> Result<(), ClientError> {
        let credentials = self.inner.credentials.as_ref();
        if credentials.app_id().is_empty() {
            return Ok(());
        }
        let ctx = SigningContext {
            method,
            path: uri.path(),
            query: uri.query().unwrap_or_default(),
            headers,
        };
        let authorization = self
            .inner
            .signer
            .sign(&ctx, credentials)
            .map_err(|source| ClientError::Signing { source })?;
        headers.insert(AUTHORIZATION, authorization);
        Ok(())
    }

    /// Sends the request, following redirects when enabled.
    async fn round_trip(
        &self,
        mut method: Method,
        mut uri: Uri,
        mut headers: HeaderMap,
        body: &mut PreparedBody,
        tracker: &ProgressTracker,
    ) -> Result<http::Response<Incoming>, TransportError> {
        let mut send_body = true;
        let mut hops = 0;
        loop {
            let outgoing = if send_body {
                body.outgoing(tracker)
                    .map_err(TransportError::Body)?
                    .ok_or_else(|| {
                        TransportError::Body(std::io::Error::other("request body already sent"))
                    })?
            } else {
                empty_body()
            };
            let mut request = http::Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(outgoing)?;
            *request.headers_mut() = headers.clone();

            let response = self.inner.transport.send(request).await?;
            if !self.inner.config.redirect_enabled {
                return Ok(response);
            }
            let status = response.status();
            if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
                return Ok(response);
            }
            let Some(location) = response.headers().get(LOCATION) else {
                return Ok(response);
            };
            if hops >= MAX_REDIRECTS {
                return Err(TransportError::TooManyRedirects(MAX_REDIRECTS));
            }
            let next = resolve_location(&uri, location)?;

            let switch_to_get = status == StatusCode::SEE_OTHER
                || (matches!(status.as_u16(), 301 | 302)
                    && method != Method::GET
                    && method != Method::HEAD);
            if switch_to_get {
                if method != Method::HEAD {
                    method = Method::GET;
                }
                send_body = false;
                for name in [CONTENT_LENGTH, CONTENT_TYPE, CONTENT_MD5] {
                    headers.remove(name);
                }
            } else if send_body && !body.is_replayable() {
                debug!(status = status.as_u16(), "body cannot be resent; returning redirect");
                return Ok(response);
            } else if send_body {
                tracker.reset();
            }

            if next.host() != uri.host() || next.port_u16() != uri.port_u16() {
                for name in [AUTHORIZATION, X_SECURITY_TOKEN, COOKIE] {
                    headers.remove(name);
                }
            }
            if let Some(authority) = next.authority()
                && let Ok(value) = HeaderValue::from_str(authority.as_str())
            {
                headers.insert(HOST, value);
            }
            match self.proxy_authorization(&next) {
                Some(auth) => {
                    if let Ok(value) = HeaderValue::from_str(auth) {
                        headers.insert(PROXY_AUTHORIZATION, value);
                    }
                }
                None => {
                    headers.remove(PROXY_AUTHORIZATION);
                }
            }

            debug!(status = status.as_u16(), from = %uri, to = %next, "following redirect");
            uri = next;
            hops += 1;
        }
    }
}

/// Caller headers replace client headers of the same name.
fn merge_headers(target: &mut HeaderMap, overrides: &HeaderMap) {
    for name in overrides.keys() {
        target.remove(name);
        for value in overrides.get_all(name) {
            target.append(name.clone(), value.clone());
        }
    }
}

fn resolve_location(base: &Uri, location: &HeaderValue) -> Result<Uri, TransportError> {
    let location = location
        .to_str()
        .map_err(|_| TransportError::InvalidLocation(format!("{location:?}")))?;
    let invalid = || TransportError::InvalidLocation(location.to_string());
    let base = Url::parse(&base.to_string()).map_err(|_| invalid())?;
    let next = base.join(location).map_err(|_| invalid())?;
    if !matches!(next.scheme(), "http" | "https") {
        return Err(invalid());
    }
    next.as_str().parse::<Uri>().map_err(|_| invalid())
}

/// Header dump with credential values masked.
struct RedactedHeaders<'a>(&'a HeaderMap);

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.0 {
            if SECRET_HEADERS.contains(name) {
                map.entry(&name.as_str(), &"<redacted>");
            } else {
                map.entry(&name.as_str(), &value.to_str().unwrap_or("<binary>"));
            }
        }
        map.finish()
    }
}
