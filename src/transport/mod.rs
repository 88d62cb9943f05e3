//! Pooled HTTP/1.1 transport over deadline-wrapped sockets.
//!
//! [`TimeoutConnector`] dials TCP (directly or through a proxy), wraps the
//! socket in a [`TimeoutConn`] and hands it to hyper-rustls, which layers TLS
//! on top for `https` URIs. [`Transport`] owns the pooled client and bounds
//! the wait for response headers.

pub mod conn;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use http::uri::Scheme;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as PooledClient;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::oneshot;
use tower_service::Service;
use tracing::{debug, instrument};
use url::Url;

use crate::body::OutgoingBody;
use crate::config::{Config, HttpTimeout, ProxyConfig};
use crate::error::{ClientError, TransportError};

pub use self::conn::TimeoutConn;

/// Largest CONNECT response head accepted from a proxy.
const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

/// Parsed proxy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    host: String,
    port: u16,
    authorization: Option<String>,
}

impl ProxyTarget {
    /// Parses `http://host:port` or bare `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidProxy`] for unparseable addresses and
    /// schemes other than `http`.
    pub fn parse(proxy: &ProxyConfig) -> Result<Self, ClientError> {
        let raw = proxy.host.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&with_scheme).map_err(|e| ClientError::invalid_proxy(raw, e.to_string()))?;
        if url.scheme() != "http" {
            return Err(ClientError::invalid_proxy(
                raw,
                format!("unsupported proxy scheme {}", url.scheme()),
            ));
        }
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(ClientError::invalid_proxy(raw, "missing host")),
        };
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(Self {
            host,
            port,
            authorization: proxy.authorization(),
        })
    }

    /// `Proxy-Authorization` value, when credentials are configured.
    #[must_use]
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

/// Connection produced by [`TimeoutConnector`].
#[derive(Debug)]
pub struct PooledConn {
    io: TokioIo<TimeoutConn<TcpStream>>,
    via_proxy: bool,
}

impl PooledConn {
    fn new(conn: TimeoutConn<TcpStream>, via_proxy: bool) -> Self {
        Self {
            io: TokioIo::new(conn),
            via_proxy,
        }
    }
}

impl Connection for PooledConn {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.via_proxy)
    }
}

impl Read for PooledConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl Write for PooledConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }
}

/// Dialer wrapping every socket in a [`TimeoutConn`].
#[derive(Debug, Clone)]
pub struct TimeoutConnector {
    timeouts: HttpTimeout,
    local_addr: Option<IpAddr>,
    proxy: Option<Arc<ProxyTarget>>,
}

impl TimeoutConnector {
    /// Creates a connector.
    #[must_use]
    pub fn new(timeouts: HttpTimeout, local_addr: Option<IpAddr>, proxy: Option<ProxyTarget>) -> Self {
        Self {
            timeouts,
            local_addr,
            proxy: proxy.map(Arc::new),
        }
    }

    #[instrument(level = "debug", skip(self), fields(uri = %uri))]
    async fn connect(self, uri: Uri) -> io::Result<PooledConn> {
        let https = uri.scheme() == Some(&Scheme::HTTPS);
        let host = uri
            .host()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URI has no host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let Some(proxy) = self.proxy.as_deref() else {
            let stream = self.dial(host, port).await?;
            return Ok(PooledConn::new(self.wrap(stream), false));
        };

        let stream = self.dial(&proxy.host, proxy.port).await?;
        let mut conn = self.wrap(stream);
        if !https {
            debug!(proxy = %proxy.host, "sending through proxy in absolute form");
            return Ok(PooledConn::new(conn, true));
        }

        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        tokio::time::timeout(
            self.timeouts.connect_timeout,
            tunnel(&mut conn, &authority, proxy.authorization()),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "proxy CONNECT timed out"))??;
        debug!(proxy = %proxy.host, target = %authority, "proxy tunnel established");
        Ok(PooledConn::new(conn, false))
    }

    /// Resolves `host` and connects to the first reachable address.
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let attempt = async {
            let mut last_err = None;
            for addr in lookup_host((host, port)).await? {
                match self.connect_addr(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => {
                        debug!(%addr, error = %err, "connect attempt failed");
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses resolved for {host}"),
                )
            }))
        };
        tokio::time::timeout(self.timeouts.connect_timeout, attempt)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )
            })?
    }

    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local_addr {
            if local.is_ipv4() != addr.is_ipv4() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("local address {local} cannot reach {addr}"),
                ));
            }
            socket.bind(SocketAddr::new(local, 0))?;
        }
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn wrap(&self, stream: TcpStream) -> TimeoutConn<TcpStream> {
        TimeoutConn::new(
            stream,
            self.timeouts.read_write_timeout,
            self.timeouts.long_timeout,
        )
    }
}

impl Service<Uri> for TimeoutConnector {
    type Response = PooledConn;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<PooledConn>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// Opens a CONNECT tunnel to `authority` over an established proxy connection.
async fn tunnel(
    conn: &mut TimeoutConn<TcpStream>,
    authority: &str,
    authorization: Option<&str>,
) -> io::Result<()> {
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while !head.ends_with(b"\r\n\r\n") {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection during CONNECT",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() > MAX_TUNNEL_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy CONNECT response too large",
            ));
        }
    }

    let status_line = head
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    match status {
        "200" => Ok(()),
        "407" => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "proxy authentication required",
        )),
        _ => Err(io::Error::other(format!("proxy CONNECT failed: {status_line}"))),
    }
}

type HttpClient = PooledClient<HttpsConnector<TimeoutConnector>, OutgoingBody>;

/// Pooled client plus the response-header timeout.
#[derive(Debug, Clone)]
pub struct Transport {
    client: HttpClient,
    header_timeout: Duration,
    proxy: Option<Arc<ProxyTarget>>,
}

impl Transport {
    /// Builds the transport described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidProxy`] when the proxy cannot be parsed.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let proxy = config.proxy.as_ref().map(ProxyTarget::parse).transpose()?;
        let connector = TimeoutConnector::new(config.http_timeout, config.local_addr, proxy.clone());
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = PooledClient::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.http_timeout.idle_conn_timeout)
            .pool_max_idle_per_host(config.http_max_conns.effective_per_host())
            .build(https);

        debug!(
            idle_timeout = ?config.http_timeout.idle_conn_timeout,
            max_idle_per_host = config.http_max_conns.effective_per_host(),
            proxy = proxy.is_some(),
            "transport built"
        );
        Ok(Self {
            client,
            header_timeout: config.http_timeout.header_timeout,
            proxy: proxy.map(Arc::new),
        })
    }

    /// Configured proxy, if any.
    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyTarget> {
        self.proxy.as_deref()
    }

    /// Sends one request, waiting at most the header timeout for the response head.
    ///
    /// The header timeout starts once the request body has been fully handed
    /// to the connection; while the body uploads only the socket deadlines
    /// apply.
    ///
    /// # Errors
    ///
    /// [`TransportError::HeaderTimeout`] or the pooled client's error.
    pub async fn send(
        &self,
        request: http::Request<OutgoingBody>,
    ) -> Result<http::Response<Incoming>, TransportError> {
        let (uploaded, upload_done) = oneshot::channel();
        let request = request.map(|inner| {
            UploadBody {
                inner,
                done: Some(uploaded),
            }
            .boxed_unsync()
        });

        let response = self.client.request(request);
        tokio::pin!(response);
        tokio::select! {
            result = &mut response => return result.map_err(TransportError::from),
            _ = upload_done => {}
        }
        match tokio::time::timeout(self.header_timeout, response).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::HeaderTimeout(self.header_timeout)),
        }
    }
}

/// Request body that signals when hyper has taken its last frame.
///
/// Dropping it (hyper drops bodies it no longer needs) signals as well.
struct UploadBody {
    inner: OutgoingBody,
    done: Option<oneshot::Sender<()>>,
}

impl Body for UploadBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(None) = poll
            && let Some(done) = self.done.take()
        {
            let _ = done.send(());
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
