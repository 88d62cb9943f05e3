//! Client configuration.
//!
//! Loading configuration from files or the environment is the caller's job;
//! this module only defines the values, their defaults and validation.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_RETRY_TIMES, HEADER_TIMEOUT, IDLE_CONN_TIMEOUT, LONG_TIMEOUT,
    MAX_IDLE_CONNS, MAX_IDLE_CONNS_PER_HOST, MD5_THRESHOLD, READ_WRITE_TIMEOUT,
};
use crate::error::ClientError;
use crate::user_agent::{SysInfo, default_user_agent};

/// Connection and request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeout {
    /// Time allowed to establish a TCP connection (and proxy tunnel).
    pub connect_timeout: Duration,
    /// Deadline armed around every individual read or write.
    pub read_write_timeout: Duration,
    /// Time allowed between sending a request and receiving response headers.
    pub header_timeout: Duration,
    /// Idle ceiling re-armed after every I/O call.
    pub long_timeout: Duration,
    /// How long an unused pooled connection is kept.
    pub idle_conn_timeout: Duration,
}

impl Default for HttpTimeout {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            read_write_timeout: READ_WRITE_TIMEOUT,
            header_timeout: HEADER_TIMEOUT,
            long_timeout: LONG_TIMEOUT,
            idle_conn_timeout: IDLE_CONN_TIMEOUT,
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpMaxConns {
    /// Upper bound on idle connections kept by the pool.
    pub max_idle_conns: usize,
    /// Upper bound on idle connections kept per host.
    pub max_idle_conns_per_host: usize,
}

impl Default for HttpMaxConns {
    fn default() -> Self {
        Self {
            max_idle_conns: MAX_IDLE_CONNS,
            max_idle_conns_per_host: MAX_IDLE_CONNS_PER_HOST,
        }
    }
}

impl HttpMaxConns {
    /// Per-host idle cap actually applied to the pool.
    ///
    /// The pool only supports a per-host bound, so the total bound caps it.
    #[must_use]
    pub fn effective_per_host(&self) -> usize {
        self.max_idle_conns_per_host.min(self.max_idle_conns)
    }
}

/// Outbound HTTP proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy address, e.g. `http://proxy.corp.net:3128` or `10.0.0.1:8080`.
    pub host: String,
    /// Proxy user; when set, requests carry `Proxy-Authorization`.
    pub user: Option<String>,
    /// Proxy password.
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyConfig {
    /// Unauthenticated proxy.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            password: None,
        }
    }

    /// Adds basic-auth credentials.
    #[must_use]
    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    /// Whether the proxy requires authentication.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// `Basic` credential for the `Proxy-Authorization` header.
    #[must_use]
    pub fn authorization(&self) -> Option<String> {
        let user = self.user.as_deref()?;
        let password = self.password.as_deref().unwrap_or("");
        Some(format!(
            "Basic {}",
            STANDARD.encode(format!("{user}:{password}"))
        ))
    }
}

/// Authorization header scheme produced by the default signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthVersion {
    /// `XHTTP <app_id>:<signature>` over method, MD5, type, date, x-headers and path.
    #[default]
    V1,
    /// Also signs the configured additional headers and the sorted query.
    V2,
}

impl std::fmt::Display for AuthVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

impl std::str::FromStr for AuthVersion {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(ClientError::config(format!(
                "invalid auth version: {other}"
            ))),
        }
    }
}

/// Everything the client needs besides the endpoint and credentials.
#[derive(Debug, Clone)]
pub struct Config {
    /// User-Agent header value.
    pub user_agent: String,
    /// Retry budget for callers that layer retries on top; unused by the client.
    pub retry_times: u32,
    /// Authorization scheme for the default signer.
    pub auth_version: AuthVersion,
    /// Extra header names signed under [`AuthVersion::V2`].
    pub additional_headers: Vec<String>,
    /// Timeouts.
    pub http_timeout: HttpTimeout,
    /// Pool sizing.
    pub http_max_conns: HttpMaxConns,
    /// Local address to bind outgoing connections to.
    pub local_addr: Option<IpAddr>,
    /// Follow 3xx responses instead of returning them.
    pub redirect_enabled: bool,
    /// Compute and send `Content-MD5` for request bodies.
    pub enable_md5: bool,
    /// Bodies above this size are hashed through a temp file.
    pub md5_threshold: u64,
    /// Directory for spill files; the system temp dir when `None`.
    pub temp_dir: Option<PathBuf>,
    /// Outbound proxy.
    pub proxy: Option<ProxyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(&SysInfo::from_target()),
            retry_times: DEFAULT_RETRY_TIMES,
            auth_version: AuthVersion::V1,
            additional_headers: Vec::new(),
            http_timeout: HttpTimeout::default(),
            http_max_conns: HttpMaxConns::default(),
            local_addr: None,
            redirect_enabled: false,
            enable_md5: false,
            md5_threshold: MD5_THRESHOLD,
            temp_dir: None,
            proxy: None,
        }
    }
}

impl Config {
    /// Replaces the User-Agent with one describing `sys`.
    #[must_use]
    pub fn with_sys_info(mut self, sys: &SysInfo) -> Self {
        self.user_agent = default_user_agent(sys);
        self
    }

    /// Validates values against transport constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<(), ClientError> {
        let timeouts = &self.http_timeout;
        validate_nonzero("connect_timeout", timeouts.connect_timeout)?;
        validate_nonzero("read_write_timeout", timeouts.read_write_timeout)?;
        validate_nonzero("header_timeout", timeouts.header_timeout)?;
        validate_nonzero("long_timeout", timeouts.long_timeout)?;
        if timeouts.long_timeout < timeouts.read_write_timeout {
            return Err(ClientError::config(format!(
                "long_timeout ({:?}) must be >= read_write_timeout ({:?})",
                timeouts.long_timeout, timeouts.read_write_timeout
            )));
        }
        if timeouts.idle_conn_timeout > timeouts.long_timeout {
            return Err(ClientError::config(format!(
                "idle_conn_timeout ({:?}) must be <= long_timeout ({:?})",
                timeouts.idle_conn_timeout, timeouts.long_timeout
            )));
        }
        if self.md5_threshold == 0 {
            return Err(ClientError::config("md5_threshold must be > 0"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ClientError::config("user_agent must not be empty"));
        }
        if let Some(proxy) = &self.proxy
            && proxy.host.trim().is_empty()
        {
            return Err(ClientError::config("proxy host must not be empty"));
        }
        Ok(())
    }
}

fn validate_nonzero(name: &str, value: Duration) -> Result<(), ClientError> {
    if value.is_zero() {
        return Err(ClientError::config(format!("{name} must be > 0")));
    }
    Ok(())
}
