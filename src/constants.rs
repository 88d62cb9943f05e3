//! Constants for the client (timeouts, pool sizes, header names, temp files).

use std::time::Duration;

use http::HeaderName;

/// Default TCP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-operation read/write deadline (60 seconds).
pub const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for response headers (60 seconds).
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle ceiling between I/O calls on one connection (5 minutes).
pub const LONG_TIMEOUT: Duration = Duration::from_secs(300);

/// Default lifetime of an idle pooled connection (50 seconds).
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(50);

/// Default cap on idle pooled connections.
pub const MAX_IDLE_CONNS: usize = 100;

/// Default cap on idle pooled connections per host.
pub const MAX_IDLE_CONNS_PER_HOST: usize = 100;

/// Bodies larger than this are spilled to a temp file before hashing (16 MiB).
pub const MD5_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Carried for callers that layer their own retries; the client never retries.
pub const DEFAULT_RETRY_TIMES: u32 = 5;

/// Redirect hops followed when redirect following is enabled.
pub const MAX_REDIRECTS: usize = 10;

/// Prefix of spill files so leftovers can be identified.
pub const TEMP_FILE_PREFIX: &str = "xhttp-temp-";

/// Suffix of spill files.
pub const TEMP_FILE_SUFFIX: &str = ".temp";

/// Chunk size used when streaming request bodies.
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Security token header sent when the credentials carry one.
pub const X_SECURITY_TOKEN: HeaderName = HeaderName::from_static("x-security-token");

/// Service-assigned request identifier.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Service-assigned track identifier.
pub const X_TRACK_ID: HeaderName = HeaderName::from_static("x-track-id");

/// Content-MD5 request header (not among `http`'s standard constants).
pub const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");
