//! Signed HTTP Client Library
//!
//! This library issues signed HTTP requests to a remote service. It bounds
//! every socket read and write with its own deadline, optionally hashes
//! request bodies (spilling large ones to disk), classifies responses into
//! success, redirect and service-error outcomes, and reports transfer
//! progress.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`client`] - Request builder and the execution pipeline
//! - [`transport`] - Pooled HTTP/1.1 transport over deadline-wrapped sockets
//! - [`url`](crate::url) - Endpoint parsing and request URI composition
//! - [`body`] - Body measurement, MD5 digests and spill files
//! - [`response`] - Response classification and JSON decoding
//! - [`progress`] - Progress events and listeners
//! - [`sign`] / [`credentials`] - Authorization header computation
//! - [`config`] - Timeouts, pool sizes, proxy and feature flags

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod body;
pub mod client;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod progress;
pub mod response;
pub mod sign;
pub mod transport;
pub mod url;
pub mod user_agent;

// Re-export commonly used types
pub use body::{BodyError, MaterializedBody, RequestBody, calc_digest};
pub use client::{Client, ClientBuilder, Request};
pub use config::{AuthVersion, Config, HttpMaxConns, HttpTimeout, ProxyConfig};
pub use credentials::{Credentials, StaticCredentials};
pub use error::{ClientError, ServiceError, TransportError};
pub use progress::{ProgressEvent, ProgressEventType, ProgressListener, publish_progress};
pub use response::{JsonResponse, Response, classify, decode_json};
pub use sign::{HmacSigner, SignError, Signer, SigningContext};
pub use transport::{TimeoutConn, Transport};
pub use crate::url::{Endpoint, HostKind, Scheme, canonical_query};
pub use user_agent::{SysInfo, default_user_agent};
