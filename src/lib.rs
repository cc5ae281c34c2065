//! Utilities for HTTP/1.1 forward proxying over TCP.
//!
//! The crate is built around three pieces: a [`pool::ConnectionPool`] that
//! stores idle keep-alive sockets to origin servers, an [`upstream::Dialer`]
//! that reuses pooled sockets or establishes fresh connections, and a
//! [`forward::Forwarder`] that relays a parsed client request upstream and
//! streams the response back. [`server::ProxyServer`] ties them together
//! behind a TCP listener.

/// Request forwarding between clients and origin servers.
pub mod forward;
mod parse;
/// Storage for idle upstream sockets, keyed by origin authority.
pub mod pool;
/// Client-facing acceptor that parses requests and drives the forwarding engine.
pub mod server;
/// Origin dialing with pooled-socket reuse.
pub mod upstream;

mod error;
mod util;

pub use error::DialError;
pub use parse::{Authority, HttpRequest, HttpResponse};

/// How much data to read for a request header section before it's considered invalid.
///
/// 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Upper bound on request body bytes the parser buffers ahead of the
/// forwarding engine; anything beyond this is streamed.
pub(crate) const BODY_BUFFER_MAX_LENGTH: usize = 64 * 1024;

/// Bound on the response header accumulation buffer. An origin that never
/// completes its header section within this is treated as misbehaving.
pub(crate) const RESPONSE_HEAD_MAX_LENGTH: usize = 64 * 1024;

/// Read chunk size for relaying response bodies and tunnel traffic.
pub(crate) const BUFFER_SIZE: usize = 8192;
