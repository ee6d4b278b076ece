//! A duplicating HTTP reverse proxy.
//!
//! Every incoming request is forwarded to one primary upstream and
//! mirrored to any number of secondary upstreams in parallel. The client
//! sees only the primary's response; secondary responses are drained and
//! discarded. The request body is read once and fanned out through
//! [`body::MultiReader`], so each upstream consumes the same byte stream
//! at its own pace with bounded buffering.

#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![warn(missing_docs)]

/// Access-log writer with reopen-on-SIGHUP support
pub mod access_log;
/// Fan-out body types that stream one request body to many upstreams
pub mod body;
/// Upstream round-trip collaborator
pub mod client;
pub mod extensions;
pub mod handler;
/// Request cloning and header hygiene
pub mod request;
/// Server loop and graceful shutdown
pub mod server;

pub use access_log::AccessLog;
pub use body::{Consumer, MultiReader, ProxyBody, StreamError};
pub use client::{HttpClient, RoundTrip, RoundTripError};
pub use extensions::{RequestExt, SocketInfo};
pub use handler::{Duproxy, Handler};
pub use request::{HOP_BY_HOP, clone_request, strip_hop_headers};
