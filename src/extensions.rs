//! Extension types for storing additional data in http Requests

use std::net::SocketAddr;

/// Socket information for a request
///
/// Installed by the server layer on every inbound request; the request
/// cloner reads the remote address from it to build the `X-Forwarded-For`
/// and `X-Forwarded-Port` headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketInfo {
    /// Local socket address
    pub local: Option<SocketAddr>,
    /// Remote socket address
    pub remote: Option<SocketAddr>,
}

impl SocketInfo {
    /// Create a new SocketInfo with both local and remote addresses
    pub fn new(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self { local, remote }
    }

    /// Create a SocketInfo with only remote address
    pub fn with_remote(remote: SocketAddr) -> Self {
        Self {
            local: None,
            remote: Some(remote),
        }
    }
}

/// Extension trait for http::Request
///
/// Provides access to the socket information carried in the request
/// extensions.
pub trait RequestExt {
    /// Get socket info from request extensions
    fn socket_info(&self) -> Option<&SocketInfo>;

    /// Set socket info in request extensions
    fn set_socket_info(&mut self, info: SocketInfo);
}

impl<T> RequestExt for http::Request<T> {
    fn socket_info(&self) -> Option<&SocketInfo> {
        self.extensions().get::<SocketInfo>()
    }

    fn set_socket_info(&mut self, info: SocketInfo) {
        self.extensions_mut().insert(info);
    }
}
