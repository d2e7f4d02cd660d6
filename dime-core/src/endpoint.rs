//! Listener endpoint addressing.
//!
//! DiME configuration names listeners as `proto:address` strings, where
//! `proto` is `tcp`, `ipc`, or `unix` and the address is a `host:port`
//! pair or a filesystem path.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// A parsed listener address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP transport: `tcp:host:port`
    Tcp(SocketAddr),
    /// Unix-domain stream socket: `ipc:/path` or `unix:/path`
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint from a `proto:address` string.
    ///
    /// Supported formats:
    /// - `tcp:127.0.0.1:5000`
    /// - `tcp:[::1]:5000` (IPv6)
    /// - `ipc:/tmp/dime.sock` (Unix only)
    /// - `unix:/tmp/dime.sock` (alias for `ipc:`)
    ///
    /// # Examples
    ///
    /// ```
    /// use dime_core::endpoint::Endpoint;
    ///
    /// let ep = Endpoint::parse("tcp:127.0.0.1:5000").unwrap();
    /// assert!(matches!(ep, Endpoint::Tcp(_)));
    ///
    /// # #[cfg(unix)]
    /// # {
    /// let ep = Endpoint::parse("unix:/tmp/dime.sock").unwrap();
    /// assert!(matches!(ep, Endpoint::Ipc(_)));
    /// # }
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Returns true if this is a TCP endpoint.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }

    /// Returns true if this is a Unix-socket endpoint.
    #[cfg(unix)]
    pub fn is_ipc(&self) -> bool {
        matches!(self, Endpoint::Ipc(_))
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp:") {
            let socket_addr = addr
                .parse::<SocketAddr>()
                .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))?;
            Ok(Endpoint::Tcp(socket_addr))
        } else if let Some(path) = s.strip_prefix("ipc:").or_else(|| s.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(EndpointError::InvalidPath(s.to_string()));
            }
            #[cfg(unix)]
            {
                Ok(Endpoint::Ipc(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                Err(EndpointError::IpcNotSupported)
            }
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            #[cfg(unix)]
            Endpoint::Ipc(path) => write!(f, "ipc:{}", path.display()),
        }
    }
}

/// Errors produced when parsing listener endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp:, ipc:, or unix:)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid socket path in endpoint: {0}")]
    InvalidPath(String),

    #[error("Unix-domain sockets not supported on this platform")]
    IpcNotSupported,
}
