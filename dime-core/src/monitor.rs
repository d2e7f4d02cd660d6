//! Server lifecycle event monitoring.
//!
//! Lets tests and operators observe binds, accepted connections, and
//! session teardown without polling broker state.

use crate::endpoint::Endpoint;
use std::fmt;

/// Broker lifecycle events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A listener is bound and accepting.
    Bound(Endpoint),

    /// Bind failed for an endpoint.
    BindFailed { endpoint: Endpoint, reason: String },

    /// A connection was accepted.
    Accepted { peer: String },

    /// A client session finished (clean close or error).
    SessionClosed { peer: String },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound(ep) => write!(f, "Listening on {ep}"),
            Self::BindFailed { endpoint, reason } => {
                write!(f, "Bind failed for {endpoint}: {reason}")
            }
            Self::Accepted { peer } => write!(f, "Accepted connection from {peer}"),
            Self::SessionClosed { peer } => write!(f, "Session closed for {peer}"),
        }
    }
}

/// Handle for receiving server events.
pub type ServerMonitor = flume::Receiver<ServerEvent>;

/// Internal sender for server events.
pub type ServerEventSender = flume::Sender<ServerEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ServerEventSender, ServerMonitor) {
    flume::unbounded()
}
