//! Broker configuration
//!
//! Frame size caps, mailbox backpressure limits, and the aggregate
//! `ServerConfig` handed to listeners and sessions.

/// Serialization label assumed when a handshake does not name one.
pub const DEFAULT_SERIALIZATION: &str = "matlab";

/// Upper bounds on the two length fields of a wire frame.
///
/// Violations are framing errors and close the connection.
#[derive(Debug, Clone)]
pub struct FrameLimits {
    /// Maximum accepted `json_len` in bytes.
    pub max_json_len: usize,
    /// Maximum accepted `bin_len` in bytes.
    pub max_bin_len: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_json_len: 512 * 1024 * 1024,
            max_bin_len: 512 * 1024 * 1024,
        }
    }
}

impl FrameLimits {
    /// Set both length caps at once.
    #[must_use]
    pub const fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_json_len = bytes;
        self.max_bin_len = bytes;
        self
    }
}

/// Backpressure caps for one client mailbox.
///
/// When either bound is exceeded the oldest undelivered envelope is
/// dropped and counted (see `mailbox::Mailbox`).
#[derive(Debug, Clone)]
pub struct MailboxLimits {
    /// Maximum queued envelopes per client.
    pub max_envelopes: usize,
    /// Maximum queued bytes (metadata + payload) per client.
    pub max_bytes: usize,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            max_envelopes: 16 * 1024,
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl MailboxLimits {
    #[must_use]
    pub const fn with_max_envelopes(mut self, n: usize) -> Self {
        self.max_envelopes = n;
        self
    }

    #[must_use]
    pub const fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }
}

/// Aggregate broker configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub frame_limits: FrameLimits,
    pub mailbox_limits: MailboxLimits,
}

impl ServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_frame_limits(mut self, limits: FrameLimits) -> Self {
        self.frame_limits = limits;
        self
    }

    #[must_use]
    pub fn with_mailbox_limits(mut self, limits: MailboxLimits) -> Self {
        self.mailbox_limits = limits;
        self
    }
}
