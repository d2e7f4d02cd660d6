//! Per-client session state machine.
//!
//! Sans-IO: the machine sees parsed commands and tells the I/O layer
//! what to do. It enforces the handshake-first rule, records the
//! negotiated serialization label, and never touches a socket or the
//! registry itself.

use crate::command::{self, Command, CommandError, MetaMap};
use dime_core::config::DEFAULT_SERIALIZATION;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connected, no valid handshake yet.
    New,
    /// Handshake accepted; normal operation.
    Ready,
    /// Tearing down; no further commands are served.
    Closing,
}

/// What the I/O layer should do with the frame it just read.
#[derive(Debug)]
pub enum Step {
    /// Answer with this metadata map and keep going.
    Reply(MetaMap),
    /// Register the client, then answer with `handshake_ok`.
    Handshake {
        serialization: String,
        tls: bool,
        name: Option<String>,
    },
    /// Forward to the registry dispatcher.
    Dispatch(Command),
}

/// State machine instance, one per connection.
#[derive(Debug)]
pub struct Session {
    phase: SessionPhase,
    serialization: String,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::New,
            serialization: DEFAULT_SERIALIZATION.to_string(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The label recorded at handshake (default until then).
    #[must_use]
    pub fn serialization(&self) -> &str {
        &self.serialization
    }

    /// Enter teardown; subsequent commands are refused.
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closing;
    }

    /// Advance the machine with the parse result of an inbound frame.
    pub fn advance(&mut self, parsed: Result<Command, CommandError>) -> Step {
        let cmd = match parsed {
            Ok(cmd) => cmd,
            // Malformed command: protocol error, session state unchanged.
            Err(err) => return Step::Reply(command::error_reply(&err.to_string())),
        };

        match (self.phase, cmd) {
            (
                SessionPhase::New,
                Command::Handshake {
                    serialization,
                    tls,
                    name,
                },
            ) => {
                // Negotiation: the broker accepts the requested label
                // verbatim; payloads are opaque either way.
                let serialization =
                    serialization.unwrap_or_else(|| DEFAULT_SERIALIZATION.to_string());
                self.serialization = serialization.clone();
                self.phase = SessionPhase::Ready;
                Step::Handshake {
                    serialization,
                    tls: tls.unwrap_or(false),
                    name,
                }
            }

            (SessionPhase::New, _) => {
                Step::Reply(command::error_reply("handshake required"))
            }

            (SessionPhase::Ready, Command::Handshake { .. }) => {
                Step::Reply(command::error_reply("handshake already completed"))
            }

            (SessionPhase::Ready, cmd) => Step::Dispatch(cmd),

            (SessionPhase::Closing, _) => {
                Step::Reply(command::error_reply("session is closing"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parse_command;
    use serde_json::{json, Value};

    fn advance(session: &mut Session, v: Value) -> Step {
        let meta = match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        session.advance(parse_command(&meta))
    }

    #[test]
    fn handshake_first_then_ready() {
        let mut s = Session::new();
        assert_eq!(s.phase(), SessionPhase::New);

        let step = advance(
            &mut s,
            json!({"command": "handshake", "serialization": "pickle", "tls": false}),
        );
        match step {
            Step::Handshake { serialization, tls, name } => {
                assert_eq!(serialization, "pickle");
                assert!(!tls);
                assert!(name.is_none());
            }
            other => panic!("expected handshake step, got {other:?}"),
        }
        assert_eq!(s.phase(), SessionPhase::Ready);
        assert_eq!(s.serialization(), "pickle");
    }

    #[test]
    fn serialization_defaults_to_matlab() {
        let mut s = Session::new();
        match advance(&mut s, json!({"command": "handshake"})) {
            Step::Handshake { serialization, .. } => assert_eq!(serialization, "matlab"),
            other => panic!("expected handshake step, got {other:?}"),
        }
    }

    #[test]
    fn commands_before_handshake_are_refused() {
        let mut s = Session::new();
        match advance(&mut s, json!({"command": "devices"})) {
            Step::Reply(m) => {
                assert_eq!(m["status"], -1);
                assert_eq!(m["error"], "handshake required");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
        // Still waiting for a handshake.
        assert_eq!(s.phase(), SessionPhase::New);
        assert!(matches!(
            advance(&mut s, json!({"command": "handshake"})),
            Step::Handshake { .. }
        ));
    }

    #[test]
    fn second_handshake_is_refused_but_session_survives() {
        let mut s = Session::new();
        advance(&mut s, json!({"command": "handshake"}));

        match advance(&mut s, json!({"command": "handshake"})) {
            Step::Reply(m) => assert_eq!(m["status"], -1),
            other => panic!("expected error reply, got {other:?}"),
        }
        assert_eq!(s.phase(), SessionPhase::Ready);
        assert!(matches!(
            advance(&mut s, json!({"command": "wait"})),
            Step::Dispatch(Command::Wait)
        ));
    }

    #[test]
    fn parse_errors_do_not_change_state() {
        let mut s = Session::new();
        advance(&mut s, json!({"command": "handshake"}));

        match advance(&mut s, json!({"command": "warp-core-breach"})) {
            Step::Reply(m) => {
                assert_eq!(m["status"], -1);
                assert_eq!(m["error"], "unknown command 'warp-core-breach'");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
        assert_eq!(s.phase(), SessionPhase::Ready);
    }

    #[test]
    fn closing_refuses_everything() {
        let mut s = Session::new();
        advance(&mut s, json!({"command": "handshake"}));
        s.close();

        match advance(&mut s, json!({"command": "devices"})) {
            Step::Reply(m) => assert_eq!(m["status"], -1),
            other => panic!("expected error reply, got {other:?}"),
        }
    }
}
