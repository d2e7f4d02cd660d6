//! Command parsing and reply building.
//!
//! Every request frame carries a JSON object whose `command` field
//! selects the operation; the binary portion is opaque payload. Parse
//! failures here are *protocol* errors: the broker answers
//! `{status: -1, error}` and the session stays up, in contrast to
//! framing errors which kill the connection.

use serde_json::{Map, Value};
use thiserror::Error;

/// The metadata object of a frame.
pub type MetaMap = Map<String, Value>;

/// Recoverable protocol errors; `Display` is the wire `error` string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

/// A parsed client request.
///
/// `Send`/`Broadcast` do not carry their metadata here; the dispatcher
/// keeps the original map so delivery replays it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Handshake {
        serialization: Option<String>,
        tls: Option<bool>,
        name: Option<String>,
    },
    Join {
        groups: Vec<String>,
    },
    Leave {
        groups: Vec<String>,
    },
    Send {
        group: String,
    },
    Broadcast,
    Sync {
        n: i64,
    },
    Wait,
    Devices,
}

/// Parse the metadata object of a request frame.
pub fn parse_command(meta: &MetaMap) -> Result<Command, CommandError> {
    let command = required_str(meta, "command")?;

    match command {
        "handshake" => Ok(Command::Handshake {
            serialization: optional_str(meta, "serialization")?,
            tls: optional_bool(meta, "tls")?,
            name: optional_str(meta, "name")?,
        }),
        "join" => Ok(Command::Join {
            groups: name_list(meta)?,
        }),
        "leave" => Ok(Command::Leave {
            groups: name_list(meta)?,
        }),
        "send" => {
            let group = required_str(meta, "name")?.to_string();
            required_str(meta, "varname")?;
            required_str(meta, "serialization")?;
            Ok(Command::Send { group })
        }
        "broadcast" => {
            required_str(meta, "varname")?;
            required_str(meta, "serialization")?;
            Ok(Command::Broadcast)
        }
        "sync" => {
            // Absent `n` means "drain everything", same as the documented -1.
            let n = match meta.get("n") {
                None | Some(Value::Null) => -1,
                Some(v) => v.as_i64().ok_or(CommandError::WrongType("n"))?,
            };
            Ok(Command::Sync { n })
        }
        "wait" => Ok(Command::Wait),
        "devices" => Ok(Command::Devices),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

/// `name` accepts a single group or an array of groups.
fn name_list(meta: &MetaMap) -> Result<Vec<String>, CommandError> {
    match meta.get("name") {
        None => Err(CommandError::MissingField("name")),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or(CommandError::WrongType("name"))
            })
            .collect(),
        Some(_) => Err(CommandError::WrongType("name")),
    }
}

fn required_str<'a>(meta: &'a MetaMap, field: &'static str) -> Result<&'a str, CommandError> {
    match meta.get(field) {
        None => Err(CommandError::MissingField(field)),
        Some(v) => v.as_str().ok_or(CommandError::WrongType(field)),
    }
}

fn optional_str(meta: &MetaMap, field: &'static str) -> Result<Option<String>, CommandError> {
    match meta.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or(CommandError::WrongType(field)),
    }
}

fn optional_bool(meta: &MetaMap, field: &'static str) -> Result<Option<bool>, CommandError> {
    match meta.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or(CommandError::WrongType(field)),
    }
}

// ---------------------------------------------------------------------
// Reply builders. `status` 0 = ok, negative = error, positive = meta.
// ---------------------------------------------------------------------

/// `{status: 0}` - also the sync sentinel (no `varname` field).
#[must_use]
pub fn ok() -> MetaMap {
    let mut m = MetaMap::new();
    m.insert("status".into(), 0.into());
    m
}

/// `{status: -1, error: msg}`
#[must_use]
pub fn error_reply(msg: &str) -> MetaMap {
    let mut m = MetaMap::new();
    m.insert("status".into(), (-1).into());
    m.insert("error".into(), msg.into());
    m
}

/// Handshake acknowledgement carrying the negotiated label.
#[must_use]
pub fn handshake_ok(serialization: &str) -> MetaMap {
    let mut m = ok();
    m.insert("serialization".into(), serialization.into());
    m
}

/// `wait` reply: mailbox length at wake.
#[must_use]
pub fn wait_ok(n: usize) -> MetaMap {
    let mut m = ok();
    m.insert("n".into(), n.into());
    m
}

/// `devices` reply: names of all non-empty groups.
#[must_use]
pub fn devices_ok(names: &[String]) -> MetaMap {
    let mut m = ok();
    m.insert(
        "devices".into(),
        Value::Array(names.iter().map(|n| Value::String(n.clone())).collect()),
    );
    m
}

/// Terminator of a `sync` envelope stream.
#[must_use]
pub fn sentinel() -> MetaMap {
    ok()
}

/// Out-of-band broker-to-client frame: `status > 0`, `meta: true`.
///
/// Reserved by the protocol (e.g. to renegotiate the serialization
/// label); clients consume these transparently before their real reply.
#[must_use]
pub fn meta_frame(status: i64, fields: MetaMap) -> MetaMap {
    debug_assert!(status > 0, "meta frames use positive status");
    let mut m = MetaMap::new();
    m.insert("status".into(), status.into());
    m.insert("meta".into(), true.into());
    for (k, v) in fields {
        m.insert(k, v);
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> MetaMap {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn parse_handshake_with_defaults() {
        let cmd = parse_command(&meta(json!({"command": "handshake"}))).unwrap();
        assert_eq!(
            cmd,
            Command::Handshake {
                serialization: None,
                tls: None,
                name: None,
            }
        );
    }

    #[test]
    fn parse_handshake_full() {
        let cmd = parse_command(&meta(json!({
            "command": "handshake",
            "serialization": "pickle",
            "tls": false,
            "name": "workspace-1",
        })))
        .unwrap();
        assert_eq!(
            cmd,
            Command::Handshake {
                serialization: Some("pickle".into()),
                tls: Some(false),
                name: Some("workspace-1".into()),
            }
        );
    }

    #[test]
    fn join_accepts_string_or_array() {
        let one = parse_command(&meta(json!({"command": "join", "name": "g1"}))).unwrap();
        assert_eq!(
            one,
            Command::Join {
                groups: vec!["g1".into()]
            }
        );

        let many =
            parse_command(&meta(json!({"command": "leave", "name": ["g1", "g2"]}))).unwrap();
        assert_eq!(
            many,
            Command::Leave {
                groups: vec!["g1".into(), "g2".into()]
            }
        );

        let empty = parse_command(&meta(json!({"command": "join", "name": []}))).unwrap();
        assert_eq!(empty, Command::Join { groups: vec![] });
    }

    #[test]
    fn join_without_name_is_a_protocol_error() {
        let err = parse_command(&meta(json!({"command": "join"}))).unwrap_err();
        assert_eq!(err, CommandError::MissingField("name"));
    }

    #[test]
    fn send_requires_routing_fields() {
        let ok = parse_command(&meta(json!({
            "command": "send", "name": "g1", "varname": "x", "serialization": "matlab"
        })))
        .unwrap();
        assert_eq!(ok, Command::Send { group: "g1".into() });

        let err = parse_command(&meta(json!({"command": "send", "varname": "x", "serialization": "matlab"})));
        assert_eq!(err.unwrap_err(), CommandError::MissingField("name"));

        let err = parse_command(&meta(json!({"command": "send", "name": "g1", "serialization": "matlab"})));
        assert_eq!(err.unwrap_err(), CommandError::MissingField("varname"));
    }

    #[test]
    fn sync_defaults_to_drain_all() {
        assert_eq!(
            parse_command(&meta(json!({"command": "sync"}))).unwrap(),
            Command::Sync { n: -1 }
        );
        assert_eq!(
            parse_command(&meta(json!({"command": "sync", "n": 3}))).unwrap(),
            Command::Sync { n: 3 }
        );
        assert_eq!(
            parse_command(&meta(json!({"command": "sync", "n": "three"}))).unwrap_err(),
            CommandError::WrongType("n")
        );
    }

    #[test]
    fn unknown_command_names_the_offender() {
        let err = parse_command(&meta(json!({"command": "frobnicate"}))).unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'frobnicate'");
    }

    #[test]
    fn missing_command_field() {
        let err = parse_command(&meta(json!({"name": "g1"}))).unwrap_err();
        assert_eq!(err, CommandError::MissingField("command"));
    }

    #[test]
    fn replies_have_the_documented_shape() {
        assert_eq!(ok()["status"], 0);

        let e = error_reply("nope");
        assert_eq!(e["status"], -1);
        assert_eq!(e["error"], "nope");

        let h = handshake_ok("matlab");
        assert_eq!(h["serialization"], "matlab");

        let w = wait_ok(3);
        assert_eq!(w["n"], 3);

        let d = devices_ok(&["g1".to_string(), "g2".to_string()]);
        assert_eq!(d["devices"], json!(["g1", "g2"]));

        // The sentinel must not carry a varname: that is how clients
        // tell it apart from an envelope frame.
        assert!(!sentinel().contains_key("varname"));
    }

    #[test]
    fn meta_frames_are_marked() {
        let mut fields = MetaMap::new();
        fields.insert("serialization".into(), "dimeb".into());
        let m = meta_frame(1, fields);
        assert_eq!(m["status"], 1);
        assert_eq!(m["meta"], true);
        assert_eq!(m["serialization"], "dimeb");
    }
}
