//! # DiME Protocol
//!
//! Sans-IO implementation of the DiME wire protocol:
//!
//! - **Framing** (`codec`): 12-byte `DiME` header + JSON metadata +
//!   opaque payload, decoded incrementally from read chunks.
//! - **Commands** (`command`): typed views over the metadata object and
//!   builders for the broker's reply maps.
//! - **Session** (`session`): the per-client state machine that enforces
//!   handshake-first ordering and classifies commands for the I/O layer.
//!
//! The protocol layer never owns a socket; the one exception is
//! [`codec::write_frame`], a small helper over compio's owned-buffer
//! write path shared by the broker and its tests.

// Pedantic lints that add noise without value
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod buffer;
pub mod codec;
pub mod command;
pub mod session;

pub use buffer::RecvBuffer;
pub use codec::{Frame, FrameDecoder, FrameError};
pub use command::{Command, CommandError, MetaMap};
pub use session::{Session, SessionPhase, Step};
