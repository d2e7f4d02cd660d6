//! # DiME
//!
//! A distributed messaging exchange: heterogeneous scientific compute
//! clients share opaque variable payloads through this central broker.
//!
//! ## Architecture
//!
//! The broker is structured as a **messaging kernel** with clean layering:
//!
//! - **`dime-core`**: registry hub, group table, mailboxes, endpoints
//! - **`dime-proto`**: pure sans-IO wire protocol (framing, commands,
//!   session state machine)
//! - **`dime`**: listener/acceptor, per-connection actors, CLI
//!   (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dime::{Server, ServerConfig};
//! use dime_core::endpoint::Endpoint;
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default());
//!     server.bind(&Endpoint::parse("tcp:127.0.0.1:5000")?).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design
//!
//! - **One actor pair per connection**: a read pump that only moves
//!   bytes off the socket, and a dispatcher that decodes frames, runs
//!   the protocol state machine, and answers.
//! - **One registry hub**: every membership mutation and every fanout
//!   goes through a single serialized task, so registry operations are
//!   linearizable without locks.
//! - **Zero-copy fanout**: payloads are refcounted `Bytes` shared by
//!   every recipient mailbox; the broker never reads payload bytes.

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::future_not_send)] // Runtime design: futures are not required to be Send

pub mod dev_tracing;
pub mod server;

mod session;

pub use dime_core::config::{FrameLimits, MailboxLimits, ServerConfig};
pub use dime_core::endpoint::Endpoint;
pub use dime_core::monitor::{ServerEvent, ServerMonitor};
pub use server::{Server, ServerHandle};
