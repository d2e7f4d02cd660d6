//! Per-connection actors.
//!
//! One connection == two cooperating tasks sharing the stream:
//!
//! - **Read pump**: moves bytes from the kernel into a flume channel and
//!   nothing else. Exits on EOF or read error, which closes the channel.
//! - **Dispatcher**: decodes frames, drives the protocol state machine,
//!   talks to the registry, and writes every outbound frame. Owning the
//!   whole write side keeps per-session outbound order equal to write
//!   order.
//!
//! The split exists for `wait`: the dispatcher must block the request
//! side until the mailbox fills, yet still notice the peer hanging up.
//! It races the registry's deferred reply against the inbound byte
//! channel - both flume receivers, both cancel-safe - so no in-flight
//! socket read is ever dropped.

use std::rc::Rc;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite};
use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use dime_core::config::FrameLimits;
use dime_core::envelope::Envelope;
use dime_core::error::{DimeError, Result};
use dime_core::monitor::{ServerEvent, ServerEventSender};
use dime_core::registry::groups::ClientId;
use dime_core::registry::hub::RegistryHandle;
use dime_proto::codec::{self, Frame, FrameDecoder};
use dime_proto::command::{self, parse_command, Command, MetaMap};
use dime_proto::{RecvBuffer, Session, Step};

/// Bytes requested per socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Chunks buffered between the read pump and the dispatcher before the
/// pump stops reading (TCP backpressure takes over from there).
const INBOUND_DEPTH: usize = 32;

/// Whether to keep serving this connection after a frame.
enum Flow {
    Continue,
    Close,
}

/// Spawn the actor pair for one accepted connection.
pub(crate) fn spawn_session<S>(
    stream: S,
    registry: RegistryHandle,
    limits: FrameLimits,
    peer: String,
    monitor: Option<ServerEventSender>,
) where
    S: 'static,
    for<'a> &'a S: AsyncRead + AsyncWrite,
{
    let stream = Rc::new(stream);
    let (chunk_tx, chunk_rx) = flume::bounded(INBOUND_DEPTH);

    compio::runtime::spawn(read_pump(Rc::clone(&stream), chunk_tx)).detach();

    let dispatcher = Dispatcher {
        stream,
        inbound: chunk_rx,
        registry,
        limits,
        peer,
        monitor,
    };
    compio::runtime::spawn(dispatcher.run()).detach();
}

/// Kernel -> channel. No protocol knowledge, no registry access.
async fn read_pump<S>(stream: Rc<S>, tx: flume::Sender<Bytes>)
where
    for<'a> &'a S: AsyncRead,
{
    let mut reader = &*stream;
    loop {
        let buf = Vec::with_capacity(READ_CHUNK);
        let BufResult(res, buf) = reader.read(buf).await;
        match res {
            Ok(0) => break,
            Ok(_) => {
                if tx.send_async(Bytes::from(buf)).await.is_err() {
                    // Dispatcher is gone; stop reading.
                    break;
                }
            }
            Err(err) => {
                trace!(error = %err, "socket read failed");
                break;
            }
        }
    }
    // Dropping `tx` signals EOF to the dispatcher.
}

struct Dispatcher<S> {
    stream: Rc<S>,
    inbound: flume::Receiver<Bytes>,
    registry: RegistryHandle,
    limits: FrameLimits,
    peer: String,
    monitor: Option<ServerEventSender>,
}

impl<S> Dispatcher<S>
where
    S: 'static,
    for<'a> &'a S: AsyncRead + AsyncWrite,
{
    async fn run(self) {
        let mut recv = RecvBuffer::new();
        let mut decoder = FrameDecoder::new(self.limits.clone());
        let mut session = Session::new();
        let mut client: Option<ClientId> = None;

        'conn: loop {
            // Serve every complete frame already buffered, in order.
            loop {
                match decoder.decode(&mut recv) {
                    Ok(Some(frame)) => {
                        let outcome = self
                            .handle_frame(&mut session, &mut client, frame, &mut recv)
                            .await;
                        match outcome {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close) => break 'conn,
                            Err(err) => {
                                if !err.is_connection_error() {
                                    warn!(peer = %self.peer, error = %err, "session error");
                                }
                                break 'conn;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // Framing violation: close without a reply.
                        warn!(peer = %self.peer, error = %err, "framing error, closing connection");
                        break 'conn;
                    }
                }
            }

            match self.inbound.recv_async().await {
                Ok(chunk) => recv.push(chunk),
                Err(_) => {
                    if decoder.is_mid_frame() || !recv.is_empty() {
                        warn!(peer = %self.peer, "connection truncated mid-frame");
                    }
                    break 'conn;
                }
            }
        }

        session.close();
        if let Some(id) = client {
            self.registry.unregister(id);
        }
        debug!(peer = %self.peer, "session closed");
        if let Some(tx) = &self.monitor {
            let _ = tx.send(ServerEvent::SessionClosed {
                peer: self.peer.clone(),
            });
        }
    }

    async fn handle_frame(
        &self,
        session: &mut Session,
        client: &mut Option<ClientId>,
        frame: Frame,
        recv: &mut RecvBuffer,
    ) -> Result<Flow> {
        match session.advance(parse_command(&frame.meta)) {
            Step::Reply(reply) => {
                self.write_reply(reply).await?;
                Ok(Flow::Continue)
            }

            Step::Handshake {
                serialization,
                tls,
                name,
            } => {
                let id = self.registry.register(name, serialization.clone()).await?;
                *client = Some(id);
                debug!(
                    peer = %self.peer,
                    client = id,
                    serialization = %serialization,
                    tls,
                    "handshake complete"
                );
                self.write_reply(command::handshake_ok(&serialization))
                    .await?;
                Ok(Flow::Continue)
            }

            Step::Dispatch(cmd) => {
                let Some(id) = *client else {
                    // Ready without a registration is a broker bug.
                    error!(peer = %self.peer, "command dispatched before registration");
                    return Ok(Flow::Close);
                };
                self.dispatch(id, cmd, frame, recv).await
            }
        }
    }

    async fn dispatch(
        &self,
        id: ClientId,
        cmd: Command,
        frame: Frame,
        recv: &mut RecvBuffer,
    ) -> Result<Flow> {
        match cmd {
            Command::Join { groups } => {
                self.registry.join(id, groups).await?;
                self.write_reply(command::ok()).await?;
            }

            Command::Leave { groups } => {
                self.registry.leave(id, groups).await?;
                self.write_reply(command::ok()).await?;
            }

            Command::Send { group } => {
                let envelope = Envelope::new(id, &frame.meta, frame.payload)?;
                let delivered = self.registry.route_group(id, group, envelope).await?;
                trace!(client = id, delivered, "send routed");
                self.write_reply(command::ok()).await?;
            }

            Command::Broadcast => {
                let envelope = Envelope::new(id, &frame.meta, frame.payload)?;
                let delivered = self.registry.route_broadcast(id, envelope).await?;
                trace!(client = id, delivered, "broadcast routed");
                self.write_reply(command::ok()).await?;
            }

            Command::Sync { n } => {
                let envelopes = self.registry.drain(id, n).await?;
                for env in envelopes {
                    self.write_raw(env.meta().clone(), env.payload().clone())
                        .await?;
                }
                self.write_reply(command::sentinel()).await?;
            }

            Command::Wait => return self.serve_wait(id, recv).await,

            Command::Devices => {
                let names = self.registry.devices().await?;
                self.write_reply(command::devices_ok(&names)).await?;
            }

            Command::Handshake { .. } => {
                // Session::advance() routes handshake commands through
                // Step::Handshake, never Step::Dispatch; this arm exists
                // only to keep the match exhaustive.
                error!(peer = %self.peer, "handshake dispatched after registration");
                return Ok(Flow::Close);
            }
        }

        Ok(Flow::Continue)
    }

    /// Block the request side until the mailbox is non-empty.
    ///
    /// Bytes arriving meanwhile are buffered but not dispatched, so
    /// pipelined commands still run after the wait resolves, in order.
    async fn serve_wait(&self, id: ClientId, recv: &mut RecvBuffer) -> Result<Flow> {
        let reply_rx = self.registry.wait(id)?;

        loop {
            futures::select! {
                reply = reply_rx.recv_async().fuse() => {
                    match reply {
                        Ok(n) => {
                            self.write_reply(command::wait_ok(n)).await?;
                            return Ok(Flow::Continue);
                        }
                        // Registry dropped the waiter: broker shutdown.
                        Err(_) => return Ok(Flow::Close),
                    }
                }
                chunk = self.inbound.recv_async().fuse() => {
                    match chunk {
                        Ok(bytes) => recv.push(bytes),
                        Err(_) => {
                            // Peer hung up mid-wait: exit without a reply.
                            self.registry.cancel_wait(id);
                            return Ok(Flow::Close);
                        }
                    }
                }
            }
        }
    }

    async fn write_reply(&self, reply: MetaMap) -> Result<()> {
        let meta = codec::encode_meta(&reply).map_err(|e| DimeError::framing(e.to_string()))?;
        self.write_raw(meta, Bytes::new()).await
    }

    async fn write_raw(&self, meta: Bytes, payload: Bytes) -> Result<()> {
        let mut writer = &*self.stream;
        codec::write_frame(&mut writer, meta, payload)
            .await
            .map_err(DimeError::from)
    }
}
