//! Broker registry hub.
//!
//! Responsibilities:
//! - Directory of all live, handshake-complete clients.
//! - Group membership (forward table + per-client reverse list).
//! - Fanout routing: enqueue one envelope reference per recipient.
//! - Wake clients blocked on `wait` when their mailbox becomes non-empty.
//!
//! Concurrency model:
//! - Single-threaded async task; every operation arrives as a
//!   `RegistryCmd` over one flume channel and is handled to completion
//!   before the next, so all registry operations are linearizable.
//! - No locks anywhere; the routing snapshot and the mailbox appends
//!   happen inside one hub turn.

use flume::{Receiver, Sender};
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::MailboxLimits;
use crate::envelope::Envelope;
use crate::error::{DimeError, Result};
use crate::mailbox::Mailbox;
use crate::registry::groups::{ClientId, GroupTable};

/// Requests from client sessions to the hub.
#[derive(Debug)]
pub enum RegistryCmd {
    /// Admit a handshake-complete client and assign it an id.
    Register {
        name: Option<String>,
        serialization: String,
        reply: Sender<ClientId>,
    },
    /// Remove a client: leave all groups, discard its mailbox, release
    /// any waiter.
    Unregister { id: ClientId },
    Join {
        id: ClientId,
        groups: Vec<String>,
        reply: Sender<()>,
    },
    Leave {
        id: ClientId,
        groups: Vec<String>,
        reply: Sender<()>,
    },
    /// Enqueue into every current member of `group` except the sender.
    /// Replies with the number of recipients.
    RouteGroup {
        sender: ClientId,
        group: String,
        envelope: Envelope,
        reply: Sender<usize>,
    },
    /// Enqueue into every registered client except the sender.
    RouteBroadcast {
        sender: ClientId,
        envelope: Envelope,
        reply: Sender<usize>,
    },
    /// Remove up to `n` envelopes (`n < 0` = all) from the client's
    /// mailbox.
    Drain {
        id: ClientId,
        n: i64,
        reply: Sender<Vec<Envelope>>,
    },
    /// Reply with the mailbox length once it is non-empty. The reply is
    /// deferred when the mailbox is empty.
    Wait { id: ClientId, reply: Sender<usize> },
    /// Discard a deferred `Wait` (the waiting connection went away).
    CancelWait { id: ClientId },
    /// Reply with the names of all non-empty groups.
    Devices { reply: Sender<Vec<String>> },
}

#[derive(Debug)]
struct ClientEntry {
    name: Option<String>,
    serialization: String,
    mailbox: Mailbox,
    /// Reverse index: groups this client belongs to. Kept consistent
    /// with the forward table within each hub turn.
    groups: SmallVec<[String; 4]>,
    /// Pending `wait`, fired on the empty -> non-empty transition.
    waiter: Option<Sender<usize>>,
}

/// The broker's process-global registry.
///
/// The hub does no socket I/O itself; it only mutates membership state
/// and moves already-built envelopes between mailboxes.
pub struct RegistryHub {
    clients: HashMap<ClientId, ClientEntry>,
    groups: GroupTable,
    next_id: ClientId,
    limits: MailboxLimits,
    cmd_rx: Receiver<RegistryCmd>,
}

impl RegistryHub {
    /// Create a hub and the handle sessions use to reach it.
    #[must_use]
    pub fn new(limits: MailboxLimits) -> (Self, RegistryHandle) {
        let (tx, rx) = flume::unbounded();
        let hub = Self {
            clients: HashMap::new(),
            groups: GroupTable::new(),
            next_id: 1, // reserve 0
            limits,
            cmd_rx: rx,
        };
        (hub, RegistryHandle { tx })
    }

    /// Main event loop. Returns when every handle has been dropped.
    pub async fn run(mut self) {
        while let Ok(cmd) = self.cmd_rx.recv_async().await {
            self.on_cmd(cmd);
        }
        debug!("registry hub shutting down");
    }

    fn on_cmd(&mut self, cmd: RegistryCmd) {
        match cmd {
            RegistryCmd::Register {
                name,
                serialization,
                reply,
            } => {
                let id = self.next_id;
                self.next_id += 1;
                self.clients.insert(
                    id,
                    ClientEntry {
                        name,
                        serialization,
                        mailbox: Mailbox::new(self.limits.clone()),
                        groups: SmallVec::new(),
                        waiter: None,
                    },
                );
                debug!(client = id, "registered client");
                let _ = reply.send(id);
            }

            RegistryCmd::Unregister { id } => {
                if let Some(entry) = self.clients.remove(&id) {
                    for group in &entry.groups {
                        self.groups.leave(group, id);
                    }
                    debug_assert!(
                        entry.groups.iter().all(|g| !self.groups.is_member(g, id)),
                        "client {id} still listed in a group after unregister"
                    );
                    // Dropping the entry discards the mailbox and closes
                    // any deferred waiter, releasing a blocked `wait`.
                    debug!(
                        client = id,
                        name = entry.name.as_deref().unwrap_or(""),
                        "unregistered client"
                    );
                }
            }

            RegistryCmd::Join { id, groups, reply } => {
                if let Some(entry) = self.clients.get_mut(&id) {
                    for group in &groups {
                        self.groups.join(group, id);
                        if !entry.groups.iter().any(|g| g == group) {
                            entry.groups.push(group.clone());
                        }
                    }
                    trace!(client = id, ?groups, "joined groups");
                }
                let _ = reply.send(());
            }

            RegistryCmd::Leave { id, groups, reply } => {
                if let Some(entry) = self.clients.get_mut(&id) {
                    for group in &groups {
                        self.groups.leave(group, id);
                        if let Some(pos) = entry.groups.iter().position(|g| g == group) {
                            entry.groups.swap_remove(pos);
                        }
                    }
                    trace!(client = id, ?groups, "left groups");
                }
                let _ = reply.send(());
            }

            RegistryCmd::RouteGroup {
                sender,
                group,
                envelope,
                reply,
            } => {
                // Recipient snapshot and mailbox appends happen in this
                // one turn: nothing can join or leave in between.
                let members = self.groups.members_of(&group);
                let mut delivered = 0usize;
                for member in members {
                    if member != sender {
                        self.enqueue(member, envelope.clone());
                        delivered += 1;
                    }
                }
                trace!(sender, group, delivered, "routed group message");
                let _ = reply.send(delivered);
            }

            RegistryCmd::RouteBroadcast {
                sender,
                envelope,
                reply,
            } => {
                let recipients: SmallVec<[ClientId; 8]> = self
                    .clients
                    .keys()
                    .copied()
                    .filter(|id| *id != sender)
                    .collect();
                let delivered = recipients.len();
                for id in recipients {
                    self.enqueue(id, envelope.clone());
                }
                trace!(sender, delivered, "routed broadcast");
                let _ = reply.send(delivered);
            }

            RegistryCmd::Drain { id, n, reply } => {
                let envelopes = match self.clients.get_mut(&id) {
                    Some(entry) => entry.mailbox.drain(n),
                    None => Vec::new(),
                };
                let _ = reply.send(envelopes);
            }

            RegistryCmd::Wait { id, reply } => {
                if let Some(entry) = self.clients.get_mut(&id) {
                    if entry.mailbox.is_empty() {
                        entry.waiter = Some(reply);
                    } else {
                        let _ = reply.send(entry.mailbox.len());
                    }
                }
                // Unknown client: drop the reply sender, waking the caller
                // with a closed channel.
            }

            RegistryCmd::CancelWait { id } => {
                if let Some(entry) = self.clients.get_mut(&id) {
                    entry.waiter = None;
                }
            }

            RegistryCmd::Devices { reply } => {
                let _ = reply.send(self.groups.names());
            }
        }
    }

    fn enqueue(&mut self, id: ClientId, envelope: Envelope) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.mailbox.push(envelope);
            if let Some(waiter) = entry.waiter.take() {
                let _ = waiter.send(entry.mailbox.len());
            }
        }
    }
}

/// Cloneable handle sessions use to talk to the hub.
///
/// Every request-shaped method sends one command and awaits its
/// `bounded(1)` reply channel.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: Sender<RegistryCmd>,
}

impl RegistryHandle {
    fn send(&self, cmd: RegistryCmd) -> Result<()> {
        self.tx.send(cmd).map_err(|_| DimeError::RegistrySend)
    }

    async fn recv<T>(rx: Receiver<T>) -> Result<T> {
        rx.recv_async().await.map_err(|_| DimeError::RegistryRecv)
    }

    pub async fn register(&self, name: Option<String>, serialization: String) -> Result<ClientId> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::Register {
            name,
            serialization,
            reply,
        })?;
        Self::recv(rx).await
    }

    /// Fire-and-forget: the session is going away and cannot await.
    pub fn unregister(&self, id: ClientId) {
        let _ = self.send(RegistryCmd::Unregister { id });
    }

    pub async fn join(&self, id: ClientId, groups: Vec<String>) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::Join { id, groups, reply })?;
        Self::recv(rx).await
    }

    pub async fn leave(&self, id: ClientId, groups: Vec<String>) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::Leave { id, groups, reply })?;
        Self::recv(rx).await
    }

    pub async fn route_group(
        &self,
        sender: ClientId,
        group: String,
        envelope: Envelope,
    ) -> Result<usize> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::RouteGroup {
            sender,
            group,
            envelope,
            reply,
        })?;
        Self::recv(rx).await
    }

    pub async fn route_broadcast(&self, sender: ClientId, envelope: Envelope) -> Result<usize> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::RouteBroadcast {
            sender,
            envelope,
            reply,
        })?;
        Self::recv(rx).await
    }

    pub async fn drain(&self, id: ClientId, n: i64) -> Result<Vec<Envelope>> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::Drain { id, n, reply })?;
        Self::recv(rx).await
    }

    /// Issue a `wait`; the returned channel resolves once the mailbox is
    /// non-empty. The caller races it against connection teardown and
    /// calls [`cancel_wait`](Self::cancel_wait) if the connection wins.
    pub fn wait(&self, id: ClientId) -> Result<Receiver<usize>> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::Wait { id, reply })?;
        Ok(rx)
    }

    pub fn cancel_wait(&self, id: ClientId) {
        let _ = self.send(RegistryCmd::CancelWait { id });
    }

    pub async fn devices(&self) -> Result<Vec<String>> {
        let (reply, rx) = flume::bounded(1);
        self.send(RegistryCmd::Devices { reply })?;
        Self::recv(rx).await
    }
}
