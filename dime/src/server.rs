//! Listener / acceptor.
//!
//! Binds any number of `tcp:` / `ipc:` endpoints, runs one accept loop
//! per listener, and hands every accepted stream to a fresh session
//! actor pair. A single registry hub serves all sessions.

use compio::net::TcpListener;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info};

#[cfg(unix)]
use compio::net::UnixListener;
#[cfg(unix)]
use std::path::PathBuf;

use dime_core::config::ServerConfig;
use dime_core::endpoint::Endpoint;
use dime_core::error::{DimeError, Result};
use dime_core::monitor::{create_monitor, ServerEvent, ServerEventSender, ServerMonitor};
use dime_core::registry::hub::{RegistryHandle, RegistryHub};
use dime_core::tcp::enable_tcp_nodelay;

use crate::session::spawn_session;

/// The DiME broker server.
///
/// Bind endpoints first, then take a [`handle`](Server::handle) if you
/// need to stop it later, then [`run`](Server::run).
pub struct Server {
    config: ServerConfig,
    hub: Option<RegistryHub>,
    registry: RegistryHandle,
    tcp: Vec<(TcpListener, flume::Receiver<()>)>,
    #[cfg(unix)]
    unix: Vec<(UnixListener, PathBuf, flume::Receiver<()>)>,
    bound: Vec<Endpoint>,
    shutdown_txs: Vec<flume::Sender<()>>,
    monitor_tx: Option<ServerEventSender>,
}

impl Server {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (hub, registry) = RegistryHub::new(config.mailbox_limits.clone());
        Self {
            config,
            hub: Some(hub),
            registry,
            tcp: Vec::new(),
            #[cfg(unix)]
            unix: Vec::new(),
            bound: Vec::new(),
            shutdown_txs: Vec::new(),
            monitor_tx: None,
        }
    }

    /// Attach a lifecycle event monitor (bind/accept/session-closed).
    pub fn monitor(&mut self) -> ServerMonitor {
        let (tx, rx) = create_monitor();
        self.monitor_tx = Some(tx);
        rx
    }

    /// Bind one endpoint. May be called repeatedly before [`run`](Server::run).
    pub async fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = match TcpListener::bind(*addr).await {
                    Ok(l) => l,
                    Err(err) => return Err(self.bind_failed(endpoint.clone(), err)),
                };
                let local = Endpoint::Tcp(listener.local_addr()?);
                info!(endpoint = %local, "listening");
                self.emit(ServerEvent::Bound(local.clone()));
                self.bound.push(local);

                let (tx, rx) = flume::bounded(1);
                self.shutdown_txs.push(tx);
                self.tcp.push((listener, rx));
                Ok(())
            }

            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let listener = match dime_core::ipc::bind(path).await {
                    Ok(l) => l,
                    Err(err) => return Err(self.bind_failed(endpoint.clone(), err)),
                };
                info!(endpoint = %endpoint, "listening");
                self.emit(ServerEvent::Bound(endpoint.clone()));
                self.bound.push(endpoint.clone());

                let (tx, rx) = flume::bounded(1);
                self.shutdown_txs.push(tx);
                self.unix.push((listener, path.clone(), rx));
                Ok(())
            }
        }
    }

    fn bind_failed(&self, endpoint: Endpoint, err: std::io::Error) -> DimeError {
        error!(endpoint = %endpoint, error = %err, "bind failed");
        self.emit(ServerEvent::BindFailed {
            endpoint,
            reason: err.to_string(),
        });
        DimeError::Io(err)
    }

    /// Endpoints actually bound, with ephemeral TCP ports resolved.
    #[must_use]
    pub fn local_endpoints(&self) -> &[Endpoint] {
        &self.bound
    }

    /// Handle for stopping the server. Take it after the last `bind`.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            signals: self.shutdown_txs.clone(),
        }
    }

    /// Serve until every accept loop has been told to stop.
    ///
    /// The registry hub keeps running while any session is alive, so
    /// in-flight requests finish best-effort after shutdown.
    pub async fn run(mut self) -> Result<()> {
        if self.tcp.is_empty() {
            #[cfg(unix)]
            let no_listeners = self.unix.is_empty();
            #[cfg(not(unix))]
            let no_listeners = true;
            if no_listeners {
                return Err(DimeError::protocol("no listeners bound"));
            }
        }

        let hub = self
            .hub
            .take()
            .ok_or_else(|| DimeError::protocol("server already running"))?;
        compio::runtime::spawn(hub.run()).detach();

        let mut loops: Vec<LocalBoxFuture<'static, ()>> = Vec::new();

        for (listener, shutdown) in self.tcp.drain(..) {
            loops.push(
                tcp_accept_loop(
                    listener,
                    self.registry.clone(),
                    self.config.clone(),
                    shutdown,
                    self.monitor_tx.clone(),
                )
                .boxed_local(),
            );
        }

        #[cfg(unix)]
        for (listener, path, shutdown) in self.unix.drain(..) {
            loops.push(
                unix_accept_loop(
                    listener,
                    path,
                    self.registry.clone(),
                    self.config.clone(),
                    shutdown,
                    self.monitor_tx.clone(),
                )
                .boxed_local(),
            );
        }

        futures::future::join_all(loops).await;
        info!("broker stopped accepting connections");
        Ok(())
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.monitor_tx {
            let _ = tx.send(event);
        }
    }
}

/// Stops the accept loops; existing sessions drain best-effort.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    signals: Vec<flume::Sender<()>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        for tx in &self.signals {
            let _ = tx.send(());
        }
    }
}

async fn tcp_accept_loop(
    listener: TcpListener,
    registry: RegistryHandle,
    config: ServerConfig,
    shutdown: flume::Receiver<()>,
    monitor: Option<ServerEventSender>,
) {
    loop {
        // Accept futures are not Unpin; box them for select.
        futures::select! {
            accepted = listener.accept().boxed_local().fuse() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(err) = enable_tcp_nodelay(&stream) {
                        debug!(peer = %addr, error = %err, "could not set TCP_NODELAY");
                    }
                    let peer = addr.to_string();
                    debug!(peer = %peer, "accepted tcp connection");
                    if let Some(tx) = &monitor {
                        let _ = tx.send(ServerEvent::Accepted { peer: peer.clone() });
                    }
                    spawn_session(
                        stream,
                        registry.clone(),
                        config.frame_limits.clone(),
                        peer,
                        monitor.clone(),
                    );
                }
                Err(err) => {
                    error!(error = %err, "tcp accept failed");
                }
            },
            _ = shutdown.recv_async().fuse() => break,
        }
    }
    debug!("tcp accept loop stopped");
}

#[cfg(unix)]
async fn unix_accept_loop(
    listener: UnixListener,
    path: PathBuf,
    registry: RegistryHandle,
    config: ServerConfig,
    shutdown: flume::Receiver<()>,
    monitor: Option<ServerEventSender>,
) {
    loop {
        futures::select! {
            accepted = listener.accept().boxed_local().fuse() => match accepted {
                Ok((stream, _addr)) => {
                    let peer = format!("ipc:{}", path.display());
                    debug!(peer = %peer, "accepted unix connection");
                    if let Some(tx) = &monitor {
                        let _ = tx.send(ServerEvent::Accepted { peer: peer.clone() });
                    }
                    spawn_session(
                        stream,
                        registry.clone(),
                        config.frame_limits.clone(),
                        peer,
                        monitor.clone(),
                    );
                }
                Err(err) => {
                    error!(error = %err, "unix accept failed");
                }
            },
            _ = shutdown.recv_async().fuse() => break,
        }
    }
    let _ = std::fs::remove_file(&path);
    debug!(path = %path.display(), "unix accept loop stopped");
}
