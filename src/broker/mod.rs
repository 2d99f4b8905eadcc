//! Broker runtime.
//!
//! This module wires the session table, retained store, collaborator seams
//! and the accept/sweep loops into a running broker:
//! - `session_table` - live connection registry and lifecycle hooks
//! - `topics` - wildcard filter matching
//! - `retained` - last-value-wins retained storage
//! - `dispatcher` - per-connection frame routing, QoS acks and fan-out

pub mod retained;
pub mod session_table;
pub mod topics;

mod dispatcher;

pub use retained::{MemoryRetained, NoopRetained, RetainedStore};
pub use session_table::{
    NoopHooks, Session, SessionHooks, SessionSeed, SessionTable, OUTBOUND_QUEUE_DEPTH,
};
pub use topics::{has_wildcard, topic_matches, valid_filter};

use crate::core::config::BrokerConfig;
use crate::extensions::rpc::RpcRegistry;
use crate::extensions::transfer::TransferHandler;
use crate::protocol::packets::ConnectPacket;
use crate::protocol::{ConnectRefusal, ProtocolKind};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Verification callback consulted before a session is admitted. Returning
/// a refusal sends it back in the connack and closes the connection.
pub type ConnectGuard = Box<dyn Fn(&ConnectPacket) -> Option<ConnectRefusal> + Send + Sync>;

/// Shared broker state handed to every connection task.
pub(crate) struct BrokerCore {
    pub(crate) config: BrokerConfig,
    pub(crate) table: SessionTable,
    pub(crate) retained: Box<dyn RetainedStore>,
    pub(crate) hooks: Box<dyn SessionHooks>,
    pub(crate) rpc: Arc<RpcRegistry>,
    pub(crate) transfer: Option<Box<dyn TransferHandler>>,
    pub(crate) guard: Option<ConnectGuard>,
}

/// Broker under construction. Collaborators are installed before `start`.
pub struct Broker {
    config: BrokerConfig,
    retained: Box<dyn RetainedStore>,
    hooks: Box<dyn SessionHooks>,
    rpc: Arc<RpcRegistry>,
    transfer: Option<Box<dyn TransferHandler>>,
    guard: Option<ConnectGuard>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            retained: Box::new(MemoryRetained::new()),
            hooks: Box::new(NoopHooks),
            rpc: Arc::new(RpcRegistry::new()),
            transfer: None,
            guard: None,
        }
    }

    pub fn with_retained(mut self, retained: Box<dyn RetainedStore>) -> Self {
        self.retained = retained;
        self
    }

    pub fn with_hooks(mut self, hooks: Box<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_transfer(mut self, transfer: Box<dyn TransferHandler>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn with_guard(mut self, guard: ConnectGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Call registry for SyncRpc dispatch; handlers can be registered
    /// before or after start.
    pub fn rpc(&self) -> Arc<RpcRegistry> {
        self.rpc.clone()
    }

    /// Bind the listener and spawn the accept and sweep loops.
    pub async fn start(self) -> Result<BrokerHandle> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("bind {}", self.config.bind))?;
        let addr = listener.local_addr().context("listener local addr")?;

        let core = Arc::new(BrokerCore {
            config: self.config,
            table: SessionTable::new(),
            retained: self.retained,
            hooks: self.hooks,
            rpc: self.rpc,
            transfer: self.transfer,
            guard: self.guard,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(core.clone(), listener, shutdown_rx.clone()));
        tokio::spawn(sweep_loop(core.clone(), shutdown_rx));
        info!("broker listening on {addr}");

        Ok(BrokerHandle {
            addr,
            core,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle to a running broker.
pub struct BrokerHandle {
    addr: SocketAddr,
    core: Arc<BrokerCore>,
    shutdown: watch::Sender<bool>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session_count(&self) -> usize {
        self.core.table.len()
    }

    pub fn retained_count(&self) -> usize {
        self.core.retained.count()
    }

    pub fn rpc(&self) -> Arc<RpcRegistry> {
        self.core.rpc.clone()
    }

    /// Stop accepting and sweeping; existing connections drain on their own
    /// read deadlines.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    core: Arc<BrokerCore>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(dispatcher::serve_connection(core.clone(), stream, peer));
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Periodic keep-alive sweep over PubSub sessions. Removal is idempotent
/// with the connection's own teardown, so the disconnect hook fires exactly
/// once whichever path wins.
async fn sweep_loop(core: Arc<BrokerCore>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(core.config.sweep_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {}
        }
        for session in core.table.snapshot() {
            if session.kind != ProtocolKind::PubSub || !session.keep_alive_expired() {
                continue;
            }
            if core.table.remove(session.id()).is_some() {
                warn!(
                    "session {} ({}) timed out after {:?} idle",
                    session.id(),
                    session.client_id,
                    session.idle_for()
                );
                session.request_close();
                core.hooks.client_disconnected(&session);
            }
        }
    }
}
