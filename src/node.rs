//! # High-Level Node API
//!
//! A [`Node`] wires the overlay components together: the UDP transport, the
//! membership table, the dispatch engine with its built-in handlers, and the
//! two background stabilizers.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig {
//!     port: 4567,
//!     max_peers: 10,
//!     ..NodeConfig::default()
//! }).await?;
//!
//! // Seed the table, then start listening + stabilizing.
//! node.add_peer("192.168.1.20", 4568).await;
//! node.start().await?;
//!
//! // Flood an application message across the overlay.
//! node.broadcast(&Envelope::new(8, Order::Other("STATUS".into()), None)).await;
//!
//! node.shutdown().await;
//! ```
//!
//! `start()` announces the node by broadcasting a HELLO carrying its own
//! identity to the seeded peers, then spawns:
//! - the listening task, which blocks on `recv_from` and hands every
//!   datagram to a fresh dispatch task;
//! - the liveness sweep stabilizer (jittered interval);
//! - the seen-cache pruning stabilizer (fixed interval).
//!
//! All of them observe a single shutdown watch; `shutdown()` flips it and
//! waits for the loops to wind down, letting in-flight dispatch tasks
//! finish naturally.

use std::num::NonZeroUsize;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dispatch::{Dispatcher, Handler, HandlerContext};
use crate::envelope::{Envelope, Order};
use crate::handlers::{self, PROBE_TTL};
use crate::membership::{MembershipTable, NodeId};
use crate::stabilizer::{spawn_stabilizer, IntervalPolicy};
use crate::transport::{UdpTransport, MAX_DATAGRAM_SIZE};

/// Freshness window for the seen cache: ids older than this are forgotten.
pub const DEFAULT_RECENT_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the seen cache is pruned.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(45);

/// Jitter range for the liveness sweep, in seconds (3 to 10 minutes).
pub const DEFAULT_SWEEP_RANGE_SECS: RangeInclusive<u64> = 180..=600;

/// Occupancy fraction above which the sweep starts churning old entries.
pub const DEFAULT_CHURN_HIGH_WATER: f64 = 0.8;

/// Fraction of oldest entries churned when above the high-water mark.
pub const DEFAULT_CHURN_FRACTION: f64 = 0.2;

/// Hard capacity bound on the seen cache.
/// Bounds memory under flood pressure; age-based pruning does the rest.
pub const DEFAULT_SEEN_CAPACITY: usize = 65_536;

/// Node construction parameters. Orchestration supplies `max_peers`, `port`
/// and optionally `host`; the rest default to the values above.
pub struct NodeConfig {
    /// Membership capacity; 0 means unbounded.
    pub max_peers: usize,
    /// UDP port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Our reachable host address. When absent it is auto-detected by
    /// probing an outbound route (no traffic is actually sent).
    pub host: Option<String>,
    /// Hop budget for the HELLO announcement sent by `start()`.
    pub hello_ttl: i64,
    pub recent_timeout: Duration,
    pub prune_interval: Duration,
    pub sweep_interval_secs: RangeInclusive<u64>,
    pub churn_high_water: f64,
    pub churn_fraction: f64,
    pub seen_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            max_peers: 0,
            port: 0,
            host: None,
            hello_ttl: PROBE_TTL,
            recent_timeout: DEFAULT_RECENT_TIMEOUT,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            sweep_interval_secs: DEFAULT_SWEEP_RANGE_SECS,
            churn_high_water: DEFAULT_CHURN_HIGH_WATER,
            churn_fraction: DEFAULT_CHURN_FRACTION,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

/// One overlay node: owns its membership table exclusively, no state is
/// shared across node instances.
pub struct Node {
    config: NodeConfig,
    local: NodeId,
    table: Arc<MembershipTable>,
    transport: Arc<UdpTransport>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the UDP socket and assemble the node. Nothing runs until
    /// [`Node::start`].
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind(config.port)?);
        // Read the port back so `port: 0` gets the ephemeral assignment.
        let port = transport.local_addr()?.port();

        let host = match &config.host {
            Some(host) => host.clone(),
            None => detect_local_host(),
        };
        let local = NodeId::new(host, port);

        let table = Arc::new(MembershipTable::new(local.clone(), config.max_peers));
        let ctx = HandlerContext {
            local: local.clone(),
            table: table.clone(),
            transport: transport.clone(),
        };
        let seen_capacity = NonZeroUsize::new(config.seen_capacity)
            .context("seen_capacity must be non-zero")?;
        let dispatcher = Arc::new(Dispatcher::new(ctx, seen_capacity));
        handlers::register_builtin(&dispatcher).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(node = %local, max_peers = config.max_peers, "node bound");
        Ok(Node {
            config,
            local,
            table,
            transport,
            dispatcher,
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Seed the membership table. Subject to the usual self-exclusion and
    /// capacity rules; returns whether the peer was added.
    pub async fn add_peer(&self, host: &str, port: u16) -> bool {
        self.table.add(host, port).await
    }

    pub async fn peer_count(&self) -> usize {
        self.table.peer_count().await
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.table.peer_ids().await
    }

    /// Register a handler for an application-defined order. New orders
    /// extend the node without touching the dispatch engine.
    pub async fn register_handler(&self, order: Order, handler: Arc<dyn Handler>) {
        self.dispatcher.register(order, handler).await;
    }

    /// Originate a message: flood it to every current member.
    pub async fn broadcast(&self, envelope: &Envelope) {
        self.table
            .broadcast(&envelope.encode(), self.transport.as_ref())
            .await;
    }

    /// Announce ourselves to the seeded peers, then spawn the listening
    /// loop and both stabilizers. Returns immediately; the node runs in the
    /// background until [`Node::shutdown`].
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("node already started");
        }

        let hello = Envelope::new(
            self.config.hello_ttl,
            Order::Hello,
            Some(vec![self.local.host.clone(), self.local.port.to_string()]),
        );
        self.broadcast(&hello).await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_listener());
        tasks.push(self.spawn_liveness_sweep());
        tasks.push(self.spawn_cache_pruner());

        info!(node = %self.local, "node started");
        Ok(())
    }

    fn spawn_listener(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    received = transport.recv_from(&mut buf) => {
                        match received {
                            Ok((len, from)) => {
                                trace!(%from, len, "datagram received");
                                let dispatcher = dispatcher.clone();
                                let payload = buf[..len].to_vec();
                                tokio::spawn(async move {
                                    dispatcher.dispatch(&payload).await;
                                });
                            }
                            Err(e) => {
                                // Per-datagram failures never stop the loop.
                                warn!(error = %e, "receive failed");
                            }
                        }
                    }
                }
            }
            debug!("listening loop exited");
        })
    }

    fn spawn_liveness_sweep(&self) -> JoinHandle<()> {
        let table = self.table.clone();
        let transport = self.transport.clone();
        let local = self.local.clone();
        let high_water = self.config.churn_high_water;
        let churn_fraction = self.config.churn_fraction;

        spawn_stabilizer(
            "liveness-sweep",
            IntervalPolicy::JitteredSecs(self.config.sweep_interval_secs.clone()),
            self.shutdown_rx.clone(),
            move || {
                let table = table.clone();
                let transport = transport.clone();
                let local = local.clone();
                async move {
                    let evicted = table.sweep(high_water, churn_fraction).await;
                    if !evicted.is_empty() {
                        info!(?evicted, "evicted peers during liveness sweep");
                    }
                    let ping = Envelope::new(
                        PROBE_TTL,
                        Order::Ping,
                        Some(vec![local.host.clone(), local.port.to_string()]),
                    );
                    table.broadcast(&ping.encode(), transport.as_ref()).await;
                }
            },
        )
    }

    fn spawn_cache_pruner(&self) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let window = self.config.recent_timeout;

        spawn_stabilizer(
            "cache-prune",
            IntervalPolicy::Fixed(self.config.prune_interval),
            self.shutdown_rx.clone(),
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.prune_seen(window).await;
                }
            },
        )
    }

    /// Signal shutdown and wait for the listening loop and stabilizers to
    /// stop. In-flight dispatch tasks are left to finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
        info!(node = %self.local, "node stopped");
    }
}

/// Discover the host address other nodes can reach us on, by opening an
/// outbound-routed UDP socket toward a public resolver and reading back the
/// chosen local address. `connect` on UDP sends nothing; this only consults
/// the routing table. Falls back to loopback on isolated machines.
fn detect_local_host() -> String {
    for target in ["8.8.8.8:53", "1.1.1.1:53"] {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    if !local.ip().is_unspecified() && !local.ip().is_loopback() {
                        return local.ip().to_string();
                    }
                }
            }
        }
    }
    "127.0.0.1".to_string()
}
