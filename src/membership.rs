//! # Membership Table
//!
//! Each node owns exactly one [`MembershipTable`]: a bounded map from peer id
//! (`host:port`) to [`PeerEntry`], guarded by a single table-wide async mutex.
//! Every compound read-modify-write sequence (capacity check + insert,
//! liveness sweep + eviction, snapshot + broadcast fan-out) runs under one
//! lock acquisition so concurrent dispatch tasks can never observe a
//! half-applied mutation or push the table past capacity.
//!
//! Invariants:
//! - `peer_count() <= max_peers` whenever the capacity is finite.
//! - The table never contains the node's own identity.
//! - An entry exists iff the peer is currently considered a member.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::transport::Transport;

/// A node's overlay identity: the `(host, port)` pair it listens on,
/// stringified as `host:port` everywhere it crosses the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeId { host: host.into(), port }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("peer id '{s}' must be HOST:PORT"))?;
        if host.is_empty() {
            bail!("peer id '{s}' has an empty host");
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("peer id '{s}' has an invalid port"))?;
        Ok(NodeId::new(host, port))
    }
}

/// Everything the table tracks about one known peer.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    /// Armed `false` at the start of each liveness sweep; only an ALIVE
    /// reply flips it back. Still `false` at the next sweep means eviction.
    pub alive: bool,
    /// Insertion time, the age used for oldest-first eviction.
    pub time_added: Instant,
    pub host: String,
    pub port: u16,
}

impl PeerEntry {
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bounded, concurrency-safe store of known peer endpoints.
pub struct MembershipTable {
    local: NodeId,
    /// Capacity; 0 means unbounded.
    max_peers: usize,
    inner: Mutex<HashMap<String, PeerEntry>>,
}

impl MembershipTable {
    pub fn new(local: NodeId, max_peers: usize) -> Self {
        MembershipTable {
            local,
            max_peers,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Insert a peer. Refused (returning `false`) for the node's own
    /// identity or when the table is at capacity; both are non-fatal.
    pub async fn add(&self, host: &str, port: u16) -> bool {
        if host == self.local.host && port == self.local.port {
            return false;
        }

        let mut peers = self.inner.lock().await;
        if self.at_capacity(&peers) {
            debug!(peer = %format!("{host}:{port}"), "cannot add peer, table full");
            return false;
        }
        debug!(peer = %format!("{host}:{port}"), "adding peer");
        peers.insert(
            format!("{host}:{port}"),
            PeerEntry {
                alive: true,
                time_added: Instant::now(),
                host: host.to_string(),
                port,
            },
        );
        true
    }

    /// Remove a peer; benign if absent.
    pub async fn remove(&self, host: &str, port: u16) {
        let mut peers = self.inner.lock().await;
        peers.remove(&format!("{host}:{port}"));
    }

    /// Flip a peer back to alive. Errors if the peer is no longer a member,
    /// which happens when an ALIVE reply races an eviction; callers treat
    /// that as benign.
    pub async fn mark_alive(&self, host: &str, port: u16) -> Result<()> {
        let mut peers = self.inner.lock().await;
        match peers.get_mut(&format!("{host}:{port}")) {
            Some(entry) => {
                entry.alive = true;
                Ok(())
            }
            None => bail!("peer {host}:{port} is not in the table"),
        }
    }

    /// Admit a peer that announced itself with HELLO: when the table is
    /// full, the single oldest entry is evicted first to make room. One
    /// lock acquisition covers eviction plus insert.
    pub async fn admit(&self, host: &str, port: u16) -> bool {
        if host == self.local.host && port == self.local.port {
            return false;
        }

        let mut peers = self.inner.lock().await;
        if self.at_capacity(&peers) {
            let oldest = peers
                .values()
                .min_by_key(|entry| entry.time_added)
                .map(PeerEntry::id);
            if let Some(id) = oldest {
                debug!(evicted = %id, "table full, evicting oldest to admit new peer");
                peers.remove(&id);
            }
        }
        peers.insert(
            format!("{host}:{port}"),
            PeerEntry {
                alive: true,
                time_added: Instant::now(),
                host: host.to_string(),
                port,
            },
        );
        true
    }

    /// One liveness round, atomic as a whole:
    /// - entries still armed from the previous round are evicted;
    /// - surviving entries are re-armed (`alive = false`) for the next one;
    /// - if occupancy exceeds `high_water` of a finite capacity, the oldest
    ///   `churn_fraction` of entries is evicted too, keeping the table fresh
    ///   under pressure.
    ///
    /// Returns the evicted peer ids.
    pub async fn sweep(&self, high_water: f64, churn_fraction: f64) -> Vec<String> {
        let mut peers = self.inner.lock().await;
        let mut doomed: HashSet<String> = HashSet::new();

        for (id, entry) in peers.iter_mut() {
            if entry.alive {
                entry.alive = false;
            } else {
                doomed.insert(id.clone());
            }
        }

        if self.max_peers > 0 && peers.len() as f64 > high_water * self.max_peers as f64 {
            let mut by_age: Vec<&PeerEntry> = peers.values().collect();
            by_age.sort_by_key(|entry| entry.time_added);
            let churn = (churn_fraction * peers.len() as f64) as usize;
            for entry in by_age.into_iter().take(churn) {
                doomed.insert(entry.id());
            }
        }

        for id in &doomed {
            peers.remove(id);
        }
        doomed.into_iter().collect()
    }

    /// All entries, ascending by `time_added`.
    pub async fn snapshot_sorted_by_age(&self) -> Vec<PeerEntry> {
        let peers = self.inner.lock().await;
        let mut snapshot: Vec<PeerEntry> = peers.values().cloned().collect();
        snapshot.sort_by_key(|entry| entry.time_added);
        snapshot
    }

    pub async fn is_full(&self) -> bool {
        let peers = self.inner.lock().await;
        self.at_capacity(&peers)
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// Send one payload to every member. The lock is held across the whole
    /// fan-out so the recipient set is a consistent snapshot; sends are
    /// fire-and-forget and a failure toward one peer only produces a log
    /// line.
    pub async fn broadcast(&self, payload: &[u8], transport: &dyn Transport) {
        let peers = self.inner.lock().await;
        for entry in peers.values() {
            if let Err(e) = transport.send(payload, &entry.host, entry.port).await {
                debug!(peer = %entry.id(), error = %e, "broadcast send failed");
            }
        }
    }

    fn at_capacity(&self, peers: &HashMap<String, PeerEntry>) -> bool {
        self.max_peers > 0 && peers.len() >= self.max_peers
    }
}
