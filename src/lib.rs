//! # Floodmesh - Self-Organizing Gossip Overlay
//!
//! Floodmesh builds a peer-to-peer overlay out of plain UDP datagrams:
//!
//! - **Membership**: each node keeps a bounded table of known peers and
//!   discovers new ones by epidemic HELLO/PEERS exchange
//! - **Liveness**: periodic PING/ALIVE sweeps evict peers that stop
//!   answering, and proactively churn the oldest entries under pressure
//! - **Dissemination**: application messages flood the overlay with a
//!   per-hop ttl budget and a recently-seen cache for loop suppression
//!
//! ## Architecture
//!
//! One listening task per node blocks on datagram receipt; every inbound
//! datagram is dispatched on its own task, so handlers run concurrently and
//! the membership table is the single mutually-excluded resource. Two
//! background *stabilizers* (liveness sweep, seen-cache pruning) run on
//! independent timers until shutdown.
//!
//! No delivery guarantees are made: flooding is fire-and-forget, duplicate
//! suppression is best-effort within the freshness window, and handlers
//! must stay idempotent.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `envelope` | Wire codec and the `Order` tag set |
//! | `membership` | Bounded concurrency-safe peer table |
//! | `dispatch` | Per-datagram pipeline: dedup, routing, re-flood |
//! | `handlers` | Built-in HELLO/PEERS/PING/ALIVE handlers |
//! | `stabilizer` | Periodic background maintenance tasks |
//! | `transport` | `Transport` capability and the UDP implementation |

mod dispatch;
mod envelope;
mod handlers;
mod membership;
mod node;
mod stabilizer;
mod transport;

pub use dispatch::{Dispatcher, Handler, HandlerContext};
pub use envelope::{Envelope, Order};
pub use handlers::PROBE_TTL;
pub use membership::{MembershipTable, NodeId, PeerEntry};
pub use node::{Node, NodeConfig};
pub use transport::{Transport, UdpTransport, MAX_DATAGRAM_SIZE};
