//! # Built-in Protocol Handlers
//!
//! The four orders every node speaks:
//!
//! | Order | Payload | Effect |
//! |-------|---------|--------|
//! | HELLO | `[host, port]` | admit the sender (evicting the oldest entry if full), reply PEERS directly |
//! | PEERS | `[id, ...]` | add each listed peer, subject to capacity and self-exclusion |
//! | PING  | `[host, port]` | reply ALIVE directly with our own identity |
//! | ALIVE | `[host, port]` | flip the sender's alive flag back on |
//!
//! Direct replies go straight to the endpoint named in the payload, never
//! through the flood. They still carry regular envelopes with ttl
//! [`PROBE_TTL`], so if a reply does get relayed it dies after one hop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::dispatch::{Dispatcher, Handler, HandlerContext};
use crate::envelope::{Envelope, Order};
use crate::membership::NodeId;
use crate::transport::Transport;

/// Hop budget for point-to-point messages (PEERS/PING/ALIVE). These are
/// addressed probes, not deep relays, so one hop is all they get.
pub const PROBE_TTL: i64 = 1;

/// Pull a `[host, port]` endpoint out of an envelope payload.
fn endpoint_from_data(envelope: &Envelope) -> Result<(String, u16)> {
    let data = envelope
        .data
        .as_ref()
        .context("message carries no data")?;
    let [host, port] = data.as_slice() else {
        anyhow::bail!("expected [host, port], got {} items", data.len());
    };
    if host.is_empty() {
        anyhow::bail!("empty host in endpoint data");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port '{port}'"))?;
    Ok((host.clone(), port))
}

/// HELLO: a node announcing itself to the overlay.
pub struct HelloHandler;

#[async_trait]
impl Handler for HelloHandler {
    async fn handle(&self, ctx: &HandlerContext, envelope: &Envelope) -> Result<()> {
        let (host, port) = endpoint_from_data(envelope)?;
        ctx.table.admit(&host, port).await;

        // Reply with the membership as it stands after the admit, so the
        // newcomer sees itself in the overlay it just joined.
        let known = ctx.table.peer_ids().await;
        let reply = Envelope::new(PROBE_TTL, Order::Peers, Some(known));
        ctx.transport.send(&reply.encode(), &host, port).await?;
        Ok(())
    }
}

/// PEERS: a membership list shared by another node.
pub struct PeersHandler;

#[async_trait]
impl Handler for PeersHandler {
    async fn handle(&self, ctx: &HandlerContext, envelope: &Envelope) -> Result<()> {
        let data = envelope
            .data
            .as_ref()
            .context("PEERS message carries no data")?;
        for id in data {
            match id.parse::<NodeId>() {
                Ok(peer) => {
                    ctx.table.add(&peer.host, peer.port).await;
                }
                Err(e) => {
                    debug!(entry = %id, error = %e, "skipping malformed peer id");
                }
            }
        }
        Ok(())
    }
}

/// PING: a liveness probe; answer with our own identity.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &HandlerContext, envelope: &Envelope) -> Result<()> {
        let (host, port) = endpoint_from_data(envelope)?;
        let reply = Envelope::new(
            PROBE_TTL,
            Order::Alive,
            Some(vec![ctx.local.host.clone(), ctx.local.port.to_string()]),
        );
        ctx.transport.send(&reply.encode(), &host, port).await?;
        Ok(())
    }
}

/// ALIVE: a peer answering our probe before the next sweep.
pub struct AliveHandler;

#[async_trait]
impl Handler for AliveHandler {
    async fn handle(&self, ctx: &HandlerContext, envelope: &Envelope) -> Result<()> {
        let (host, port) = endpoint_from_data(envelope)?;
        if let Err(e) = ctx.table.mark_alive(&host, port).await {
            // The peer was evicted between our probe and its reply.
            debug!(peer = %format!("{host}:{port}"), error = %e, "ALIVE for unknown peer, ignoring");
        }
        Ok(())
    }
}

/// Install the four built-in handlers on a dispatcher.
pub async fn register_builtin(dispatcher: &Dispatcher) {
    dispatcher
        .register(Order::Hello, std::sync::Arc::new(HelloHandler))
        .await;
    dispatcher
        .register(Order::Peers, std::sync::Arc::new(PeersHandler))
        .await;
    dispatcher
        .register(Order::Ping, std::sync::Arc::new(PingHandler))
        .await;
    dispatcher
        .register(Order::Alive, std::sync::Arc::new(AliveHandler))
        .await;
}
