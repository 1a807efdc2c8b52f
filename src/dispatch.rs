//! # Dispatch Engine
//!
//! One [`Dispatcher`] per node routes every inbound datagram through a fixed
//! pipeline, each datagram on its own spawned task:
//!
//! 1. decode — malformed input becomes the invalid envelope and is dropped;
//! 2. dedup — ids already in the recently-seen cache are dropped, breaking
//!    flood loops; fresh ids are recorded first;
//! 3. route — the handler registered for the order runs, or the datagram is
//!    logged and dropped (unknown orders are an expected extension case);
//! 4. re-flood — the ttl is decremented and, while it stays positive, the
//!    envelope is re-encoded and fanned out to every table entry. This holds
//!    for every order type, liveness probes included; their ttl of 1 is what
//!    stops them from travelling further.
//!
//! A handler error is caught and logged at this boundary; it aborts only the
//! re-flood of that one message and can never take down the listening loop
//! or other in-flight dispatch tasks.
//!
//! The recently-seen cache is an [`lru::LruCache`] behind its own mutex: the
//! capacity bound caps memory under flood pressure, while the stabilizer
//! prunes by age so ids become eligible for re-processing once the
//! freshness window has passed.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::envelope::{Envelope, Order};
use crate::membership::{MembershipTable, NodeId};
use crate::transport::Transport;

/// What a handler gets to work with: the node's identity, its membership
/// table, and the outbound transport for direct replies.
pub struct HandlerContext {
    pub local: NodeId,
    pub table: Arc<MembershipTable>,
    pub transport: Arc<dyn Transport>,
}

/// A protocol operation. Registering a handler for a new [`Order`] extends
/// the node without touching the dispatch pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, envelope: &Envelope) -> Result<()>;
}

pub struct Dispatcher {
    ctx: HandlerContext,
    handlers: RwLock<std::collections::HashMap<Order, Arc<dyn Handler>>>,
    /// Message id -> first observed. Capacity-bounded; age-pruned by the
    /// cache stabilizer.
    seen: Mutex<LruCache<String, Instant>>,
}

impl Dispatcher {
    pub fn new(ctx: HandlerContext, seen_capacity: NonZeroUsize) -> Self {
        Dispatcher {
            ctx,
            handlers: RwLock::new(std::collections::HashMap::new()),
            seen: Mutex::new(LruCache::new(seen_capacity)),
        }
    }

    pub fn ctx(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Register (or replace) the handler for an order.
    pub async fn register(&self, order: Order, handler: Arc<dyn Handler>) {
        self.handlers.write().await.insert(order, handler);
    }

    /// Run one inbound datagram through the pipeline. Never fails; every
    /// per-message problem ends at a log line.
    pub async fn dispatch(&self, payload: &[u8]) {
        let mut envelope = Envelope::decode(payload);
        if !envelope.is_valid() {
            trace!("discarding invalid datagram");
            return;
        }

        {
            let mut seen = self.seen.lock().await;
            if seen.contains(&envelope.id) {
                trace!(id = %envelope.id, "duplicate message, suppressing");
                return;
            }
            seen.put(envelope.id.clone(), Instant::now());
        }

        let handler = self.handlers.read().await.get(&envelope.order).cloned();
        let handler = match handler {
            Some(h) => h,
            None => {
                debug!(order = %envelope.order, id = %envelope.id, "no handler registered, discarding");
                return;
            }
        };

        debug!(order = %envelope.order, id = %envelope.id, ttl = envelope.ttl, "handling message");
        if let Err(e) = handler.handle(&self.ctx, &envelope).await {
            warn!(order = %envelope.order, id = %envelope.id, error = %e, "handler failed");
            return;
        }

        envelope.ttl -= 1;
        if envelope.ttl > 0 {
            self.ctx
                .table
                .broadcast(&envelope.encode(), self.ctx.transport.as_ref())
                .await;
        }
    }

    /// Drop every seen-cache entry older than the freshness window.
    pub async fn prune_seen(&self, window: Duration) {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = seen
            .iter()
            .filter(|(_, first_seen)| now.duration_since(**first_seen) > window)
            .map(|(id, _)| id.clone())
            .collect();
        let pruned = stale.len();
        for id in stale {
            seen.pop(&id);
        }
        if pruned > 0 {
            debug!(pruned, remaining = seen.len(), "pruned seen cache");
        }
    }

    #[cfg(test)]
    pub(crate) async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fakes for dispatch-level unit tests.

    use super::*;

    /// Transport that records every send instead of touching the network.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<(Vec<u8>, String, u16)>>,
    }

    impl RecordingTransport {
        pub async fn sent(&self) -> Vec<(Vec<u8>, String, u16)> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, payload: &[u8], host: &str, port: u16) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((payload.to_vec(), host.to_string(), port));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _ctx: &HandlerContext, _envelope: &Envelope) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        async fn handle(&self, _ctx: &HandlerContext, _envelope: &Envelope) -> Result<()> {
            anyhow::bail!("synthetic handler failure")
        }
    }

    const SEEN_CAPACITY: usize = 1024;

    async fn dispatcher() -> (Arc<Dispatcher>, Arc<RecordingTransport>, Arc<MembershipTable>) {
        let local = NodeId::new("127.0.0.1", 4567);
        let table = Arc::new(MembershipTable::new(local.clone(), 0));
        let transport = Arc::new(RecordingTransport::default());
        let ctx = HandlerContext {
            local,
            table: table.clone(),
            transport: transport.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            ctx,
            NonZeroUsize::new(SEEN_CAPACITY).unwrap(),
        ));
        (dispatcher, transport, table)
    }

    fn test_order() -> Order {
        Order::Other("TEST".to_string())
    }

    #[tokio::test]
    async fn duplicate_ids_invoke_handler_once() {
        let (dispatcher, transport, table) = dispatcher().await;
        table.add("10.0.0.1", 1000).await;

        let handler = Arc::new(CountingHandler { hits: AtomicUsize::new(0) });
        dispatcher.register(test_order(), handler.clone()).await;

        let payload = Envelope::new(2, test_order(), None).encode();
        for _ in 0..5 {
            dispatcher.dispatch(&payload).await;
        }

        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
        // At most one re-flood to the single peer.
        assert_eq!(transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn reflood_decrements_ttl_and_keeps_id() {
        let (dispatcher, transport, table) = dispatcher().await;
        table.add("10.0.0.1", 1000).await;

        dispatcher
            .register(test_order(), Arc::new(CountingHandler { hits: AtomicUsize::new(0) }))
            .await;

        let original = Envelope::new(5, test_order(), Some(vec!["x".into()]));
        dispatcher.dispatch(&original.encode()).await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        let relayed = Envelope::decode(&sent[0].0);
        assert_eq!(relayed.ttl, 4);
        assert_eq!(relayed.id, original.id);
        assert_eq!(relayed.data, original.data);
    }

    #[tokio::test]
    async fn expired_messages_are_handled_but_not_flooded() {
        let (dispatcher, transport, table) = dispatcher().await;
        table.add("10.0.0.1", 1000).await;

        let handler = Arc::new(CountingHandler { hits: AtomicUsize::new(0) });
        dispatcher.register(test_order(), handler.clone()).await;

        // ttl 1 decrements to 0: local processing only.
        dispatcher
            .dispatch(&Envelope::new(1, test_order(), None).encode())
            .await;
        // Already expired on arrival: same.
        dispatcher
            .dispatch(&Envelope::new(0, test_order(), None).encode())
            .await;

        assert_eq!(handler.hits.load(Ordering::SeqCst), 2);
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn floods_every_peer_exactly_once() {
        let (dispatcher, transport, table) = dispatcher().await;
        table.add("10.0.0.1", 1000).await;
        table.add("10.0.0.2", 1001).await;

        dispatcher
            .register(test_order(), Arc::new(CountingHandler { hits: AtomicUsize::new(0) }))
            .await;
        dispatcher
            .dispatch(&Envelope::new(3, test_order(), None).encode())
            .await;

        let mut recipients: Vec<(String, u16)> = transport
            .sent()
            .await
            .into_iter()
            .map(|(_, host, port)| (host, port))
            .collect();
        recipients.sort();
        assert_eq!(
            recipients,
            vec![("10.0.0.1".to_string(), 1000), ("10.0.0.2".to_string(), 1001)]
        );
    }

    #[tokio::test]
    async fn unknown_order_is_discarded_without_flooding() {
        let (dispatcher, transport, table) = dispatcher().await;
        table.add("10.0.0.1", 1000).await;

        dispatcher
            .dispatch(&Envelope::new(9, Order::Other("NOBODY".into()), None).encode())
            .await;
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn handler_failure_is_contained() {
        let (dispatcher, transport, table) = dispatcher().await;
        table.add("10.0.0.1", 1000).await;

        dispatcher.register(test_order(), Arc::new(FailingHandler)).await;
        dispatcher
            .dispatch(&Envelope::new(5, test_order(), None).encode())
            .await;

        // The failed message is not relayed, and the dispatcher stays usable.
        assert!(transport.sent().await.is_empty());
        let handler = Arc::new(CountingHandler { hits: AtomicUsize::new(0) });
        dispatcher.register(test_order(), handler.clone()).await;
        dispatcher
            .dispatch(&Envelope::new(5, test_order(), None).encode())
            .await;
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_datagrams_never_reach_handlers() {
        let (dispatcher, transport, _table) = dispatcher().await;
        let handler = Arc::new(CountingHandler { hits: AtomicUsize::new(0) });
        dispatcher.register(test_order(), handler.clone()).await;

        dispatcher.dispatch(b"definitely not an envelope").await;
        dispatcher.dispatch(&[0xff, 0x00, 0x3b]).await;

        assert_eq!(handler.hits.load(Ordering::SeqCst), 0);
        assert!(transport.sent().await.is_empty());
        assert_eq!(dispatcher.seen_len().await, 0);
    }

    #[tokio::test]
    async fn prune_drops_only_stale_entries() {
        let (dispatcher, _transport, _table) = dispatcher().await;
        dispatcher
            .register(test_order(), Arc::new(CountingHandler { hits: AtomicUsize::new(0) }))
            .await;

        dispatcher
            .dispatch(&Envelope::new(1, test_order(), None).encode())
            .await;
        assert_eq!(dispatcher.seen_len().await, 1);

        // Generous window keeps the entry, zero window drops it.
        dispatcher.prune_seen(Duration::from_secs(300)).await;
        assert_eq!(dispatcher.seen_len().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.prune_seen(Duration::from_millis(1)).await;
        assert_eq!(dispatcher.seen_len().await, 0);
    }

    #[tokio::test]
    async fn pruned_id_can_be_processed_again() {
        let (dispatcher, _transport, _table) = dispatcher().await;
        let handler = Arc::new(CountingHandler { hits: AtomicUsize::new(0) });
        dispatcher.register(test_order(), handler.clone()).await;

        let payload = Envelope::new(1, test_order(), None).encode();
        dispatcher.dispatch(&payload).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.prune_seen(Duration::from_millis(1)).await;
        dispatcher.dispatch(&payload).await;

        assert_eq!(handler.hits.load(Ordering::SeqCst), 2);
    }
}
