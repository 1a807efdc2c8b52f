//! # Stabilizer Scheduler
//!
//! A *stabilizer* is a zero-argument maintenance task run on its own
//! long-lived repeating timer, independent of message traffic: it
//! re-establishes invariants (peer liveness, cache freshness) that inbound
//! traffic alone cannot. Each stabilizer runs its body once immediately,
//! then sleeps per its [`IntervalPolicy`] until shutdown is signalled.
//!
//! The node wires up two of them at startup: the jittered liveness sweep and
//! the fixed-interval seen-cache pruner (see `node.rs`).

use std::future::Future;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// How long a stabilizer sleeps between rounds.
pub enum IntervalPolicy {
    /// The same delay every round.
    Fixed(Duration),
    /// A fresh uniform draw from the range (in seconds) before every round.
    /// Jitter keeps a fleet of nodes from sweeping in lockstep.
    JitteredSecs(RangeInclusive<u64>),
}

impl IntervalPolicy {
    fn next_delay(&self) -> Duration {
        match self {
            IntervalPolicy::Fixed(delay) => *delay,
            IntervalPolicy::JitteredSecs(range) => {
                Duration::from_secs(rand::thread_rng().gen_range(range.clone()))
            }
        }
    }
}

/// Spawn a repeating background task. The task runs until the shutdown
/// watch flips to `true`; an in-progress round finishes before the loop
/// exits.
pub fn spawn_stabilizer<F, Fut>(
    name: &'static str,
    policy: IntervalPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            trace!(stabilizer = name, "running round");
            task().await;

            tokio::select! {
                _ = tokio::time::sleep(policy.next_delay()) => {}
                changed = shutdown.changed() => {
                    // A dropped sender means the node is gone.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(stabilizer = name, "stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jittered_delay_stays_in_range() {
        let policy = IntervalPolicy::JitteredSecs(3..=10);
        for _ in 0..100 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[tokio::test]
    async fn runs_repeatedly_until_shutdown() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = rounds.clone();
        let handle = spawn_stabilizer(
            "test",
            IntervalPolicy::Fixed(Duration::from_millis(10)),
            rx,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).expect("send failed");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stabilizer did not stop")
            .expect("stabilizer panicked");

        let count = rounds.load(Ordering::SeqCst);
        assert!(count >= 2, "expected repeated rounds, got {count}");
    }

    #[tokio::test]
    async fn shutdown_interrupts_long_sleep() {
        let (tx, rx) = watch::channel(false);
        let handle = spawn_stabilizer(
            "sleepy",
            IntervalPolicy::Fixed(Duration::from_secs(3600)),
            rx,
            || async {},
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("send failed");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stabilizer stuck in sleep")
            .expect("stabilizer panicked");
    }
}
