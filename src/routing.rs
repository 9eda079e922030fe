//! Routing services that drain a shared queue into connection mailboxes.
//!
//! Two instances run per relay:
//!
//! - **Broadcast** (fed by the producer → consumer queue): every transaction is copied into the
//!   mailbox of every registered consumer, in registration order.
//! - **Point-to-point** (fed by the consumer → producer queue): every transaction is delivered to
//!   the single producer whose id equals the transaction's thread id.
//!
//! How a full mailbox is handled is decided by the [`DeliveryStrategy`]. Broadcasts that find no
//! consumer are held or dropped according to the [`BroadcastPolicy`]. Every drop is logged and
//! counted in [`RoutingStats`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{
    error::SendError,
    mailbox::MailboxReceiver,
    registry::{ConnectionRef, Registry},
    transaction::Transaction,
};

/// Strategies for delivering a transaction into a connection's mailbox.
///
/// Different strategies provide different trade-offs between reliability and keeping the routing
/// service moving when one connection stops reading.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum DeliveryStrategy {
    /// Block until the mailbox has room.
    ///
    /// A full mailbox stalls the routing service, and with it delivery to every connection that
    /// comes after it in registration order.
    #[default]
    Guaranteed,

    /// Skip connections with full mailboxes.
    ///
    /// The transaction is dropped for that connection and counted as `dropped_full`.
    BestEffort,

    /// Wait for mailbox room, but only up to the given duration.
    TimedDelivery(Duration),
}

/// What the broadcast service does with a transaction when no live consumer is registered.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum BroadcastPolicy {
    /// Wait until a new consumer registers, then deliver.
    #[default]
    Hold,
    /// Drop the transaction and count it as `lost`.
    Drop,
}

/// Which way a routing service moves traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Producer requests broadcast to all consumers.
    ToConsumers,
    /// Consumer replies delivered to the one matching producer.
    ToProducers,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToConsumers => write!(f, "to-consumers"),
            Direction::ToProducers => write!(f, "to-producers"),
        }
    }
}

/// Result of routing a single transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The transaction had at least one target; `delivered` mailboxes accepted it.
    Routed {
        /// Number of mailboxes that accepted the transaction.
        delivered: usize,
    },
    /// No target existed and the transaction was dropped.
    Unrouted,
    /// The relay stopped before the transaction could be delivered.
    Stopped,
}

/// Counters for one routing service.
#[derive(Debug, Default)]
pub struct RoutingStats {
    routed: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_closed: AtomicU64,
    misses: AtomicU64,
    lost: AtomicU64,
}

impl RoutingStats {
    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> RoutingStatsSnapshot {
        RoutingStatsSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plain copy of [`RoutingStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingStatsSnapshot {
    /// Transactions taken from the source queue.
    pub routed: u64,
    /// Successful mailbox deliveries (a broadcast counts once per consumer).
    pub delivered: u64,
    /// Deliveries skipped because a mailbox was full or timed out.
    pub dropped_full: u64,
    /// Deliveries to connections that have already gone away.
    pub dropped_closed: u64,
    /// Replies whose thread id matched no registered producer.
    pub misses: u64,
    /// Broadcasts dropped because no live consumer was registered.
    pub lost: u64,
}

/// Background task draining one shared queue.
pub struct RoutingService {
    direction: Direction,
    source: MailboxReceiver<Transaction>,
    registry: Registry,
    strategy: DeliveryStrategy,
    broadcast_policy: BroadcastPolicy,
    stats: Arc<RoutingStats>,
}

impl RoutingService {
    /// Creates a routing service reading from `source`.
    pub fn new(
        direction: Direction,
        source: MailboxReceiver<Transaction>,
        registry: Registry,
        strategy: DeliveryStrategy,
    ) -> Self {
        RoutingService {
            direction,
            source,
            registry,
            strategy,
            broadcast_policy: BroadcastPolicy::default(),
            stats: Arc::default(),
        }
    }

    /// Sets what happens to broadcasts when no consumer is registered.
    pub fn with_broadcast_policy(mut self, policy: BroadcastPolicy) -> Self {
        self.broadcast_policy = policy;
        self
    }

    /// The service's counters, shared with the running task.
    pub fn stats(&self) -> Arc<RoutingStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the service on a new tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Takes transactions from the source queue until the relay stops or every writer to the
    /// queue is gone.
    pub async fn run(mut self) {
        debug!(direction = %self.direction, "routing service started");
        loop {
            let tx = tokio::select! {
                biased;
                _ = self.registry.stopped() => break,
                tx = self.source.recv() => match tx {
                    Some(tx) => tx,
                    None => break,
                },
            };
            if self.route(tx).await == RouteOutcome::Stopped {
                break;
            }
        }
        debug!(direction = %self.direction, "routing service stopped");
    }

    /// Delivers a single transaction according to the service's direction.
    pub async fn route(&self, tx: Transaction) -> RouteOutcome {
        RoutingStats::incr(&self.stats.routed);
        trace!(
            direction = %self.direction,
            thread_id = %tx.thread_id(),
            message_id = tx.message_id(),
            len = tx.payload().len(),
            "routing transaction"
        );
        match self.direction {
            Direction::ToConsumers => self.broadcast(tx).await,
            Direction::ToProducers => self.deliver_to_producer(tx).await,
        }
    }

    async fn broadcast(&self, tx: Transaction) -> RouteOutcome {
        let consumers = loop {
            // Read the count first so a registration racing the snapshot still wakes the wait.
            let seen = self.registry.consumer_count();
            let consumers = self.registry.live_consumers();
            if !consumers.is_empty() {
                break consumers;
            }
            match self.broadcast_policy {
                BroadcastPolicy::Drop => {
                    RoutingStats::incr(&self.stats.lost);
                    warn!(
                        thread_id = %tx.thread_id(),
                        message_id = tx.message_id(),
                        "no live consumers, broadcast dropped"
                    );
                    return RouteOutcome::Unrouted;
                }
                BroadcastPolicy::Hold => {
                    tokio::select! {
                        biased;
                        _ = self.registry.stopped() => return RouteOutcome::Stopped,
                        _ = self.registry.consumer_registered(seen) => {}
                    }
                }
            }
        };

        let mut delivered = 0;
        for consumer in &consumers {
            match self.deliver(consumer, tx.clone()).await {
                Delivery::Delivered => delivered += 1,
                Delivery::Dropped => {}
                Delivery::Stopped => return RouteOutcome::Stopped,
            }
        }
        RouteOutcome::Routed { delivered }
    }

    async fn deliver_to_producer(&self, tx: Transaction) -> RouteOutcome {
        let Some(producer) = self.registry.producer(tx.thread_id()) else {
            RoutingStats::incr(&self.stats.misses);
            warn!(
                thread_id = %tx.thread_id(),
                message_id = tx.message_id(),
                "reply matches no registered producer, dropped"
            );
            return RouteOutcome::Unrouted;
        };

        match self.deliver(&producer, tx).await {
            Delivery::Delivered => RouteOutcome::Routed { delivered: 1 },
            Delivery::Dropped => RouteOutcome::Routed { delivered: 0 },
            Delivery::Stopped => RouteOutcome::Stopped,
        }
    }

    async fn deliver(&self, conn: &ConnectionRef, tx: Transaction) -> Delivery {
        let mailbox = conn.mailbox();
        let res = match self.strategy {
            DeliveryStrategy::Guaranteed => {
                tokio::select! {
                    biased;
                    _ = self.registry.stopped() => return Delivery::Stopped,
                    res = mailbox.send(tx) => res,
                }
            }
            DeliveryStrategy::BestEffort => mailbox.try_send(tx),
            DeliveryStrategy::TimedDelivery(timeout) => {
                tokio::select! {
                    biased;
                    _ = self.registry.stopped() => return Delivery::Stopped,
                    res = mailbox.send_timeout(tx, timeout) => res,
                }
            }
        };

        match res {
            Ok(()) => {
                RoutingStats::incr(&self.stats.delivered);
                Delivery::Delivered
            }
            Err(SendError::Closed(_)) => {
                RoutingStats::incr(&self.stats.dropped_closed);
                debug!(conn_id = %conn.id(), "connection gone, delivery dropped");
                Delivery::Dropped
            }
            Err(err @ (SendError::MailboxFull(_) | SendError::Timeout(_))) => {
                RoutingStats::incr(&self.stats.dropped_full);
                warn!(conn_id = %conn.id(), error = %err, "mailbox overflow, delivery dropped");
                Delivery::Dropped
            }
        }
    }
}

impl fmt::Debug for RoutingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingService")
            .field("direction", &self.direction)
            .field("strategy", &self.strategy)
            .field("broadcast_policy", &self.broadcast_policy)
            .finish()
    }
}

enum Delivery {
    Delivered,
    Dropped,
    Stopped,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{id::ConnectionId, mailbox::bounded};

    use super::*;

    fn service(direction: Direction, registry: &Registry) -> RoutingService {
        let (_tx, rx) = bounded(1);
        RoutingService::new(direction, rx, registry.clone(), DeliveryStrategy::Guaranteed)
    }

    fn connection(
        registry: &Registry,
        capacity: usize,
    ) -> (ConnectionRef, MailboxReceiver<Transaction>) {
        let (tx, rx) = bounded(capacity);
        (ConnectionRef::new(registry.next_connection_id(), tx), rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_consumer() {
        let registry = Registry::new();
        let (a, mut a_rx) = connection(&registry, 4);
        let (b, mut b_rx) = connection(&registry, 4);
        registry.register_consumer(a).unwrap();
        registry.register_consumer(b).unwrap();

        let service = service(Direction::ToConsumers, &registry);
        let tx = Transaction::from_payload(&b"query"[..], ConnectionId::new(9), 3);
        assert_eq!(service.route(tx.clone()).await, RouteOutcome::Routed { delivered: 2 });

        assert_eq!(a_rx.try_recv(), Some(tx.clone()));
        assert_eq!(b_rx.try_recv(), Some(tx));
        assert_eq!(service.stats().snapshot().delivered, 2);
    }

    #[tokio::test]
    async fn broadcast_without_consumers_is_dropped() {
        let registry = Registry::new();
        let (producer, mut producer_rx) = connection(&registry, 4);
        registry.register_producer(producer).unwrap();

        let service = service(Direction::ToConsumers, &registry)
            .with_broadcast_policy(BroadcastPolicy::Drop);
        let tx = Transaction::from_payload(&b"query"[..], ConnectionId::new(0), 0);
        assert_eq!(service.route(tx).await, RouteOutcome::Unrouted);
        assert!(producer_rx.try_recv().is_none());
        assert_eq!(service.stats().snapshot().lost, 1);
    }

    #[tokio::test]
    async fn held_broadcast_waits_for_first_consumer() {
        let registry = Registry::new();
        let service = service(Direction::ToConsumers, &registry);
        let tx = Transaction::from_payload(&b"query"[..], ConnectionId::new(0), 0);

        let routing = tokio::spawn(async move { service.route(tx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!routing.is_finished());

        let (consumer, mut consumer_rx) = connection(&registry, 4);
        registry.register_consumer(consumer).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), routing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Routed { delivered: 1 });
        assert_eq!(consumer_rx.try_recv().map(|tx| tx.message_id()), Some(0));
    }

    #[tokio::test]
    async fn held_broadcast_ignores_departed_consumers() {
        let registry = Registry::new();
        let (departed, departed_rx) = connection(&registry, 4);
        registry.register_consumer(departed).unwrap();
        drop(departed_rx);

        let service = service(Direction::ToConsumers, &registry);
        let stats = service.stats();
        let tx = Transaction::from_payload(&b"hello"[..], ConnectionId::new(0), 0);
        let routing = tokio::spawn(async move { service.route(tx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!routing.is_finished());

        let (fresh, mut fresh_rx) = connection(&registry, 4);
        registry.register_consumer(fresh).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), routing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Routed { delivered: 1 });
        assert_eq!(fresh_rx.try_recv().map(|tx| tx.message_id()), Some(0));
        assert_eq!(stats.snapshot().dropped_closed, 0);
    }

    #[tokio::test]
    async fn dropping_broadcast_ignores_departed_consumers() {
        let registry = Registry::new();
        let (departed, departed_rx) = connection(&registry, 4);
        registry.register_consumer(departed).unwrap();
        drop(departed_rx);

        let service = service(Direction::ToConsumers, &registry)
            .with_broadcast_policy(BroadcastPolicy::Drop);
        let tx = Transaction::from_payload(&b"hello"[..], ConnectionId::new(0), 0);
        assert_eq!(service.route(tx).await, RouteOutcome::Unrouted);
        assert_eq!(service.stats().snapshot().lost, 1);
    }

    #[tokio::test]
    async fn reply_to_departed_producer_counts_closed() {
        let registry = Registry::new();
        let (producer, producer_rx) = connection(&registry, 4);
        let producer_id = producer.id();
        registry.register_producer(producer).unwrap();
        drop(producer_rx);

        let service = service(Direction::ToProducers, &registry);
        let reply = Transaction::from_payload(&b"pong"[..], producer_id, 0);
        assert_eq!(service.route(reply).await, RouteOutcome::Routed { delivered: 0 });
        let stats = service.stats().snapshot();
        assert_eq!(stats.dropped_closed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn timed_delivery_gives_up_on_full_mailbox() {
        let registry = Registry::new();
        let (full, mut full_rx) = connection(&registry, 1);
        let (open, mut open_rx) = connection(&registry, 1);
        full.mailbox()
            .try_send(Transaction::from_payload(&b"x"[..], ConnectionId::new(0), 0))
            .unwrap();
        registry.register_consumer(full).unwrap();
        registry.register_consumer(open).unwrap();

        let (_tx, rx) = bounded(1);
        let service = RoutingService::new(
            Direction::ToConsumers,
            rx,
            registry.clone(),
            DeliveryStrategy::TimedDelivery(Duration::from_millis(20)),
        );
        let tx = Transaction::from_payload(&b"y"[..], ConnectionId::new(0), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(1), service.route(tx))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Routed { delivered: 1 });
        assert_eq!(open_rx.try_recv().map(|tx| tx.message_id()), Some(1));
        assert_eq!(full_rx.try_recv().map(|tx| tx.message_id()), Some(0));
        assert!(full_rx.try_recv().is_none());

        let stats = service.stats().snapshot();
        assert_eq!(stats.dropped_full, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn reply_goes_to_matching_producer_only() {
        let registry = Registry::new();
        let (p0, mut p0_rx) = connection(&registry, 4);
        let (p1, mut p1_rx) = connection(&registry, 4);
        let p1_id = p1.id();
        registry.register_producer(p0).unwrap();
        registry.register_producer(p1).unwrap();

        let service = service(Direction::ToProducers, &registry);
        let reply = Transaction::from_payload(&b"pong"[..], p1_id, 0);
        assert_eq!(service.route(reply.clone()).await, RouteOutcome::Routed { delivered: 1 });

        assert_eq!(p1_rx.try_recv(), Some(reply));
        assert!(p0_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn reply_without_producer_counts_a_miss() {
        let registry = Registry::new();
        let service = service(Direction::ToProducers, &registry);
        let reply = Transaction::from_payload(&b"pong"[..], ConnectionId::new(42), 0);
        assert_eq!(service.route(reply).await, RouteOutcome::Unrouted);
        assert_eq!(service.stats().snapshot().misses, 1);
    }

    #[tokio::test]
    async fn best_effort_skips_full_mailbox() {
        let registry = Registry::new();
        let (full, _full_rx) = connection(&registry, 1);
        let (open, mut open_rx) = connection(&registry, 1);
        full.mailbox()
            .try_send(Transaction::from_payload(&b"x"[..], ConnectionId::new(0), 0))
            .unwrap();
        registry.register_consumer(full).unwrap();
        registry.register_consumer(open).unwrap();

        let (_tx, rx) = bounded(1);
        let service = RoutingService::new(
            Direction::ToConsumers,
            rx,
            registry.clone(),
            DeliveryStrategy::BestEffort,
        );
        let tx = Transaction::from_payload(&b"y"[..], ConnectionId::new(0), 1);
        assert_eq!(service.route(tx).await, RouteOutcome::Routed { delivered: 1 });
        assert_eq!(open_rx.try_recv().map(|tx| tx.message_id()), Some(1));
        assert_eq!(service.stats().snapshot().dropped_full, 1);
    }

    #[tokio::test]
    async fn guaranteed_delivery_is_released_by_stop() {
        let registry = Registry::new();
        let (full, _full_rx) = connection(&registry, 1);
        full.mailbox()
            .try_send(Transaction::from_payload(&b"x"[..], ConnectionId::new(0), 0))
            .unwrap();
        registry.register_consumer(full).unwrap();

        let service = service(Direction::ToConsumers, &registry);
        let routing = tokio::spawn(async move {
            let tx = Transaction::from_payload(&b"y"[..], ConnectionId::new(0), 1);
            service.route(tx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!routing.is_finished());

        registry.stop();
        assert_eq!(routing.await.unwrap(), RouteOutcome::Stopped);
    }

    #[tokio::test]
    async fn run_exits_when_queue_writers_are_gone() {
        let registry = Registry::new();
        let (queue_tx, queue_rx) = bounded(4);
        let (consumer, mut consumer_rx) = connection(&registry, 4);
        registry.register_consumer(consumer).unwrap();

        let service = RoutingService::new(
            Direction::ToConsumers,
            queue_rx,
            registry.clone(),
            DeliveryStrategy::Guaranteed,
        );
        let stats = service.stats();
        let handle = service.spawn();

        for n in 0..3 {
            queue_tx
                .send(Transaction::from_payload(&b"q"[..], ConnectionId::new(0), n))
                .await
                .unwrap();
        }
        drop(queue_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let ids: Vec<_> = std::iter::from_fn(|| consumer_rx.try_recv())
            .map(|tx| tx.message_id())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(stats.snapshot().routed, 3);
    }
}
