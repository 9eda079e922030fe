//! The relay core: registry, shared queues and routing services wired together.

use std::{fmt, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tracing::{debug, info_span, Instrument};

use crate::{
    error::ConnectionError,
    handler::{ConnectionHandler, ConnectionOptions, SharedQueues},
    mailbox::{bounded, DEFAULT_QUEUE_CAPACITY},
    registry::Registry,
    routing::{
        BroadcastPolicy, DeliveryStrategy, Direction, RoutingService, RoutingStats,
        RoutingStatsSnapshot,
    },
};

/// Settings for a [`Relay`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayOptions {
    /// Capacity of each of the two shared queues.
    pub queue_capacity: usize,
    /// How routing services push into full mailboxes.
    pub delivery: DeliveryStrategy,
    /// What happens to requests broadcast while no consumer is registered.
    pub broadcast_policy: BroadcastPolicy,
    /// Settings applied to every connection.
    pub connection: ConnectionOptions,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            delivery: DeliveryStrategy::default(),
            broadcast_policy: BroadcastPolicy::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

/// Routing counters for both directions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Producer requests broadcast to consumers.
    pub to_consumers: RoutingStatsSnapshot,
    /// Consumer replies routed back to producers.
    pub to_producers: RoutingStatsSnapshot,
}

/// A running relay.
///
/// Streams handed to [`attach`](Relay::attach) become connections; their first frame decides
/// whether they act as producers or consumers. Must be started from within a tokio runtime.
pub struct Relay {
    registry: Registry,
    queues: SharedQueues,
    options: RelayOptions,
    to_consumers_stats: Arc<RoutingStats>,
    to_producers_stats: Arc<RoutingStats>,
    routing_tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Creates the shared queues and spawns both routing services.
    ///
    /// # Panics
    ///
    /// Panics if a queue or mailbox capacity is zero, or when called outside a tokio runtime.
    pub fn start(options: RelayOptions) -> Self {
        let registry = Registry::new();
        let (to_consumers, to_consumers_rx) = bounded(options.queue_capacity);
        let (to_producers, to_producers_rx) = bounded(options.queue_capacity);

        let broadcast = RoutingService::new(
            Direction::ToConsumers,
            to_consumers_rx,
            registry.clone(),
            options.delivery,
        )
        .with_broadcast_policy(options.broadcast_policy);
        let point_to_point = RoutingService::new(
            Direction::ToProducers,
            to_producers_rx,
            registry.clone(),
            options.delivery,
        );

        let to_consumers_stats = broadcast.stats();
        let to_producers_stats = point_to_point.stats();
        let routing_tasks = vec![broadcast.spawn(), point_to_point.spawn()];

        Relay {
            registry,
            queues: SharedQueues {
                to_consumers,
                to_producers,
            },
            options,
            to_consumers_stats,
            to_producers_stats,
            routing_tasks,
        }
    }

    /// The relay's registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serves an already accepted stream on a new task.
    pub fn attach<S>(&self, stream: S) -> JoinHandle<Result<(), ConnectionError>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.registry.next_connection_id();
        debug!(conn_id = %id, "attaching connection");
        let handler = ConnectionHandler::new(
            id,
            stream,
            self.registry.clone(),
            self.queues.clone(),
            self.options.connection.clone(),
        );
        tokio::spawn(handler.run().instrument(info_span!("connection", conn_id = %id)))
    }

    /// Current routing counters.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            to_consumers: self.to_consumers_stats.snapshot(),
            to_producers: self.to_producers_stats.snapshot(),
        }
    }

    /// Returns `true` until the relay is stopped.
    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    /// Stops every handler and both routing services. Idempotent.
    pub fn stop(&self) -> bool {
        self.registry.stop()
    }

    /// Stops the relay and waits for the routing services to finish.
    pub async fn shutdown(self) {
        self.registry.stop();
        for task in self.routing_tasks {
            if let Err(err) = task.await {
                debug!(error = %err, "routing task ended abnormally");
            }
        }
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}
