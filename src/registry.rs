//! Process-wide bookkeeping of producer and consumer connections.
//!
//! The [`Registry`] owns two append-only sets of [`ConnectionRef`]s and the relay's running flag.
//! Readers only ever get snapshots, so routing iterates without holding a lock while handlers keep
//! registering. Entries are never removed: a connection that went away stays in its set and
//! deliveries to it fail with a closed mailbox.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    error::RegistryError, id::ConnectionId, mailbox::MailboxSender, transaction::Transaction,
};

/// Handle used to deliver transactions to a connection's mailbox.
#[derive(Clone, Debug)]
pub struct ConnectionRef {
    id: ConnectionId,
    mailbox: MailboxSender<Transaction>,
}

impl ConnectionRef {
    /// Creates a reference to the connection `id` that delivers into `mailbox`.
    pub fn new(id: ConnectionId, mailbox: MailboxSender<Transaction>) -> Self {
        ConnectionRef { id, mailbox }
    }

    /// The connection's id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection's inbound mailbox.
    pub fn mailbox(&self) -> &MailboxSender<Transaction> {
        &self.mailbox
    }
}

/// Shared registry of producers, consumers and the running flag.
///
/// Cloning is cheap and every clone refers to the same state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    producers: RwLock<Vec<ConnectionRef>>,
    consumers: RwLock<Vec<ConnectionRef>>,
    running: watch::Sender<bool>,
    consumer_count: watch::Sender<usize>,
    next_id: AtomicU32,
}

impl Registry {
    /// Creates an empty, running registry.
    pub fn new() -> Self {
        Registry {
            inner: Arc::new(RegistryInner {
                producers: RwLock::new(Vec::new()),
                consumers: RwLock::new(Vec::new()),
                running: watch::Sender::new(true),
                consumer_count: watch::Sender::new(0),
                next_id: AtomicU32::new(0),
            }),
        }
    }

    /// Hands out the next connection id. Ids start at `0` and are never reused.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a connection to the producer set.
    pub fn register_producer(&self, conn: ConnectionRef) -> Result<(), RegistryError> {
        let id = conn.id();
        self.insert(conn, Role::Producer)?;
        info!(conn_id = %id, "producer registered");
        Ok(())
    }

    /// Adds a connection to the consumer set.
    pub fn register_consumer(&self, conn: ConnectionRef) -> Result<(), RegistryError> {
        let id = conn.id();
        self.insert(conn, Role::Consumer)?;
        self.inner.consumer_count.send_modify(|count| *count += 1);
        info!(conn_id = %id, "consumer registered");
        Ok(())
    }

    fn insert(&self, conn: ConnectionRef, role: Role) -> Result<(), RegistryError> {
        // Both sets are locked, always in this order, so the membership check and the insert
        // are atomic with respect to the other set.
        let mut producers = self
            .inner
            .producers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut consumers = self
            .inner
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let id = conn.id();
        if producers.iter().chain(consumers.iter()).any(|c| c.id() == id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        match role {
            Role::Producer => producers.push(conn),
            Role::Consumer => consumers.push(conn),
        }
        Ok(())
    }

    /// Snapshot of the producer set in registration order.
    pub fn producers(&self) -> Vec<ConnectionRef> {
        self.inner
            .producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the consumer set in registration order.
    pub fn consumers(&self) -> Vec<ConnectionRef> {
        self.inner
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the consumers whose mailbox is still open, in registration order.
    pub fn live_consumers(&self) -> Vec<ConnectionRef> {
        self.inner
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|conn| !conn.mailbox().is_closed())
            .cloned()
            .collect()
    }

    /// Looks up the producer with the given id.
    pub fn producer(&self, id: ConnectionId) -> Option<ConnectionRef> {
        self.inner
            .producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|conn| conn.id() == id)
            .cloned()
    }

    /// Number of registered producers.
    pub fn producer_count(&self) -> usize {
        self.inner
            .producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of registered consumers, including ones that have since gone away.
    pub fn consumer_count(&self) -> usize {
        *self.inner.consumer_count.borrow()
    }

    /// Returns `true` until [`stop`](Registry::stop) is called.
    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Stops the relay. Every handler and both routing services observe this.
    ///
    /// Idempotent; returns `true` only for the call that actually stopped the relay.
    pub fn stop(&self) -> bool {
        let stopped = self
            .inner
            .running
            .send_if_modified(|running| std::mem::replace(running, false));
        if stopped {
            info!("relay stopping");
        }
        stopped
    }

    /// Completes once the relay has been stopped.
    pub async fn stopped(&self) {
        let mut running = self.inner.running.subscribe();
        // The sender lives as long as `self`, so this can only finish by observing `false`.
        let _ = running.wait_for(|running| !running).await;
    }

    /// Completes once more than `seen` consumers have registered in total.
    ///
    /// Pass the [`consumer_count`](Registry::consumer_count) observed before inspecting the
    /// consumer set to wait for the next registration without missing one in between.
    pub async fn consumer_registered(&self, seen: usize) {
        let mut count = self.inner.consumer_count.subscribe();
        debug!(seen, "waiting for a consumer to register");
        let _ = count.wait_for(|count| *count > seen).await;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("producers", &self.producer_count())
            .field("consumers", &self.consumer_count())
            .field("running", &self.is_running())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Role {
    Producer,
    Consumer,
}
