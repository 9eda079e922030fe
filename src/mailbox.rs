//! Bounded multi-producer, single-consumer queues used for all traffic inside the relay.
//!
//! Both shared queues and every per-connection mailbox are built from [`bounded`]. Each is
//! written by exactly one logical writer and read by exactly one task, which is why a plain
//! tokio mpsc channel suffices.
//!
//! _See tokio's [`mpsc::channel`] docs for more info._
//!
//! [`mpsc::channel`]: ::tokio::sync::mpsc::channel

use std::{fmt, time::Duration};

use tokio::sync::mpsc;

use crate::error::SendError;

/// Default capacity of a connection's inbound mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 128;

/// Default capacity of each shared queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Creates a bounded mailbox, where sending to a full mailbox causes backpressure.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded<M>(capacity: usize) -> (MailboxSender<M>, MailboxReceiver<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    (MailboxSender(tx), MailboxReceiver(rx))
}

/// The sending half of a bounded mailbox.
pub struct MailboxSender<M>(mpsc::Sender<M>);

impl<M> MailboxSender<M> {
    /// Sends a message, waiting until there is capacity.
    pub async fn send(&self, msg: M) -> Result<(), SendError<M>> {
        self.0
            .send(msg)
            .await
            .map_err(|mpsc::error::SendError(msg)| SendError::Closed(msg))
    }

    /// Attempts to immediately send a message, failing with [`SendError::MailboxFull`] if the
    /// mailbox has no spare capacity.
    pub fn try_send(&self, msg: M) -> Result<(), SendError<M>> {
        self.0.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(msg) => SendError::MailboxFull(msg),
            mpsc::error::TrySendError::Closed(msg) => SendError::Closed(msg),
        })
    }

    /// Sends a message, waiting until there is capacity, but only for a limited time.
    pub async fn send_timeout(&self, msg: M, timeout: Duration) -> Result<(), SendError<M>> {
        self.0.send_timeout(msg, timeout).await.map_err(|err| match err {
            mpsc::error::SendTimeoutError::Timeout(msg) => SendError::Timeout(Some(msg)),
            mpsc::error::SendTimeoutError::Closed(msg) => SendError::Closed(msg),
        })
    }

    /// Checks if the receiving half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

}

impl<M> Clone for MailboxSender<M> {
    fn clone(&self) -> Self {
        MailboxSender(self.0.clone())
    }
}

impl<M> fmt::Debug for MailboxSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSender")
            .field("capacity", &self.0.capacity())
            .field("max_capacity", &self.0.max_capacity())
            .finish()
    }
}

/// The receiving half of a bounded mailbox.
pub struct MailboxReceiver<M>(mpsc::Receiver<M>);

impl<M> MailboxReceiver<M> {
    /// Receives the next message, waiting until one is available.
    ///
    /// Returns `None` once every sender has been dropped and the mailbox is drained.
    pub async fn recv(&mut self) -> Option<M> {
        self.0.recv().await
    }

    /// Receives the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<M> {
        self.0.try_recv().ok()
    }
}

impl<M> fmt::Debug for MailboxReceiver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxReceiver")
            .field("len", &self.0.len())
            .finish()
    }
}
