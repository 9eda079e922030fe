//! Per-connection protocol state machine.
//!
//! A [`ConnectionHandler`] owns one accepted stream. The sign of the very first length header
//! decides the connection's [`Role`] for its whole lifetime:
//!
//! - positive: a **producer**, a client that believes it is talking to the real server. Every
//!   frame it sends is forwarded to the consumers, then the handler waits for the correlated
//!   reply and writes it back verbatim.
//! - zero or negative: a **consumer**. The first payload is a handshake and is discarded. From
//!   then on the handler writes each broadcast request to the consumer and forwards whatever the
//!   consumer sends back, tagged with the correlation ids the consumer supplies.
//!
//! Every wait (socket, shared queue, mailbox) races against the registry's stop signal, so a
//! stopped relay releases all handlers immediately.

use std::{fmt, future::Future, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::{
    error::ConnectionError,
    id::ConnectionId,
    mailbox::{bounded, MailboxReceiver, MailboxSender, DEFAULT_MAILBOX_CAPACITY},
    registry::{ConnectionRef, Registry},
    transaction::Transaction,
    wire::{self, LengthHeader},
};

/// Default upper bound for a single payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// The role a connection takes on after its first frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// No frame received yet.
    Unknown,
    /// Submits queries and waits for one correlated response per query.
    Producer,
    /// Receives broadcast queries and submits correlated responses.
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Unknown => write!(f, "unknown"),
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// What a peer disconnect does to the rest of the relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DisconnectPolicy {
    /// Any end-of-stream stops the whole relay.
    #[default]
    StopRelay,
    /// Only the disconnected connection is torn down.
    CloseConnection,
}

/// Settings shared by every connection handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Capacity of each connection's mailbox.
    pub mailbox_capacity: usize,
    /// Largest payload a length header may announce.
    pub max_frame_bytes: usize,
    /// Deadline for waiting on the mailbox; `None` waits indefinitely.
    pub mailbox_timeout: Option<Duration>,
    /// Reaction to a peer disconnect.
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            mailbox_timeout: None,
            disconnect_policy: DisconnectPolicy::default(),
        }
    }
}

/// Writers for the two shared queues.
#[derive(Clone, Debug)]
pub struct SharedQueues {
    /// Producer requests, drained by the broadcast routing service.
    pub to_consumers: MailboxSender<Transaction>,
    /// Consumer replies, drained by the point-to-point routing service.
    pub to_producers: MailboxSender<Transaction>,
}

/// Serves a single connection until it disconnects, fails, or the relay stops.
pub struct ConnectionHandler<S> {
    id: ConnectionId,
    role: Role,
    message_seq: u32,
    // Replies that answered an earlier request of this producer.
    stale_replies: u64,
    stream: S,
    // Handed to the registry once the role is known.
    mailbox_tx: Option<MailboxSender<Transaction>>,
    mailbox: MailboxReceiver<Transaction>,
    registry: Registry,
    queues: SharedQueues,
    options: ConnectionOptions,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a handler for `stream` with a fresh mailbox.
    pub fn new(
        id: ConnectionId,
        stream: S,
        registry: Registry,
        queues: SharedQueues,
        options: ConnectionOptions,
    ) -> Self {
        let (mailbox_tx, mailbox) = bounded(options.mailbox_capacity);
        ConnectionHandler {
            id,
            role: Role::Unknown,
            message_seq: 0,
            stale_replies: 0,
            stream,
            mailbox_tx: Some(mailbox_tx),
            mailbox,
            registry,
            queues,
            options,
        }
    }


    /// Runs the protocol loop and releases the stream when done.
    ///
    /// Returns `Ok(())` when the relay was stopped, otherwise the error that ended the
    /// connection. A disconnect also stops the relay under [`DisconnectPolicy::StopRelay`].
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(conn_id = %self.id, "connection opened");
        let result = match self.serve().await {
            Ok(()) | Err(ConnectionError::Stopped) => {
                info!(conn_id = %self.id, role = %self.role, "relay stopped, closing connection");
                Ok(())
            }
            Err(ConnectionError::Disconnected) => {
                info!(conn_id = %self.id, role = %self.role, "peer disconnected");
                if self.options.disconnect_policy == DisconnectPolicy::StopRelay {
                    self.registry.stop();
                }
                Err(ConnectionError::Disconnected)
            }
            Err(err) => {
                warn!(conn_id = %self.id, role = %self.role, error = %err, "connection failed");
                Err(err)
            }
        };

        if let Err(err) = self.stream.shutdown().await {
            trace!(conn_id = %self.id, error = %err, "shutdown after close failed");
        }
        debug!(
            conn_id = %self.id,
            stale_replies = self.stale_replies,
            "socket connection closed"
        );
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        while self.registry.is_running() {
            let header = guarded(&self.registry, wire::read_length(&mut self.stream)).await?;
            let (role, len) = match self.role {
                Role::Unknown => {
                    let role = self.resolve_role(header)?;
                    (role, self.check_len(header.value.unsigned_abs() as usize)?)
                }
                role => (role, self.payload_len(header)?),
            };
            let payload = guarded(&self.registry, wire::read_payload(&mut self.stream, len)).await?;
            trace!(
                conn_id = %self.id,
                role = %role,
                payload = %String::from_utf8_lossy(&payload),
                "frame received"
            );

            if role == Role::Producer {
                self.producer_cycle(header, payload).await?;
            } else {
                self.consumer_cycle(header, payload).await?;
            }
            self.message_seq = self.message_seq.wrapping_add(1);
        }
        Ok(())
    }

    /// Decides the role from the first header and registers the connection under it.
    fn resolve_role(&mut self, header: LengthHeader) -> Result<Role, ConnectionError> {
        let Some(mailbox) = self.mailbox_tx.take() else {
            return Err(ConnectionError::QueueClosed);
        };
        let conn = ConnectionRef::new(self.id, mailbox);

        if header.value > 0 {
            self.role = Role::Producer;
            self.registry.register_producer(conn)?;
        } else {
            self.role = Role::Consumer;
            self.registry.register_consumer(conn)?;
        }
        Ok(self.role)
    }

    fn payload_len(&self, header: LengthHeader) -> Result<usize, ConnectionError> {
        if header.value < 0 {
            return Err(ConnectionError::InvalidLength(header.value));
        }
        self.check_len(header.value as usize)
    }

    fn check_len(&self, len: usize) -> Result<usize, ConnectionError> {
        if len > self.options.max_frame_bytes {
            return Err(ConnectionError::FrameTooLarge {
                len,
                max: self.options.max_frame_bytes,
            });
        }
        Ok(len)
    }

    async fn producer_cycle(
        &mut self,
        header: LengthHeader,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let request = Transaction::new(header.raw, payload, self.id, self.message_seq);
        enqueue(&self.registry, &self.queues.to_consumers, request).await?;

        // With several consumers every one of them may answer; only the first reply to the
        // current request is written, later ones are discarded when they surface.
        let reply = loop {
            let reply = self.next_delivery().await?;
            if reply.message_id() == self.message_seq {
                break reply;
            }
            self.stale_replies += 1;
            debug!(
                conn_id = %self.id,
                message_id = reply.message_id(),
                expected = self.message_seq,
                "discarding reply to an earlier request"
            );
        };
        debug!(
            conn_id = %self.id,
            message_id = reply.message_id(),
            len = reply.payload().len(),
            "reply to producer"
        );
        let frame = wire::encode_producer_frame(&reply);
        guarded(&self.registry, wire::write_frame(&mut self.stream, &frame)).await
    }

    async fn consumer_cycle(
        &mut self,
        header: LengthHeader,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        // The first frame is the handshake and answers nothing.
        if self.message_seq > 0 {
            let correlation =
                guarded(&self.registry, wire::read_correlation(&mut self.stream)).await?;
            let reply = Transaction::new(
                header.raw,
                payload,
                correlation.thread_id,
                correlation.message_id,
            );
            enqueue(&self.registry, &self.queues.to_producers, reply).await?;
        }

        let request = self.next_delivery().await?;
        debug!(
            conn_id = %self.id,
            thread_id = %request.thread_id(),
            message_id = request.message_id(),
            len = request.payload().len(),
            "request to consumer"
        );
        let frame = wire::encode_consumer_frame(&request);
        guarded(&self.registry, wire::write_frame(&mut self.stream, &frame)).await
    }

    async fn next_delivery(&mut self) -> Result<Transaction, ConnectionError> {
        let mailbox = &mut self.mailbox;
        let recv = async move { mailbox.recv().await.ok_or(ConnectionError::QueueClosed) };
        match self.options.mailbox_timeout {
            Some(timeout) => {
                guarded(&self.registry, async move {
                    tokio::time::timeout(timeout, recv)
                        .await
                        .map_err(|_| ConnectionError::MailboxTimeout)?
                })
                .await
            }
            None => guarded(&self.registry, recv).await,
        }
    }
}

impl<S> fmt::Debug for ConnectionHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("message_seq", &self.message_seq)
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

/// Races `fut` against the relay stopping.
async fn guarded<F, T>(registry: &Registry, fut: F) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, ConnectionError>>,
{
    tokio::select! {
        biased;
        _ = registry.stopped() => Err(ConnectionError::Stopped),
        res = fut => res,
    }
}

/// Pushes onto a shared queue, waiting for room.
async fn enqueue(
    registry: &Registry,
    queue: &MailboxSender<Transaction>,
    tx: Transaction,
) -> Result<(), ConnectionError> {
    guarded(registry, async move {
        queue
            .send(tx)
            .await
            .map_err(|_| ConnectionError::QueueClosed)
    })
    .await
}
