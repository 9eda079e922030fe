//! Defines error handling constructs for the relay.
//!
//! [`SendError`] is returned when pushing into a mailbox or shared queue fails and hands the
//! undelivered message back to the caller. [`ConnectionError`] describes why a connection
//! handler stopped, and [`RegistryError`] covers invalid registrations.

use std::{error, fmt, io};

use thiserror::Error;

use crate::id::ConnectionId;

/// Error that can occur when sending a message into a mailbox.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SendError<M = ()> {
    /// The receiving side has been dropped.
    Closed(M),
    /// The mailbox is full.
    MailboxFull(M),
    /// Timed out waiting for mailbox capacity.
    Timeout(Option<M>),
}

impl<M> fmt::Debug for SendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => write!(f, "Closed"),
            SendError::MailboxFull(_) => write!(f, "MailboxFull"),
            SendError::Timeout(_) => write!(f, "Timeout"),
        }
    }
}

impl<M> fmt::Display for SendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => write!(f, "mailbox closed"),
            SendError::MailboxFull(_) => write!(f, "mailbox full"),
            SendError::Timeout(_) => write!(f, "timeout"),
        }
    }
}

impl<M> error::Error for SendError<M> {}

/// Reason a connection handler stopped serving its socket.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed the stream, possibly in the middle of a frame.
    #[error("peer disconnected")]
    Disconnected,
    /// Any other transport failure.
    #[error("io error: {0}")]
    Io(io::Error),
    /// A length header that is not valid in the connection's current state.
    #[error("invalid frame length {0}")]
    InvalidLength(i32),
    /// A length header announcing more bytes than the relay accepts.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The relay was stopped while the handler was waiting.
    #[error("relay stopped")]
    Stopped,
    /// No transaction arrived in the mailbox before the configured deadline.
    #[error("timed out waiting for the mailbox")]
    MailboxTimeout,
    /// The shared queue or the mailbox has no counterpart any more.
    #[error("queue closed")]
    QueueClosed,
    /// The connection could not be added to the registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConnectionError {
    /// Returns `true` if the peer went away, as opposed to a local or protocol failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnectionError::Disconnected)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ConnectionError::Disconnected,
            _ => ConnectionError::Io(err),
        }
    }
}

/// Error returned when registering a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection is already present in the producer or consumer set.
    #[error("{0} is already registered")]
    AlreadyRegistered(ConnectionId),
}
