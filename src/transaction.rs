//! The unit of traffic moved between connections.
//!
//! A [`Transaction`] carries one frame's payload together with the raw length header it arrived
//! with and the correlation ids that tie a consumer's reply back to the producer request it
//! answers. Transactions are immutable; the payload is reference counted so that broadcasting to
//! many consumers shares a single allocation.

use std::{fmt, sync::Arc};

use crate::id::ConnectionId;

/// One relayed frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Transaction {
    size_header: [u8; 4],
    payload: Arc<[u8]>,
    thread_id: ConnectionId,
    message_id: u32,
}

impl Transaction {
    /// Creates a transaction from the raw length header it was received with.
    ///
    /// The header is forwarded byte for byte, so a peer on the other side sees exactly what the
    /// sender wrote.
    pub fn new(
        size_header: [u8; 4],
        payload: impl Into<Arc<[u8]>>,
        thread_id: ConnectionId,
        message_id: u32,
    ) -> Self {
        Transaction {
            size_header,
            payload: payload.into(),
            thread_id,
            message_id,
        }
    }

    /// Creates a transaction whose length header is derived from the payload length.
    ///
    /// # Panics
    ///
    /// Panics if the payload does not fit a signed 32 bit length.
    #[cfg(test)]
    pub(crate) fn from_payload(
        payload: impl Into<Arc<[u8]>>,
        thread_id: ConnectionId,
        message_id: u32,
    ) -> Self {
        let payload = payload.into();
        let len = i32::try_from(payload.len()).expect("payload length fits an i32 header");
        let size_header = len.to_le_bytes();
        Transaction::new(size_header, payload, thread_id, message_id)
    }

    /// The 4 raw header bytes, little-endian signed length as received.
    pub fn size_header(&self) -> [u8; 4] {
        self.size_header
    }

    /// The opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Id of the producer connection this transaction belongs to.
    pub fn thread_id(&self) -> ConnectionId {
        self.thread_id
    }

    /// Request sequence number within the producer connection.
    pub fn message_id(&self) -> u32 {
        self.message_id
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("size_header", &i32::from_le_bytes(self.size_header))
            .field("payload_len", &self.payload.len())
            .field("thread_id", &self.thread_id)
            .field("message_id", &self.message_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_kept_verbatim() {
        // A header that does not match the payload length is still forwarded unchanged.
        let tx = Transaction::new([9, 0, 0, 0], &b"abc"[..], ConnectionId::new(1), 4);
        assert_eq!(tx.size_header(), [9, 0, 0, 0]);
        assert_eq!(tx.payload(), b"abc");
        assert_eq!(tx.thread_id(), ConnectionId::new(1));
        assert_eq!(tx.message_id(), 4);
    }

    #[test]
    fn from_payload_writes_little_endian_length() {
        let tx = Transaction::from_payload(&b"hello"[..], ConnectionId::new(0), 0);
        assert_eq!(tx.size_header(), [5, 0, 0, 0]);
    }

    #[test]
    fn clones_share_the_payload() {
        let tx = Transaction::from_payload(vec![1u8; 64], ConnectionId::new(0), 0);
        let copy = tx.clone();
        assert!(std::ptr::eq(tx.payload().as_ptr(), copy.payload().as_ptr()));
    }
}
