//! Wire framing shared by producers and consumers.
//!
//! ```text
//! producer -> relay   | len: i32 LE | payload |
//! relay -> producer   | len: i32 LE | payload |
//! consumer -> relay   | len: i32 LE | payload | message_id: i32 BE | thread_id: i32 BE |
//! relay -> consumer   | len: i32 LE | payload | message_id: i32 BE | thread_id: i32 BE |
//! ```
//!
//! A consumer's very first frame is a handshake with a non-positive length and carries no
//! correlation ids. The length header and the correlation ids use different byte orders; both
//! must be kept as is for compatibility with existing clients.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::ConnectionError, id::ConnectionId, transaction::Transaction};

/// Size of the length header.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the message id plus thread id trailer on consumer frames.
pub const CORRELATION_LEN: usize = 8;

/// A decoded length header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthHeader {
    /// The bytes exactly as received.
    pub raw: [u8; 4],
    /// The signed little-endian value.
    pub value: i32,
}

impl LengthHeader {
    /// Decodes a raw header.
    pub fn from_raw(raw: [u8; 4]) -> Self {
        LengthHeader {
            raw,
            value: i32::from_le_bytes(raw),
        }
    }
}

/// Correlation ids trailing a consumer reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Correlation {
    /// Sequence number of the producer request being answered.
    pub message_id: u32,
    /// Id of the producer connection that sent the request.
    pub thread_id: ConnectionId,
}

/// Reads a 4 byte little-endian length header.
pub async fn read_length<R>(reader: &mut R) -> Result<LengthHeader, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut raw).await?;
    Ok(LengthHeader::from_raw(raw))
}

/// Reads exactly `len` payload bytes, accumulating partial reads.
pub async fn read_payload<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Reads the big-endian message id and thread id that follow a consumer reply.
pub async fn read_correlation<R>(reader: &mut R) -> Result<Correlation, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; CORRELATION_LEN];
    reader.read_exact(&mut raw).await?;
    let [m0, m1, m2, m3, t0, t1, t2, t3] = raw;
    Ok(Correlation {
        message_id: u32::from_be_bytes([m0, m1, m2, m3]),
        thread_id: ConnectionId::from_be_bytes([t0, t1, t2, t3]),
    })
}

/// Encodes a reply frame for a producer: the raw length header followed by the payload.
pub fn encode_producer_frame(tx: &Transaction) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + tx.payload().len());
    frame.extend_from_slice(&tx.size_header());
    frame.extend_from_slice(tx.payload());
    frame
}

/// Encodes a request frame for a consumer: length header, payload, then message id and thread
/// id in big-endian order.
pub fn encode_consumer_frame(tx: &Transaction) -> Vec<u8> {
    let mut frame =
        Vec::with_capacity(LENGTH_PREFIX_LEN + tx.payload().len() + CORRELATION_LEN);
    frame.extend_from_slice(&tx.size_header());
    frame.extend_from_slice(tx.payload());
    frame.extend_from_slice(&tx.message_id().to_be_bytes());
    frame.extend_from_slice(&tx.thread_id().to_be_bytes());
    frame
}

/// Writes a frame and flushes the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
