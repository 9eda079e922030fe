use std::fmt;

/// Identifier of an accepted connection.
///
/// Ids are handed out by the [`Registry`](crate::registry::Registry) in accept order, starting at `0`,
/// and are never reused for the lifetime of a relay. A producer's id is the *thread id* that
/// consumers echo back so that their replies can be routed to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Creates a connection id from its raw value.
    pub const fn new(id: u32) -> Self {
        ConnectionId(id)
    }

    /// Encodes the id the way it travels on the wire: a 4 byte big-endian integer.
    pub const fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Decodes an id from its 4 byte big-endian wire form.
    pub const fn from_be_bytes(bytes: [u8; 4]) -> Self {
        ConnectionId(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_big_endian() {
        let id = ConnectionId::new(0x0102_0304);
        assert_eq!(id.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(ConnectionId::from_be_bytes([1, 2, 3, 4]), id);
    }

    #[test]
    fn display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn#7");
    }
}
