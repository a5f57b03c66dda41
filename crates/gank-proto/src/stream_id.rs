//! Stream identifiers

use std::fmt;
use uuid::Uuid;

/// 128-bit random stream identifier, 16 bytes on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId([u8; 16]);

impl StreamId {
    pub const LEN: usize = 16;

    /// Allocate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Read an id from the first 16 bytes of `src`
    pub fn from_slice(src: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = src.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_slice() {
        let id = StreamId::new();
        let mut buf = id.as_bytes().to_vec();
        buf.extend_from_slice(b"trailing");
        assert_eq!(StreamId::from_slice(&buf), Some(id));
        assert_eq!(StreamId::from_slice(&buf[..15]), None);
    }

    #[test]
    fn test_display_is_hex() {
        let id = StreamId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }
}
