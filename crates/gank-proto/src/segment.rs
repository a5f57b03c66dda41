//! Splitting of stream payloads into DATA-sized segments

use bytes::Bytes;

/// Largest payload carried by a single STREAM_DATA frame
pub const MAX_SEGMENT_SIZE: usize = 4096;

/// Iterator over consecutive segments of a payload
pub struct Segments {
    rest: Bytes,
    first: bool,
}

impl Iterator for Segments {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.rest.is_empty() {
            // An empty payload still produces one (empty) segment
            if std::mem::take(&mut self.first) {
                return Some(Bytes::new());
            }
            return None;
        }
        self.first = false;
        let len = self.rest.len().min(MAX_SEGMENT_SIZE);
        Some(self.rest.split_to(len))
    }
}

/// Split `data` into chunks of at most [`MAX_SEGMENT_SIZE`] bytes, in order.
///
/// Chunks share the original allocation.
pub fn segment(data: Bytes) -> Segments {
    Segments {
        rest: data,
        first: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_small_payload_is_one_segment() {
        let parts: Vec<_> = segment(Bytes::from_static(b"abc")).collect();
        assert_eq!(parts, vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn test_empty_payload() {
        let parts: Vec<_> = segment(Bytes::new()).collect();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[test]
    fn test_large_payload_reassembles() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let parts: Vec<_> = segment(Bytes::from(data.clone())).collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), MAX_SEGMENT_SIZE);
        assert_eq!(parts[1].len(), MAX_SEGMENT_SIZE);
        assert_eq!(parts[2].len(), 10_000 - 2 * MAX_SEGMENT_SIZE);

        let mut joined = BytesMut::new();
        for part in parts {
            joined.extend_from_slice(&part);
        }
        assert_eq!(&joined[..], &data[..]);
    }

    #[test]
    fn test_exact_multiple() {
        let parts: Vec<_> = segment(Bytes::from(vec![7u8; MAX_SEGMENT_SIZE * 2])).collect();
        assert_eq!(parts.len(), 2);
    }
}
