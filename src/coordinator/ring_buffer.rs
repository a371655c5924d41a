//! Fixed-capacity byte ring buffer for Logcat replay (§3.3 "Logcat context").
//!
//! Adapted from the teacher's `broker::ring_buffer::RingBuffer` (PTY
//! scrollback for hub reconnect snapshots): same evict-oldest-on-overflow
//! byte buffer, capped here at [`crate::constants::LOGCAT_RING_CAPACITY`]
//! (16 KiB) instead of the teacher's 1 MiB PTY scrollback default, and with
//! no `vt100` replay path — a Logcat subscriber gets raw bytes, not a
//! terminal screen.

use std::collections::VecDeque;

/// Fixed-capacity byte ring buffer. Pushing more bytes than `capacity`
/// evicts the oldest bytes first; a single push larger than `capacity`
/// keeps only its tail.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// A ring buffer sized for Logcat replay (§3 boundary: "ring buffer
    /// never exceeds 16 KiB").
    #[must_use]
    pub fn for_logcat() -> Self {
        Self::new(crate::constants::LOGCAT_RING_CAPACITY)
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() >= self.capacity {
            self.buf.clear();
            let start = data.len() - self.capacity;
            self.buf.extend(&data[start..]);
            return;
        }
        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            let to_drain = needed - self.capacity;
            self.buf.drain(..to_drain);
        }
        self.buf.extend(data);
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut v = Vec::with_capacity(a.len() + b.len());
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        v
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_empty() {
        let rb = RingBuffer::new(64);
        assert!(rb.is_empty());
        assert!(rb.to_vec().is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = RingBuffer::new(0);
    }

    #[test]
    fn for_logcat_caps_at_16_kib() {
        let rb = RingBuffer::for_logcat();
        assert_eq!(rb.capacity(), 16 * 1024);
    }

    #[test]
    fn overflow_drops_oldest_bytes() {
        let mut rb = RingBuffer::new(8);
        rb.push(b"AAAAAAAA");
        rb.push(b"BB");
        let contents = rb.to_vec();
        assert_eq!(rb.len(), 8);
        assert_eq!(&contents[..6], b"AAAAAA");
        assert_eq!(&contents[6..], b"BB");
    }

    #[test]
    fn single_push_larger_than_capacity_keeps_tail() {
        let mut rb = RingBuffer::new(8);
        rb.push(b"XXXXYYYYZZZZ");
        assert_eq!(rb.to_vec(), b"YYYYZZZZ");
    }

    #[test]
    fn late_joiner_sees_exactly_what_existed_before_it_joined() {
        // §8 invariant 5: a subscriber added at time t sees the ring buffer
        // contents that existed at t, before any later frame.
        let mut rb = RingBuffer::new(1024);
        rb.push(b"line1\n");
        rb.push(b"line2\n");
        let snapshot = rb.to_vec();
        rb.push(b"line3\n");
        assert_eq!(snapshot, b"line1\nline2\n");
    }
}
