//! Fixed-capacity single-producer/single-consumer byte queue.
//!
//! One [`RingBuffer`] per direction per channel (`buffer_uart`, `buffer_net`).
//! Both ends are driven from the same scheduler task (see the scheduler
//! module), so no internal locking is needed: safety here rests on the two
//! methods never being called concurrently from different threads, not on
//! any synchronization primitive.

/// Default capacity for a channel's data-path ring buffers.
pub const RING_BUFFER_SIZE: usize = 8 * 1024;

/// A fixed-capacity byte queue backed by a `Vec<u8>` used as a circular buffer.
///
/// Overflow is never silently absorbed: [`RingBuffer::enqueue`] writes as much
/// as fits and returns the short count, so the caller can count the drop.
pub struct RingBuffer {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            buf: vec![0u8; capacity],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Resets the buffer to empty, keeping its capacity.
    pub fn init(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn num_items(&self) -> usize {
        self.len
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Writes as many bytes of `data` as fit; returns the count actually written.
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_space());
        let cap = self.capacity();
        for &b in &data[..n] {
            self.buf[self.tail] = b;
            self.tail = (self.tail + 1) % cap;
        }
        self.len += n;
        n
    }

    /// Reads up to `max` bytes into `out`, returning the count actually read.
    pub fn dequeue(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.capacity();
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.len -= n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_roundtrip() {
        let mut r = RingBuffer::new(8);
        assert_eq!(r.enqueue(b"hello"), 5);
        assert_eq!(r.num_items(), 5);
        let mut out = [0u8; 5];
        assert_eq!(r.dequeue(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(r.is_empty());
    }

    #[test]
    fn wraps_around() {
        let mut r = RingBuffer::new(4);
        r.enqueue(b"ab");
        let mut out = [0u8; 1];
        r.dequeue(&mut out);
        r.enqueue(b"cde");
        assert_eq!(r.num_items(), 4);
        let mut out = [0u8; 4];
        assert_eq!(r.dequeue(&mut out), 4);
        assert_eq!(&out, b"bcde");
    }

    #[test]
    fn overflow_is_a_short_write() {
        let mut r = RingBuffer::new(4);
        assert_eq!(r.enqueue(b"abcdef"), 4);
        assert!(r.is_full());
    }

    #[test]
    fn init_resets_state() {
        let mut r = RingBuffer::new(4);
        r.enqueue(b"ab");
        r.init();
        assert!(r.is_empty());
        assert_eq!(r.free_space(), 4);
    }
}
