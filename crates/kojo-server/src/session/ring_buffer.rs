//! Circular buffer for session scrollback.
//!
//! Stores the last N bytes of session output so that a new subscriber
//! can receive a scrollback snapshot without the host keeping unbounded history.

use std::sync::Mutex;

/// Default scrollback capacity (1 MiB).
pub const DEFAULT_SCROLLBACK_BYTES: usize = 1024 * 1024;

/// A fixed-capacity circular byte buffer, safe for concurrent use.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    capacity: usize,
    /// Write position (wraps around).
    write_pos: usize,
    /// Total bytes ever written (used to detect wrap).
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                capacity,
                write_pos: 0,
                total_written: 0,
            }),
        }
    }

    /// Write data into the ring buffer, overwriting oldest data if full.
    pub fn write(&self, data: &[u8]) {
        let mut inner = self.lock();
        if inner.capacity == 0 {
            return;
        }
        for &byte in data {
            let pos = inner.write_pos;
            inner.buf[pos] = byte;
            inner.write_pos = (pos + 1) % inner.capacity;
            inner.total_written += 1;
        }
    }

    /// Copy all buffered data out in chronological order.
    ///
    /// Returns up to `capacity` bytes, starting from the oldest data.
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.lock();
        if inner.total_written == 0 {
            return Vec::new();
        }

        let len = inner.len();
        let mut result = Vec::with_capacity(len);

        if inner.total_written <= inner.capacity as u64 {
            // Haven't wrapped yet; data starts at 0
            result.extend_from_slice(&inner.buf[..len]);
        } else {
            // Wrapped; oldest data starts at write_pos
            result.extend_from_slice(&inner.buf[inner.write_pos..]);
            result.extend_from_slice(&inner.buf[..inner.write_pos]);
        }

        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().total_written == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_write_read() {
        let rb = RingBuffer::new(10);
        rb.write(b"hello");
        assert_eq!(rb.snapshot(), b"hello");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn wrap_around() {
        let rb = RingBuffer::new(5);
        rb.write(b"abcde"); // fills exactly
        rb.write(b"fg"); // overwrites a, b
        assert_eq!(rb.snapshot(), b"cdefg");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn empty_buffer() {
        let rb = RingBuffer::new(10);
        assert!(rb.is_empty());
        assert_eq!(rb.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn zero_capacity() {
        let rb = RingBuffer::new(0);
        rb.write(b"test");
        assert!(rb.is_empty());
    }

    #[test]
    fn snapshot_equals_total_below_capacity() {
        let rb = RingBuffer::new(64);
        rb.write(b"one ");
        rb.write(b"two ");
        rb.write(b"three");
        assert_eq!(rb.snapshot(), b"one two three");
    }

    #[test]
    fn snapshot_never_exceeds_capacity() {
        let rb = RingBuffer::new(8);
        for _ in 0..100 {
            rb.write(b"0123456789");
        }
        assert_eq!(rb.snapshot().len(), 8);
        assert_eq!(rb.snapshot(), b"23456789");
    }
}
