use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::AmuxError;

/// Default retained window: 2 MiB of raw terminal bytes.
pub const DEFAULT_CAPACITY: usize = 2 * 1024 * 1024;

/// Fixed-capacity ring of raw bytes produced by a session's process.
///
/// Positions handed to readers are cumulative byte counts ever written, not
/// physical indices, so a stale position is detectable after wraparound.
/// Internally synchronized: safe under many concurrent readers and writers.
#[derive(Debug)]
pub struct TerminalBuffer {
    inner: Mutex<Ring>,
    capacity: usize,
}

#[derive(Debug)]
struct Ring {
    data: VecDeque<u8>,
    total_written: u64,
}

/// Result of an incremental read: the bytes since the requested position and
/// the position to pass next time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinceResult {
    pub data: Vec<u8>,
    pub position: u64,
}

impl TerminalBuffer {
    pub fn new(capacity: usize) -> Result<Self, AmuxError> {
        if capacity == 0 {
            return Err(AmuxError::InvalidCapacity(capacity));
        }
        Ok(Self {
            inner: Mutex::new(Ring {
                data: VecDeque::with_capacity(capacity.min(64 * 1024)),
                total_written: 0,
            }),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append bytes, evicting the oldest on wraparound. A write longer than
    /// the capacity keeps only its final `capacity` bytes; the counter still
    /// advances by the full length so reader positions stay consistent.
    pub fn write(&self, data: &[u8]) {
        let mut ring = self.inner.lock().expect("terminal buffer poisoned");
        let skip = data.len().saturating_sub(self.capacity);
        ring.data.extend(&data[skip..]);
        while ring.data.len() > self.capacity {
            ring.data.pop_front();
        }
        ring.total_written = ring.total_written.saturating_add(data.len() as u64);
    }

    /// The full retained window, oldest byte first.
    pub fn dump_all(&self) -> Vec<u8> {
        let ring = self.inner.lock().expect("terminal buffer poisoned");
        ring.data.iter().copied().collect()
    }

    /// Cumulative byte count ever written.
    pub fn total_written(&self) -> u64 {
        let ring = self.inner.lock().expect("terminal buffer poisoned");
        ring.total_written
    }

    /// Bytes written since `position`.
    ///
    /// A position at or beyond the counter yields nothing. A stale position
    /// (older than the retained window) yields a full dump rather than a
    /// partial, corrupt range.
    pub fn written_since(&self, position: u64) -> SinceResult {
        let ring = self.inner.lock().expect("terminal buffer poisoned");
        let total = ring.total_written;
        if position >= total {
            return SinceResult {
                data: Vec::new(),
                position: total,
            };
        }
        let window_start = total - ring.data.len() as u64;
        let start = if position < window_start {
            // Stale: the requested bytes were already evicted.
            0
        } else {
            (position - window_start) as usize
        };
        SinceResult {
            data: ring.data.iter().skip(start).copied().collect(),
            position: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            TerminalBuffer::new(0),
            Err(AmuxError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn dump_is_last_capacity_bytes_in_order() {
        let buf = TerminalBuffer::new(4).unwrap();
        buf.write(b"ab");
        buf.write(b"cd");
        assert_eq!(buf.dump_all(), b"abcd");
        buf.write(b"ef");
        assert_eq!(buf.dump_all(), b"cdef");
        assert_eq!(buf.total_written(), 6);
    }

    #[test]
    fn oversized_write_keeps_final_capacity_bytes() {
        let buf = TerminalBuffer::new(4).unwrap();
        buf.write(b"0123456789");
        assert_eq!(buf.dump_all(), b"6789");
        assert_eq!(buf.total_written(), 10);
    }

    #[test]
    fn since_at_counter_is_empty() {
        let buf = TerminalBuffer::new(8).unwrap();
        buf.write(b"hello");
        let res = buf.written_since(5);
        assert!(res.data.is_empty());
        assert_eq!(res.position, 5);
    }

    #[test]
    fn since_beyond_counter_is_empty() {
        let buf = TerminalBuffer::new(8).unwrap();
        buf.write(b"hi");
        let res = buf.written_since(999);
        assert!(res.data.is_empty());
        assert_eq!(res.position, 2);
    }

    #[test]
    fn since_fresh_position_returns_exact_suffix() {
        let buf = TerminalBuffer::new(16).unwrap();
        buf.write(b"hello ");
        let first = buf.written_since(0);
        assert_eq!(first.data, b"hello ");
        buf.write(b"world");
        let second = buf.written_since(first.position);
        assert_eq!(second.data, b"world");
        assert_eq!(second.position, 11);
    }

    #[test]
    fn since_stale_position_falls_back_to_full_dump() {
        let buf = TerminalBuffer::new(4).unwrap();
        buf.write(b"abcdef");
        // Position 1 refers to evicted bytes.
        let res = buf.written_since(1);
        assert_eq!(res.data, buf.dump_all());
        assert_eq!(res.position, 6);
    }

    #[test]
    fn concurrent_writers_never_tear() {
        use std::sync::Arc;
        let buf = Arc::new(TerminalBuffer::new(1024).unwrap());
        let mut handles = Vec::new();
        for byte in [b'a', b'b', b'c', b'd'] {
            let buf = Arc::clone(&buf);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    buf.write(&[byte; 8]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buf.total_written(), 4 * 200 * 8);
        // Every 8-byte chunk must be homogeneous: a torn write would
        // interleave bytes from two writers inside one chunk.
        let dump = buf.dump_all();
        for chunk in dump.chunks(8) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }
}
