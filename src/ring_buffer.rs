//! Fixed-capacity byte FIFO between the USB reader and consumers.
//!
//! When a write does not fit, the oldest bytes are dropped to make room, so
//! the buffer always holds the most recent data. The byte store and the
//! bookkeeping sit behind separate locks: a copy holds the data lock for its
//! duration, while the statistics lock is only taken for a few field
//! updates, so `stats()` never waits behind a large copy.

use log::warn;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Cursor {
    read: usize,
    write: usize,
    fill: usize,
    peak_fill: usize,
    total_written: u64,
    total_read: u64,
    overflow_count: u64,
    underflow_count: u64,
    since: Instant,
}

impl Cursor {
    fn new() -> Self {
        Self {
            read: 0,
            write: 0,
            fill: 0,
            peak_fill: 0,
            total_written: 0,
            total_read: 0,
            overflow_count: 0,
            underflow_count: 0,
            since: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingBufferStats {
    pub capacity: usize,
    pub available: usize,
    pub fill_pct: f64,
    pub peak_fill: usize,
    pub peak_fill_pct: f64,
    pub total_written: u64,
    pub total_read: u64,
    pub overflow_count: u64,
    pub underflow_count: u64,
    pub uptime: Duration,
}

pub struct RingBuffer {
    capacity: usize,
    data: Mutex<Vec<u8>>,
    cursor: Mutex<Cursor>,
}

fn pct(n: usize, capacity: usize) -> f64 {
    let p = n as f64 / capacity as f64 * 100.0;
    (p * 100.0).round() / 100.0
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            data: Mutex::new(vec![0; capacity]),
            cursor: Mutex::new(Cursor::new()),
        }
    }

    pub fn with_size_mb(size_mb: usize) -> Self {
        Self::new(size_mb * 1024 * 1024)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `bytes`, discarding the oldest data on overflow. Returns the
    /// number of bytes written; a block larger than the capacity keeps only
    /// its last `capacity` bytes.
    pub fn write(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        let requested = bytes.len();
        let bytes = if requested > self.capacity {
            &bytes[requested - self.capacity..]
        } else {
            bytes
        };
        let n = bytes.len();

        let mut data = self.data.lock();
        let start = {
            let mut cur = self.cursor.lock();
            let free = self.capacity - cur.fill;
            // Overflow is judged on the untrimmed length.
            if requested > free {
                let evicted = n.saturating_sub(free);
                let discard = evicted + (requested - n);
                cur.read = (cur.read + evicted) % self.capacity;
                cur.fill -= evicted;
                cur.overflow_count += 1;
                warn!(
                    "Ring buffer overflow: discarded {} bytes ({} total overflows)",
                    discard, cur.overflow_count
                );
            }
            cur.write
        };

        let first = n.min(self.capacity - start);
        data[start..start + first].copy_from_slice(&bytes[..first]);
        data[..n - first].copy_from_slice(&bytes[first..]);

        let mut cur = self.cursor.lock();
        cur.write = (start + n) % self.capacity;
        cur.fill += n;
        cur.peak_fill = cur.peak_fill.max(cur.fill);
        cur.total_written += n as u64;
        n
    }

    /// Remove up to `max` bytes in FIFO order. An empty buffer yields `None`
    /// and counts as an underflow.
    pub fn read(&self, max: usize) -> Option<Vec<u8>> {
        let data = self.data.lock();
        let (start, n) = {
            let mut cur = self.cursor.lock();
            if cur.fill == 0 || max == 0 {
                cur.underflow_count += 1;
                return None;
            }
            (cur.read, max.min(cur.fill))
        };

        let mut out = Vec::with_capacity(n);
        let first = n.min(self.capacity - start);
        out.extend_from_slice(&data[start..start + first]);
        out.extend_from_slice(&data[..n - first]);

        let mut cur = self.cursor.lock();
        cur.read = (start + n) % self.capacity;
        cur.fill -= n;
        cur.total_read += n as u64;
        Some(out)
    }

    /// Copy up to `max` bytes without consuming them.
    pub fn peek(&self, max: usize) -> Option<Vec<u8>> {
        let data = self.data.lock();
        let (start, n) = {
            let cur = self.cursor.lock();
            if cur.fill == 0 || max == 0 {
                return None;
            }
            (cur.read, max.min(cur.fill))
        };
        let mut out = Vec::with_capacity(n);
        let first = n.min(self.capacity - start);
        out.extend_from_slice(&data[start..start + first]);
        out.extend_from_slice(&data[..n - first]);
        Some(out)
    }

    pub fn available(&self) -> usize {
        self.cursor.lock().fill
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn fill_pct(&self) -> f64 {
        pct(self.available(), self.capacity)
    }

    pub fn stats(&self) -> RingBufferStats {
        let cur = *self.cursor.lock();
        RingBufferStats {
            capacity: self.capacity,
            available: cur.fill,
            fill_pct: pct(cur.fill, self.capacity),
            peak_fill: cur.peak_fill,
            peak_fill_pct: pct(cur.peak_fill, self.capacity),
            total_written: cur.total_written,
            total_read: cur.total_read,
            overflow_count: cur.overflow_count,
            underflow_count: cur.underflow_count,
            uptime: cur.since.elapsed(),
        }
    }

    /// Drop all contents and zero every counter.
    pub fn reset(&self) {
        let _data = self.data.lock();
        *self.cursor.lock() = Cursor::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn fifo_order_with_wraparound() {
        let rb = RingBuffer::new(8);
        assert_eq!(rb.write(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(rb.read(4), Some(vec![1, 2, 3, 4]));
        rb.write(&[7, 8, 9, 10]);
        assert_eq!(rb.available(), 6);
        assert_eq!(rb.read(100), Some(vec![5, 6, 7, 8, 9, 10]));
        assert!(rb.is_empty());
    }

    #[test]
    fn overflow_discards_exactly_the_oldest_bytes() {
        let rb = RingBuffer::new(8);
        rb.write(&[1, 2, 3, 4, 5, 6]);
        rb.write(&[7, 8, 9, 10, 11]);
        let stats = rb.stats();
        assert_eq!(stats.overflow_count, 1);
        assert_eq!(stats.available, 8);
        assert_eq!(stats.fill_pct, 100.0);
        assert_eq!(rb.read(8), Some(vec![4, 5, 6, 7, 8, 9, 10, 11]));
    }

    #[test]
    fn oversized_block_keeps_its_tail() {
        let rb = RingBuffer::new(4);
        rb.write(&[1]);
        assert_eq!(rb.write(&[2, 3, 4, 5, 6, 7]), 4);
        assert_eq!(rb.read(10), Some(vec![4, 5, 6, 7]));
    }

    #[test]
    fn oversized_block_into_empty_buffer_counts_overflow() {
        let rb = RingBuffer::new(4);
        assert_eq!(rb.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(rb.stats().overflow_count, 1);
        assert_eq!(rb.read(4), Some(vec![3, 4, 5, 6]));
    }

    #[test]
    fn exact_fit_is_not_an_overflow() {
        let rb = RingBuffer::new(4);
        rb.write(&[1, 2, 3, 4]);
        assert_eq!(rb.stats().overflow_count, 0);
        assert_eq!(rb.available(), 4);
    }

    #[test]
    fn empty_read_counts_underflow() {
        let rb = RingBuffer::new(4);
        assert_eq!(rb.read(1), None);
        assert_eq!(rb.read(1), None);
        assert_eq!(rb.stats().underflow_count, 2);
    }

    #[test]
    fn peek_does_not_consume() {
        let rb = RingBuffer::new(4);
        rb.write(&[1, 2, 3]);
        assert_eq!(rb.peek(2), Some(vec![1, 2]));
        assert_eq!(rb.available(), 3);
        assert_eq!(rb.read(3), Some(vec![1, 2, 3]));
    }

    #[test]
    fn stats_track_totals_and_peak() {
        let rb = RingBuffer::new(200);
        rb.write(&[0; 150]);
        rb.read(100);
        rb.write(&[0; 10]);
        let stats = rb.stats();
        assert_eq!(stats.total_written, 160);
        assert_eq!(stats.total_read, 100);
        assert_eq!(stats.peak_fill, 150);
        assert_eq!(stats.peak_fill_pct, 75.0);
        assert_eq!(stats.fill_pct, 30.0);

        rb.reset();
        let stats = rb.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_written, 0);
    }

    #[test]
    fn concurrent_writer_and_reader_preserve_order() {
        let rb = Arc::new(RingBuffer::new(1 << 16));
        let writer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    rb.write(&i.to_le_bytes());
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 4000 {
            if let Some(bytes) = rb.read(64) {
                received.extend(bytes);
            } else {
                thread::yield_now();
            }
        }
        writer.join().unwrap();

        let values: Vec<u32> = received
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, (0..1000).collect::<Vec<_>>());
    }
}
