//! Background worker that pulls blocks off the device pipe into the ring
//! buffer.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use time::OffsetDateTime;

use crate::{
    config::AcquisitionSettings, context::DeviceContext, registers::PIPE_OUT_DDR3,
    ring_buffer::RingBuffer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSettings {
    pub data_length_words: usize,
    pub read_interval: Duration,
    pub error_backoff: Duration,
    pub join_timeout: Duration,
    /// Stop on our own after this many iterations.
    pub iteration_limit: Option<u64>,
}

impl From<&AcquisitionSettings> for ReaderSettings {
    fn from(s: &AcquisitionSettings) -> Self {
        Self {
            data_length_words: s.data_length_words,
            read_interval: Duration::from_millis(s.read_interval_ms),
            error_backoff: Duration::from_millis(s.error_backoff_ms),
            join_timeout: Duration::from_millis(s.join_timeout_ms),
            iteration_limit: None,
        }
    }
}

/// Throughput bookkeeping with *all-time* totals and a *sliding 1 s
/// window* rate.
#[derive(Debug, Clone)]
pub struct ThroughputCounter {
    pub bytes_read: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub buffer_overruns: u64,
    pub short_reads: u64,
    pub iterations: u64,
    pub t_begin: Instant,

    window: Duration,
    events: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self {
            bytes_read: 0,
            packets_received: 0,
            packets_dropped: 0,
            buffer_overruns: 0,
            short_reads: 0,
            iterations: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average since `t_begin`, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.bytes_read as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Sliding-window rate over the last `window` duration, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Record a received packet of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();

        self.bytes_read += size as u64;
        self.packets_received += 1;

        self.events.push_back((now, size));
        self.bytes_in_window += size;

        while let Some(&(ts, sz)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self {
            window: self.window,
            ..Default::default()
        };
    }

    pub fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            bytes_read: self.bytes_read,
            packets_received: self.packets_received,
            packets_dropped: self.packets_dropped,
            buffer_overruns: self.buffer_overruns,
            short_reads: self.short_reads,
            iterations: self.iterations,
            throughput_mbps: self.rate(),
            average_mbps: self.average_rate(),
            uptime: self.t_begin.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReaderStats {
    pub bytes_read: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub buffer_overruns: u64,
    pub short_reads: u64,
    pub iterations: u64,
    pub throughput_mbps: f64,
    pub average_mbps: f64,
    pub uptime: Duration,
}

/// Published once per block; the payload itself stays in the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockNotice {
    pub sequence: u64,
    pub size: usize,
    pub timestamp: OffsetDateTime,
}

pub trait NotificationSink: Send + Sync {
    /// Deliver a notice without blocking. Returns `false` if it was dropped.
    fn notify(&self, notice: BlockNotice) -> bool;
}

impl NotificationSink for Sender<BlockNotice> {
    fn notify(&self, notice: BlockNotice) -> bool {
        self.try_send(notice).is_ok()
    }
}

/// Little-endian byte image of a word block.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes
}

/// Handle to a running reader thread.
pub struct UsbReader {
    counter: Arc<Mutex<ThroughputCounter>>,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl UsbReader {
    pub fn spawn(
        ctx: DeviceContext,
        buffer: Arc<RingBuffer>,
        settings: ReaderSettings,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        let counter = Arc::new(Mutex::new(ThroughputCounter::new()));
        // Dropping the sender is the stop signal; the worker's end of the
        // done channel disconnects when it exits.
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let handle = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                reader_thread(ctx, buffer, settings, counter, sink, stop_rx);
                drop(done_tx);
            })
        };
        info!(
            "Reader started: {} words per block every {:?}",
            settings.data_length_words, settings.read_interval
        );

        Self {
            counter,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
            join_timeout: settings.join_timeout,
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.counter.lock().snapshot()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Signal the worker and wait up to the join timeout. A worker that does
    /// not finish in time is logged and left detached.
    pub fn stop(&mut self) -> ReaderStats {
        drop(self.stop_tx.take());
        match self.done_rx.recv_timeout(self.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "Reader thread did not stop within {:?}, detaching it",
                    self.join_timeout
                );
                self.handle.take();
            }
            _ => {
                if let Some(h) = self.handle.take() {
                    if h.join().is_err() {
                        error!("Reader thread panicked");
                    }
                }
            }
        }
        let stats = self.stats();
        info!(
            "Reader stopped after {} iterations, {} bytes, {} dropped",
            stats.iterations, stats.bytes_read, stats.packets_dropped
        );
        stats
    }
}

impl Drop for UsbReader {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn reader_thread(
    ctx: DeviceContext,
    buffer: Arc<RingBuffer>,
    settings: ReaderSettings,
    counter: Arc<Mutex<ThroughputCounter>>,
    sink: Option<Arc<dyn NotificationSink>>,
    stop: Receiver<()>,
) {
    let mut sequence = 0u64;
    loop {
        let t0 = Instant::now();
        let res = ctx
            .device()
            .read_block(PIPE_OUT_DDR3, settings.data_length_words);

        let pause = match res {
            Ok(words) => {
                let bytes = words_to_bytes(&words);
                let free = buffer.capacity() - buffer.available();
                let written = buffer.write(&bytes);

                let mut c = counter.lock();
                c.iterations += 1;
                if words.len() < settings.data_length_words {
                    c.short_reads += 1;
                }
                if written < bytes.len() || bytes.len() > free {
                    c.buffer_overruns += 1;
                }
                c.increment(bytes.len());
                drop(c);

                if let Some(sink) = &sink {
                    let notice = BlockNotice {
                        sequence,
                        size: bytes.len(),
                        timestamp: OffsetDateTime::now_utc(),
                    };
                    if !sink.notify(notice) {
                        debug!("Block notice {} not delivered", sequence);
                    }
                }
                sequence += 1;
                settings.read_interval.saturating_sub(t0.elapsed())
            }
            Err(e) => {
                let mut c = counter.lock();
                c.iterations += 1;
                c.packets_dropped += 1;
                warn!("Block read failed ({} dropped so far): {}", c.packets_dropped, e);
                settings.error_backoff
            }
        };

        if settings
            .iteration_limit
            .is_some_and(|n| counter.lock().iterations >= n)
        {
            break;
        }
        match stop.recv_timeout(pause) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn settings(words: usize) -> ReaderSettings {
        ReaderSettings {
            data_length_words: words,
            read_interval: Duration::from_millis(1),
            error_backoff: Duration::from_millis(1),
            join_timeout: Duration::from_secs(5),
            iteration_limit: None,
        }
    }

    #[test]
    fn counter_tracks_totals_and_window() {
        let mut c = ThroughputCounter::new();
        c.increment(1024 * 1024);
        c.increment(1024 * 1024);
        assert_eq!(c.packets_received, 2);
        assert_eq!(c.bytes_read, 2 * 1024 * 1024);
        assert!((c.rate() - 2.0).abs() < 1e-9);
        c.reset();
        assert_eq!(c.snapshot().bytes_read, 0);
        assert_eq!(c.rate(), 0.0);
    }

    #[test]
    fn words_are_little_endian() {
        assert_eq!(words_to_bytes(&[0x0102, 0xA0B0]), vec![0x02, 0x01, 0xB0, 0xA0]);
    }

    #[test]
    fn reader_honours_iteration_limit_and_notifies() {
        let ctx = DeviceContext::simulated(1);
        let buffer = Arc::new(RingBuffer::new(1 << 20));
        let (tx, rx) = unbounded::<BlockNotice>();
        let mut s = settings(4096);
        s.iteration_limit = Some(5);

        let mut reader = UsbReader::spawn(ctx, Arc::clone(&buffer), s, Some(Arc::new(tx)));
        let stats = reader.stop_when_done();
        assert_eq!(stats.iterations, 5);
        assert_eq!(stats.packets_received, 5);
        assert_eq!(buffer.available(), 5 * 4096 * 2);

        let seqs: Vec<u64> = rx.try_iter().map(|n| n.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn small_buffer_counts_overruns() {
        let ctx = DeviceContext::simulated(1);
        let buffer = Arc::new(RingBuffer::new(4096));
        let mut s = settings(4096);
        s.iteration_limit = Some(3);

        let mut reader = UsbReader::spawn(ctx, Arc::clone(&buffer), s, None);
        let stats = reader.stop_when_done();
        assert_eq!(stats.buffer_overruns, 3);
        assert_eq!(buffer.available(), 4096);
    }

    #[test]
    fn stop_preempts_a_long_interval() {
        let ctx = DeviceContext::simulated(1);
        let buffer = Arc::new(RingBuffer::new(1 << 20));
        let mut s = settings(64);
        s.read_interval = Duration::from_secs(60);

        let mut reader = UsbReader::spawn(ctx, buffer, s, None);
        while reader.stats().iterations == 0 {
            thread::yield_now();
        }
        let t0 = Instant::now();
        reader.stop();
        assert!(t0.elapsed() < Duration::from_secs(5));
        assert!(!reader.is_running());
    }

    impl UsbReader {
        fn stop_when_done(&mut self) -> ReaderStats {
            let _ = self.done_rx.recv_timeout(Duration::from_secs(10));
            self.stop()
        }
    }
}
