use log::{error, info, warn};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    config::AcquisitionSettings,
    context::DeviceContext,
    device::DeviceInfo,
    error::{DaqError, Result},
    reader::{NotificationSink, ReaderSettings, ReaderStats, UsbReader},
    ring_buffer::{RingBuffer, RingBufferStats},
};

pub const MAX_BUFFER_MB: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSession {
    pub id: Uuid,
    pub channel_mask: u32,
    pub sample_rate_hz: f64,
    pub started_at: OffsetDateTime,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub is_recording: bool,
    pub session_id: Option<Uuid>,
    pub iteration_count: u64,
    pub elapsed_s: f64,
    pub throughput_mbps: f64,
    pub buffer_fill_pct: f64,
    pub buffer_stats: RingBufferStats,
    pub reader_stats: ReaderStats,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub iteration_count: u64,
    pub elapsed_s: f64,
    pub bytes_read: u64,
    pub packets_dropped: u64,
}

/// Owns the device context, the ring buffer and at most one recording
/// session.
pub struct AcquisitionService {
    ctx: DeviceContext,
    settings: AcquisitionSettings,
    buffer: Arc<RingBuffer>,
    reader: Option<UsbReader>,
    session: Option<AcquisitionSession>,
    sink: Option<Arc<dyn NotificationSink>>,
    iteration_limit: Option<u64>,
    info: DeviceInfo,
}

impl AcquisitionService {
    pub fn new(ctx: DeviceContext, settings: &AcquisitionSettings) -> Self {
        let info = ctx.device().info();
        Self {
            buffer: Arc::new(RingBuffer::with_size_mb(settings.buffer_size_mb)),
            settings: settings.clone(),
            reader: None,
            session: None,
            sink: None,
            iteration_limit: None,
            info,
            ctx,
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Bring up the device. A failure is logged and the service carries on
    /// without hardware.
    pub fn initialize(&mut self) -> bool {
        match self.ctx.device().initialize() {
            Ok(info) => {
                self.info = info;
                true
            }
            Err(e) => {
                error!("Device initialisation failed, running degraded: {}", e);
                false
            }
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_notification_sink(&mut self, sink: Option<Arc<dyn NotificationSink>>) {
        self.sink = sink;
    }

    /// Make the reader stop by itself after `n` blocks. Applies to the next
    /// `start`.
    pub fn set_iteration_limit(&mut self, n: Option<u64>) {
        self.iteration_limit = n;
    }

    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn start(&mut self, channel_mask: u32, sample_rate_hz: f64) -> Result<Uuid> {
        if let Some(session) = &self.session {
            return Err(DaqError::Conflict(format!(
                "acquisition already running (session {})",
                session.id
            )));
        }
        if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
            return Err(DaqError::InvalidArgument(format!(
                "sample rate must be positive, got {}",
                sample_rate_hz
            )));
        }

        self.buffer.reset();
        self.ctx.device().begin_streaming()?;

        let mut reader_settings = ReaderSettings::from(&self.settings);
        reader_settings.iteration_limit = self.iteration_limit;
        self.reader = Some(UsbReader::spawn(
            self.ctx.clone(),
            Arc::clone(&self.buffer),
            reader_settings,
            self.sink.clone(),
        ));

        let session = AcquisitionSession {
            id: Uuid::new_v4(),
            channel_mask,
            sample_rate_hz,
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
        };
        info!(
            "Acquisition started: session {} mask {:#010x} at {} Hz",
            session.id, channel_mask, sample_rate_hz
        );
        let id = session.id;
        self.session = Some(session);
        Ok(id)
    }

    pub fn stop(&mut self) -> Result<SessionSummary> {
        let session = self
            .session
            .take()
            .ok_or_else(|| DaqError::Conflict("acquisition is not running".into()))?;

        let stats = match self.reader.take() {
            Some(mut reader) => reader.stop(),
            None => ReaderStats::default(),
        };
        let elapsed = session.started.elapsed();

        let summary = SessionSummary {
            session_id: session.id,
            iteration_count: stats.iterations,
            elapsed_s: elapsed.as_secs_f64(),
            bytes_read: stats.bytes_read,
            packets_dropped: stats.packets_dropped,
        };
        info!(
            "Acquisition stopped: session {} ran {:.2} s, {} iterations",
            summary.session_id, summary.elapsed_s, summary.iteration_count
        );

        // The session has already ended on our side.
        if let Err(e) = self.ctx.device().end_streaming() {
            error!("Failed to end streaming for session {}: {}", summary.session_id, e);
        }
        Ok(summary)
    }

    pub fn status(&self) -> StreamStatus {
        let reader_stats = self
            .reader
            .as_ref()
            .map(|r| r.stats())
            .unwrap_or_default();
        let buffer_stats = self.buffer.stats();
        StreamStatus {
            is_recording: self.session.is_some(),
            session_id: self.session.as_ref().map(|s| s.id),
            iteration_count: reader_stats.iterations,
            elapsed_s: self
                .session
                .as_ref()
                .map_or(0.0, |s| s.started.elapsed().as_secs_f64()),
            throughput_mbps: reader_stats.throughput_mbps,
            buffer_fill_pct: buffer_stats.fill_pct,
            buffer_stats,
            reader_stats,
            device_info: self.info.clone(),
        }
    }

    /// Replace the ring buffer with one of `size_mb` MiB.
    pub fn configure_buffer(&mut self, size_mb: usize) -> Result<usize> {
        if self.is_recording() {
            return Err(DaqError::Conflict(
                "cannot resize the buffer while recording".into(),
            ));
        }
        if !(1..=MAX_BUFFER_MB).contains(&size_mb) {
            return Err(DaqError::InvalidArgument(format!(
                "buffer size {} MB is outside 1..={}",
                size_mb, MAX_BUFFER_MB
            )));
        }
        self.buffer = Arc::new(RingBuffer::with_size_mb(size_mb));
        self.settings.buffer_size_mb = size_mb;
        info!("Ring buffer resized to {} MB", size_mb);
        Ok(self.buffer.capacity())
    }

    /// Stop any running session. Errors are logged.
    pub fn shutdown(&mut self) {
        if self.is_recording() {
            if let Err(e) = self.stop() {
                warn!("Error stopping acquisition on shutdown: {}", e);
            }
        }
    }

    /// Block until the reader has exited on its own or `timeout` passes.
    pub fn wait_for_reader(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(reader) = &self.reader {
            if !reader.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Conf;

    fn service() -> AcquisitionService {
        let mut settings = Conf::defaults().unwrap().acquisition;
        settings.buffer_size_mb = 1;
        settings.data_length_words = 4096;
        settings.read_interval_ms = 1;
        AcquisitionService::new(DeviceContext::simulated(3), &settings)
    }

    #[test]
    fn start_and_stop_are_guarded() {
        let mut acq = service();
        assert!(matches!(acq.stop(), Err(DaqError::Conflict(_))));
        acq.start(0xFFFF_FFFF, 10_000.0).unwrap();
        assert!(matches!(
            acq.start(0xFFFF_FFFF, 10_000.0),
            Err(DaqError::Conflict(_))
        ));
        assert!(matches!(acq.configure_buffer(4), Err(DaqError::Conflict(_))));
        acq.stop().unwrap();
        assert!(!acq.status().is_recording);
    }

    #[test]
    fn stop_keeps_summary_when_end_streaming_fails() {
        let mut acq = service();
        acq.set_iteration_limit(Some(2));
        let id = acq.start(0xFFFF_FFFF, 10_000.0).unwrap();
        assert!(acq.wait_for_reader(Duration::from_secs(10)));

        acq.ctx
            .device()
            .as_simulated_mut()
            .unwrap()
            .set_write_fault(true);
        let summary = acq.stop().unwrap();
        assert_eq!(summary.session_id, id);
        assert_eq!(summary.iteration_count, 2);
        assert!(!acq.status().is_recording);
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut acq = service();
        assert!(matches!(
            acq.start(1, 0.0),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(matches!(
            acq.configure_buffer(0),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(matches!(
            acq.configure_buffer(2048),
            Err(DaqError::InvalidArgument(_))
        ));
        assert_eq!(acq.configure_buffer(2).unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn start_issues_streaming_sequence() {
        let mut acq = service();
        acq.set_iteration_limit(Some(1));
        acq.start(1, 10_000.0).unwrap();
        assert!(acq.wait_for_reader(Duration::from_secs(10)));
        {
            let dev = acq.context().device();
            let sim = dev.as_simulated().unwrap();
            assert_eq!(sim.read_wire(0x0D, 0x07), 0x03);
        }
        acq.stop().unwrap();
        let dev = acq.context().device();
        assert_eq!(dev.as_simulated().unwrap().read_wire(0x0D, 0x04), 0x04);
    }
}
