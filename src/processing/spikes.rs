use log::info;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

pub const SIGMA_MIN: f64 = 1.0;
pub const SIGMA_MAX: f64 = 10.0;
pub const DEFAULT_SIGMA: f64 = 5.0;
pub const DEFAULT_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Polarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeEvent {
    pub channel: usize,
    pub amplitude: f64,
    /// Offset of the peak (or trough) from the start of the frame.
    pub sample: usize,
    pub threshold: f64,
    pub polarity: Polarity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpikeDetectionResult {
    pub spike_counts: Array1<f64>,
    pub events: Vec<SpikeEvent>,
    pub sigma: f64,
    pub window_size: usize,
    pub total_spikes: u64,
}

fn clamp_sigma(sigma: f64) -> f64 {
    if sigma.is_nan() {
        return DEFAULT_SIGMA;
    }
    sigma.clamp(SIGMA_MIN, SIGMA_MAX)
}

#[derive(Debug, Clone, Copy)]
struct WindowStats {
    mean: f64,
    std: f64,
    min: (usize, f64),
    max: (usize, f64),
}

fn window_stats(win: ArrayView1<f64>) -> WindowStats {
    let n = win.len() as f64;
    let mean = win.sum() / n;
    let var = win.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let mut min = (0, f64::INFINITY);
    let mut max = (0, f64::NEG_INFINITY);
    for (i, &v) in win.iter().enumerate() {
        if v < min.1 {
            min = (i, v);
        }
        if v > max.1 {
            max = (i, v);
        }
    }
    WindowStats {
        mean,
        std: var.sqrt(),
        min,
        max,
    }
}

/// Count threshold crossings in one channel. Each window contributes at
/// most one positive and one negative spike.
fn scan_channel(
    channel: usize,
    row: ArrayView1<f64>,
    sigma: f64,
    window: usize,
    events: Option<&mut Vec<(usize, SpikeEvent)>>,
) -> f64 {
    let mut count = 0.0;
    let mut sink = events;
    for (w, chunk) in row.axis_chunks_iter(Axis(0), window).enumerate() {
        let stats = window_stats(chunk);
        let limit = sigma * stats.std;
        let upper = stats.mean + limit;
        let lower = stats.mean - limit;
        let start = w * window;

        if stats.max.1 > upper {
            count += 1.0;
            if let Some(ev) = sink.as_deref_mut() {
                ev.push((
                    w,
                    SpikeEvent {
                        channel,
                        amplitude: stats.max.1,
                        sample: start + stats.max.0,
                        threshold: upper,
                        polarity: Polarity::Positive,
                    },
                ));
            }
        }
        if stats.min.1 < lower {
            count += 1.0;
            if let Some(ev) = sink.as_deref_mut() {
                ev.push((
                    w,
                    SpikeEvent {
                        channel,
                        amplitude: stats.min.1,
                        sample: start + stats.min.0,
                        threshold: lower,
                        polarity: Polarity::Negative,
                    },
                ));
            }
        }
    }
    count
}

/// Windowed threshold-crossing detector over a channels x samples frame,
/// with a running per-channel total across calls.
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    sigma: f64,
    window_size: usize,
    cumulative: Option<Array1<f64>>,
}

impl Default for SpikeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIGMA, DEFAULT_WINDOW)
    }
}

impl SpikeDetector {
    pub fn new(sigma: f64, window_size: usize) -> Self {
        Self {
            sigma: clamp_sigma(sigma),
            window_size: window_size.max(1),
            cumulative: None,
        }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn set_sigma(&mut self, sigma: f64) {
        self.sigma = clamp_sigma(sigma);
    }

    /// Run detection. `sigma` and `window` override the detector's own
    /// settings for this call only.
    pub fn detect(
        &mut self,
        data: &Array2<f64>,
        sigma: Option<f64>,
        window: Option<usize>,
        return_events: bool,
    ) -> SpikeDetectionResult {
        let sigma = clamp_sigma(sigma.unwrap_or(self.sigma));
        let window = window.unwrap_or(self.window_size).max(1);
        let channels = data.nrows();

        let mut counts = Array1::<f64>::zeros(channels);
        let mut per_channel: Vec<Vec<(usize, SpikeEvent)>> = vec![Vec::new(); channels];
        let channel_ids = Array1::from_iter(0..channels);

        Zip::from(&mut counts)
            .and(&mut per_channel)
            .and(data.rows())
            .and(&channel_ids)
            .par_for_each(|count, events, row, &ch| {
                let sink = if return_events { Some(events) } else { None };
                *count = scan_channel(ch, row, sigma, window, sink);
            });

        // Order events the way a window-by-window sweep would produce them.
        let mut tagged: Vec<(usize, SpikeEvent)> = per_channel.into_iter().flatten().collect();
        tagged.sort_by_key(|(w, e)| (*w, e.polarity, e.channel));
        let events: Vec<SpikeEvent> = tagged.into_iter().map(|(_, e)| e).collect();

        let total = counts.sum() as u64;

        let same_shape = matches!(&self.cumulative, Some(acc) if acc.len() == channels);
        if !same_shape {
            self.cumulative = Some(Array1::zeros(channels));
        }
        if let Some(acc) = &mut self.cumulative {
            *acc += &counts;
        }

        SpikeDetectionResult {
            spike_counts: counts,
            events,
            sigma,
            window_size: window,
            total_spikes: total,
        }
    }

    /// Per-channel totals since the last reset, or `None` before the first
    /// detection.
    pub fn cumulative_counts(&self) -> Option<Array1<f64>> {
        self.cumulative.clone()
    }

    pub fn reset_counts(&mut self) {
        if let Some(acc) = &mut self.cumulative {
            acc.fill(0.0);
        }
        info!("Spike counts reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigma_is_clamped() {
        let mut det = SpikeDetector::new(0.1, 64);
        assert_eq!(det.sigma(), SIGMA_MIN);
        det.set_sigma(50.0);
        assert_eq!(det.sigma(), SIGMA_MAX);
        let res = det.detect(&Array2::zeros((1, 8)), Some(-3.0), None, false);
        assert_eq!(res.sigma, SIGMA_MIN);
    }

    #[test]
    fn constant_window_never_spikes() {
        let data = Array2::from_elem((4, 1024), 7.5);
        let mut det = SpikeDetector::default();
        for sigma in [1.0, 3.0, 10.0] {
            let res = det.detect(&data, Some(sigma), None, true);
            assert_eq!(res.total_spikes, 0);
            assert!(res.events.is_empty());
        }
    }

    #[test]
    fn constructed_spike_counts_once() {
        let mut data = Array2::from_shape_fn((3, 100), |(_, s)| if s % 2 == 0 { 1.0 } else { -1.0 });
        data[[1, 42]] = 50.0;
        let mut det = SpikeDetector::new(5.0, 100);
        let res = det.detect(&data, None, None, true);

        assert_eq!(res.spike_counts.to_vec(), vec![0.0, 1.0, 0.0]);
        assert_eq!(res.total_spikes, 1);
        assert_eq!(res.events.len(), 1);
        let ev = res.events[0];
        assert_eq!(ev.channel, 1);
        assert_eq!(ev.sample, 42);
        assert_eq!(ev.amplitude, 50.0);
        assert_eq!(ev.polarity, Polarity::Positive);
        assert!(ev.amplitude > ev.threshold);
    }

    #[test]
    fn partial_last_window_and_offsets() {
        let mut data = Array2::from_shape_fn((1, 250), |(_, s)| if s % 2 == 0 { 0.5 } else { -0.5 });
        data[[0, 230]] = -40.0;
        let mut det = SpikeDetector::new(3.0, 100);
        let res = det.detect(&data, None, None, true);
        assert_eq!(res.total_spikes, 1);
        assert_eq!(res.events[0].sample, 230);
        assert_eq!(res.events[0].polarity, Polarity::Negative);
    }

    #[test]
    fn events_are_optional() {
        let mut data = Array2::from_shape_fn((2, 64), |(_, s)| (s % 3) as f64);
        data[[0, 10]] = 100.0;
        let res = SpikeDetector::new(3.0, 64).detect(&data, None, None, false);
        assert_eq!(res.total_spikes, 1);
        assert!(res.events.is_empty());
    }

    #[test]
    fn cumulative_counts_persist_until_reset() {
        let mut data = Array2::from_shape_fn((2, 64), |(_, s)| (s % 3) as f64);
        data[[1, 5]] = 100.0;
        let mut det = SpikeDetector::new(3.0, 64);
        assert!(det.cumulative_counts().is_none());
        det.detect(&data, None, None, false);
        det.detect(&data, None, None, false);
        assert_eq!(det.cumulative_counts().unwrap().to_vec(), vec![0.0, 2.0]);

        det.reset_counts();
        assert_eq!(det.cumulative_counts().unwrap().to_vec(), vec![0.0, 0.0]);

        // A different channel count starts a fresh accumulator.
        let wider = Array2::from_shape_fn((3, 64), |(_, s)| (s % 3) as f64);
        det.detect(&wider, None, None, false);
        assert_eq!(det.cumulative_counts().unwrap().len(), 3);
    }
}
