//! Per-channel transforms over channels x samples frames.

pub mod filters;
pub mod noise;
pub mod spectral;
pub mod spikes;

use ndarray::Array2;

use crate::{
    config::ProcessingSettings,
    error::Result,
    processing::{
        filters::SignalFilter,
        noise::NoiseReducer,
        spikes::{SpikeDetectionResult, SpikeDetector},
    },
};

/// Reassemble little-endian words from drained buffer bytes. A trailing
/// odd byte is dropped.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Turn sample-major words (`words[s * channels + ch]`) into a
/// channels x samples matrix. Incomplete trailing samples are dropped.
pub fn frame_from_words(words: &[u16], channels: usize) -> Array2<f64> {
    let channels = channels.max(1);
    let samples = words.len() / channels;
    Array2::from_shape_fn((channels, samples), |(ch, s)| {
        words[s * channels + ch] as f64
    })
}

/// Line-noise notch, noise reduction, then spike detection, as configured.
/// A `notch_hz` of zero skips the notch.
pub struct FrameProcessor {
    settings: ProcessingSettings,
    filter: SignalFilter,
    reducer: NoiseReducer,
    detector: SpikeDetector,
}

impl FrameProcessor {
    pub fn new(settings: &ProcessingSettings, sample_rate: f64) -> Self {
        Self {
            filter: SignalFilter::new(settings.filter_order, sample_rate),
            reducer: NoiseReducer::new(settings.artifact_method),
            detector: SpikeDetector::new(settings.sigma, settings.window_size),
            settings: settings.clone(),
        }
    }

    pub fn detector(&self) -> &SpikeDetector {
        &self.detector
    }

    pub fn process(&mut self, frame: &Array2<f64>) -> Result<SpikeDetectionResult> {
        let s = &self.settings;
        let notched;
        let frame = if s.notch_hz > 0.0 {
            notched = self.filter.notch(frame, s.notch_hz, s.notch_q);
            &notched
        } else {
            frame
        };
        let needs_reduction = s.common_average_reference
            || s.artifact_threshold.is_some()
            || s.smoothing_window.is_some();

        if !needs_reduction {
            return Ok(self.detector.detect(frame, None, None, false));
        }
        let reduced = self.reducer.reduce(
            frame,
            s.common_average_reference,
            s.artifact_threshold,
            s.smoothing_window,
        )?;
        Ok(self.detector.detect(&reduced.data, None, None, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Conf;

    #[test]
    fn bytes_are_little_endian() {
        assert_eq!(words_from_bytes(&[0x34, 0x12, 0xFF, 0x00, 0x07]), vec![0x1234, 0x00FF]);
    }

    #[test]
    fn frame_is_channel_major() {
        let words: Vec<u16> = (0..7).collect();
        let frame = frame_from_words(&words, 3);
        assert_eq!(frame.dim(), (3, 2));
        assert_eq!(frame.row(0).to_vec(), vec![0.0, 3.0]);
        assert_eq!(frame.row(2).to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn processor_finds_injected_spike() {
        let mut settings = Conf::defaults().unwrap().processing;
        settings.window_size = 64;
        settings.notch_hz = 0.0;
        let mut processor = FrameProcessor::new(&settings, 10_000.0);

        let mut frame = Array2::from_shape_fn((4, 64), |(c, s)| 100.0 + ((s + c) % 2) as f64);
        frame[[2, 30]] = 160.0;
        let res = processor.process(&frame).unwrap();
        assert_eq!(res.spike_counts[2], 1.0);
        assert_eq!(processor.detector().cumulative_counts().unwrap()[2], 1.0);
    }
}
