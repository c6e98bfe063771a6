//! Frequency-domain views of a channels × samples matrix.

use log::warn;
use ndarray::{Array2, Axis, Zip};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::{f64::consts::PI, sync::Arc};

use crate::error::{DaqError, Result};

/// Symmetric Hann window, zero at both ends.
pub fn hann_symmetric(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / denom).cos())
        .collect()
}

/// Periodic Hann window for spectral estimation.
pub fn hann_periodic(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// Periodic Tukey window with taper fraction `alpha`.
pub fn tukey_periodic(n: usize, alpha: f64) -> Vec<f64> {
    let m = n + 1;
    let last = (m - 1) as f64;
    let width = (alpha * last / 2.0).floor() as usize;
    (0..n)
        .map(|i| {
            let x = i as f64;
            if i <= width {
                0.5 * (1.0 + (PI * (-1.0 + 2.0 * x / alpha / last)).cos())
            } else if i >= m - width - 1 {
                0.5 * (1.0 + (PI * (-2.0 / alpha + 1.0 + 2.0 * x / alpha / last)).cos())
            } else {
                1.0
            }
        })
        .collect()
}

pub fn rfft_frequencies(n: usize, sample_rate: f64) -> Vec<f64> {
    (0..=n / 2)
        .map(|k| k as f64 * sample_rate / n as f64)
        .collect()
}

fn spectrum(fft: &Arc<dyn Fft<f64>>, samples: impl Iterator<Item = f64>) -> Vec<Complex<f64>> {
    let mut buf: Vec<Complex<f64>> = samples.map(|s| Complex::new(s, 0.0)).collect();
    fft.process(&mut buf);
    buf.truncate(buf.len() / 2 + 1);
    buf
}

#[derive(Debug, Clone, PartialEq)]
pub struct FftResult {
    pub frequencies: Vec<f64>,
    pub channels: Vec<usize>,
    /// channels × frequency bins
    pub magnitudes: Array2<f64>,
    pub sample_rate: f64,
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PsdResult {
    pub frequencies: Vec<f64>,
    pub channels: Vec<usize>,
    /// channels × frequency bins, units²/Hz
    pub psd: Array2<f64>,
    pub sample_rate: f64,
    pub nperseg: usize,
    pub noverlap: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub frequencies: Vec<f64>,
    pub times: Vec<f64>,
    /// frequency bins × segments, in dB
    pub power_db: Array2<f64>,
    pub channel: usize,
    pub sample_rate: f64,
    pub window_size: usize,
    pub overlap: usize,
}

/// Spectral analysis at a fixed sample rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FftAnalyzer {
    pub sample_rate: f64,
}

impl Default for FftAnalyzer {
    fn default() -> Self {
        Self {
            sample_rate: 10_000.0,
        }
    }
}

impl FftAnalyzer {
    pub fn new(sample_rate: f64) -> Self {
        Self { sample_rate }
    }

    fn select(
        data: &Array2<f64>,
        channels: Option<&[usize]>,
    ) -> Result<(Array2<f64>, Vec<usize>)> {
        if data.ncols() == 0 {
            return Err(DaqError::InvalidArgument("no samples to analyse".into()));
        }
        match channels {
            None => Ok((data.to_owned(), (0..data.nrows()).collect())),
            Some(chs) => {
                if let Some(&bad) = chs.iter().find(|&&c| c >= data.nrows()) {
                    return Err(DaqError::InvalidArgument(format!(
                        "channel {} out of range for {} channels",
                        bad,
                        data.nrows()
                    )));
                }
                Ok((data.select(Axis(0), chs), chs.to_vec()))
            }
        }
    }

    /// Hann-windowed one-sided amplitude spectrum, `|X| * 2 / N`.
    pub fn compute_fft(&self, data: &Array2<f64>, channels: Option<&[usize]>) -> Result<FftResult> {
        let (data, channels) = Self::select(data, channels)?;
        let n = data.ncols();
        let window = hann_symmetric(n);
        let fft = FftPlanner::new().plan_fft_forward(n);
        let bins = n / 2 + 1;

        let mut magnitudes = Array2::zeros((data.nrows(), bins));
        Zip::from(magnitudes.rows_mut())
            .and(data.rows())
            .par_for_each(|mut out, row| {
                let spec = spectrum(&fft, row.iter().zip(&window).map(|(x, w)| x * w));
                for (o, c) in out.iter_mut().zip(spec) {
                    *o = c.norm() * 2.0 / n as f64;
                }
            });

        Ok(FftResult {
            frequencies: rfft_frequencies(n, self.sample_rate),
            channels,
            magnitudes,
            sample_rate: self.sample_rate,
            n_samples: n,
        })
    }

    /// Welch PSD with a periodic Hann window and 50% overlap. `nperseg`
    /// defaults to `min(256, n)` and is capped at `n`.
    pub fn compute_psd(
        &self,
        data: &Array2<f64>,
        nperseg: Option<usize>,
        channels: Option<&[usize]>,
    ) -> Result<PsdResult> {
        let (data, channels) = Self::select(data, channels)?;
        let n = data.ncols();
        let nperseg = nperseg.unwrap_or(256).clamp(1, n);
        let noverlap = nperseg / 2;
        let window = hann_periodic(nperseg);
        let fft = FftPlanner::new().plan_fft_forward(nperseg);

        let mut psd = Array2::zeros((data.nrows(), nperseg / 2 + 1));
        Zip::from(psd.rows_mut())
            .and(data.rows())
            .par_for_each(|mut out, row| {
                let segs = segment_densities(
                    &row.to_vec(),
                    &window,
                    noverlap,
                    self.sample_rate,
                    &fft,
                );
                if let Some(mean) = segs.mean_axis(Axis(0)) {
                    out.assign(&mean);
                }
            });

        Ok(PsdResult {
            frequencies: rfft_frequencies(nperseg, self.sample_rate),
            channels,
            psd,
            sample_rate: self.sample_rate,
            nperseg,
            noverlap,
        })
    }

    /// Short-time PSD of one channel in dB, with a periodic Tukey(0.25)
    /// window. An out-of-range channel falls back to channel 0 and a window
    /// longer than the data shrinks to fit.
    pub fn compute_spectrogram(
        &self,
        data: &Array2<f64>,
        window_size: usize,
        overlap: Option<usize>,
        channel: usize,
    ) -> Result<Spectrogram> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(DaqError::InvalidArgument("no samples to analyse".into()));
        }
        let channel = if channel >= data.nrows() {
            warn!("spectrogram: channel {} out of range, using 0", channel);
            0
        } else {
            channel
        };
        let n = data.ncols();
        let nperseg = window_size.clamp(1, n);
        let noverlap = overlap.unwrap_or(nperseg / 2);
        if noverlap >= nperseg {
            return Err(DaqError::InvalidArgument(format!(
                "overlap {} must be less than window {}",
                noverlap, nperseg
            )));
        }

        let window = tukey_periodic(nperseg, 0.25);
        let fft = FftPlanner::new().plan_fft_forward(nperseg);
        let x = data.row(channel).to_vec();
        let segs = segment_densities(&x, &window, noverlap, self.sample_rate, &fft);

        let step = nperseg - noverlap;
        let times = (0..segs.nrows())
            .map(|i| (nperseg as f64 / 2.0 + (step * i) as f64) / self.sample_rate)
            .collect();
        let power_db = segs.t().mapv(|s| 10.0 * (s + 1e-20).log10());

        Ok(Spectrogram {
            frequencies: rfft_frequencies(nperseg, self.sample_rate),
            times,
            power_db,
            channel,
            sample_rate: self.sample_rate,
            window_size: nperseg,
            overlap: noverlap,
        })
    }

    /// Frequency of the largest non-DC FFT bin per channel.
    pub fn dominant_frequency(
        &self,
        data: &Array2<f64>,
        channels: Option<&[usize]>,
    ) -> Result<Vec<(usize, f64)>> {
        let fft = self.compute_fft(data, channels)?;
        Ok(fft
            .channels
            .iter()
            .zip(fft.magnitudes.axis_iter(Axis(0)))
            .map(|(&ch, mags)| {
                let peak = mags
                    .iter()
                    .enumerate()
                    .skip(1)
                    .fold(None, |best: Option<(usize, f64)>, (i, &m)| match best {
                        Some((_, bm)) if bm >= m => best,
                        _ => Some((i, m)),
                    });
                (ch, peak.map_or(0.0, |(i, _)| fft.frequencies[i]))
            })
            .collect())
    }
}

/// One-sided density spectrum of each detrended, windowed segment
/// (segments × bins).
fn segment_densities(
    x: &[f64],
    window: &[f64],
    noverlap: usize,
    sample_rate: f64,
    fft: &Arc<dyn Fft<f64>>,
) -> Array2<f64> {
    let nperseg = window.len();
    let step = nperseg - noverlap;
    let nseg = (x.len() - noverlap) / step;
    let bins = nperseg / 2 + 1;
    let scale = 1.0 / (sample_rate * window.iter().map(|w| w * w).sum::<f64>());

    let mut out = Array2::zeros((nseg, bins));
    for (s, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        let seg = &x[s * step..s * step + nperseg];
        let mean = seg.iter().sum::<f64>() / nperseg as f64;
        let spec = spectrum(fft, seg.iter().zip(window).map(|(v, w)| (v - mean) * w));
        for (k, (o, c)) in row.iter_mut().zip(spec).enumerate() {
            let doubled = k > 0 && !(nperseg % 2 == 0 && k == bins - 1);
            *o = c.norm_sqr() * scale * if doubled { 2.0 } else { 1.0 };
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 10_000.0;

    fn tones(channels: usize, n: usize, freq: impl Fn(usize) -> f64) -> Array2<f64> {
        Array2::from_shape_fn((channels, n), |(c, i)| {
            (2.0 * PI * freq(c) * i as f64 / FS).sin()
        })
    }

    #[test]
    fn windows_match_reference_values() {
        let h = hann_symmetric(5);
        assert!((h[2] - 1.0).abs() < 1e-12 && h[0].abs() < 1e-12 && h[4].abs() < 1e-12);
        let p = hann_periodic(4);
        assert!((p[2] - 1.0).abs() < 1e-12 && (p[1] - 0.5).abs() < 1e-12);
        let t = tukey_periodic(16, 0.25);
        assert_eq!(t.len(), 16);
        assert!(t[0].abs() < 1e-12);
        assert!(t[4..12].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn fft_peak_amplitude_and_frequency() {
        // 1 kHz falls exactly on a bin for n = 1000
        let data = tones(2, 1000, |c| 1000.0 * (c + 1) as f64);
        let res = FftAnalyzer::new(FS).compute_fft(&data, None).unwrap();
        assert_eq!(res.frequencies.len(), 501);
        assert_eq!(res.frequencies[100], 1000.0);
        // Hann coherent gain is 0.5
        assert!((res.magnitudes[[0, 100]] - 0.5).abs() < 0.01);

        let dom = FftAnalyzer::new(FS).dominant_frequency(&data, None).unwrap();
        assert_eq!(dom, vec![(0, 1000.0), (1, 2000.0)]);
    }

    #[test]
    fn dominant_frequency_ignores_dc() {
        // the offset outweighs the tone, its leakage into bin 1 does not
        let data = Array2::from_shape_fn((1, 1000), |(_, i)| {
            0.8 + (2.0 * PI * 250.0 * i as f64 / FS).sin()
        });
        let dom = FftAnalyzer::new(FS).dominant_frequency(&data, None).unwrap();
        assert_eq!(dom[0].1, 250.0);
    }

    #[test]
    fn channel_subset_is_validated() {
        let data = tones(3, 64, |_| 500.0);
        let an = FftAnalyzer::new(FS);
        let res = an.compute_fft(&data, Some(&[2][..])).unwrap();
        assert_eq!(res.channels, vec![2]);
        assert_eq!(res.magnitudes.nrows(), 1);
        assert!(matches!(
            an.compute_psd(&data, None, Some(&[3][..])),
            Err(DaqError::InvalidArgument(_))
        ));
    }

    #[test]
    fn welch_psd_integrates_to_signal_power() {
        let data = tones(1, 4096, |_| 625.0);
        let res = FftAnalyzer::new(FS).compute_psd(&data, None, None).unwrap();
        assert_eq!(res.nperseg, 256);
        assert_eq!(res.noverlap, 128);
        assert_eq!(res.psd.ncols(), 129);
        let df = FS / 256.0;
        let power: f64 = res.psd.row(0).sum() * df;
        assert!((power - 0.5).abs() < 0.02, "{power}");
        let peak = res
            .psd
            .row(0)
            .iter()
            .enumerate()
            .fold((0, 0.0), |b, (i, &v)| if v > b.1 { (i, v) } else { b });
        assert_eq!(res.frequencies[peak.0], 625.0);
    }

    #[test]
    fn spectrogram_shape_and_fallbacks() {
        let data = tones(2, 1024, |_| 1000.0);
        let an = FftAnalyzer::new(FS);
        let sg = an.compute_spectrogram(&data, 256, None, 9).unwrap();
        assert_eq!(sg.channel, 0);
        assert_eq!(sg.frequencies.len(), 129);
        assert_eq!(sg.times.len(), 7);
        assert_eq!(sg.power_db.dim(), (129, 7));
        assert!((sg.times[0] - 128.0 / FS).abs() < 1e-12);

        let head = data.slice(ndarray::s![.., ..100]).to_owned();
        let short = an.compute_spectrogram(&head, 256, None, 1).unwrap();
        assert_eq!(short.window_size, 100);
        assert_eq!(short.times.len(), 1);
        assert!(an.compute_spectrogram(&data, 64, Some(64), 0).is_err());
    }
}
