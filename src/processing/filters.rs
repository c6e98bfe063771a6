//! Zero-phase IIR filtering over channels × samples matrices.
//!
//! Filters are cascades of second-order sections run forward and backward
//! over an odd-extended copy of each channel, with the initial state set to
//! the filter's step response so edges do not ring.

use log::warn;
use ndarray::{parallel::prelude::*, Array2, Axis};
use serde::Deserialize;
use std::f64::consts::PI;

/// `H(z) = (b0 + b1 z^-1 + b2 z^-2) / (1 + a1 z^-1 + a2 z^-2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Steady-state Direct Form II transposed state for a unit step.
    fn step_state(&self) -> [f64; 2] {
        let g = self.dc_gain();
        [g - self.b0, self.b2 - self.a2 * g]
    }

    fn is_first_order(&self) -> bool {
        self.b2 == 0.0 && self.a2 == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Low,
    High,
}

fn butter(order: usize, wn: f64, pass: Pass) -> Vec<Biquad> {
    let order = order.max(1);
    let k = (PI * wn / 2.0).tan();
    let k2 = k * k;
    let mut sections = Vec::with_capacity(order.div_ceil(2));

    for i in 0..order / 2 {
        let d = 2.0 * (PI * (2 * i + 1) as f64 / (2 * order) as f64).sin();
        let norm = 1.0 / (1.0 + d * k + k2);
        let a1 = 2.0 * (k2 - 1.0) * norm;
        let a2 = (1.0 - d * k + k2) * norm;
        sections.push(match pass {
            Pass::Low => Biquad {
                b0: k2 * norm,
                b1: 2.0 * k2 * norm,
                b2: k2 * norm,
                a1,
                a2,
            },
            Pass::High => Biquad {
                b0: norm,
                b1: -2.0 * norm,
                b2: norm,
                a1,
                a2,
            },
        });
    }

    if order % 2 == 1 {
        let norm = 1.0 / (1.0 + k);
        let a1 = (k - 1.0) * norm;
        sections.push(match pass {
            Pass::Low => Biquad {
                b0: k * norm,
                b1: k * norm,
                b2: 0.0,
                a1,
                a2: 0.0,
            },
            Pass::High => Biquad {
                b0: norm,
                b1: -norm,
                b2: 0.0,
                a1,
                a2: 0.0,
            },
        });
    }
    sections
}

/// Butterworth lowpass, `wn` normalised to Nyquist.
pub fn butter_lowpass(order: usize, wn: f64) -> Vec<Biquad> {
    butter(order, wn, Pass::Low)
}

/// Butterworth highpass, `wn` normalised to Nyquist.
pub fn butter_highpass(order: usize, wn: f64) -> Vec<Biquad> {
    butter(order, wn, Pass::High)
}

/// Second-order notch at `freq_hz` with quality factor `q`.
pub fn notch_section(freq_hz: f64, q: f64, sample_rate: f64) -> Biquad {
    let w0 = 2.0 * freq_hz / sample_rate;
    let bw = w0 / q * PI;
    let w0 = w0 * PI;
    let beta = (bw / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);
    Biquad {
        b0: gain,
        b1: -2.0 * gain * w0.cos(),
        b2: gain,
        a1: -2.0 * gain * w0.cos(),
        a2: 2.0 * gain - 1.0,
    }
}

/// Run `sos` over `x` in place, optionally from initial state `zi`.
pub fn sosfilt(sos: &[Biquad], x: &mut [f64], zi: Option<&[[f64; 2]]>) {
    for (s, sec) in sos.iter().enumerate() {
        let [mut z0, mut z1] = zi.map_or([0.0, 0.0], |zi| zi[s]);
        for v in x.iter_mut() {
            let input = *v;
            let y = sec.b0 * input + z0;
            z0 = sec.b1 * input - sec.a1 * y + z1;
            z1 = sec.b2 * input - sec.a2 * y;
            *v = y;
        }
    }
}

/// Per-section step-response state, each scaled by the DC gain of the
/// sections before it.
fn sos_step_state(sos: &[Biquad]) -> Vec<[f64; 2]> {
    let mut scale = 1.0;
    sos.iter()
        .map(|sec| {
            let [z0, z1] = sec.step_state();
            let zi = [z0 * scale, z1 * scale];
            scale *= sec.dc_gain();
            zi
        })
        .collect()
}

fn pad_len(sos: &[Biquad], n: usize) -> usize {
    let first_order = sos.iter().filter(|s| s.is_first_order()).count();
    let ntaps = 2 * sos.len() + 1 - first_order;
    (3 * ntaps).min(n.saturating_sub(1))
}

/// Forward-backward filtering with odd extension at both ends.
pub fn sosfiltfilt(sos: &[Biquad], x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n < 2 || sos.is_empty() {
        return x.to_vec();
    }
    let pad = pad_len(sos, n);

    let mut ext = Vec::with_capacity(n + 2 * pad);
    ext.extend((1..=pad).rev().map(|i| 2.0 * x[0] - x[i]));
    ext.extend_from_slice(x);
    ext.extend((1..=pad).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));

    let zi = sos_step_state(sos);
    let scaled = |edge: f64| -> Vec<[f64; 2]> {
        zi.iter().map(|[a, b]| [a * edge, b * edge]).collect()
    };

    let z = scaled(ext[0]);
    sosfilt(sos, &mut ext, Some(&z));
    ext.reverse();
    let z = scaled(ext[0]);
    sosfilt(sos, &mut ext, Some(&z));
    ext.reverse();

    ext[pad..pad + n].to_vec()
}

fn filter_rows(data: &Array2<f64>, sos: &[Biquad]) -> Array2<f64> {
    let mut out = data.to_owned();
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let filtered = sosfiltfilt(sos, &row.to_vec());
            for (dst, src) in row.iter_mut().zip(filtered) {
                *dst = src;
            }
        });
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    Bandpass {
        low_hz: f64,
        high_hz: f64,
        order: Option<usize>,
    },
    Highpass {
        cutoff_hz: f64,
        order: Option<usize>,
    },
    Lowpass {
        cutoff_hz: f64,
        order: Option<usize>,
    },
    Notch {
        freq_hz: f64,
        #[serde(default = "default_q")]
        q: f64,
    },
}

fn default_q() -> f64 {
    30.0
}

/// Butterworth and notch filters at a fixed sample rate. Degenerate
/// cutoffs log a warning and return the data unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalFilter {
    pub order: usize,
    pub sample_rate: f64,
}

impl Default for SignalFilter {
    fn default() -> Self {
        Self {
            order: 4,
            sample_rate: 10_000.0,
        }
    }
}

impl SignalFilter {
    pub fn new(order: usize, sample_rate: f64) -> Self {
        Self { order, sample_rate }
    }

    fn nyquist(&self) -> f64 {
        self.sample_rate / 2.0
    }

    pub fn bandpass(&self, data: &Array2<f64>, low_hz: f64, high_hz: f64) -> Array2<f64> {
        let low = (low_hz / self.nyquist()).max(1e-6);
        let high = (high_hz / self.nyquist()).min(1.0 - 1e-6);
        if low >= high {
            warn!(
                "bandpass: low {:.1} Hz >= high {:.1} Hz, returning unfiltered data",
                low_hz, high_hz
            );
            return data.to_owned();
        }
        let mut sos = butter_highpass(self.order, low);
        sos.extend(butter_lowpass(self.order, high));
        filter_rows(data, &sos)
    }

    pub fn highpass(&self, data: &Array2<f64>, cutoff_hz: f64) -> Array2<f64> {
        let wn = (cutoff_hz / self.nyquist()).max(1e-6);
        if wn >= 1.0 {
            warn!(
                "highpass: cutoff {:.1} Hz >= Nyquist {:.1} Hz, returning unfiltered data",
                cutoff_hz,
                self.nyquist()
            );
            return data.to_owned();
        }
        filter_rows(data, &butter_highpass(self.order, wn))
    }

    pub fn lowpass(&self, data: &Array2<f64>, cutoff_hz: f64) -> Array2<f64> {
        let wn = (cutoff_hz / self.nyquist()).min(1.0 - 1e-6);
        if wn <= 0.0 {
            warn!(
                "lowpass: cutoff {:.1} Hz is not positive, returning unfiltered data",
                cutoff_hz
            );
            return data.to_owned();
        }
        filter_rows(data, &butter_lowpass(self.order, wn))
    }

    pub fn notch(&self, data: &Array2<f64>, freq_hz: f64, q: f64) -> Array2<f64> {
        if freq_hz >= self.nyquist() || freq_hz <= 0.0 || q <= 0.0 {
            warn!(
                "notch: {:.1} Hz (Q {}) is outside (0, {:.1}) Hz, returning unfiltered data",
                freq_hz,
                q,
                self.nyquist()
            );
            return data.to_owned();
        }
        filter_rows(data, &[notch_section(freq_hz, q, self.sample_rate)])
    }

    /// Apply each spec in order; a spec's `order` overrides ours.
    pub fn apply_filter_chain(&self, data: &Array2<f64>, chain: &[FilterSpec]) -> Array2<f64> {
        let mut result = data.to_owned();
        for spec in chain {
            let with = |order: Option<usize>| Self {
                order: order.unwrap_or(self.order),
                ..*self
            };
            result = match *spec {
                FilterSpec::Bandpass {
                    low_hz,
                    high_hz,
                    order,
                } => with(order).bandpass(&result, low_hz, high_hz),
                FilterSpec::Highpass { cutoff_hz, order } => with(order).highpass(&result, cutoff_hz),
                FilterSpec::Lowpass { cutoff_hz, order } => with(order).lowpass(&result, cutoff_hz),
                FilterSpec::Notch { freq_hz, q } => self.notch(&result, freq_hz, q),
            };
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    const FS: f64 = 10_000.0;

    fn tone(freq: f64, n: usize) -> Array1<f64> {
        Array1::from_shape_fn(n, |i| (2.0 * PI * freq * i as f64 / FS).sin())
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    /// Steady-state gain measured over the middle half of `n` samples.
    fn gain(sos: &[Biquad], freq: f64, n: usize) -> f64 {
        let x = tone(freq, n).to_vec();
        let y = sosfiltfilt(sos, &x);
        rms(&y[n / 4..3 * n / 4]) / rms(&x[n / 4..3 * n / 4])
    }

    #[test]
    fn butterworth_sections_have_unity_passband() {
        for order in 1..=6 {
            let lp = butter_lowpass(order, 0.1);
            assert_eq!(lp.len(), order.div_ceil(2));
            let dc: f64 = lp.iter().map(Biquad::dc_gain).product();
            assert!((dc - 1.0).abs() < 1e-9, "order {order}: {dc}");
        }
    }

    #[test]
    fn lowpass_and_highpass_separate_tones() {
        let lp = butter_lowpass(4, 500.0 / (FS / 2.0));
        assert!(gain(&lp, 50.0, 4000) > 0.99);
        assert!(gain(&lp, 3000.0, 4000) < 1e-3);

        let hp = butter_highpass(4, 500.0 / (FS / 2.0));
        assert!(gain(&hp, 3000.0, 4000) > 0.99);
        assert!(gain(&hp, 50.0, 4000) < 1e-3);
    }

    #[test]
    fn notch_removes_line_noise() {
        let sec = notch_section(60.0, 30.0, FS);
        // the notch rings for ~0.16 s, so measure well away from the edges
        assert!(gain(&[sec], 60.0, 40_000) < 0.05);
        assert!(gain(&[sec], 1000.0, 40_000) > 0.99);
    }

    #[test]
    fn filtfilt_keeps_constant_signal() {
        let sos = butter_highpass(3, 0.05);
        let y = sosfiltfilt(&butter_lowpass(3, 0.05), &[2.5; 100]);
        assert!(y.iter().all(|v| (v - 2.5).abs() < 1e-9));
        let y = sosfiltfilt(&sos, &[2.5; 100]);
        assert!(y.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn degenerate_cutoffs_return_input() {
        let data = Array2::from_shape_fn((2, 64), |(c, s)| (c * 64 + s) as f64);
        let f = SignalFilter::new(4, FS);
        assert_eq!(f.bandpass(&data, 3000.0, 300.0), data);
        assert_eq!(f.highpass(&data, 6000.0), data);
        assert_eq!(f.lowpass(&data, -1.0), data);
        assert_eq!(f.notch(&data, 5000.0, 30.0), data);
    }

    #[test]
    fn filter_chain_bandpasses_each_channel() {
        let n = 4000;
        let mix = &tone(20.0, n) + &tone(1000.0, n) + &tone(4000.0, n);
        let data = Array2::from_shape_fn((3, n), |(_, s)| mix[s]);
        let chain: Vec<FilterSpec> = vec![
            FilterSpec::Highpass {
                cutoff_hz: 300.0,
                order: None,
            },
            FilterSpec::Lowpass {
                cutoff_hz: 2000.0,
                order: Some(6),
            },
            FilterSpec::Notch {
                freq_hz: 60.0,
                q: 30.0,
            },
        ];
        let out = SignalFilter::new(4, FS).apply_filter_chain(&data, &chain);
        let want = tone(1000.0, n);
        for row in out.rows() {
            let err: Vec<f64> = (1000..3000).map(|i| row[i] - want[i]).collect();
            assert!(rms(&err) < 0.05);
        }
    }
}
