use log::info;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use serde::Deserialize;

use crate::error::{DaqError, Result};

/// How samples flagged as artifacts are replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMethod {
    /// Linear interpolation between the neighbouring clean samples.
    #[default]
    Interpolate,
    /// The channel mean.
    MeanReplace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseReduction {
    pub data: Array2<f64>,
    pub steps_applied: Vec<String>,
    pub artifact_count: usize,
}

fn reference_rows(data: &Array2<f64>, reference: Option<&[usize]>) -> Result<Array2<f64>> {
    match reference {
        None => Ok(data.to_owned()),
        Some(chs) => {
            if let Some(&bad) = chs.iter().find(|&&c| c >= data.nrows()) {
                return Err(DaqError::InvalidArgument(format!(
                    "reference channel {} out of range for {} channels",
                    bad,
                    data.nrows()
                )));
            }
            if chs.is_empty() {
                return Err(DaqError::InvalidArgument("empty reference channel set".into()));
            }
            Ok(data.select(Axis(0), chs))
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// `np.interp` over `xp`/`fp`, clamped to the end values outside `xp`.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let j = xp.partition_point(|&v| v <= x);
    let (x0, x1) = (xp[j - 1], xp[j]);
    let (y0, y1) = (fp[j - 1], fp[j]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

fn mean_std(row: ArrayView1<f64>) -> (f64, f64) {
    let n = row.len().max(1) as f64;
    let mean = row.sum() / n;
    let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Common-reference subtraction, artifact suppression and smoothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NoiseReducer {
    pub artifact_method: ArtifactMethod,
}

impl NoiseReducer {
    pub fn new(artifact_method: ArtifactMethod) -> Self {
        Self { artifact_method }
    }

    /// Subtract the per-sample mean of the reference channels (all when
    /// `None`) from every channel.
    pub fn common_average_reference(
        &self,
        data: &Array2<f64>,
        reference: Option<&[usize]>,
    ) -> Result<Array2<f64>> {
        let refs = reference_rows(data, reference)?;
        match refs.mean_axis(Axis(0)) {
            Some(common) => Ok(data - &common.insert_axis(Axis(0))),
            None => Ok(data.to_owned()),
        }
    }

    /// Like [`common_average_reference`](Self::common_average_reference)
    /// with the median, which tolerates a few bad channels.
    pub fn median_reference(
        &self,
        data: &Array2<f64>,
        reference: Option<&[usize]>,
    ) -> Result<Array2<f64>> {
        let refs = reference_rows(data, reference)?;
        if refs.nrows() == 0 {
            return Ok(data.to_owned());
        }
        let mut common = Array1::zeros(refs.ncols());
        Zip::from(&mut common)
            .and(refs.columns())
            .par_for_each(|m, col| *m = median(&mut col.to_vec()));
        Ok(data - &common.insert_axis(Axis(0)))
    }

    /// Replace samples further than `threshold` standard deviations from
    /// their channel mean. Returns the cleaned data and the number of
    /// flagged samples.
    pub fn remove_artifacts(&self, data: &Array2<f64>, threshold: f64) -> (Array2<f64>, usize) {
        let mut out = data.to_owned();
        let mut flagged = vec![0usize; out.nrows()];
        let method = self.artifact_method;

        Zip::from(out.rows_mut())
            .and(&mut flagged)
            .par_for_each(|mut row, count| {
                let (mean, std) = mean_std(row.view());
                let limit = threshold * std.max(1e-12);
                let bad: Vec<usize> = (0..row.len())
                    .filter(|&i| (row[i] - mean).abs() > limit)
                    .collect();
                *count = bad.len();
                if bad.is_empty() {
                    return;
                }

                let good: Vec<usize> = (0..row.len())
                    .filter(|&i| (row[i] - mean).abs() <= limit)
                    .collect();
                if method == ArtifactMethod::MeanReplace || good.len() < 2 {
                    for &i in &bad {
                        row[i] = mean;
                    }
                    return;
                }
                let xp: Vec<f64> = good.iter().map(|&i| i as f64).collect();
                let fp: Vec<f64> = good.iter().map(|&i| row[i]).collect();
                for &i in &bad {
                    row[i] = interp(i as f64, &xp, &fp);
                }
            });

        let total: usize = flagged.iter().sum();
        if total > 0 {
            info!(
                "Artifact removal: replaced {} samples across {} channels",
                total,
                flagged.iter().filter(|&&c| c > 0).count()
            );
        }
        (out, total)
    }

    /// Causal moving average: each output is the mean of the current
    /// sample and up to `window - 1` before it.
    pub fn moving_average(&self, data: &Array2<f64>, window: usize) -> Array2<f64> {
        let mut out = data.to_owned();
        if window < 2 {
            return out;
        }
        Zip::from(out.rows_mut())
            .and(data.rows())
            .par_for_each(|mut dst, src| {
                let mut acc = 0.0;
                for i in 0..src.len() {
                    acc += src[i];
                    if i >= window {
                        acc -= src[i - window];
                    }
                    dst[i] = acc / (i + 1).min(window) as f64;
                }
            });
        out
    }

    /// Run the enabled steps in order: common average reference, artifact
    /// removal, smoothing.
    pub fn reduce(
        &self,
        data: &Array2<f64>,
        car: bool,
        artifact_threshold: Option<f64>,
        smooth_window: Option<usize>,
    ) -> Result<NoiseReduction> {
        let mut result = data.to_owned();
        let mut steps = Vec::new();
        let mut artifact_count = 0;

        if car {
            result = self.common_average_reference(&result, None)?;
            steps.push("common_average_reference".to_string());
        }
        if let Some(threshold) = artifact_threshold.filter(|&t| t > 0.0) {
            let (cleaned, count) = self.remove_artifacts(&result, threshold);
            result = cleaned;
            artifact_count = count;
            steps.push(format!("artifact_removal(threshold={})", threshold));
        }
        if let Some(window) = smooth_window.filter(|&w| w > 1) {
            result = self.moving_average(&result, window);
            steps.push(format!("moving_average(window={})", window));
        }

        Ok(NoiseReduction {
            data: result,
            steps_applied: steps,
            artifact_count,
        })
    }
}
