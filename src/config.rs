use confique::Config;
use std::path::{Path, PathBuf};

use crate::{error::Result, processing::noise::ArtifactMethod};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub acquisition: AcquisitionSettings,
    #[config(nested)]
    pub processing: ProcessingSettings,
    #[config(nested)]
    pub log: LogSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    /// Explicit path to the FrontPanel shared library. When unset the
    /// platform search path is used.
    #[config(env = "CNEA_SDK_LIBRARY")]
    pub sdk_library: Option<PathBuf>,
    #[config(default = "CNEAv5_v01_TOP.bit")]
    pub bitstream: PathBuf,
    /// Serial of the board to open; empty opens the first one found.
    #[config(default = "")]
    pub serial: String,
    #[config(env = "CNEA_FORCE_SIMULATED", default = false)]
    pub force_simulated: bool,
    #[config(default = 42)]
    pub sim_seed: u64,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionSettings {
    #[config(default = 160)]
    pub buffer_size_mb: usize,
    /// Words per block read, `16 * 65536` by default.
    #[config(default = 1048576)]
    pub data_length_words: usize,
    #[config(default = 50)]
    pub read_interval_ms: u64,
    #[config(default = 100)]
    pub error_backoff_ms: u64,
    #[config(default = 5000)]
    pub join_timeout_ms: u64,
    /// Unset records every channel; see [`AcquisitionSettings::channel_mask`].
    pub channel_mask: Option<u32>,
    #[config(default = 10000.0)]
    pub sample_rate_hz: f64,
}

#[derive(Config, Debug, Clone)]
pub struct ProcessingSettings {
    #[config(default = 4)]
    pub filter_order: usize,
    #[config(default = 60.0)]
    pub notch_hz: f64,
    #[config(default = 30.0)]
    pub notch_q: f64,
    #[config(default = 5.0)]
    pub sigma: f64,
    #[config(default = 512)]
    pub window_size: usize,
    /// Subtract the common average before spike detection.
    #[config(default = true)]
    pub common_average_reference: bool,
    pub artifact_threshold: Option<f64>,
    #[config(default = "interpolate")]
    pub artifact_method: ArtifactMethod,
    pub smoothing_window: Option<usize>,
}

#[derive(Config, Debug, Clone)]
pub struct LogSettings {
    #[config(env = "CNEA_LOG_LEVEL", default = "info")]
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Mask selecting all 32 channel groups.
pub const ALL_CHANNELS: u32 = u32::MAX;

impl AcquisitionSettings {
    pub fn channel_mask(&self) -> u32 {
        self.channel_mask.unwrap_or(ALL_CHANNELS)
    }
}

impl Conf {
    /// Layer environment variables over `path`. A missing file is not an
    /// error; every field has a default.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Conf::builder().env().file(path).load()?)
    }

    pub fn defaults() -> Result<Self> {
        Ok(Conf::builder().load()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_hardware_constants() {
        let conf = Conf::defaults().unwrap();
        assert_eq!(conf.acquisition.data_length_words, 16 * 65536);
        assert_eq!(conf.acquisition.buffer_size_mb, 160);
        assert_eq!(conf.acquisition.channel_mask, None);
        assert_eq!(conf.acquisition.channel_mask(), u32::MAX);
        assert_eq!(conf.processing.window_size, 512);
        assert!(conf.device.sdk_library.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[device]\nforce_simulated = true\nsim_seed = 7\n\n[acquisition]\nbuffer_size_mb = 16\n\n[processing]\nartifact_method = \"mean_replace\""
        )
        .unwrap();

        let conf = Conf::load(file.path()).unwrap();
        assert!(conf.device.force_simulated);
        assert_eq!(conf.device.sim_seed, 7);
        assert_eq!(conf.acquisition.buffer_size_mb, 16);
        assert_eq!(conf.acquisition.read_interval_ms, 50);
        assert_eq!(conf.processing.artifact_method, ArtifactMethod::MeanReplace);
        assert_eq!(conf.acquisition.channel_mask(), ALL_CHANNELS);
    }

    #[test]
    fn channel_mask_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[acquisition]\nchannel_mask = 3").unwrap();

        let conf = Conf::load(file.path()).unwrap();
        assert_eq!(conf.acquisition.channel_mask(), 0b11);
    }
}
