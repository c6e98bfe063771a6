//! Stimulation sources: DC levels, AC and pulse trains on the VS DACs, and
//! arbitrary waveforms played back from the FPGA register file.
//!
//! Every configuration passes the safety guard before the first device
//! write. Starting outputs is left to the caller; [`StimStatus`] always
//! reports that a human has to approve it.

use log::info;
use std::{collections::BTreeMap, fmt, time::Duration};
use time::OffsetDateTime;

use crate::{
    bias::DAC_VREF,
    context::DeviceContext,
    device::{stim_code, DacWaveMode},
    error::{DaqError, Result},
    registers::*,
    safety::{charge_per_phase_nc, StimKind, DEFAULT_CHARGE_BALANCE_TOLERANCE_PCT},
};

/// DC level the stimulation DAC returns to after an arbitrary waveform.
pub const DC_RESTORE_V: f64 = 1.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimMode {
    Dc,
    Ac,
    Pulse,
    Arbitrary,
}

impl fmt::Display for StimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StimMode::Dc => "dc",
            StimMode::Ac => "ac",
            StimMode::Pulse => "pulse",
            StimMode::Arbitrary => "arbitrary",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StimParams {
    Dc {
        vs_channel: u8,
        amplitude_v: f64,
        dac_code: u16,
    },
    AcPulse {
        vs_channel: u8,
        amp_dc_v: f64,
        amp_peak_v: f64,
        frequency_hz: f64,
        duty: f64,
    },
    Arbitrary {
        waveform_id: Option<String>,
        repeat: bool,
        repeat_count: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaveformMeta {
    pub n_samples: usize,
    pub sample_rate_hz: f64,
    pub duration_ms: f64,
    pub peak_v: f64,
    pub uploaded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEnables {
    pub clk1: bool,
    pub clk2: bool,
    pub clk3: bool,
    pub all: bool,
}

impl Default for ClockEnables {
    fn default() -> Self {
        Self {
            clk1: true,
            clk2: true,
            clk3: true,
            all: false,
        }
    }
}

impl ClockEnables {
    fn bits(self) -> u32 {
        let mut bits = 0;
        if self.clk1 {
            bits |= CTRL_STIM_CLK1_EN;
        }
        if self.clk2 {
            bits |= CTRL_STIM_CLK2_EN;
        }
        if self.clk3 {
            bits |= CTRL_STIM_CLK3_EN;
        }
        if self.all {
            bits |= CTRL_STIM_ALL_EN;
        }
        bits
    }
}

/// A charge-balanced biphasic current pulse, described for pre-flight
/// checks against the current and charge limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiphasicPulse {
    pub cathodic_ua: f64,
    pub cathodic_width_us: f64,
    pub anodic_ua: f64,
    pub anodic_width_us: f64,
    pub frequency_hz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StimStatus {
    pub is_active: bool,
    pub mode: Option<StimMode>,
    pub params: Option<StimParams>,
    pub uploaded_waveforms: Vec<String>,
    pub requires_human_approval: bool,
}

pub struct StimController {
    ctx: DeviceContext,
    is_active: bool,
    mode: Option<StimMode>,
    params: Option<StimParams>,
    waveforms: BTreeMap<String, WaveformMeta>,
}

fn check_vs(vs_channel: u8) -> Result<()> {
    if !(1..=4).contains(&vs_channel) {
        return Err(DaqError::InvalidArgument(format!(
            "VS channel must be 1-4 (got {})",
            vs_channel
        )));
    }
    Ok(())
}

/// Register-file code of one waveform sample.
pub fn waveform_code(volts: f64) -> u32 {
    ((volts / DAC_VREF * 65535.0) as i64).clamp(0, 65535) as u32
}

impl StimController {
    pub fn new(ctx: DeviceContext) -> Self {
        Self {
            ctx,
            is_active: false,
            mode: None,
            params: None,
            waveforms: BTreeMap::new(),
        }
    }

    pub fn configure_dc(&mut self, vs_channel: u8, amplitude_v: f64) -> Result<StimParams> {
        check_vs(vs_channel)?;
        self.ctx
            .safety()
            .validate_source_voltage(StimKind::Dc, &[amplitude_v])?;

        let dac_code = stim_code(amplitude_v);
        self.ctx
            .device()
            .dac_write(0x01, 0x07 + vs_channel, dac_code)?;

        let params = StimParams::Dc {
            vs_channel,
            amplitude_v,
            dac_code,
        };
        info!("DC stim configured: VS{} = {:.4} V", vs_channel, amplitude_v);
        self.mode = Some(StimMode::Dc);
        self.params = Some(params.clone());
        Ok(params)
    }

    pub fn configure_ac_pulse(
        &mut self,
        mode: StimMode,
        vs_channel: u8,
        amp_dc_v: f64,
        amp_peak_v: f64,
        frequency_hz: f64,
        duty: f64,
    ) -> Result<StimParams> {
        let (wave, kind) = match mode {
            StimMode::Ac => (DacWaveMode::Ac, StimKind::Ac),
            StimMode::Pulse => (DacWaveMode::Pulse, StimKind::Pulse),
            other => {
                return Err(DaqError::InvalidArgument(format!(
                    "mode must be ac or pulse (got {})",
                    other
                )))
            }
        };
        check_vs(vs_channel)?;
        if !(0.0..=1.0).contains(&duty) {
            return Err(DaqError::InvalidArgument(format!(
                "duty cycle must be in [0, 1] (got {})",
                duty
            )));
        }
        {
            let mut safety = self.ctx.safety();
            safety.validate_source_voltage(kind, &[amp_dc_v, amp_peak_v])?;
            safety.validate_frequency(frequency_hz)?;
        }

        self.ctx.device().dac_vs_write_ac_pulse(
            wave,
            vs_channel,
            amp_dc_v,
            amp_peak_v,
            frequency_hz,
            duty,
        )?;

        let params = StimParams::AcPulse {
            vs_channel,
            amp_dc_v,
            amp_peak_v,
            frequency_hz,
            duty,
        };
        info!(
            "{} stim configured: VS{} DC={:.4} Peak={:.4} f={:.1} Hz duty={:.2}",
            mode, vs_channel, amp_dc_v, amp_peak_v, frequency_hz, duty
        );
        self.mode = Some(mode);
        self.params = Some(params.clone());
        Ok(params)
    }

    /// Check a current-mode biphasic pulse against the current, frequency,
    /// charge-per-phase and charge-balance limits. Nothing is written.
    pub fn validate_pulse_protocol(&self, pulse: &BiphasicPulse) -> Result<()> {
        let mut safety = self.ctx.safety();
        safety.validate_stimulation(
            pulse.cathodic_ua,
            pulse.cathodic_width_us,
            pulse.frequency_hz,
            StimKind::Pulse,
        )?;
        safety.validate_stimulation(
            pulse.anodic_ua,
            pulse.anodic_width_us,
            pulse.frequency_hz,
            StimKind::Pulse,
        )?;
        safety.check_charge_balance(
            charge_per_phase_nc(pulse.anodic_ua, pulse.anodic_width_us),
            charge_per_phase_nc(pulse.cathodic_ua, pulse.cathodic_width_us),
            DEFAULT_CHARGE_BALANCE_TOLERANCE_PCT,
        )?;
        Ok(())
    }

    /// Load an arbitrary waveform into the FPGA register file.
    ///
    /// Playback is stopped and the DC output disabled for the duration of
    /// the upload; the DAC is left at the DC restore level afterwards.
    pub fn upload_waveform(
        &mut self,
        waveform_id: &str,
        samples_v: &[f64],
        sample_rate_hz: f64,
    ) -> Result<WaveformMeta> {
        self.ctx
            .safety()
            .validate_waveform(samples_v, sample_rate_hz)?;

        {
            let mut dev = self.ctx.device();
            dev.write_wire(WIRE_DDR3, 0, DDR3_ARB_RUN)?;
            dev.write_wire(WIRE_DDR3, 0, DDR3_DAC_DC_OUT)?;

            let clk_div = (MASTER_CLOCK_HZ / sample_rate_hz) as u32;
            dev.write_wire(WIRE_ARB_CLK_DIV, clk_div, u32::MAX)?;
            dev.write_wire(WIRE_ARB_LENGTH, (samples_v.len() - 1) as u32, u32::MAX)?;

            for (i, &v) in samples_v.iter().enumerate() {
                dev.write_reg(i as u32, waveform_code(v))?;
            }

            let dc_restore = (DC_RESTORE_V / DAC_VREF * 65535.0) as u16;
            dev.dac_write(0x04, DAC_RESTORE_ADDRESS, dc_restore)?;
        }

        let meta = WaveformMeta {
            n_samples: samples_v.len(),
            sample_rate_hz,
            duration_ms: samples_v.len() as f64 / sample_rate_hz * 1000.0,
            peak_v: samples_v.iter().fold(0.0, |m: f64, v| m.max(v.abs())),
            uploaded_at: OffsetDateTime::now_utc(),
        };
        info!(
            "Waveform '{}' uploaded: {} points @ {:.0} Hz",
            waveform_id, meta.n_samples, sample_rate_hz
        );
        self.waveforms.insert(waveform_id.to_string(), meta.clone());
        Ok(meta)
    }

    /// Start playback of the uploaded waveform. `repeat_count` is ignored
    /// when `repeat` loops indefinitely.
    pub fn trigger_waveform(
        &mut self,
        waveform_id: Option<&str>,
        repeat: bool,
        repeat_count: u32,
    ) -> Result<StimParams> {
        if let Some(id) = waveform_id {
            if !self.waveforms.contains_key(id) {
                return Err(DaqError::NotFound(format!("waveform '{}'", id)));
            }
        }

        {
            let mut dev = self.ctx.device();
            let repeat_bit = if repeat { DDR3_ARB_REPEAT } else { 0 };
            dev.write_wire(WIRE_DDR3, repeat_bit, DDR3_ARB_REPEAT)?;
            dev.settle(Duration::from_millis(1));
            dev.write_wire(
                WIRE_DDR3,
                repeat_count.saturating_sub(1) << DDR3_REPEAT_COUNT_SHIFT,
                DDR3_REPEAT_COUNT_MASK,
            )?;
            dev.write_wire(WIRE_DDR3, 0, DDR3_ARB_RUN)?;
            dev.settle(Duration::from_millis(1));
            dev.write_wire(WIRE_DDR3, DDR3_ARB_RUN, DDR3_ARB_RUN)?;
        }

        let params = StimParams::Arbitrary {
            waveform_id: waveform_id.map(str::to_string),
            repeat,
            repeat_count,
        };
        info!(
            "Waveform triggered (id={:?}, repeat={}, count={})",
            waveform_id, repeat, repeat_count
        );
        self.is_active = true;
        self.mode = Some(StimMode::Arbitrary);
        self.params = Some(params.clone());
        Ok(params)
    }

    pub fn start_stimulation(&mut self, enables: ClockEnables) -> Result<()> {
        self.ctx
            .device()
            .write_wire(WIRE_CONTROL, enables.bits(), CTRL_STIM_CLK_MASK)?;
        self.is_active = true;
        info!("Stimulation started: {:?}", enables);
        Ok(())
    }

    pub fn stop_stimulation(&mut self) -> Result<()> {
        {
            let mut dev = self.ctx.device();
            dev.write_wire(WIRE_CONTROL, 0, CTRL_STIM_CLK_MASK)?;
            dev.write_wire(WIRE_DDR3, 0, DDR3_ARB_RUN)?;
        }
        self.is_active = false;
        self.mode = None;
        info!("Stimulation stopped");
        Ok(())
    }

    pub fn list_waveforms(&self) -> &BTreeMap<String, WaveformMeta> {
        &self.waveforms
    }

    pub fn status(&self) -> StimStatus {
        StimStatus {
            is_active: self.is_active,
            mode: self.mode,
            params: self.params.clone(),
            uploaded_waveforms: self.waveforms.keys().cloned().collect(),
            requires_human_approval: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::{SafetyRule, SafetyViolation};

    #[test]
    fn waveform_codes_truncate_and_clamp() {
        assert_eq!(waveform_code(0.0), 0);
        assert_eq!(waveform_code(-1.0), 0);
        assert_eq!(waveform_code(DAC_VREF), 65535);
        assert_eq!(waveform_code(1.0), (65535.0 / DAC_VREF) as u32);
    }

    #[test]
    fn dc_writes_vs_address() {
        let ctx = DeviceContext::simulated(0);
        let mut stim = StimController::new(ctx.clone());
        stim.configure_dc(3, 1.0).unwrap();

        let dev = ctx.device();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(
            sim.read_wire(WIRE_DAC_DATA, DAC_WORD_MASK),
            (0x0A << 16) | stim_code(1.0) as u32
        );
        assert_eq!(stim.status().mode, Some(StimMode::Dc));
        assert!(stim.status().requires_human_approval);
    }

    #[test]
    fn unsafe_dc_level_is_blocked_before_any_write() {
        let ctx = DeviceContext::simulated(0);
        let mut stim = StimController::new(ctx.clone());
        let err = stim.configure_dc(1, 3.7).unwrap_err();
        assert!(matches!(err, DaqError::Safety(ref v) if v.rule == SafetyRule::StimVoltage));
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), 0);
        assert!(stim.configure_dc(5, 1.0).is_err());
    }

    #[test]
    fn ac_pulse_validation() {
        let ctx = DeviceContext::simulated(0);
        let mut stim = StimController::new(ctx.clone());
        assert!(stim
            .configure_ac_pulse(StimMode::Dc, 1, 1.0, 0.5, 100.0, 0.5)
            .is_err());
        assert!(stim
            .configure_ac_pulse(StimMode::Pulse, 1, 1.0, 0.5, 100.0, 1.5)
            .is_err());
        let err = stim
            .configure_ac_pulse(StimMode::Ac, 1, 1.0, 0.5, 300_000.0, 0.5)
            .unwrap_err();
        assert!(matches!(err, DaqError::Safety(ref v) if v.rule == SafetyRule::StimFrequency));
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), 0);

        stim.configure_ac_pulse(StimMode::Pulse, 2, 1.0, 0.5, 1000.0, 0.25)
            .unwrap();
        assert_eq!(stim.status().mode, Some(StimMode::Pulse));
    }

    #[test]
    fn biphasic_protocol_checks_balance() {
        let stim = StimController::new(DeviceContext::simulated(0));
        let balanced = BiphasicPulse {
            cathodic_ua: -100.0,
            cathodic_width_us: 200.0,
            anodic_ua: 100.0,
            anodic_width_us: 200.0,
            frequency_hz: 50.0,
        };
        assert!(stim.validate_pulse_protocol(&balanced).is_ok());

        let skewed = BiphasicPulse {
            anodic_width_us: 150.0,
            ..balanced
        };
        assert!(stim.validate_pulse_protocol(&skewed).is_err());

        let same_polarity = BiphasicPulse {
            cathodic_ua: 100.0,
            ..balanced
        };
        let err = stim.validate_pulse_protocol(&same_polarity).unwrap_err();
        assert!(matches!(
            err,
            DaqError::Safety(SafetyViolation {
                rule: SafetyRule::ChargeBalance,
                ..
            })
        ));
    }

    #[test]
    fn non_finite_waveform_rate_never_reaches_device() {
        let ctx = DeviceContext::simulated(0);
        let mut stim = StimController::new(ctx.clone());
        let before = ctx.device().as_simulated().unwrap().op_count();
        assert!(stim.upload_waveform("nan", &[0.5, 1.0], f64::NAN).is_err());
        assert!(stim.upload_waveform("nan", &[0.5, f64::NAN], 1000.0).is_err());
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), before);
        assert!(stim.list_waveforms().is_empty());
    }

    #[test]
    fn start_and_stop_drive_clock_enables() {
        let ctx = DeviceContext::simulated(0);
        let mut stim = StimController::new(ctx.clone());
        stim.start_stimulation(ClockEnables::default()).unwrap();
        assert_eq!(
            ctx.device()
                .as_simulated()
                .unwrap()
                .read_wire(WIRE_CONTROL, CTRL_STIM_CLK_MASK),
            0x0700_0000
        );
        assert!(stim.status().is_active);

        stim.stop_stimulation().unwrap();
        assert_eq!(
            ctx.device()
                .as_simulated()
                .unwrap()
                .read_wire(WIRE_CONTROL, CTRL_STIM_CLK_MASK),
            0
        );
        assert!(!stim.status().is_active);
        assert_eq!(stim.status().mode, None);
    }
}
