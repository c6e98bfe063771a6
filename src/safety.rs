//! Hard limits for everything that can put current or voltage into tissue.
//!
//! Limits are compiled in and cannot be changed at runtime. Every check is
//! written to a bounded audit log whether it passes or not.

use log::{info, warn};
use std::{collections::BTreeMap, collections::VecDeque, fmt};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLimits {
    pub vs_min_voltage: f64,
    pub vs_max_voltage: f64,
    pub stim_max_current_ua: f64,
    pub stim_max_charge_per_phase_nc: f64,
    pub max_stim_frequency_hz: f64,
    pub min_stim_frequency_hz: f64,
    pub max_waveform_points: usize,
    pub max_waveform_amplitude_v: f64,
    pub max_pcb_temperature_c: f64,
    pub max_ic_temperature_c: f64,
    pub max_voltage_step_v: f64,
    pub bias_voltage_min: f64,
    pub bias_voltage_max: f64,
}

pub const HARDWARE_SAFETY_LIMITS: SafetyLimits = SafetyLimits {
    vs_min_voltage: 0.0,
    vs_max_voltage: 3.6,
    stim_max_current_ua: 500.0,
    stim_max_charge_per_phase_nc: 100.0,
    max_stim_frequency_hz: 200_000.0,
    min_stim_frequency_hz: 0.1,
    max_waveform_points: 2048,
    max_waveform_amplitude_v: 3.6,
    max_pcb_temperature_c: 45.0,
    max_ic_temperature_c: 42.0,
    max_voltage_step_v: 0.5,
    bias_voltage_min: 0.0,
    bias_voltage_max: 3.3,
};

pub const MAX_AUDIT_ENTRIES: usize = 2000;
pub const DEFAULT_CHARGE_BALANCE_TOLERANCE_PCT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyRule {
    BiasRange,
    RateOfChange,
    StimCurrent,
    StimFrequency,
    StimVoltage,
    ChargePerPhase,
    ChargeBalance,
    WaveformLength,
    WaveformAmplitude,
    WaveformRate,
    PcbTemperature,
    IcTemperature,
}

impl fmt::Display for SafetyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafetyRule::BiasRange => "BIAS_RANGE",
            SafetyRule::RateOfChange => "RATE_OF_CHANGE",
            SafetyRule::StimCurrent => "STIM_CURRENT",
            SafetyRule::StimFrequency => "STIM_FREQUENCY",
            SafetyRule::StimVoltage => "STIM_VOLTAGE",
            SafetyRule::ChargePerPhase => "CHARGE_PER_PHASE",
            SafetyRule::ChargeBalance => "CHARGE_BALANCE",
            SafetyRule::WaveformLength => "WAVEFORM_LENGTH",
            SafetyRule::WaveformAmplitude => "WAVEFORM_AMPLITUDE",
            SafetyRule::WaveformRate => "WAVEFORM_RATE",
            SafetyRule::PcbTemperature => "PCB_TEMPERATURE",
            SafetyRule::IcTemperature => "IC_TEMPERATURE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("safety violation [{rule}]: {detail}")]
pub struct SafetyViolation {
    pub rule: SafetyRule,
    pub detail: String,
    pub value: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub timestamp: OffsetDateTime,
    pub action: String,
    pub parameter: String,
    pub old_value: Option<f64>,
    pub new_value: f64,
    pub allowed: bool,
    pub reason: String,
}

/// Source mode passed to [`HardwareSafetyGuard::validate_stimulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimKind {
    Dc,
    Ac,
    Pulse,
    Arbitrary,
}

impl fmt::Display for StimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StimKind::Dc => "dc",
            StimKind::Ac => "ac",
            StimKind::Pulse => "pulse",
            StimKind::Arbitrary => "arbitrary",
        };
        f.write_str(name)
    }
}

/// Charge delivered by a rectangular phase, in nC.
pub fn charge_per_phase_nc(amplitude_ua: f64, pulse_width_us: f64) -> f64 {
    amplitude_ua * pulse_width_us / 1000.0
}

pub struct HardwareSafetyGuard {
    limits: SafetyLimits,
    last_bias: BTreeMap<String, f64>,
    audit: VecDeque<AuditEntry>,
}

impl Default for HardwareSafetyGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareSafetyGuard {
    pub fn new() -> Self {
        Self {
            limits: HARDWARE_SAFETY_LIMITS,
            last_bias: BTreeMap::new(),
            audit: VecDeque::with_capacity(MAX_AUDIT_ENTRIES),
        }
    }

    #[cfg(test)]
    fn with_limits(limits: SafetyLimits) -> Self {
        Self {
            limits,
            ..Self::new()
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    fn record(
        &mut self,
        action: &str,
        parameter: &str,
        old_value: Option<f64>,
        new_value: f64,
        allowed: bool,
        reason: impl Into<String>,
    ) {
        if self.audit.len() == MAX_AUDIT_ENTRIES {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditEntry {
            timestamp: OffsetDateTime::now_utc(),
            action: action.to_string(),
            parameter: parameter.to_string(),
            old_value,
            new_value,
            allowed,
            reason: reason.into(),
        });
    }

    fn block(
        &mut self,
        action: &str,
        parameter: &str,
        old_value: Option<f64>,
        rule: SafetyRule,
        value: f64,
        limit: f64,
        detail: String,
    ) -> SafetyViolation {
        warn!("Safety block [{}] {}", rule, detail);
        self.record(action, parameter, old_value, value, false, detail.clone());
        SafetyViolation {
            rule,
            detail,
            value,
            limit,
        }
    }

    /// NaN compares false against every limit, so non-finite inputs are
    /// rejected before any range check.
    fn require_finite(
        &mut self,
        action: &str,
        parameter: &str,
        rule: SafetyRule,
        value: f64,
        limit: f64,
    ) -> Result<(), SafetyViolation> {
        if value.is_finite() {
            return Ok(());
        }
        Err(self.block(
            action,
            parameter,
            None,
            rule,
            value,
            limit,
            format!("{} = {} is not a finite number", parameter, value),
        ))
    }

    /// Check a batch of bias voltages against the absolute range and the
    /// per-step limit relative to the last committed value. Stops at the
    /// first violation; nothing is committed here.
    pub fn validate_bias(&mut self, params: &BTreeMap<String, f64>) -> Result<(), SafetyViolation> {
        let lim = self.limits;
        for (name, &v) in params {
            let old = self.last_bias.get(name).copied();

            if !(lim.bias_voltage_min..=lim.bias_voltage_max).contains(&v) {
                let limit = if v < lim.bias_voltage_min {
                    lim.bias_voltage_min
                } else {
                    lim.bias_voltage_max
                };
                return Err(self.block(
                    "set_bias",
                    name,
                    old,
                    SafetyRule::BiasRange,
                    v,
                    limit,
                    format!(
                        "{} = {:.3} V is outside [{}, {}] V",
                        name, v, lim.bias_voltage_min, lim.bias_voltage_max
                    ),
                ));
            }

            if let Some(prev) = old {
                let step = (v - prev).abs();
                if step > lim.max_voltage_step_v {
                    return Err(self.block(
                        "set_bias",
                        name,
                        old,
                        SafetyRule::RateOfChange,
                        step,
                        lim.max_voltage_step_v,
                        format!(
                            "{} step {:.3} V exceeds {} V (from {:.3} to {:.3})",
                            name, step, lim.max_voltage_step_v, prev, v
                        ),
                    ));
                }
            }

            self.record("set_bias", name, old, v, true, "within limits");
        }
        Ok(())
    }

    /// Make `params` the reference for the next rate-of-change check.
    pub fn commit_bias(&mut self, params: &BTreeMap<String, f64>) {
        for (name, &v) in params {
            self.last_bias.insert(name.clone(), v);
        }
    }

    pub fn last_bias(&self, name: &str) -> Option<f64> {
        self.last_bias.get(name).copied()
    }

    pub fn validate_stimulation(
        &mut self,
        amplitude_ua: f64,
        pulse_width_us: f64,
        frequency_hz: f64,
        kind: StimKind,
    ) -> Result<(), SafetyViolation> {
        let lim = self.limits;
        let action = format!("stimulate_{}", kind);

        self.require_finite(
            &action,
            "amplitude_ua",
            SafetyRule::StimCurrent,
            amplitude_ua,
            lim.stim_max_current_ua,
        )?;
        self.require_finite(
            &action,
            "pulse_width_us",
            SafetyRule::ChargePerPhase,
            pulse_width_us,
            lim.stim_max_charge_per_phase_nc,
        )?;

        if amplitude_ua.abs() > lim.stim_max_current_ua {
            return Err(self.block(
                &action,
                "amplitude_ua",
                None,
                SafetyRule::StimCurrent,
                amplitude_ua,
                lim.stim_max_current_ua,
                format!(
                    "|{:.1}| uA exceeds {} uA",
                    amplitude_ua, lim.stim_max_current_ua
                ),
            ));
        }

        if !(lim.min_stim_frequency_hz..=lim.max_stim_frequency_hz).contains(&frequency_hz) {
            let limit = if frequency_hz < lim.min_stim_frequency_hz {
                lim.min_stim_frequency_hz
            } else {
                lim.max_stim_frequency_hz
            };
            return Err(self.block(
                &action,
                "frequency_hz",
                None,
                SafetyRule::StimFrequency,
                frequency_hz,
                limit,
                format!(
                    "{} Hz is outside [{}, {}] Hz",
                    frequency_hz, lim.min_stim_frequency_hz, lim.max_stim_frequency_hz
                ),
            ));
        }

        let charge = charge_per_phase_nc(amplitude_ua.abs(), pulse_width_us);
        if charge > lim.stim_max_charge_per_phase_nc {
            return Err(self.block(
                &action,
                "charge_nc",
                None,
                SafetyRule::ChargePerPhase,
                charge,
                lim.stim_max_charge_per_phase_nc,
                format!(
                    "{:.2} nC per phase exceeds {} nC",
                    charge, lim.stim_max_charge_per_phase_nc
                ),
            ));
        }

        self.record(
            &action,
            "amplitude_ua",
            None,
            amplitude_ua,
            true,
            format!("{:.2} nC per phase at {} Hz", charge, frequency_hz),
        );
        Ok(())
    }

    /// Check a voltage-mode source. DC levels must sit in the VS range;
    /// AC and pulse levels are bounded by the waveform amplitude limit.
    pub fn validate_source_voltage(
        &mut self,
        kind: StimKind,
        levels_v: &[f64],
    ) -> Result<(), SafetyViolation> {
        let lim = self.limits;
        let action = format!("stimulate_{}", kind);
        for &v in levels_v {
            let (ok, limit) = match kind {
                StimKind::Dc => (
                    (lim.vs_min_voltage..=lim.vs_max_voltage).contains(&v),
                    if v < lim.vs_min_voltage {
                        lim.vs_min_voltage
                    } else {
                        lim.vs_max_voltage
                    },
                ),
                _ => (
                    v.abs() <= lim.max_waveform_amplitude_v,
                    lim.max_waveform_amplitude_v,
                ),
            };
            if !ok {
                return Err(self.block(
                    &action,
                    "voltage_v",
                    None,
                    SafetyRule::StimVoltage,
                    v,
                    limit,
                    format!("{:.3} V is outside the allowed {} range", v, kind),
                ));
            }
        }
        let peak = levels_v.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        self.record(&action, "voltage_v", None, peak, true, "within limits");
        Ok(())
    }

    pub fn validate_frequency(&mut self, frequency_hz: f64) -> Result<(), SafetyViolation> {
        let lim = self.limits;
        if !(lim.min_stim_frequency_hz..=lim.max_stim_frequency_hz).contains(&frequency_hz) {
            let limit = if frequency_hz < lim.min_stim_frequency_hz {
                lim.min_stim_frequency_hz
            } else {
                lim.max_stim_frequency_hz
            };
            return Err(self.block(
                "set_frequency",
                "frequency_hz",
                None,
                SafetyRule::StimFrequency,
                frequency_hz,
                limit,
                format!(
                    "{} Hz is outside [{}, {}] Hz",
                    frequency_hz, lim.min_stim_frequency_hz, lim.max_stim_frequency_hz
                ),
            ));
        }
        self.record(
            "set_frequency",
            "frequency_hz",
            None,
            frequency_hz,
            true,
            "within limits",
        );
        Ok(())
    }

    pub fn validate_waveform(
        &mut self,
        samples_v: &[f64],
        sample_rate_hz: f64,
    ) -> Result<(), SafetyViolation> {
        let lim = self.limits;
        let n = samples_v.len();

        if n == 0 || n > lim.max_waveform_points {
            return Err(self.block(
                "upload_waveform",
                "n_samples",
                None,
                SafetyRule::WaveformLength,
                n as f64,
                lim.max_waveform_points as f64,
                format!(
                    "{} points is outside 1..={} points",
                    n, lim.max_waveform_points
                ),
            ));
        }

        if let Some(&bad) = samples_v.iter().find(|v| !v.is_finite()) {
            self.require_finite(
                "upload_waveform",
                "sample_v",
                SafetyRule::WaveformAmplitude,
                bad,
                lim.max_waveform_amplitude_v,
            )?;
        }

        let peak = samples_v.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if peak > lim.max_waveform_amplitude_v {
            return Err(self.block(
                "upload_waveform",
                "peak_v",
                None,
                SafetyRule::WaveformAmplitude,
                peak,
                lim.max_waveform_amplitude_v,
                format!(
                    "peak {:.3} V exceeds {} V",
                    peak, lim.max_waveform_amplitude_v
                ),
            ));
        }

        self.require_finite(
            "upload_waveform",
            "sample_rate_hz",
            SafetyRule::WaveformRate,
            sample_rate_hz,
            0.0,
        )?;
        if sample_rate_hz <= 0.0 {
            return Err(self.block(
                "upload_waveform",
                "sample_rate_hz",
                None,
                SafetyRule::WaveformRate,
                sample_rate_hz,
                0.0,
                format!("sample rate {} Hz must be positive", sample_rate_hz),
            ));
        }

        self.record(
            "upload_waveform",
            "peak_v",
            None,
            peak,
            true,
            format!("{} points at {} Hz", n, sample_rate_hz),
        );
        Ok(())
    }

    pub fn check_thermal(&mut self, pcb_temp_c: f64, ic_temp_c: f64) -> Result<(), SafetyViolation> {
        let lim = self.limits;
        self.require_finite(
            "thermal_check",
            "pcb_temperature_c",
            SafetyRule::PcbTemperature,
            pcb_temp_c,
            lim.max_pcb_temperature_c,
        )?;
        self.require_finite(
            "thermal_check",
            "ic_temperature_c",
            SafetyRule::IcTemperature,
            ic_temp_c,
            lim.max_ic_temperature_c,
        )?;
        if pcb_temp_c > lim.max_pcb_temperature_c {
            return Err(self.block(
                "thermal_check",
                "pcb_temperature_c",
                None,
                SafetyRule::PcbTemperature,
                pcb_temp_c,
                lim.max_pcb_temperature_c,
                format!(
                    "PCB at {:.1} C exceeds {} C",
                    pcb_temp_c, lim.max_pcb_temperature_c
                ),
            ));
        }
        if ic_temp_c > lim.max_ic_temperature_c {
            return Err(self.block(
                "thermal_check",
                "ic_temperature_c",
                None,
                SafetyRule::IcTemperature,
                ic_temp_c,
                lim.max_ic_temperature_c,
                format!(
                    "IC at {:.1} C exceeds {} C",
                    ic_temp_c, lim.max_ic_temperature_c
                ),
            ));
        }
        self.record(
            "thermal_check",
            "ic_temperature_c",
            None,
            ic_temp_c,
            true,
            "within limits",
        );
        Ok(())
    }

    /// Net charge of a biphasic pulse, `|Qa + Qc| / (|Qa| + |Qc|)`, as a
    /// percentage. Charges are signed: two phases of the same polarity are
    /// fully unbalanced.
    pub fn check_charge_balance(
        &mut self,
        anodic_nc: f64,
        cathodic_nc: f64,
        tolerance_pct: f64,
    ) -> Result<(), SafetyViolation> {
        for (parameter, value) in [
            ("anodic_nc", anodic_nc),
            ("cathodic_nc", cathodic_nc),
            ("tolerance_pct", tolerance_pct),
        ] {
            self.require_finite(
                "charge_balance",
                parameter,
                SafetyRule::ChargeBalance,
                value,
                tolerance_pct,
            )?;
        }

        let total = anodic_nc.abs() + cathodic_nc.abs();
        let imbalance_pct = if total > 0.0 {
            (anodic_nc + cathodic_nc).abs() / total * 100.0
        } else {
            0.0
        };
        if imbalance_pct > tolerance_pct {
            return Err(self.block(
                "charge_balance",
                "imbalance_pct",
                None,
                SafetyRule::ChargeBalance,
                imbalance_pct,
                tolerance_pct,
                format!(
                    "imbalance {:.2}% exceeds {}% (anodic {:.2} nC, cathodic {:.2} nC)",
                    imbalance_pct, tolerance_pct, anodic_nc, cathodic_nc
                ),
            ));
        }
        self.record(
            "charge_balance",
            "imbalance_pct",
            None,
            imbalance_pct,
            true,
            "balanced",
        );
        Ok(())
    }

    /// The most recent `n` audit entries, oldest first.
    pub fn audit_log(&self, n: usize) -> Vec<AuditEntry> {
        let skip = self.audit.len().saturating_sub(n);
        self.audit.iter().skip(skip).cloned().collect()
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }

    pub fn log_limits(&self) {
        let l = &self.limits;
        info!(
            "Safety limits: bias {}..{} V (step {} V), stim {} uA / {} nC, {}..{} Hz, waveform {} pts / {} V, PCB {} C, IC {} C",
            l.bias_voltage_min,
            l.bias_voltage_max,
            l.max_voltage_step_v,
            l.stim_max_current_ua,
            l.stim_max_charge_per_phase_nc,
            l.min_stim_frequency_hz,
            l.max_stim_frequency_hz,
            l.max_waveform_points,
            l.max_waveform_amplitude_v,
            l.max_pcb_temperature_c,
            l.max_ic_temperature_c
        );
    }
}
