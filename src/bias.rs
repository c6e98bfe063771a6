use log::info;
use std::collections::BTreeMap;

use crate::{
    context::DeviceContext,
    error::{DaqError, Result},
};

pub const DAC_VREF: f64 = 2.518 * 2.0;
pub const DAC_RESOLUTION: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasParam {
    pub name: &'static str,
    pub dac_select: u8,
    pub dac_address: u8,
    pub default_v: f64,
    pub description: &'static str,
}

const fn param(
    name: &'static str,
    dac_select: u8,
    dac_address: u8,
    default_v: f64,
    description: &'static str,
) -> BiasParam {
    BiasParam {
        name,
        dac_select,
        dac_address,
        default_v,
        description,
    }
}

pub const BIAS_PARAMETERS: [BiasParam; 20] = [
    param("VS1", 0x01, 0x08, 1.65, "Stimulation source 1"),
    param("VS2", 0x01, 0x09, 1.50, "Stimulation source 2"),
    param("VS3", 0x01, 0x0A, 0.00, "Stimulation source 3"),
    param("VS4", 0x01, 0x0B, 1.20, "Stimulation source 4"),
    param("V_CI1", 0x02, 0x08, 0.00, "Current injection 1"),
    param("V_CI2", 0x02, 0x09, 0.00, "Current injection 2"),
    param("V_CI3", 0x02, 0x0A, 0.00, "Current injection 3"),
    param("V_CI4", 0x02, 0x0B, 0.00, "Current injection 4"),
    param("VREFL", 0x04, 0x08, 1.15, "Low reference"),
    param("VREFLH", 0x04, 0x09, 2.15, "Low-high reference"),
    param("VREFMH", 0x04, 0x0A, 2.15, "Mid-high reference"),
    param("VCM", 0x04, 0x0B, 1.65, "Common-mode voltage"),
    param("BP_CI", 0x08, 0x08, 2.85, "Current injection bias"),
    param("BP_OTA", 0x08, 0x09, 2.85, "OTA bias"),
    param("VR", 0x08, 0x0A, 3.30, "Reset voltage"),
    param("NMIR", 0x08, 0x0B, 0.65, "Current mirror bias"),
    param("REF_DC", 0x10, 0x08, 1.65, "DC reference"),
    param("TEMP_SET", 0x10, 0x09, 0.00, "Temperature set point"),
    param("TEMP_OS", 0x10, 0x0A, 0.50, "Temperature offset"),
    param("TEST_IN", 0x10, 0x0B, 2.00, "Test input"),
];

pub fn find_param(name: &str) -> Option<(usize, &'static BiasParam)> {
    BIAS_PARAMETERS
        .iter()
        .enumerate()
        .find(|(_, p)| p.name == name)
}

pub fn voltage_to_dac_code(volts: f64) -> u16 {
    let code = (volts / DAC_VREF * DAC_RESOLUTION as f64).round();
    code.clamp(0.0, DAC_RESOLUTION as f64) as u16
}

pub fn dac_code_to_voltage(code: u16) -> f64 {
    code as f64 / DAC_RESOLUTION as f64 * DAC_VREF
}

#[derive(Debug, Clone, PartialEq)]
pub struct BiasChange {
    pub name: &'static str,
    pub old_v: f64,
    pub new_v: f64,
    pub dac_code: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BiasEntry {
    pub name: &'static str,
    pub voltage: f64,
    pub dac_code: u16,
    pub dac_select: u8,
    pub dac_address: u8,
    pub description: &'static str,
}

pub struct BiasController {
    ctx: DeviceContext,
    current: [f64; 20],
}

impl BiasController {
    pub fn new(ctx: DeviceContext) -> Self {
        let mut current = [0.0; 20];
        for (slot, p) in current.iter_mut().zip(BIAS_PARAMETERS.iter()) {
            *slot = p.default_v;
        }
        Self { ctx, current }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        find_param(name).map(|(i, _)| self.current[i])
    }

    /// Validate and apply a batch of bias voltages.
    ///
    /// Unknown names and safety violations reject the whole batch before any
    /// DAC is touched. Each value is written twice to let the DAC settle, and
    /// the batch becomes the rate-of-change reference only after every write
    /// succeeded.
    pub fn set_multiple(&mut self, params: &BTreeMap<String, f64>) -> Result<Vec<BiasChange>> {
        let mut targets = Vec::with_capacity(params.len());
        for (name, &v) in params {
            let (i, p) = find_param(name)
                .ok_or_else(|| DaqError::InvalidArgument(format!("unknown bias parameter {}", name)))?;
            targets.push((i, p, v));
        }

        self.ctx.safety().validate_bias(params)?;

        let mut changes = Vec::with_capacity(targets.len());
        {
            let mut dev = self.ctx.device();
            for &(i, p, v) in &targets {
                let code = voltage_to_dac_code(v);
                dev.dac_write(p.dac_select, p.dac_address, code)?;
                dev.dac_write(p.dac_select, p.dac_address, code)?;
                changes.push(BiasChange {
                    name: p.name,
                    old_v: self.current[i],
                    new_v: v,
                    dac_code: code,
                });
                self.current[i] = v;
            }
        }

        self.ctx.safety().commit_bias(params);
        for c in &changes {
            info!(
                "Bias {} {:.3} V -> {:.3} V (code {})",
                c.name, c.old_v, c.new_v, c.dac_code
            );
        }
        Ok(changes)
    }

    pub fn set_single(&mut self, name: &str, volts: f64) -> Result<BiasChange> {
        let params = BTreeMap::from([(name.to_string(), volts)]);
        let mut changes = self.set_multiple(&params)?;
        changes
            .pop()
            .ok_or_else(|| DaqError::InvalidArgument(format!("unknown bias parameter {}", name)))
    }

    /// Apply every default in one batch.
    pub fn apply_defaults(&mut self) -> Result<Vec<BiasChange>> {
        let params: BTreeMap<String, f64> = BIAS_PARAMETERS
            .iter()
            .map(|p| (p.name.to_string(), p.default_v))
            .collect();
        self.set_multiple(&params)
    }

    pub fn definitions(&self) -> &'static [BiasParam] {
        &BIAS_PARAMETERS
    }

    pub fn get_all(&self) -> Vec<BiasEntry> {
        BIAS_PARAMETERS
            .iter()
            .zip(self.current.iter())
            .map(|(p, &v)| BiasEntry {
                name: p.name,
                voltage: v,
                dac_code: voltage_to_dac_code(v),
                dac_select: p.dac_select,
                dac_address: p.dac_address,
                description: p.description,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dac_code_round_trip() {
        for i in 0..=330 {
            let v = i as f64 * 0.01;
            let back = dac_code_to_voltage(voltage_to_dac_code(v));
            assert!((back - v).abs() <= DAC_VREF / 65535.0, "{v} -> {back}");
        }
        assert_eq!(voltage_to_dac_code(-1.0), 0);
        assert_eq!(voltage_to_dac_code(10.0), 65535);
    }

    #[test]
    fn defaults_are_in_range_and_unique() {
        let mut names: Vec<_> = BIAS_PARAMETERS.iter().map(|p| p.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 20);
        assert!(BIAS_PARAMETERS
            .iter()
            .all(|p| (0.0..=3.3).contains(&p.default_v)));
        assert_eq!(find_param("VCM").map(|(_, p)| p.dac_select), Some(0x04));
    }

    #[test]
    fn set_writes_twice_and_commits() {
        let ctx = DeviceContext::simulated(0);
        let mut bias = BiasController::new(ctx.clone());
        let change = bias.set_single("VCM", 1.8).unwrap();
        assert_eq!(change.old_v, 1.65);
        assert_eq!(change.dac_code, voltage_to_dac_code(1.8));
        assert_eq!(bias.get("VCM"), Some(1.8));

        // two dac_write calls of four operations each
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), 8);
        assert_eq!(ctx.safety().last_bias("VCM"), Some(1.8));
    }

    #[test]
    fn unknown_name_rejects_batch() {
        let ctx = DeviceContext::simulated(0);
        let mut bias = BiasController::new(ctx.clone());
        let params = BTreeMap::from([("VCM".to_string(), 1.0), ("NOPE".to_string(), 1.0)]);
        assert!(matches!(
            bias.set_multiple(&params),
            Err(DaqError::InvalidArgument(_))
        ));
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), 0);
        assert_eq!(bias.get("VCM"), Some(1.65));
    }
}
