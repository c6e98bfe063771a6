use log::info;
use std::collections::BTreeMap;

use crate::{
    context::DeviceContext,
    error::{DaqError, Result},
    registers::MASTER_CLOCK_HZ,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDef {
    pub name: &'static str,
    pub min_divider: u32,
    pub max_divider: u32,
    pub default_divider: u32,
    pub description: &'static str,
}

pub const CLOCK_DEFINITIONS: [ClockDef; 5] = [
    ClockDef {
        name: "CLK1",
        min_divider: 1,
        max_divider: 1023,
        default_divider: 100,
        description: "Stimulation clock 1",
    },
    ClockDef {
        name: "CLK2",
        min_divider: 1,
        max_divider: 1023,
        default_divider: 250,
        description: "Stimulation clock 2",
    },
    ClockDef {
        name: "CLK3",
        min_divider: 1,
        max_divider: 1023,
        default_divider: 250,
        description: "Stimulation clock 3",
    },
    ClockDef {
        name: "PG_CLK",
        min_divider: 0,
        max_divider: 255,
        default_divider: 0,
        description: "Pattern generator clock",
    },
    ClockDef {
        name: "DATA_CLK",
        min_divider: 1,
        max_divider: 1023,
        default_divider: 1,
        description: "Data clock",
    },
];

pub fn divider_to_frequency(divider: u32) -> f64 {
    if divider == 0 {
        return 0.0;
    }
    MASTER_CLOCK_HZ / divider as f64
}

pub fn frequency_to_divider(frequency_hz: f64) -> u32 {
    if frequency_hz <= 0.0 {
        return 0;
    }
    ((MASTER_CLOCK_HZ / frequency_hz).round() as u32).max(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockEntry {
    pub name: &'static str,
    pub divider: u32,
    pub frequency_hz: f64,
    pub description: &'static str,
}

pub struct ClockController {
    ctx: DeviceContext,
    dividers: [u32; 5],
}

fn index_of(name: &str) -> Option<usize> {
    CLOCK_DEFINITIONS.iter().position(|c| c.name == name)
}

impl ClockController {
    pub fn new(ctx: DeviceContext) -> Self {
        let mut dividers = [0; 5];
        for (slot, def) in dividers.iter_mut().zip(CLOCK_DEFINITIONS.iter()) {
            *slot = def.default_divider;
        }
        Self { ctx, dividers }
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        index_of(name).map(|i| self.dividers[i])
    }

    /// Validate every requested divider, then program the stimulation
    /// clocks in one device call. Nothing changes if any value is rejected.
    pub fn set_clocks(&mut self, dividers: &BTreeMap<String, u32>) -> Result<Vec<ClockEntry>> {
        let mut next = self.dividers;
        for (name, &div) in dividers {
            let i = index_of(name)
                .ok_or_else(|| DaqError::InvalidArgument(format!("unknown clock {}", name)))?;
            let def = &CLOCK_DEFINITIONS[i];
            if !(def.min_divider..=def.max_divider).contains(&div) {
                return Err(DaqError::InvalidArgument(format!(
                    "{} divider {} is outside {}..={}",
                    name, div, def.min_divider, def.max_divider
                )));
            }
            next[i] = div;
        }

        self.ctx
            .device()
            .stim_clk_init(next[0], next[1], next[2], next[3])?;
        self.dividers = next;

        info!(
            "Clocks CLK1={} CLK2={} CLK3={} PG_CLK={}",
            next[0], next[1], next[2], next[3]
        );
        Ok(self.get_all())
    }

    pub fn set_divider(&mut self, name: &str, divider: u32) -> Result<Vec<ClockEntry>> {
        self.set_clocks(&BTreeMap::from([(name.to_string(), divider)]))
    }

    pub fn apply_defaults(&mut self) -> Result<Vec<ClockEntry>> {
        let defaults = CLOCK_DEFINITIONS
            .iter()
            .map(|c| (c.name.to_string(), c.default_divider))
            .collect();
        self.set_clocks(&defaults)
    }

    pub fn definitions(&self) -> &'static [ClockDef] {
        &CLOCK_DEFINITIONS
    }

    pub fn get_all(&self) -> Vec<ClockEntry> {
        CLOCK_DEFINITIONS
            .iter()
            .zip(self.dividers.iter())
            .map(|(def, &divider)| ClockEntry {
                name: def.name,
                divider,
                frequency_hz: divider_to_frequency(divider),
                description: def.description,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{WIRE_PG_CLK_DIV, WIRE_STIM_CLK_DIV};

    #[test]
    fn divider_round_trip() {
        for d in 1..=1023 {
            assert_eq!(frequency_to_divider(divider_to_frequency(d)), d);
        }
        assert_eq!(divider_to_frequency(0), 0.0);
        assert_eq!(frequency_to_divider(0.0), 0);
        assert_eq!(frequency_to_divider(1e12), 1);
    }

    #[test]
    fn set_clocks_packs_dividers() {
        let ctx = DeviceContext::simulated(0);
        let mut clocks = ClockController::new(ctx.clone());
        let req = BTreeMap::from([("CLK1".to_string(), 10), ("PG_CLK".to_string(), 3)]);
        clocks.set_clocks(&req).unwrap();

        let dev = ctx.device();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.wire_value(WIRE_STIM_CLK_DIV), (250 << 20) | (250 << 10) | 10);
        assert_eq!(sim.wire_value(WIRE_PG_CLK_DIV), 3 << 8);
    }

    #[test]
    fn out_of_range_rejects_whole_batch() {
        let ctx = DeviceContext::simulated(0);
        let mut clocks = ClockController::new(ctx.clone());
        let req = BTreeMap::from([("CLK1".to_string(), 5), ("CLK2".to_string(), 2000)]);
        assert!(clocks.set_clocks(&req).is_err());
        assert_eq!(clocks.get("CLK1"), Some(100));
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), 0);
    }
}
