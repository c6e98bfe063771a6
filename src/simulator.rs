//! Software stand-in for the CNEAv5 board.
//!
//! Produces frames with the statistics of the real array (12-bit ADC codes
//! around a fixed baseline, Gaussian noise, 60 Hz pickup and a handful of
//! negative-going spikes) and keeps a shadow of every wire, trigger and
//! register write so controller sequences can be inspected.

use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::{HashMap, VecDeque};

pub const CHANNELS: usize = 4096;
pub const SAMPLES_PER_FRAME: usize = 512;
pub const SAMPLE_RATE_HZ: f64 = 10_000.0;
pub const ADC_FULL_SCALE: f64 = 4095.0;
pub const BASELINE: f64 = 2360.0;
pub const NOISE_STD: f64 = 5.0;
pub const LINE_FREQ_HZ: f64 = 60.0;
pub const LINE_AMPLITUDE: f64 = 3.0;
pub const SPIKE_FRACTION: f64 = 0.005;

const WIRE_BANKS: usize = 0x20;
const OP_LOG_CAPACITY: usize = 8192;

/// One write issued to the device, in issue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceOp {
    Wire { bank: u8, value: u32, mask: u32 },
    Trigger { ep: u8, bit: u8 },
    Register { addr: u32, data: u32 },
}

#[derive(Clone, Copy)]
struct Spike {
    position: f64,
    width: f64,
    amplitude: f64,
}

pub struct SimulatedDevice {
    rng: StdRng,
    phase: f64,
    frames: u64,
    wires: [u32; WIRE_BANKS],
    registers: HashMap<u32, u32>,
    ops: VecDeque<DeviceOp>,
    op_count: u64,
    write_fault: bool,
}

impl SimulatedDevice {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            phase: 0.0,
            frames: 0,
            wires: [0; WIRE_BANKS],
            registers: HashMap::new(),
            ops: VecDeque::with_capacity(OP_LOG_CAPACITY),
            op_count: 0,
            write_fault: false,
        }
    }

    fn record(&mut self, op: DeviceOp) {
        if self.ops.len() == OP_LOG_CAPACITY {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
        self.op_count += 1;
    }

    pub fn write_wire(&mut self, bank: u8, value: u32, mask: u32) {
        if let Some(slot) = self.wires.get_mut(bank as usize) {
            *slot = (*slot & !mask) | (value & mask);
        }
        self.record(DeviceOp::Wire { bank, value, mask });
    }

    pub fn read_wire(&self, bank: u8, mask: u32) -> u32 {
        self.wires.get(bank as usize).copied().unwrap_or(0) & mask
    }

    pub fn trigger_in(&mut self, ep: u8, bit: u8) {
        self.record(DeviceOp::Trigger { ep, bit });
    }

    pub fn write_reg(&mut self, addr: u32, data: u32) {
        self.registers.insert(addr, data);
        self.record(DeviceOp::Register { addr, data });
    }

    pub fn read_reg(&self, addr: u32) -> u32 {
        self.registers.get(&addr).copied().unwrap_or(0)
    }

    /// Current shadow value of a wire-in bank.
    pub fn wire_value(&self, bank: u8) -> u32 {
        self.read_wire(bank, u32::MAX)
    }

    /// Total number of writes, triggers and register writes issued so far.
    pub fn op_count(&self) -> u64 {
        self.op_count
    }

    /// The most recent operations, oldest first.
    pub fn recent_ops(&self) -> impl Iterator<Item = &DeviceOp> {
        self.ops.iter()
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// While set, wire writes through [`crate::Device`] fail with a
    /// device fault and leave the shadow banks untouched.
    pub fn set_write_fault(&mut self, fault: bool) {
        self.write_fault = fault;
    }

    pub fn write_fault(&self) -> bool {
        self.write_fault
    }

    pub fn frames_generated(&self) -> u64 {
        self.frames
    }

    /// Generate one frame laid out sample-major (all channels of sample 0,
    /// then all channels of sample 1, ...), truncated or zero-padded to
    /// `word_length`.
    pub fn read_frame(&mut self, word_length: usize) -> Vec<u16> {
        let dt = 1.0 / SAMPLE_RATE_HZ;
        let n_spiking = ((CHANNELS as f64 * SPIKE_FRACTION) as usize).max(1);

        let mut spikes: Vec<Option<Spike>> = vec![None; CHANNELS];
        for ch in index::sample(&mut self.rng, CHANNELS, n_spiking) {
            spikes[ch] = Some(Spike {
                position: self.rng.random_range(20..SAMPLES_PER_FRAME - 20) as f64,
                width: self.rng.random_range(5..15) as f64,
                amplitude: self.rng.random_range(30.0..120.0),
            });
        }

        let produced = word_length.min(CHANNELS * SAMPLES_PER_FRAME);
        let mut words = Vec::with_capacity(word_length);
        'samples: for s in 0..SAMPLES_PER_FRAME {
            let t = self.phase + s as f64 * dt;
            let line = LINE_AMPLITUDE * (2.0 * std::f64::consts::PI * LINE_FREQ_HZ * t).sin();
            for spike in spikes.iter() {
                if words.len() == produced {
                    break 'samples;
                }
                let noise: f64 = self.rng.sample(StandardNormal);
                let mut v = BASELINE + NOISE_STD * noise + line;
                if let Some(sp) = spike {
                    let x = (s as f64 - sp.position) / sp.width;
                    v -= sp.amplitude * (-0.5 * x * x).exp();
                }
                words.push(v.clamp(0.0, ADC_FULL_SCALE) as u16);
            }
        }
        words.resize(word_length, 0);

        self.phase += SAMPLES_PER_FRAME as f64 * dt;
        self.frames += 1;
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_requested_length_and_valid_codes() {
        let mut sim = SimulatedDevice::new(42);
        let words = sim.read_frame(CHANNELS * 4);
        assert_eq!(words.len(), CHANNELS * 4);
        assert!(words.iter().all(|&w| w as f64 <= ADC_FULL_SCALE));

        let mean = words.iter().map(|&w| w as f64).sum::<f64>() / words.len() as f64;
        assert!((mean - BASELINE).abs() < 10.0, "mean {mean}");
    }

    #[test]
    fn short_request_is_padded_with_zeros() {
        let mut sim = SimulatedDevice::new(1);
        let n = CHANNELS * SAMPLES_PER_FRAME + 10;
        let words = sim.read_frame(n);
        assert_eq!(words.len(), n);
        assert!(words[n - 10..].iter().all(|&w| w == 0));
    }

    #[test]
    fn same_seed_gives_same_frames() {
        let mut a = SimulatedDevice::new(7);
        let mut b = SimulatedDevice::new(7);
        assert_eq!(a.read_frame(1000), b.read_frame(1000));
        assert_eq!(a.read_frame(1000), b.read_frame(1000));
        assert_eq!(a.frames_generated(), 2);
    }

    #[test]
    fn wire_shadow_applies_mask() {
        let mut sim = SimulatedDevice::new(0);
        sim.write_wire(0x07, 0xFFFF_FFFF, 0x3F);
        sim.write_wire(0x07, 0, 0x01);
        assert_eq!(sim.wire_value(0x07), 0x3E);
        assert_eq!(sim.read_wire(0x07, 0x0F), 0x0E);
        assert_eq!(sim.op_count(), 2);
        assert_eq!(
            sim.recent_ops().last(),
            Some(&DeviceOp::Wire { bank: 0x07, value: 0, mask: 0x01 })
        );
    }
}
