use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use crate::{
    config::DeviceSettings,
    error::{DaqError, Result},
    frontpanel::{FrontPanel, FrontPanelApi, OkError},
    registers::*,
    simulator::SimulatedDevice,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub serial: String,
    pub device_id: String,
    pub board_model: String,
    pub firmware_major: u32,
    pub firmware_minor: u32,
    pub simulated: bool,
}

/// Waveform mode of the VS DAC channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacWaveMode {
    Dc = 0,
    Ac = 1,
    Pulse = 2,
}

pub struct RealDevice {
    fp: FrontPanel,
    bitstream: PathBuf,
    serial: String,
    info: DeviceInfo,
}

impl RealDevice {
    pub fn new(fp: FrontPanel, bitstream: &Path, serial: &str) -> Self {
        Self {
            fp,
            bitstream: bitstream.to_path_buf(),
            serial: serial.to_string(),
            info: DeviceInfo::default(),
        }
    }

    fn initialize(&mut self) -> Result<DeviceInfo> {
        let count = self.fp.device_count();
        if count == 0 {
            return Err(DaqError::DeviceFault("no FrontPanel devices attached".into()));
        }
        for i in 0..count {
            info!("Found device {}: {}", i, self.fp.device_list_serial(i));
        }

        self.fp
            .open_by_serial(&self.serial)
            .map_err(DaqError::front_panel("OpenBySerial"))?;

        let (major, minor) = self.fp.firmware_version();
        self.info = DeviceInfo {
            serial: self.fp.serial_number(),
            device_id: self.fp.device_id(),
            board_model: self.fp.board_model(),
            firmware_major: major,
            firmware_minor: minor,
            simulated: false,
        };
        info!(
            "Opened {} ({}) serial {} firmware {}.{}",
            self.info.board_model, self.info.device_id, self.info.serial, major, minor
        );

        self.fp
            .configure_fpga(&self.bitstream)
            .map_err(DaqError::front_panel("ConfigureFPGA"))?;
        if !self.fp.is_front_panel_enabled() {
            return Err(DaqError::DeviceFault(format!(
                "FrontPanel support is not enabled in {}",
                self.bitstream.display()
            )));
        }
        info!("FPGA configured with {}", self.bitstream.display());

        Ok(self.info.clone())
    }

    fn read_block(&mut self, bank: u8, word_length: usize) -> Result<Vec<u16>> {
        let mut bytes = vec![0u8; word_length * 2];
        let n = match self.fp.read_from_block_pipe_out(bank, PIPE_BLOCK_SIZE, &mut bytes) {
            Ok(n) => n,
            Err(OkError::Timeout) => {
                return Err(DaqError::TransientIo("block pipe read timed out".into()))
            }
            Err(code) => {
                return Err(DaqError::FrontPanel {
                    call: "ReadFromBlockPipeOut",
                    code,
                })
            }
        };
        bytes.truncate(n - n % 2);
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    fn write_wire(&mut self, bank: u8, value: u32, mask: u32) -> Result<()> {
        self.fp
            .set_wire_in_value(bank, value, mask)
            .map_err(DaqError::front_panel("SetWireInValue"))?;
        self.fp
            .update_wire_ins()
            .map_err(DaqError::front_panel("UpdateWireIns"))
    }

    fn read_wire(&mut self, bank: u8, mask: u32) -> Result<u32> {
        self.fp
            .update_wire_outs()
            .map_err(DaqError::front_panel("UpdateWireOuts"))?;
        Ok(self.fp.wire_out_value(bank) & mask)
    }
}

/// The board, either attached over USB or simulated in software.
///
/// Every high-level primitive is written once against the four raw
/// operations (`write_wire`, `read_wire`, `trigger_in`, `write_reg`), so
/// both backends see identical register sequences.
pub enum Device {
    Real(RealDevice),
    Simulated(SimulatedDevice),
}

impl Device {
    pub fn simulated(seed: u64) -> Self {
        Device::Simulated(SimulatedDevice::new(seed))
    }

    /// Probe the vendor SDK and attached boards once, falling back to the
    /// simulated device when either is missing.
    pub fn probe(settings: &DeviceSettings) -> Self {
        if settings.force_simulated {
            info!("Simulated device forced by configuration");
            return Self::simulated(settings.sim_seed);
        }

        let api = match FrontPanelApi::load(settings.sdk_library.as_deref()) {
            Ok(api) => api,
            Err(e) => {
                info!("FrontPanel SDK not available ({}), using simulated device", e);
                return Self::simulated(settings.sim_seed);
            }
        };

        match FrontPanel::construct(Arc::clone(&api)) {
            Ok(fp) if fp.device_count() > 0 => {
                Device::Real(RealDevice::new(fp, &settings.bitstream, &settings.serial))
            }
            Ok(_) => {
                warn!("FrontPanel SDK loaded but no device attached, using simulated device");
                Self::simulated(settings.sim_seed)
            }
            Err(e) => {
                warn!("Unable to construct FrontPanel handle ({:?}), using simulated device", e);
                Self::simulated(settings.sim_seed)
            }
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Device::Simulated(_))
    }

    pub fn as_simulated(&self) -> Option<&SimulatedDevice> {
        match self {
            Device::Simulated(sim) => Some(sim),
            Device::Real(_) => None,
        }
    }

    pub fn as_simulated_mut(&mut self) -> Option<&mut SimulatedDevice> {
        match self {
            Device::Simulated(sim) => Some(sim),
            Device::Real(_) => None,
        }
    }

    pub fn initialize(&mut self) -> Result<DeviceInfo> {
        match self {
            Device::Real(dev) => dev.initialize(),
            Device::Simulated(_) => {
                info!("Simulated CNEAv5 device ready");
                Ok(self.info())
            }
        }
    }

    pub fn info(&self) -> DeviceInfo {
        match self {
            Device::Real(dev) => dev.info.clone(),
            Device::Simulated(_) => DeviceInfo {
                serial: "SIM-0001".into(),
                device_id: "SIM".into(),
                board_model: "Simulated XEM7310".into(),
                firmware_major: 1,
                firmware_minor: 0,
                simulated: true,
            },
        }
    }

    pub fn close(&mut self) {
        if let Device::Real(dev) = self {
            dev.fp.close();
            info!("Device {} closed", dev.info.serial);
        }
    }

    /// Read `word_length` 16-bit words from a block pipe. The result may be
    /// shorter than requested if the transfer came up short.
    pub fn read_block(&mut self, bank: u8, word_length: usize) -> Result<Vec<u16>> {
        match self {
            Device::Real(dev) => dev.read_block(bank, word_length),
            Device::Simulated(sim) => Ok(sim.read_frame(word_length)),
        }
    }

    pub fn write_wire(&mut self, bank: u8, value: u32, mask: u32) -> Result<()> {
        match self {
            Device::Real(dev) => dev.write_wire(bank, value, mask),
            Device::Simulated(sim) => {
                if sim.write_fault() {
                    return Err(DaqError::DeviceFault(format!(
                        "simulated write fault on wire bank {:#04x}",
                        bank
                    )));
                }
                sim.write_wire(bank, value, mask);
                Ok(())
            }
        }
    }

    pub fn read_wire(&mut self, bank: u8, mask: u32) -> Result<u32> {
        match self {
            Device::Real(dev) => dev.read_wire(bank, mask),
            Device::Simulated(sim) => Ok(sim.read_wire(bank, mask)),
        }
    }

    pub fn trigger_in(&mut self, ep: u8, bit: u8) -> Result<()> {
        match self {
            Device::Real(dev) => dev
                .fp
                .activate_trigger_in(ep, bit)
                .map_err(DaqError::front_panel("ActivateTriggerIn")),
            Device::Simulated(sim) => {
                sim.trigger_in(ep, bit);
                Ok(())
            }
        }
    }

    pub fn write_reg(&mut self, addr: u32, data: u32) -> Result<()> {
        match self {
            Device::Real(dev) => dev
                .fp
                .write_register(addr, data)
                .map_err(DaqError::front_panel("WriteRegister")),
            Device::Simulated(sim) => {
                sim.write_reg(addr, data);
                Ok(())
            }
        }
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32> {
        match self {
            Device::Real(dev) => dev
                .fp
                .read_register(addr)
                .map_err(DaqError::front_panel("ReadRegister")),
            Device::Simulated(sim) => Ok(sim.read_reg(addr)),
        }
    }

    /// Hardware settle delay. The simulator has nothing to settle.
    pub fn settle(&self, delay: Duration) {
        if let Device::Real(_) = self {
            thread::sleep(delay);
        }
    }

    pub fn send_reset(&mut self) -> Result<()> {
        self.write_wire(WIRE_CONTROL, 0, CTRL_FIFO_RESET_N)?;
        self.settle(Duration::from_millis(1));
        self.write_wire(WIRE_CONTROL, CTRL_FIFO_RESET_N, CTRL_FIFO_RESET_N)?;
        self.settle(Duration::from_millis(1));
        Ok(())
    }

    /// Program the internal reference and gain registers of all five DACs.
    pub fn dac_init(&mut self) -> Result<()> {
        for sel in DAC_SELECTS {
            self.dac_write(sel, 0x05, 0x000A)?;
            self.dac_write(sel, 0x03, 0x0200)?;
            self.dac_write(sel, 0x04, 0x000F)?;
        }
        Ok(())
    }

    pub fn dac_write(&mut self, sel: u8, addr: u8, data: u16) -> Result<()> {
        let data = data.min(DAC_MAX_WRITE_CODE) as u32;
        self.write_wire(
            WIRE_DAC_SELECT,
            (sel as u32) << DAC_SELECT_SHIFT,
            DAC_SELECT_MASK,
        )?;
        self.write_wire(WIRE_DAC_DATA, 0, DAC_MODE_MASK)?;
        self.write_wire(WIRE_DAC_DATA, ((addr as u32) << 16) | data, DAC_WORD_MASK)?;
        self.trigger_in(TRIGGER_IN, TRIG_DAC_LOAD)
    }

    /// Configure one of the four VS channels as an AC or pulse source.
    pub fn dac_vs_write_ac_pulse(
        &mut self,
        mode: DacWaveMode,
        vs: u8,
        amp_dc_v: f64,
        amp_peak_v: f64,
        freq_hz: f64,
        duty: f64,
    ) -> Result<()> {
        if !(1..=4).contains(&vs) {
            return Err(DaqError::InvalidArgument(format!("VS channel {} out of 1..=4", vs)));
        }
        if freq_hz <= 0.0 {
            return Err(DaqError::InvalidArgument("frequency must be positive".into()));
        }

        let mut counts = (MASTER_CLOCK_HZ / freq_hz).round() as u32;
        let duty_count = (counts as f64 * duty).round() as u32;
        let dc_shift = match mode {
            DacWaveMode::Ac => {
                counts >>= 6;
                amp_dc_v - amp_peak_v
            }
            DacWaveMode::Pulse | DacWaveMode::Dc => amp_dc_v,
        };
        let dc_code = stim_code(dc_shift) as u32;
        let peak_code = stim_code(amp_peak_v) as u32;

        self.write_wire(WIRE_DAC_SELECT, 0x01 << DAC_SELECT_SHIFT, DAC_SELECT_VS_MASK)?;
        self.write_wire(WIRE_DAC_DATA, (mode as u32) << DAC_MODE_SHIFT, DAC_MODE_MASK)?;
        self.write_wire(WIRE_DAC_DATA, ((vs - 1) as u32) << DAC_VS_SHIFT, DAC_VS_MASK)?;
        self.write_wire(WIRE_DAC_AMPLITUDE, (peak_code << 16) | dc_code, u32::MAX)?;
        self.write_wire(WIRE_DAC_PERIOD, counts, u32::MAX)?;
        self.write_wire(WIRE_DAC_DUTY, duty_count, u32::MAX)?;
        self.trigger_in(TRIGGER_IN, TRIG_DAC_LOAD)
    }

    pub fn pcb_config_write(
        &mut self,
        reset: bool,
        reference: u32,
        temp: u32,
        lpf: u32,
        mux: u32,
    ) -> Result<()> {
        if reset {
            self.write_wire(WIRE_PCB_CONFIG, 0, PCB_CONFIG_RESET_N)?;
            self.settle(Duration::from_micros(100));
        }
        self.write_wire(WIRE_PCB_CONFIG, PCB_CONFIG_RESET_N, PCB_CONFIG_RESET_N)?;
        self.settle(Duration::from_micros(100));
        self.write_wire(
            WIRE_PCB_CONFIG,
            (reference << PCB_REF_SHIFT) | temp,
            PCB_REF_TEMP_MASK,
        )?;
        self.write_wire(WIRE_CONFIG_LSB, lpf << LPF_SHIFT, LPF_MASK)?;
        self.write_wire(WIRE_AUX_MUX, mux, AUX_MUX_MASK)?;
        self.trigger_in(TRIGGER_IN, TRIG_PCB_CONFIG)
    }

    pub fn stim_clk_init(&mut self, clk1: u32, clk2: u32, clk3: u32, pg_clk: u32) -> Result<()> {
        self.write_wire(
            WIRE_STIM_CLK_DIV,
            (clk3 << STIM_CLK3_SHIFT) | (clk2 << STIM_CLK2_SHIFT) | clk1,
            STIM_CLK_DIV_MASK,
        )?;
        self.write_wire(WIRE_PG_CLK_DIV, pg_clk << PG_CLK_SHIFT, PG_CLK_MASK)
    }

    fn select_address(&mut self, row: u32, col: u32) -> Result<()> {
        self.write_wire(WIRE_PIXEL_SELECT, col << PIXEL_COL_SHIFT, PIXEL_COL_MASK)?;
        self.write_wire(WIRE_PIXEL_SELECT, row, PIXEL_ROW_MASK)
    }

    /// Walk every column and row with the select-all latch held.
    pub fn pixel_sel_write_all(&mut self, rows: u32, cols: u32) -> Result<()> {
        let step = Duration::from_micros(100);
        self.write_wire(WIRE_PIXEL_SELECT, PIXEL_SELECT_ALL, PIXEL_SELECT_ALL)?;
        for col in 0..cols {
            self.write_wire(WIRE_PIXEL_SELECT, col << PIXEL_COL_SHIFT, PIXEL_COL_MASK)?;
            self.settle(step);
            for row in 0..rows {
                self.write_wire(WIRE_PIXEL_SELECT, row, PIXEL_ROW_MASK)?;
                self.settle(step);
            }
        }
        self.write_wire(WIRE_PIXEL_SELECT, 0, PIXEL_SELECT_ALL)
    }

    pub fn pixel_sel_write_single(&mut self, row: u32, col: u32) -> Result<()> {
        self.select_address(row, col)
    }

    /// Address and latch each `(row, col)` in turn.
    pub fn pixel_sel_write_multiple(&mut self, pixels: &[(u32, u32)]) -> Result<()> {
        let step = Duration::from_micros(100);
        for &(row, col) in pixels {
            self.select_address(row, col)?;
            self.settle(step);
            self.write_wire(WIRE_PIXEL_SELECT, PIXEL_SELECT_ALL, PIXEL_SELECT_ALL)?;
            self.settle(step);
            self.write_wire(WIRE_PIXEL_SELECT, 0, PIXEL_SELECT_ALL)?;
            self.settle(step);
        }
        Ok(())
    }

    /// Shift a configuration word into the array's config register.
    pub fn config_data_write(&mut self, lsb: u32, msb: u32) -> Result<()> {
        self.write_wire(WIRE_PIXEL_SELECT, 0, PIXEL_SELECT_ALL)?;
        self.write_wire(WIRE_CONTROL, CTRL_SPI_WRITE_ALL, CTRL_SPI_WRITE_ALL)?;
        self.write_wire(WIRE_CONFIG_MSB, msb, u32::MAX)?;
        self.write_wire(WIRE_CONFIG_LSB, lsb, CONFIG_LSB_MASK)?;
        self.write_wire(WIRE_PIXEL_SELECT, 0, PIXEL_CONFIG_LATCH)?;
        self.write_wire(WIRE_PIXEL_SELECT, PIXEL_CONFIG_LATCH, PIXEL_CONFIG_LATCH)?;
        self.settle(Duration::from_millis(10));
        self.write_wire(WIRE_PIXEL_SELECT, 0, PIXEL_CONFIG_LATCH)
    }

    pub fn enable_array_config(&mut self, enable: bool) -> Result<()> {
        let value = if enable { CTRL_ARRAY_CONFIG_EN } else { 0 };
        self.write_wire(WIRE_CONTROL, value, CTRL_ARRAY_CONFIG_EN)
    }

    pub fn config_reset(&mut self, reset: bool) -> Result<()> {
        if reset {
            self.write_wire(WIRE_CONTROL, 0, CTRL_CONFIG_RESET_N)?;
            self.settle(Duration::from_millis(1));
        }
        self.write_wire(WIRE_CONTROL, CTRL_CONFIG_RESET_N, CTRL_CONFIG_RESET_N)?;
        self.settle(Duration::from_millis(1));
        Ok(())
    }

    pub fn vdd_shutdown(&mut self, shutdown: bool) -> Result<()> {
        let value = if shutdown { 0 } else { CTRL_VDD_SHDN_N };
        self.write_wire(WIRE_CONTROL, value, CTRL_VDD_SHDN_N)
    }

    pub fn ao_shutdown(&mut self, shutdown: bool) -> Result<()> {
        let value = if shutdown { 0 } else { CTRL_AO_SHDN_N };
        self.write_wire(WIRE_CONTROL, value, CTRL_AO_SHDN_N)
    }

    /// Release the FIFO and DDR3 buffer and start conversion.
    pub fn begin_streaming(&mut self) -> Result<()> {
        let settle = Duration::from_millis(5);
        self.write_wire(WIRE_DDR3, 0, DDR3_RESET)?;
        self.write_wire(WIRE_CONTROL, CTRL_FIFO_RESET_N, CTRL_FIFO_RESET_N)?;
        self.write_wire(WIRE_STREAM, STREAM_BYPASS_READ_CLK, STREAM_BYPASS_READ_CLK)?;
        self.settle(settle);
        self.write_wire(WIRE_DDR3, DDR3_WRITE_EN, DDR3_WRITE_EN)?;
        self.settle(settle);
        self.write_wire(WIRE_CONTROL, CTRL_START_CONV, CTRL_START_CONV)?;
        self.write_wire(WIRE_DDR3, DDR3_READ_EN, DDR3_READ_EN)
    }

    pub fn end_streaming(&mut self) -> Result<()> {
        self.write_wire(WIRE_CONTROL, 0, CTRL_FIFO_RESET_N)?;
        self.settle(Duration::from_millis(5));
        self.write_wire(WIRE_CONTROL, 0, CTRL_START_CONV)?;
        self.write_wire(WIRE_STREAM, 0, STREAM_BYPASS_READ_CLK)?;
        self.write_wire(WIRE_DDR3, DDR3_RESET, DDR3_RESET)
    }
}

/// Stimulation voltage to a 16-bit code over the 0..5 V span.
pub fn stim_code(volts: f64) -> u16 {
    (65535.0 * volts / STIM_DAC_SPAN_V).round().clamp(0.0, 65535.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::DeviceOp;

    fn wires(dev: &Device) -> Vec<DeviceOp> {
        dev.as_simulated().unwrap().recent_ops().copied().collect()
    }

    #[test]
    fn dac_write_sequence_and_clamp() {
        let mut dev = Device::simulated(0);
        dev.dac_write(0x04, 0x0A, 60000).unwrap();
        assert_eq!(
            wires(&dev),
            vec![
                DeviceOp::Wire { bank: 0x0F, value: 0x0400_0000, mask: 0x1F00_0000 },
                DeviceOp::Wire { bank: 0x01, value: 0, mask: 0x1800_0000 },
                DeviceOp::Wire { bank: 0x01, value: (0x0A << 16) | 47186, mask: 0x00FF_FFFF },
                DeviceOp::Trigger { ep: 0x40, bit: 0 },
            ]
        );
    }

    #[test]
    fn streaming_sequences() {
        let mut dev = Device::simulated(0);
        dev.begin_streaming().unwrap();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.read_wire(0x0D, 0x07), 0x03);
        assert_eq!(sim.read_wire(0x00, 0x0001_0001), 0x0001_0001);
        assert_eq!(sim.read_wire(0x10, 0x0008_0000), 0x0008_0000);

        dev.end_streaming().unwrap();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.read_wire(0x00, 0x0001_0001), 0);
        assert_eq!(sim.read_wire(0x10, 0x0008_0000), 0);
        assert_eq!(sim.read_wire(0x0D, 0x04), 0x04);
    }

    #[test]
    fn ac_mode_shifts_counts_and_dc_offset() {
        let mut dev = Device::simulated(0);
        dev.dac_vs_write_ac_pulse(DacWaveMode::Ac, 2, 1.5, 0.5, 1000.0, 0.5)
            .unwrap();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.wire_value(0x03), 200_000 >> 6);
        assert_eq!(sim.wire_value(0x04), 100_000);
        assert_eq!(sim.read_wire(0x01, 0xE000_0000), 1 << 29);
        assert_eq!(sim.read_wire(0x01, 0x1800_0000), 1 << 27);
        let amp = sim.wire_value(0x02);
        assert_eq!(amp & 0xFFFF, stim_code(1.0) as u32);
        assert_eq!(amp >> 16, stim_code(0.5) as u32);
    }

    #[test]
    fn pixel_select_all_walks_every_address() {
        let mut dev = Device::simulated(0);
        dev.pixel_sel_write_all(64, 64).unwrap();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.op_count(), 2 + 64 * 65);
        assert_eq!(sim.read_wire(0x07, PIXEL_SELECT_ALL), 0);
    }

    #[test]
    fn shutdown_bits_are_active_low() {
        let mut dev = Device::simulated(0);
        dev.vdd_shutdown(false).unwrap();
        dev.ao_shutdown(true).unwrap();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.read_wire(0x00, 0x180), 0x80);
    }
}
