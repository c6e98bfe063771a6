use log::{error, info};

use crate::{
    bias::{BiasController, BiasEntry},
    clock::{ClockController, ClockEntry},
    context::DeviceContext,
    device::DeviceInfo,
    error::Result,
    pixel::{GainMode, PixelController},
    stim::{StimController, StimStatus},
};

/// Settings shifted into the PCB configuration register that drives the
/// transimpedance amplifiers and auxiliary mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiaConfig {
    pub ref_data: u32,
    pub temp_data: u32,
    pub lpf_data: u32,
    pub mux_data: u32,
    pub reset: bool,
}

impl TiaConfig {
    /// Register contents that park the TIAs on shutdown.
    pub fn parked() -> Self {
        Self {
            ref_data: 0,
            temp_data: 0,
            lpf_data: 0xFFFFF,
            mux_data: 0,
            reset: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub info: DeviceInfo,
    pub simulated: bool,
    pub bias: Vec<BiasEntry>,
    pub clocks: Vec<ClockEntry>,
    pub gain_mode: GainMode,
    pub selected_pixels: usize,
    pub stimulation: StimStatus,
}

/// The four hardware controllers over one shared device context.
pub struct HardwareControl {
    ctx: DeviceContext,
    pub bias: BiasController,
    pub clock: ClockController,
    pub pixel: PixelController,
    pub stim: StimController,
}

impl HardwareControl {
    pub fn new(ctx: DeviceContext) -> Self {
        Self {
            bias: BiasController::new(ctx.clone()),
            clock: ClockController::new(ctx.clone()),
            pixel: PixelController::new(ctx.clone()),
            stim: StimController::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Open the device and bring the DACs to a known state. A failure here
    /// leaves the controllers usable in a degraded state and returns `false`.
    pub fn startup(&mut self) -> bool {
        let mut dev = self.ctx.device();
        let res = dev
            .initialize()
            .and_then(|_| dev.send_reset())
            .and_then(|_| dev.dac_init());
        match res {
            Ok(()) => {
                let info = dev.info();
                info!(
                    "Hardware ready: {} serial {}{}",
                    info.board_model,
                    info.serial,
                    if info.simulated { " (simulated)" } else { "" }
                );
                drop(dev);
                self.ctx.safety().log_limits();
                true
            }
            Err(e) => {
                error!("Hardware startup failed, continuing degraded: {}", e);
                false
            }
        }
    }

    pub fn configure_tia(&mut self, config: TiaConfig) -> Result<()> {
        self.ctx.device().pcb_config_write(
            config.reset,
            config.ref_data,
            config.temp_data,
            config.lpf_data,
            config.mux_data,
        )?;
        info!("TIA configured: {:?}", config);
        Ok(())
    }

    /// Power down the analog front end and close the device. Errors are
    /// logged and the remaining steps still run.
    pub fn shutdown(&mut self) {
        if self.stim.status().is_active {
            if let Err(e) = self.stim.stop_stimulation() {
                error!("Failed to stop stimulation on shutdown: {}", e);
            }
        }
        let mut dev = self.ctx.device();
        if let Err(e) = dev.vdd_shutdown(true) {
            error!("VDD shutdown failed: {}", e);
        }
        let parked = TiaConfig::parked();
        if let Err(e) = dev.pcb_config_write(
            parked.reset,
            parked.ref_data,
            parked.temp_data,
            parked.lpf_data,
            parked.mux_data,
        ) {
            error!("TIA reset failed: {}", e);
        }
        dev.close();
        info!("Hardware shut down");
    }

    pub fn device_report(&self) -> DeviceReport {
        let (info, simulated) = {
            let dev = self.ctx.device();
            (dev.info(), dev.is_simulated())
        };
        DeviceReport {
            info,
            simulated,
            bias: self.bias.get_all(),
            clocks: self.clock.get_all(),
            gain_mode: self.pixel.gain_mode(),
            selected_pixels: self.pixel.selected().len(),
            stimulation: self.stim.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{
        CTRL_VDD_SHDN_N, WIRE_AUX_MUX, WIRE_CONFIG_LSB, WIRE_CONTROL, WIRE_PCB_CONFIG,
    };

    #[test]
    fn startup_initialises_dacs() {
        let ctx = DeviceContext::simulated(0);
        let mut hw = HardwareControl::new(ctx.clone());
        assert!(hw.startup());
        // reset (2 writes) + 5 chips x 3 registers x 4 ops
        assert_eq!(ctx.device().as_simulated().unwrap().op_count(), 2 + 60);
        assert!(hw.device_report().simulated);
    }

    #[test]
    fn tia_config_lands_in_pcb_register() {
        let ctx = DeviceContext::simulated(0);
        let mut hw = HardwareControl::new(ctx.clone());
        hw.configure_tia(TiaConfig {
            ref_data: 0x12,
            temp_data: 0x05,
            lpf_data: 0x3,
            mux_data: 0x1AB,
            reset: false,
        })
        .unwrap();
        let dev = ctx.device();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.read_wire(WIRE_PCB_CONFIG, 0xFFFF), (0x12 << 6) | 0x05);
        assert_eq!(sim.read_wire(WIRE_PCB_CONFIG, 0x8000_0000), 0x8000_0000);
        assert_eq!(sim.wire_value(WIRE_AUX_MUX), 0x1AB);
    }

    #[test]
    fn shutdown_powers_down_vdd() {
        let ctx = DeviceContext::simulated(0);
        let mut hw = HardwareControl::new(ctx.clone());
        ctx.device().vdd_shutdown(false).unwrap();
        hw.shutdown();
        let dev = ctx.device();
        let sim = dev.as_simulated().unwrap();
        assert_eq!(sim.read_wire(WIRE_CONTROL, CTRL_VDD_SHDN_N), 0);
        assert_eq!(sim.read_wire(WIRE_CONFIG_LSB, 0xFFFF_F000), 0xFFFF_F000);
    }
}
