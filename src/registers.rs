//! FPGA endpoint map of the CNEAv5 bitstream.
//!
//! Wire-in banks are addressed `0x00..=0x1F`, trigger-ins start at `0x40` and
//! block pipe-outs at `0xA0`. Every value written to the device goes through
//! one of the banks below with one of these masks.

pub const MASTER_CLOCK_HZ: f64 = 200_000_000.0;

// Bank 0x00: global control.
pub const WIRE_CONTROL: u8 = 0x00;
/// FIFO reset, active low.
pub const CTRL_FIFO_RESET_N: u32 = 1 << 0;
pub const CTRL_ARRAY_CONFIG_EN: u32 = 1 << 1;
pub const CTRL_CONFIG_RESET_N: u32 = 1 << 3;
pub const CTRL_SPI_WRITE_ALL: u32 = 1 << 4;
pub const CTRL_VDD_SHDN_N: u32 = 1 << 7;
pub const CTRL_AO_SHDN_N: u32 = 1 << 8;
pub const CTRL_START_CONV: u32 = 1 << 16;
pub const CTRL_STIM_CLK1_EN: u32 = 1 << 24;
pub const CTRL_STIM_CLK2_EN: u32 = 1 << 25;
pub const CTRL_STIM_CLK3_EN: u32 = 1 << 26;
pub const CTRL_STIM_ALL_EN: u32 = 1 << 27;
pub const CTRL_STIM_CLK_MASK: u32 = 0x0F00_0000;

// Bank 0x01: DAC command word.
pub const WIRE_DAC_DATA: u8 = 0x01;
pub const DAC_WORD_MASK: u32 = 0x00FF_FFFF;
pub const DAC_MODE_SHIFT: u32 = 27;
pub const DAC_MODE_MASK: u32 = 0x1800_0000;
pub const DAC_VS_SHIFT: u32 = 29;
pub const DAC_VS_MASK: u32 = 0xE000_0000;

// Banks 0x02..=0x04: AC/pulse waveform generator.
pub const WIRE_DAC_AMPLITUDE: u8 = 0x02;
pub const WIRE_DAC_PERIOD: u8 = 0x03;
pub const WIRE_DAC_DUTY: u8 = 0x04;

// Bank 0x05: PCB configuration.
pub const WIRE_PCB_CONFIG: u8 = 0x05;
pub const PCB_CONFIG_RESET_N: u32 = 1 << 31;
pub const PCB_REF_SHIFT: u32 = 6;
pub const PCB_REF_TEMP_MASK: u32 = 0xFFFF;

// Bank 0x07: pixel address and config-shift control.
pub const WIRE_PIXEL_SELECT: u8 = 0x07;
pub const PIXEL_ROW_MASK: u32 = 0x3F;
pub const PIXEL_COL_SHIFT: u32 = 6;
pub const PIXEL_COL_MASK: u32 = 0xFC0;
pub const PIXEL_CONFIG_LATCH: u32 = 1 << 12;
pub const PIXEL_SELECT_ALL: u32 = 1 << 13;

// Banks 0x08/0x09: pixel configuration word.
pub const WIRE_CONFIG_MSB: u8 = 0x08;
pub const WIRE_CONFIG_LSB: u8 = 0x09;
pub const CONFIG_LSB_MASK: u32 = 0x3F;
/// The anti-aliasing filter setting shares bank 0x09 with the config LSB.
pub const LPF_SHIFT: u32 = 12;
pub const LPF_MASK: u32 = 0xFFFF_F000;

// Banks 0x0A/0x0B: stimulation clock dividers.
pub const WIRE_STIM_CLK_DIV: u8 = 0x0A;
pub const STIM_CLK2_SHIFT: u32 = 10;
pub const STIM_CLK3_SHIFT: u32 = 20;
pub const STIM_CLK_DIV_MASK: u32 = 0x3FFF_FFFF;
pub const WIRE_PG_CLK_DIV: u8 = 0x0B;
pub const PG_CLK_SHIFT: u32 = 8;
pub const PG_CLK_MASK: u32 = 0xFF00;

// Bank 0x0C: auxiliary analog mux.
pub const WIRE_AUX_MUX: u8 = 0x0C;
pub const AUX_MUX_MASK: u32 = 0x1FF;

// Bank 0x0D: DDR3 buffer and arbitrary-waveform playback.
pub const WIRE_DDR3: u8 = 0x0D;
pub const DDR3_READ_EN: u32 = 1 << 0;
pub const DDR3_WRITE_EN: u32 = 1 << 1;
pub const DDR3_RESET: u32 = 1 << 2;
pub const DDR3_DAC_DC_OUT: u32 = 1 << 3;
pub const DDR3_ARB_RUN: u32 = 1 << 4;
pub const DDR3_ARB_REPEAT: u32 = 1 << 5;
pub const DDR3_REPEAT_COUNT_SHIFT: u32 = 12;
pub const DDR3_REPEAT_COUNT_MASK: u32 = 0xFFFF_F000;

pub const WIRE_ARB_LENGTH: u8 = 0x0E;

// Bank 0x0F: DAC chip select.
pub const WIRE_DAC_SELECT: u8 = 0x0F;
pub const DAC_SELECT_SHIFT: u32 = 24;
pub const DAC_SELECT_MASK: u32 = 0x1F00_0000;
pub const DAC_SELECT_VS_MASK: u32 = 0x0700_0000;

// Bank 0x10: stream clocking.
pub const WIRE_STREAM: u8 = 0x10;
pub const STREAM_BYPASS_READ_CLK: u32 = 0x0008_0000;

pub const WIRE_ARB_CLK_DIV: u8 = 0x11;

pub const TRIGGER_IN: u8 = 0x40;
pub const TRIG_DAC_LOAD: u8 = 0;
pub const TRIG_PCB_CONFIG: u8 = 1;

pub const PIPE_OUT_DDR3: u8 = 0xA2;
pub const PIPE_BLOCK_SIZE: usize = 1024;

/// Chip selects of the five on-board DACs.
pub const DAC_SELECTS: [u8; 5] = [0x01, 0x02, 0x04, 0x08, 0x10];
/// Highest code accepted by `dac_write`; larger codes are clamped.
pub const DAC_MAX_WRITE_CODE: u16 = 47186;
pub const DAC_RESTORE_ADDRESS: u8 = 0x0A;
/// Reference span used when converting stimulation voltages to codes.
pub const STIM_DAC_SPAN_V: f64 = 5.0;
