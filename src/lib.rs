//! Acquisition and control for the 64x64 CNEA electrode array behind an
//! Opal Kelly FrontPanel interface board.

pub mod acquisition;
pub mod bias;
pub mod clock;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod frontpanel;
pub mod hardware;
pub mod pixel;
pub mod processing;
pub mod reader;
pub mod registers;
pub mod ring_buffer;
pub mod safety;
pub mod simulator;
pub mod stim;

pub use acquisition::{AcquisitionService, SessionSummary, StreamStatus};
pub use config::Conf;
pub use context::DeviceContext;
pub use device::{Device, DeviceInfo};
pub use error::{DaqError, Result};
pub use hardware::{HardwareControl, TiaConfig};
pub use reader::{BlockNotice, NotificationSink, ReaderStats};
pub use ring_buffer::{RingBuffer, RingBufferStats};
pub use safety::{HardwareSafetyGuard, SafetyLimits, SafetyRule, SafetyViolation};
