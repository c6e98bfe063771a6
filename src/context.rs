use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::{config::DeviceSettings, device::Device, safety::HardwareSafetyGuard};

/// Shared handles to the one device and the one safety guard.
///
/// Every controller and the acquisition worker hold a clone; the device
/// mutex serializes register sequences so they never interleave.
#[derive(Clone)]
pub struct DeviceContext {
    device: Arc<Mutex<Device>>,
    safety: Arc<Mutex<HardwareSafetyGuard>>,
}

impl DeviceContext {
    pub fn new(device: Device) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            safety: Arc::new(Mutex::new(HardwareSafetyGuard::new())),
        }
    }

    pub fn probe(settings: &DeviceSettings) -> Self {
        Self::new(Device::probe(settings))
    }

    pub fn simulated(seed: u64) -> Self {
        Self::new(Device::simulated(seed))
    }

    pub fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock()
    }

    pub fn safety(&self) -> MutexGuard<'_, HardwareSafetyGuard> {
        self.safety.lock()
    }

    pub fn is_simulated(&self) -> bool {
        self.device.lock().is_simulated()
    }
}
