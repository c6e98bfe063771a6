//! Runtime binding to the Opal Kelly FrontPanel C library.
//!
//! The library is loaded with `libloading` rather than linked at build time so
//! that the crate builds and runs on machines without the vendor SDK; in that
//! case [`FrontPanelApi::load`] fails and the caller falls back to the
//! simulated device.

use libc::{c_char, c_int, c_long, c_uint, c_void};
use libloading::Library;
use std::{
    ffi::{CStr, CString},
    path::Path,
    sync::Arc,
};

type Handle = *mut c_void;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug)]
pub enum OkError {
    NoError = 0,
    Failed = -1,
    Timeout = -2,
    DoneNotHigh = -3,
    TransferError = -4,
    CommunicationError = -5,
    InvalidBitstream = -6,
    FileError = -7,
    DeviceNotOpen = -8,
    InvalidEndpoint = -9,
    InvalidBlockSize = -10,
    I2CRestrictedAddress = -11,
    I2CBitError = -12,
    I2CNack = -13,
    I2CUnknownStatus = -14,
    UnsupportedFeature = -15,
    FIFOUnderflow = -16,
    FIFOOverflow = -17,
    DataAlignmentError = -18,
    InvalidResetProfile = -19,
    InvalidParameter = -20,
    Unknown = 1,
}

impl From<i32> for OkError {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::NoError,
            -1 => Self::Failed,
            -2 => Self::Timeout,
            -3 => Self::DoneNotHigh,
            -4 => Self::TransferError,
            -5 => Self::CommunicationError,
            -6 => Self::InvalidBitstream,
            -7 => Self::FileError,
            -8 => Self::DeviceNotOpen,
            -9 => Self::InvalidEndpoint,
            -10 => Self::InvalidBlockSize,
            -11 => Self::I2CRestrictedAddress,
            -12 => Self::I2CBitError,
            -13 => Self::I2CNack,
            -14 => Self::I2CUnknownStatus,
            -15 => Self::UnsupportedFeature,
            -16 => Self::FIFOUnderflow,
            -17 => Self::FIFOOverflow,
            -18 => Self::DataAlignmentError,
            -19 => Self::InvalidResetProfile,
            -20 => Self::InvalidParameter,
            _ => Self::Unknown,
        }
    }
}

fn check(res: c_int) -> Result<(), OkError> {
    let res = OkError::from(res);
    match res {
        OkError::NoError => Ok(()),
        _ => Err(res),
    }
}

/// Function table resolved from the shared library.
///
/// The raw function pointers stay valid for as long as `_library` is alive,
/// which is the lifetime of this struct.
pub struct FrontPanelApi {
    construct: unsafe extern "C" fn() -> Handle,
    destruct: unsafe extern "C" fn(Handle),
    get_device_count: unsafe extern "C" fn(Handle) -> c_int,
    get_device_list_serial: unsafe extern "C" fn(Handle, c_int, *mut c_char),
    open_by_serial: unsafe extern "C" fn(Handle, *const c_char) -> c_int,
    close: unsafe extern "C" fn(Handle),
    configure_fpga: unsafe extern "C" fn(Handle, *const c_char) -> c_int,
    is_front_panel_enabled: unsafe extern "C" fn(Handle) -> c_int,
    get_serial_number: unsafe extern "C" fn(Handle, *mut c_char),
    get_device_id: unsafe extern "C" fn(Handle, *mut c_char),
    get_device_major_version: unsafe extern "C" fn(Handle) -> c_int,
    get_device_minor_version: unsafe extern "C" fn(Handle) -> c_int,
    get_board_model: unsafe extern "C" fn(Handle) -> c_int,
    get_board_model_string: unsafe extern "C" fn(Handle, c_int, *mut c_char),
    set_wire_in_value: unsafe extern "C" fn(Handle, c_int, c_uint, c_uint) -> c_int,
    update_wire_ins: unsafe extern "C" fn(Handle) -> c_int,
    update_wire_outs: unsafe extern "C" fn(Handle) -> c_int,
    get_wire_out_value: unsafe extern "C" fn(Handle, c_int) -> c_uint,
    activate_trigger_in: unsafe extern "C" fn(Handle, c_int, c_int) -> c_int,
    read_from_block_pipe_out: unsafe extern "C" fn(Handle, c_int, c_int, c_long, *mut u8) -> c_long,
    write_register: unsafe extern "C" fn(Handle, c_uint, c_uint) -> c_int,
    read_register: unsafe extern "C" fn(Handle, c_uint, *mut c_uint) -> c_int,
    _library: Library,
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, libloading::Error> {
    let name = format!("{name}\0");
    let sym = unsafe { library.get::<T>(name.as_bytes()) }?;
    Ok(*sym)
}

impl FrontPanelApi {
    /// Load the FrontPanel library from `path`, or from the platform's default
    /// search path when `None`.
    pub fn load(path: Option<&Path>) -> Result<Arc<Self>, libloading::Error> {
        let library = match path {
            Some(p) => unsafe { Library::new(p) }?,
            None => unsafe { Library::new(libloading::library_filename("okFrontPanel")) }?,
        };

        let api = Self {
            construct: symbol(&library, "okFrontPanel_Construct")?,
            destruct: symbol(&library, "okFrontPanel_Destruct")?,
            get_device_count: symbol(&library, "okFrontPanel_GetDeviceCount")?,
            get_device_list_serial: symbol(&library, "okFrontPanel_GetDeviceListSerial")?,
            open_by_serial: symbol(&library, "okFrontPanel_OpenBySerial")?,
            close: symbol(&library, "okFrontPanel_Close")?,
            configure_fpga: symbol(&library, "okFrontPanel_ConfigureFPGA")?,
            is_front_panel_enabled: symbol(&library, "okFrontPanel_IsFrontPanelEnabled")?,
            get_serial_number: symbol(&library, "okFrontPanel_GetSerialNumber")?,
            get_device_id: symbol(&library, "okFrontPanel_GetDeviceID")?,
            get_device_major_version: symbol(&library, "okFrontPanel_GetDeviceMajorVersion")?,
            get_device_minor_version: symbol(&library, "okFrontPanel_GetDeviceMinorVersion")?,
            get_board_model: symbol(&library, "okFrontPanel_GetBoardModel")?,
            get_board_model_string: symbol(&library, "okFrontPanel_GetBoardModelString")?,
            set_wire_in_value: symbol(&library, "okFrontPanel_SetWireInValue")?,
            update_wire_ins: symbol(&library, "okFrontPanel_UpdateWireIns")?,
            update_wire_outs: symbol(&library, "okFrontPanel_UpdateWireOuts")?,
            get_wire_out_value: symbol(&library, "okFrontPanel_GetWireOutValue")?,
            activate_trigger_in: symbol(&library, "okFrontPanel_ActivateTriggerIn")?,
            read_from_block_pipe_out: symbol(&library, "okFrontPanel_ReadFromBlockPipeOut")?,
            write_register: symbol(&library, "okFrontPanel_WriteRegister")?,
            read_register: symbol(&library, "okFrontPanel_ReadRegister")?,
            _library: library,
        };

        Ok(Arc::new(api))
    }
}

/// An `okCFrontPanel` instance.
pub struct FrontPanel {
    api: Arc<FrontPanelApi>,
    handle: Handle,
}

// The handle is only ever used behind the device mutex.
unsafe impl Send for FrontPanel {}

fn buffer_to_string(mut buffer: Vec<u8>) -> String {
    buffer.retain(|&b| b != 0);
    String::from_utf8_lossy(&buffer).into_owned()
}

impl FrontPanel {
    pub fn construct(api: Arc<FrontPanelApi>) -> Result<Self, OkError> {
        let handle = unsafe { (api.construct)() };
        if handle.is_null() {
            return Err(OkError::Failed);
        }
        Ok(Self { api, handle })
    }

    pub fn device_count(&self) -> usize {
        let n = unsafe { (self.api.get_device_count)(self.handle) };
        n.max(0) as usize
    }

    pub fn device_list_serial(&self, index: usize) -> String {
        let mut buffer = vec![0u8; 64];
        unsafe {
            (self.api.get_device_list_serial)(
                self.handle,
                index as c_int,
                buffer.as_mut_ptr() as *mut c_char,
            )
        };
        buffer_to_string(buffer)
    }

    pub fn open_by_serial(&mut self, serial: &str) -> Result<(), OkError> {
        let serial = CString::new(serial).map_err(|_| OkError::InvalidParameter)?;
        check(unsafe { (self.api.open_by_serial)(self.handle, serial.as_ptr()) })
    }

    pub fn close(&mut self) {
        unsafe { (self.api.close)(self.handle) };
    }

    pub fn configure_fpga(&mut self, bitstream: &Path) -> Result<(), OkError> {
        let path = bitstream.to_str().ok_or(OkError::FileError)?;
        let path = CString::new(path).map_err(|_| OkError::FileError)?;
        check(unsafe { (self.api.configure_fpga)(self.handle, path.as_ptr()) })
    }

    pub fn is_front_panel_enabled(&self) -> bool {
        unsafe { (self.api.is_front_panel_enabled)(self.handle) != 0 }
    }

    pub fn serial_number(&self) -> String {
        let mut buffer = vec![0u8; 64];
        unsafe { (self.api.get_serial_number)(self.handle, buffer.as_mut_ptr() as *mut c_char) };
        buffer_to_string(buffer)
    }

    pub fn device_id(&self) -> String {
        let mut buffer = vec![0u8; 64];
        unsafe { (self.api.get_device_id)(self.handle, buffer.as_mut_ptr() as *mut c_char) };
        buffer_to_string(buffer)
    }

    pub fn firmware_version(&self) -> (u32, u32) {
        let major = unsafe { (self.api.get_device_major_version)(self.handle) };
        let minor = unsafe { (self.api.get_device_minor_version)(self.handle) };
        (major.max(0) as u32, minor.max(0) as u32)
    }

    pub fn board_model(&self) -> String {
        let mut buffer = vec![0u8; 128];
        unsafe {
            let model = (self.api.get_board_model)(self.handle);
            (self.api.get_board_model_string)(
                self.handle,
                model,
                buffer.as_mut_ptr() as *mut c_char,
            );
        }
        CStr::from_bytes_until_nul(&buffer)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn set_wire_in_value(&mut self, ep: u8, value: u32, mask: u32) -> Result<(), OkError> {
        check(unsafe { (self.api.set_wire_in_value)(self.handle, ep as c_int, value, mask) })
    }

    pub fn update_wire_ins(&mut self) -> Result<(), OkError> {
        check(unsafe { (self.api.update_wire_ins)(self.handle) })
    }

    pub fn update_wire_outs(&mut self) -> Result<(), OkError> {
        check(unsafe { (self.api.update_wire_outs)(self.handle) })
    }

    pub fn wire_out_value(&self, ep: u8) -> u32 {
        unsafe { (self.api.get_wire_out_value)(self.handle, ep as c_int) }
    }

    pub fn activate_trigger_in(&mut self, ep: u8, bit: u8) -> Result<(), OkError> {
        check(unsafe { (self.api.activate_trigger_in)(self.handle, ep as c_int, bit as c_int) })
    }

    /// Fill `data` from a block-throttled pipe. Returns the number of bytes
    /// actually transferred.
    pub fn read_from_block_pipe_out(
        &mut self,
        ep: u8,
        block_size: usize,
        data: &mut [u8],
    ) -> Result<usize, OkError> {
        let res = unsafe {
            (self.api.read_from_block_pipe_out)(
                self.handle,
                ep as c_int,
                block_size as c_int,
                data.len() as c_long,
                data.as_mut_ptr(),
            )
        };
        if res < 0 {
            return Err(OkError::from(res as i32));
        }
        Ok(res as usize)
    }

    pub fn write_register(&mut self, addr: u32, data: u32) -> Result<(), OkError> {
        check(unsafe { (self.api.write_register)(self.handle, addr, data) })
    }

    pub fn read_register(&mut self, addr: u32) -> Result<u32, OkError> {
        let mut value: c_uint = 0;
        check(unsafe { (self.api.read_register)(self.handle, addr, &mut value) })?;
        Ok(value)
    }
}

impl Drop for FrontPanel {
    fn drop(&mut self) {
        unsafe { (self.api.destruct)(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_known_values() {
        assert_eq!(OkError::from(0), OkError::NoError);
        assert_eq!(OkError::from(-8), OkError::DeviceNotOpen);
        assert_eq!(OkError::from(-20), OkError::InvalidParameter);
        assert_eq!(OkError::from(-99), OkError::Unknown);
        assert!(check(0).is_ok());
        assert_eq!(check(-2), Err(OkError::Timeout));
    }

    #[test]
    fn missing_library_fails_to_load() {
        let res = FrontPanelApi::load(Some(Path::new("/nonexistent/libokFrontPanel.so")));
        assert!(res.is_err());
    }
}
