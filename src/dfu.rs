//! USB Device Firmware Upgrade protocol
//!
//! This module holds the DFU state and status definitions, the [`DfuTransport`] interface the
//! flash orchestrator drives, and a DfuSe implementation of it for USB devices.

pub mod memory;
mod usb;

use std::convert::TryFrom;
use std::io::Read;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::TryFromPrimitive;

pub use memory::{MemoryLayout, Segment};
pub use usb::UsbDevice;

use crate::TransportError;

/// Interface class of DFU interfaces (application specific)
pub const DFU_INTERFACE_CLASS: u8 = 0xfe;
/// Interface subclass of DFU interfaces
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;

/// Number of bytes sent per download request
pub const DEFAULT_TRANSFER_SIZE: usize = 2048;

/// Device states as reported by DFU_GETSTATUS
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DnloadSync = 3,
    DnBusy = 4,
    DnloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    DfuError = 10,
}

/// Status codes as reported by DFU_GETSTATUS
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum DfuStatusCode {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0a,
    ErrVendor = 0x0b,
    ErrUsbReset = 0x0c,
    ErrPowerOnReset = 0x0d,
    ErrUnknown = 0x0e,
    ErrStalledPkt = 0x0f,
}

/// The response to a DFU_GETSTATUS request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// How long the host should wait before the next status request
    pub poll_timeout: Duration,
    pub state: DfuState,
    /// Index of a string descriptor describing the status
    pub string_index: u8,
}

impl DfuStatus {
    /// Parses the 6-byte status response
    pub fn from_reader<R: Read>(mut reader: R) -> Result<DfuStatus, TransportError> {
        let status = reader.read_u8()?;
        let poll_timeout = reader.read_u24::<LittleEndian>()?;
        let state = reader.read_u8()?;
        let string_index = reader.read_u8()?;

        Ok(DfuStatus {
            status: DfuStatusCode::try_from(status)
                .map_err(|_| TransportError::UnknownStatus(status))?,
            poll_timeout: Duration::from_millis(u64::from(poll_timeout)),
            state: DfuState::try_from(state).map_err(|_| TransportError::UnknownState(state))?,
            string_index,
        })
    }
}

/// A DFU capable interface alternate setting
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DfuInterface {
    pub number: u8,
    pub alt_setting: u8,
    /// The DfuSe region descriptor, e.g. `@Internal Flash /0x08000000/04*016Kg`
    pub name: Option<String>,
}

/// Notifications emitted by a transport during a download
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent<'a> {
    Message(&'a str),
    Progress { done: usize, total: usize },
}

/// The low-level DFU primitives of a device.
pub trait DfuTransport {
    /// Lists the DFU interfaces of the device
    fn interfaces(&mut self) -> Result<Vec<DfuInterface>, TransportError>;

    /// Claims `interface` and selects its alternate setting
    fn open(&mut self, interface: &DfuInterface) -> Result<(), TransportError>;

    fn get_status(&mut self) -> Result<DfuStatus, TransportError>;

    fn clear_status(&mut self) -> Result<(), TransportError>;

    /// Writes `data` to the region of the open interface in `transfer_size` chunks and leaves
    /// DFU mode, which starts manifestation
    fn download(
        &mut self,
        transfer_size: usize,
        data: &[u8],
        events: &mut dyn FnMut(TransportEvent<'_>),
    ) -> Result<(), TransportError>;

    /// Blocks until the device finished manifesting the downloaded image
    fn wait_for_manifestation(&mut self) -> Result<(), TransportError>;

    /// Releases the open interface, if any
    fn close(&mut self);
}
