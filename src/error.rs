use std::io;
use std::process::ExitStatus;

use thiserror::Error;

use crate::dfu::{DfuState, DfuStatusCode};

/// Errors raised while relinking an application
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("The linker script has no (0) address placeholder")]
    MissingPlaceholder,
    #[error("Could not run {}: {}", _0, _1)]
    Spawn(String, #[source] io::Error),
    #[error("{} exited with {}: {}", tool, status, stderr)]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("I/O error in link workspace: {}", _0)]
    IoError(#[from] io::Error),
}

/// Errors raised by a DFU transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No USB device with id {:04x}:{:04x} found", _0, _1)]
    DeviceNotFound(u16, u16),
    #[error("USB error: {}", _0)]
    Usb(String),
    #[error("USB transfer failed: {}", _0)]
    Transfer(#[from] nusb::transfer::TransferError),
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
    #[error("Short status response of {} bytes", _0)]
    ShortStatus(usize),
    #[error("Unknown DFU state {}", _0)]
    UnknownState(u8),
    #[error("Unknown DFU status code {}", _0)]
    UnknownStatus(u8),
    #[error("Device reported {:?} in state {:?}", _0, _1)]
    Status(DfuStatusCode, DfuState),
    #[error("Expected device in state {:?}, but it is in {:?}", expected, actual)]
    UnexpectedState { expected: DfuState, actual: DfuState },
    #[error("Invalid region descriptor {:?}: {}", _0, _1)]
    InvalidDescriptor(String, &'static str),
    #[error("Address {:#010x} is outside of the region", _0)]
    OutOfRange(u32),
    #[error("Transport is not open")]
    NotOpen,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to load linker script: {}", _0)]
    ScriptLoad(#[source] io::Error),
    #[error("Could not link {}: {}", _0, _1)]
    Link(String, #[source] LinkError),
    #[error("Unable to fetch {}: {}", _0, _1)]
    ResourceFetch(String, #[source] io::Error),
    #[error("The selected device does not have any USB DFU interfaces")]
    NoInterface,
    #[error("DFU transport error: {}", _0)]
    Transport(#[from] TransportError),
    #[error("Could not write archive: {}", _0)]
    Archive(#[source] io::Error),
    #[error("Could not decode image: {}", _0)]
    Image(#[from] png::DecodingError),
    #[error("Wallpaper must be 320x222, got {}x{}", _0, _1)]
    InvalidWallpaperSize(u32, u32),
    #[error("Wallpaper pixel buffer holds {} bytes, expected {}", actual, expected)]
    InvalidPixelBuffer { expected: usize, actual: usize },
    #[error("Application {} does not fit below the end of the address space", _0)]
    AddressOverflow(String),
}
