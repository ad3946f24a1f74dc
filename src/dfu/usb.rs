use std::thread;
use std::time::Duration;

use log::{debug, trace};
use nusb::transfer::{Control, ControlType, Recipient, TransferError};

use super::{
    DfuInterface, DfuState, DfuStatus, DfuStatusCode, DfuTransport, MemoryLayout,
    TransportEvent, DFU_INTERFACE_CLASS, DFU_INTERFACE_SUBCLASS,
};
use crate::TransportError;

const DFU_DNLOAD: u8 = 0x01;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;

/// DfuSe commands, sent as block 0 downloads
const DFUSE_SET_ADDRESS: u8 = 0x21;
const DFUSE_ERASE_SECTOR: u8 = 0x41;

/// DfuSe data blocks start at wValue 2; the address pointer selects the destination
const DFUSE_DATA_BLOCK: u16 = 2;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Class requests to a claimed DFU interface
trait ControlPipe {
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError>;

    /// Reads the response to `request` into `buf` and returns its length
    fn control_in(&self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// A claimed nusb interface together with its number, used as `wIndex`
struct ClaimedInterface {
    interface: nusb::Interface,
    number: u8,
}

impl ClaimedInterface {
    fn control(&self, request: u8, value: u16) -> Control {
        Control {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: u16::from(self.number),
        }
    }
}

impl ControlPipe for ClaimedInterface {
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError> {
        self.interface
            .control_out_blocking(self.control(request, value), data, CONTROL_TIMEOUT)?;

        Ok(())
    }

    fn control_in(&self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self
            .interface
            .control_in_blocking(self.control(request, value), buf, CONTROL_TIMEOUT)?)
    }
}

/// The DfuSe request sequences, on top of any control pipe
struct DfuSe<P> {
    pipe: Option<P>,
    layout: Option<MemoryLayout>,
}

impl<P: ControlPipe> DfuSe<P> {
    fn new() -> Self {
        DfuSe {
            pipe: None,
            layout: None,
        }
    }

    fn attach(&mut self, pipe: P, layout: MemoryLayout) {
        self.pipe = Some(pipe);
        self.layout = Some(layout);
    }

    fn detach(&mut self) -> bool {
        self.layout = None;
        self.pipe.take().is_some()
    }

    fn pipe(&self) -> Result<&P, TransportError> {
        self.pipe.as_ref().ok_or(TransportError::NotOpen)
    }

    fn dnload(&self, block: u16, data: &[u8]) -> Result<(), TransportError> {
        trace!("DFU_DNLOAD block {} ({} bytes)", block, data.len());

        self.pipe()?.control_out(DFU_DNLOAD, block, data)
    }

    fn get_status(&self) -> Result<DfuStatus, TransportError> {
        let mut buf = [0u8; 6];
        let len = self.pipe()?.control_in(DFU_GETSTATUS, 0, &mut buf)?;

        if len < buf.len() {
            return Err(TransportError::ShortStatus(len));
        }

        let status = DfuStatus::from_reader(&buf[..])?;
        trace!("DFU_GETSTATUS: {:?}", status);

        Ok(status)
    }

    fn clear_status(&self) -> Result<(), TransportError> {
        trace!("DFU_CLRSTATUS");

        self.pipe()?.control_out(DFU_CLRSTATUS, 0, &[])
    }

    /// Requests status until `done` accepts the state, sleeping for the poll timeout in between
    fn poll_until<F: Fn(DfuState) -> bool>(&self, done: F) -> Result<DfuStatus, TransportError> {
        let mut status = self.get_status()?;

        while !done(status.state) && status.state != DfuState::DfuError {
            thread::sleep(status.poll_timeout);
            status = self.get_status()?;
        }

        Ok(status)
    }

    /// Waits for a download request to finish and checks that it succeeded
    fn finish_download(&self) -> Result<(), TransportError> {
        let status = self.poll_until(|state| state != DfuState::DnBusy)?;

        if status.status != DfuStatusCode::Ok {
            return Err(TransportError::Status(status.status, status.state));
        }

        if status.state != DfuState::DnloadIdle {
            return Err(TransportError::UnexpectedState {
                expected: DfuState::DnloadIdle,
                actual: status.state,
            });
        }

        Ok(())
    }

    fn command(&self, command: u8, address: u32) -> Result<(), TransportError> {
        let mut payload = [command, 0, 0, 0, 0];
        payload[1..].copy_from_slice(&address.to_le_bytes());

        trace!("DfuSe command {:#04x} at {:#010x}", command, address);

        self.dnload(0, &payload)?;
        self.finish_download()
    }

    fn download(
        &self,
        transfer_size: usize,
        data: &[u8],
        events: &mut dyn FnMut(TransportEvent<'_>),
    ) -> Result<(), TransportError> {
        let layout = self.layout.as_ref().ok_or(TransportError::NotOpen)?;
        let start = layout.start_address();

        events(TransportEvent::Message("Erasing DFU device memory"));

        let sectors = layout.erase_plan(start, data.len())?;
        let erase_total = sectors.iter().map(|(_, size)| *size as usize).sum();
        let mut erased = 0;

        for (address, size) in sectors {
            self.command(DFUSE_ERASE_SECTOR, address)?;

            erased += size as usize;
            events(TransportEvent::Progress {
                done: erased,
                total: erase_total,
            });
        }

        events(TransportEvent::Message("Copying data to DFU device"));

        let mut address = start;
        let mut written = 0;

        for chunk in data.chunks(transfer_size) {
            self.command(DFUSE_SET_ADDRESS, address)?;
            self.dnload(DFUSE_DATA_BLOCK, chunk)?;
            self.finish_download()?;

            address = address
                .checked_add(chunk.len() as u32)
                .ok_or(TransportError::OutOfRange(address))?;
            written += chunk.len();
            events(TransportEvent::Progress {
                done: written,
                total: data.len(),
            });
        }

        events(TransportEvent::Message(&format!("Wrote {} bytes", written)));
        events(TransportEvent::Message("Manifesting new firmware"));

        // A zero-length download after pointing at the start leaves DFU mode
        self.command(DFUSE_SET_ADDRESS, start)?;
        self.dnload(0, &[])?;

        Ok(())
    }

    fn wait_for_manifestation(&self) -> Result<(), TransportError> {
        let result = self.poll_until(|state| {
            state == DfuState::DfuIdle || state == DfuState::ManifestWaitReset
        });

        match result {
            Ok(status) if status.state == DfuState::DfuError => {
                Err(TransportError::Status(status.status, status.state))
            }
            Ok(status) => {
                debug!("Manifestation finished in {:?}", status.state);
                Ok(())
            }
            // The device is allowed to reset itself once it is done
            Err(TransportError::Transfer(TransferError::Disconnected)) => {
                debug!("Device disconnected during manifestation");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// A DfuSe device connected over USB
pub struct UsbDevice {
    device: nusb::Device,
    dfuse: DfuSe<ClaimedInterface>,
}

impl UsbDevice {
    /// Opens the first connected device matching `vendor_id` and `product_id`
    pub fn find(vendor_id: u16, product_id: u16) -> Result<UsbDevice, TransportError> {
        let info = nusb::list_devices()?
            .find(|dev| dev.vendor_id() == vendor_id && dev.product_id() == product_id)
            .ok_or(TransportError::DeviceNotFound(vendor_id, product_id))?;

        debug!(
            "Opening USB device {:04x}:{:04x} on bus {} address {}",
            vendor_id,
            product_id,
            info.bus_number(),
            info.device_address()
        );

        Ok(UsbDevice {
            device: info.open()?,
            dfuse: DfuSe::new(),
        })
    }
}

impl DfuTransport for UsbDevice {
    fn interfaces(&mut self) -> Result<Vec<DfuInterface>, TransportError> {
        let config = self
            .device
            .active_configuration()
            .map_err(|err| TransportError::Usb(err.to_string()))?;

        Ok(config
            .interface_alt_settings()
            .filter(|alt| alt.class() == DFU_INTERFACE_CLASS && alt.subclass() == DFU_INTERFACE_SUBCLASS)
            .map(|alt| DfuInterface {
                number: alt.interface_number(),
                alt_setting: alt.alternate_setting(),
                name: None,
            })
            .collect())
    }

    fn open(&mut self, interface: &DfuInterface) -> Result<(), TransportError> {
        let descriptor = interface.name.as_deref().unwrap_or_default();
        let layout = MemoryLayout::parse(descriptor)?;

        debug!(
            "Claiming interface {} alt {} for {}",
            interface.number, interface.alt_setting, layout.name
        );

        let claimed = self.device.claim_interface(interface.number)?;
        claimed.set_alt_setting(interface.alt_setting)?;

        self.dfuse.attach(
            ClaimedInterface {
                interface: claimed,
                number: interface.number,
            },
            layout,
        );

        Ok(())
    }

    fn get_status(&mut self) -> Result<DfuStatus, TransportError> {
        self.dfuse.get_status()
    }

    fn clear_status(&mut self) -> Result<(), TransportError> {
        self.dfuse.clear_status()
    }

    fn download(
        &mut self,
        transfer_size: usize,
        data: &[u8],
        events: &mut dyn FnMut(TransportEvent<'_>),
    ) -> Result<(), TransportError> {
        self.dfuse.download(transfer_size, data, events)
    }

    fn wait_for_manifestation(&mut self) -> Result<(), TransportError> {
        self.dfuse.wait_for_manifestation()
    }

    fn close(&mut self) {
        if self.dfuse.detach() {
            trace!("Released DFU interface");
        }
    }
}
