//! Writing payloads to the calculator's flash regions over DFU

use log::{debug, info, warn};

use crate::dfu::{DfuState, DfuStatus, DfuTransport, TransportEvent, DEFAULT_TRANSFER_SIZE};
use crate::report::{Event, Phase, Reporter};
use crate::Error;

/// Region applications are installed to
pub const APPLICATIONS_REGION: &str = "@External Flash /0x90200000/32*064Kg,64*064Kg";
/// Region holding the external half of the firmware
pub const FIRMWARE_EXTERNAL_REGION: &str = "@External Flash /0x90000000/08*004Kg,01*032Kg,31*064Kg";
/// Region holding the internal half of the firmware
pub const FIRMWARE_INTERNAL_REGION: &str = "@Internal Flash /0x08000000/04*016Kg";

/// The states a flash session goes through
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashState {
    Closed,
    Open,
    ClearingError,
    Idle,
    Downloading,
    Manifesting,
    Done,
    Error,
}

/// A payload and the flash region it's written to
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashTarget {
    pub region_descriptor: String,
    pub payload: Vec<u8>,
    /// Internal flash targets wait for the device to finish manifestation
    pub is_internal_region: bool,
}

impl FlashTarget {
    pub fn new<S: Into<String>>(region_descriptor: S, payload: Vec<u8>, is_internal_region: bool) -> Self {
        FlashTarget {
            region_descriptor: region_descriptor.into(),
            payload,
            is_internal_region,
        }
    }
}

/// A single flash operation against an opened transport.
pub struct Session<'a, T: DfuTransport + ?Sized> {
    transport: &'a mut T,
    state: FlashState,
    history: Vec<FlashState>,
    last_status: Option<DfuStatus>,
}

impl<'a, T: DfuTransport + ?Sized> Session<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Session {
            transport,
            state: FlashState::Closed,
            history: vec![FlashState::Closed],
            last_status: None,
        }
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Every state the session has been in, oldest first
    pub fn history(&self) -> &[FlashState] {
        &self.history
    }

    pub fn last_status(&self) -> Option<&DfuStatus> {
        self.last_status.as_ref()
    }

    fn enter(&mut self, state: FlashState) {
        debug!("Flash state {:?} -> {:?}", self.state, state);

        self.state = state;
        self.history.push(state);
    }

    /// Writes `target` to the device, closing the transport again afterwards.
    ///
    /// Failures are returned as-is; nothing is retried.
    pub fn flash(&mut self, target: &FlashTarget, reporter: &mut dyn Reporter) -> Result<(), Error> {
        let result = self.run(target, reporter);

        if self.state != FlashState::Closed {
            self.transport.close();
        }

        match result {
            Ok(()) => {
                self.enter(FlashState::Done);
                info!("Flashed {} bytes to {}", target.payload.len(), target.region_descriptor);
                Ok(())
            }
            Err(err) => {
                self.enter(FlashState::Error);
                Err(err)
            }
        }
    }

    fn run(&mut self, target: &FlashTarget, reporter: &mut dyn Reporter) -> Result<(), Error> {
        let mut interfaces = self.transport.interfaces()?;

        debug!("DFU interfaces: {:?}", interfaces);

        if interfaces.is_empty() {
            return Err(Error::NoInterface);
        }

        let mut interface = interfaces.swap_remove(0);
        interface.name = Some(target.region_descriptor.clone());

        self.transport.open(&interface)?;
        self.enter(FlashState::Open);

        self.clear_error_state();
        self.enter(FlashState::Idle);

        reporter.report(Event::Flashing(&target.region_descriptor));
        self.enter(FlashState::Downloading);

        {
            let mut on_event = |event: TransportEvent<'_>| match event {
                TransportEvent::Message(message) => {
                    reporter.report(Event::Phase(Phase::from_message(message)))
                }
                TransportEvent::Progress { done, total } => {
                    reporter.report(Event::Progress { done, total })
                }
            };

            self.transport
                .download(DEFAULT_TRANSFER_SIZE, &target.payload, &mut on_event)?;
        }

        if target.is_internal_region {
            self.enter(FlashState::Manifesting);
            self.transport.wait_for_manifestation()?;
        } else {
            // A single status request starts manifestation; the device may already be gone
            match self.transport.get_status() {
                Ok(status) => self.last_status = Some(status),
                Err(err) => debug!("Ignoring status error after download: {}", err),
            }
        }

        Ok(())
    }

    /// Clears a pending error state. Failures are logged and otherwise ignored.
    fn clear_error_state(&mut self) {
        let status = match self.transport.get_status() {
            Ok(status) => status,
            Err(err) => {
                warn!("Failed to clear status: {}", err);
                return;
            }
        };

        self.last_status = Some(status);

        if status.state == DfuState::DfuError {
            self.enter(FlashState::ClearingError);

            if let Err(err) = self.transport.clear_status() {
                warn!("Failed to clear status: {}", err);
            }
        }
    }
}

/// Writes `target` to the device behind `transport`
pub fn flash<T: DfuTransport + ?Sized>(
    transport: &mut T,
    target: &FlashTarget,
    reporter: &mut dyn Reporter,
) -> Result<(), Error> {
    Session::new(transport).flash(target, reporter)
}

/// The two things that can be written to the calculator
#[derive(Debug, Clone)]
pub enum Flow {
    /// An application archive for the external flash
    Package { archive: Vec<u8> },
    /// A firmware release, split in its external and internal flash halves
    Firmware { external: Vec<u8>, internal: Vec<u8> },
}

impl Flow {
    /// The targets to flash, in order
    pub fn targets(self) -> Vec<FlashTarget> {
        match self {
            Flow::Package { archive } => vec![FlashTarget::new(APPLICATIONS_REGION, archive, false)],
            Flow::Firmware { external, internal } => vec![
                FlashTarget::new(FIRMWARE_EXTERNAL_REGION, external, false),
                FlashTarget::new(FIRMWARE_INTERNAL_REGION, internal, true),
            ],
        }
    }

    /// Flashes every target in order, stopping at the first failure.
    ///
    /// Targets that were already written stay written.
    pub fn run<T: DfuTransport + ?Sized>(
        self,
        transport: &mut T,
        reporter: &mut dyn Reporter,
    ) -> Result<(), Error> {
        for target in self.targets() {
            flash(transport, &target, reporter)?;
        }

        Ok(())
    }
}
