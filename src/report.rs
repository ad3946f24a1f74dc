//! Status reporting for long running operations

use log::info;

/// A lifecycle phase of a DFU download
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Phase {
    Erasing,
    Copying,
    Wrote,
    /// A transport message that doesn't map to a known phase
    Other(String),
}

impl Phase {
    /// Maps a transport log message to a phase by its leading word
    pub fn from_message(message: &str) -> Phase {
        if message.starts_with("Erasing") {
            Phase::Erasing
        } else if message.starts_with("Copying") {
            Phase::Copying
        } else if message.starts_with("Wrote") {
            Phase::Wrote
        } else {
            Phase::Other(message.to_owned())
        }
    }
}

/// Events emitted while building an archive or flashing a target
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event<'a> {
    /// An application is being linked
    Processing(&'a str),
    /// A file is being added to the archive
    Adding(&'a str),
    /// A flash target is about to be written
    Flashing(&'a str),
    Phase(Phase),
    Progress { done: usize, total: usize },
}

/// Receives status events. Reporters are informational only and can't affect the operation.
pub trait Reporter {
    fn report(&mut self, event: Event<'_>);
}

impl<F: FnMut(Event<'_>)> Reporter for F {
    fn report(&mut self, event: Event<'_>) {
        self(event)
    }
}

/// Reporter that writes every event to the log
#[derive(Debug, Default)]
pub struct LogReporter {
    last_percent: Option<usize>,
}

impl Reporter for LogReporter {
    fn report(&mut self, event: Event<'_>) {
        match event {
            Event::Processing(name) => info!("Processing {}", name),
            Event::Adding(name) => info!("Adding {}", name),
            Event::Flashing(region) => {
                self.last_percent = None;
                info!("Flashing {}", region)
            }
            Event::Phase(Phase::Erasing) => info!("Erasing"),
            Event::Phase(Phase::Copying) => info!("Copying data"),
            Event::Phase(Phase::Wrote) => info!("Done"),
            Event::Phase(Phase::Other(message)) => info!("{}", message),
            Event::Progress { done, total } => {
                let percent = if total == 0 { 100 } else { done * 100 / total };

                if self.last_percent != Some(percent) {
                    self.last_percent = Some(percent);
                    info!("{:3}% ({}/{})", percent, done, total);
                }
            }
        }
    }
}
