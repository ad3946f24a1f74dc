//! Packaging and flashing of applications for the N110 calculator.
//!
//! Applications are relinked one after another into the external flash address space, bundled
//! with icons, a wallpaper and custom files into a tar container, and written to the device over
//! USB DFU. The same flashing machinery is used to push a pair of firmware images.

pub mod archive;
pub mod dfu;
mod error;
pub mod flash;
pub mod link;
pub mod obm;
pub mod report;
pub mod repository;

pub use archive::{build, BuildOptions, BuiltArchive, Mode, PackageEntry, Selection};
pub use error::{Error, LinkError, TransportError};
pub use flash::{flash, FlashState, FlashTarget, Flow};
pub use link::{ExternalTools, LinkTools};
pub use obm::{encode_obm, ObmImage, Wallpaper};
pub use report::{Event, LogReporter, Phase, Reporter};
pub use repository::{Application, Repository, ResourceSource};

/// USB vendor id of the calculator in DFU mode
pub const DEFAULT_VENDOR_ID: u16 = 0x0483;

/// USB product id of the calculator in DFU mode
pub const DEFAULT_PRODUCT_ID: u16 = 0xa291;
