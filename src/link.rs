//! Relinking of application objects at a given external flash address

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, trace};

use crate::repository::Application;
use crate::LinkError;

/// The load address placeholder in the linker script template
pub const ADDRESS_PLACEHOLDER: &str = "(0)";

/// The link and extract steps, as performed by `ld` and `objcopy`.
pub trait LinkTools {
    /// Links the `elf` object with the given linker `script` and returns the linked ELF
    fn link(&self, elf: &[u8], script: &str) -> Result<Vec<u8>, LinkError>;

    /// Extracts the loadable contents of `elf` as a flat binary
    fn extract(&self, elf: &[u8]) -> Result<Vec<u8>, LinkError>;
}

/// Runs a binutils-compatible linker and objcopy from the host.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    ld: PathBuf,
    objcopy: PathBuf,
}

impl ExternalTools {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(ld: P, objcopy: Q) -> ExternalTools {
        ExternalTools {
            ld: ld.into(),
            objcopy: objcopy.into(),
        }
    }

    /// Runs `tool` with `args` from the current directory, failing if it exits with a non-zero
    /// status. File arguments are absolute so relative tool paths keep resolving.
    fn run(tool: &Path, args: &[&OsStr]) -> Result<(), LinkError> {
        let name = tool.display().to_string();

        debug!("Running {} {:?}", name, args);

        let output = Command::new(tool)
            .args(args)
            .output()
            .map_err(|err| LinkError::Spawn(name.clone(), err))?;

        if !output.status.success() {
            return Err(LinkError::ToolFailed {
                tool: name,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(())
    }
}

impl Default for ExternalTools {
    fn default() -> ExternalTools {
        ExternalTools::new("arm-none-eabi-ld", "arm-none-eabi-objcopy")
    }
}

impl LinkTools for ExternalTools {
    fn link(&self, elf: &[u8], script: &str) -> Result<Vec<u8>, LinkError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.elf");
        let script_path = workdir.path().join("linker.ld");
        let output = workdir.path().join("output.elf");

        fs::write(&input, elf)?;
        fs::write(&script_path, script)?;

        Self::run(
            &self.ld,
            &[
                input.as_os_str(),
                OsStr::new("-o"),
                output.as_os_str(),
                OsStr::new("-T"),
                script_path.as_os_str(),
            ],
        )?;

        Ok(fs::read(&output)?)
    }

    fn extract(&self, elf: &[u8]) -> Result<Vec<u8>, LinkError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.elf");
        let output = workdir.path().join("output.bin");

        fs::write(&input, elf)?;

        Self::run(
            &self.objcopy,
            &[
                OsStr::new("-O"),
                OsStr::new("binary"),
                input.as_os_str(),
                output.as_os_str(),
            ],
        )?;

        Ok(fs::read(&output)?)
    }
}

/// Substitutes `address` for the first `(0)` placeholder in the linker script `template`
pub fn relocate_script(template: &str, address: u32) -> Result<String, LinkError> {
    if !template.contains(ADDRESS_PLACEHOLDER) {
        return Err(LinkError::MissingPlaceholder);
    }

    Ok(template.replacen(ADDRESS_PLACEHOLDER, &format!("({})", address), 1))
}

/// Links `app` at `address` and returns the flat binary
pub fn link<T: LinkTools + ?Sized>(
    app: &Application,
    template: &str,
    address: u32,
    tools: &T,
) -> Result<Vec<u8>, LinkError> {
    let script = relocate_script(template, address)?;

    trace!("Linking {} at {:#010x}", app.name, address);

    let linked = tools.link(&app.elf, &script)?;
    let binary = tools.extract(&linked)?;

    debug!("Linked {} ({} bytes) at {:#010x}", app.name, binary.len(), address);

    Ok(binary)
}
