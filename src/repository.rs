//! Access to the application repository
//!
//! A repository is a directory tree with the following layout:
//!
//! ```text
//! apps/external.ld               linker script template shared by every application
//! apps/<name>/app.elf            relocatable application object
//! apps/<name>/app.icon           icon shown by the launcher
//! firmware/<version>.internal.bin
//! firmware/<version>.external.bin
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::Error;

/// Path of the linker script template inside a repository
pub const LINKER_SCRIPT_PATH: &str = "apps/external.ld";

/// An application that can be installed on the calculator
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Application {
    pub name: String,
    /// The unlinked ELF object
    pub elf: Vec<u8>,
}

impl Application {
    pub fn new<S: Into<String>>(name: S, elf: Vec<u8>) -> Application {
        Application {
            name: name.into(),
            elf,
        }
    }
}

/// Something resources can be fetched from by their repository-relative path.
pub trait ResourceSource {
    fn fetch(&self, path: &str) -> io::Result<Vec<u8>>;

    fn fetch_text(&self, path: &str) -> io::Result<String> {
        String::from_utf8(self.fetch(path)?)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

pub fn elf_path(name: &str) -> String {
    format!("apps/{}/app.elf", name)
}

pub fn icon_path(name: &str) -> String {
    format!("apps/{}/app.icon", name)
}

pub fn firmware_path(version: &str, region: &str) -> String {
    format!("firmware/{}.{}.bin", version, region)
}

/// Fetches `path` from `source`, mapping failures to `Error::ResourceFetch`
pub fn fetch_resource<S: ResourceSource + ?Sized>(source: &S, path: &str) -> Result<Vec<u8>, Error> {
    trace!("Fetching {}", path);

    source
        .fetch(path)
        .map_err(|err| Error::ResourceFetch(path.to_owned(), err))
}

/// Loads the application `name` from `source`
pub fn load_application<S: ResourceSource + ?Sized>(
    source: &S,
    name: &str,
) -> Result<Application, Error> {
    let elf = fetch_resource(source, &elf_path(name))?;

    Ok(Application::new(name, elf))
}

/// The two halves of a firmware release
#[derive(Debug, Clone)]
pub struct Firmware {
    pub internal: Vec<u8>,
    pub external: Vec<u8>,
}

/// Loads both firmware images of `version`, internal first
pub fn load_firmware<S: ResourceSource + ?Sized>(
    source: &S,
    version: &str,
) -> Result<Firmware, Error> {
    let internal = fetch_resource(source, &firmware_path(version, "internal"))?;
    let external = fetch_resource(source, &firmware_path(version, "external"))?;

    debug!(
        "Loaded firmware {} ({} internal bytes, {} external bytes)",
        version,
        internal.len(),
        external.len()
    );

    Ok(Firmware { internal, external })
}

/// A repository rooted at a local directory
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new<P: Into<PathBuf>>(root: P) -> Repository {
        Repository { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the names of every application with an `app.elf`, sorted by name
    pub fn applications(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(self.root.join("apps"))? {
            let entry = entry?;

            if entry.path().join("app.elf").is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();

        Ok(names)
    }
}

impl ResourceSource for Repository {
    fn fetch(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(path))
    }
}
