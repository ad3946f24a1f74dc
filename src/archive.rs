//! Assembly of the tar container written to the external flash

use std::convert::TryFrom;
use std::io::{self, Read};

use log::{debug, info};

use crate::link::{self, LinkTools};
use crate::obm::{encode_obm, Wallpaper};
use crate::report::{Event, Reporter};
use crate::repository::{fetch_resource, icon_path, Application, ResourceSource, LINKER_SCRIPT_PATH};
use crate::Error;

/// The tar block size, which is also the alignment of applications in flash
pub const BLOCK_SIZE: usize = 512;

/// Name of the converted wallpaper inside the container
pub const WALLPAPER_ENTRY_NAME: &str = "wallpaper.obm";

/// The permission bits an entry is stored with
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    /// `775`, used for application binaries
    Executable,
    /// `664`, used for everything else
    Regular,
}

impl Mode {
    pub fn bits(self) -> u32 {
        match self {
            Mode::Executable => 0o775,
            Mode::Regular => 0o664,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Mode> {
        match bits & 0o777 {
            0o775 => Some(Mode::Executable),
            0o664 => Some(Mode::Regular),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Executable => "775",
            Mode::Regular => "664",
        }
    }
}

/// A single file in the container
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PackageEntry {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mode: Mode,
}

impl PackageEntry {
    pub fn new<S: Into<String>>(name: S, bytes: Vec<u8>, mode: Mode) -> PackageEntry {
        PackageEntry {
            name: name.into(),
            bytes,
            mode,
        }
    }
}

/// An arbitrary user file copied into the container as-is
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CustomFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// What the user picked for installation.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    applications: Vec<Application>,
    wallpaper: Option<Wallpaper>,
    files: Vec<CustomFile>,
}

impl Selection {
    pub fn new() -> Selection {
        Selection::default()
    }

    /// Appends `app` unless an application with the same name is already selected.
    ///
    /// Returns whether the application was added.
    pub fn add_application(&mut self, app: Application) -> bool {
        if self.applications.iter().any(|a| a.name == app.name) {
            return false;
        }

        self.applications.push(app);
        true
    }

    pub fn remove_application(&mut self, name: &str) -> Option<Application> {
        let index = self.applications.iter().position(|a| a.name == name)?;

        Some(self.applications.remove(index))
    }

    pub fn set_wallpaper(&mut self, wallpaper: Wallpaper) {
        self.wallpaper = Some(wallpaper);
    }

    pub fn remove_wallpaper(&mut self) -> Option<Wallpaper> {
        self.wallpaper.take()
    }

    /// Adds a custom file, replacing the contents of a previously added file with the same name
    pub fn add_file<S: Into<String>>(&mut self, name: S, bytes: Vec<u8>) {
        let name = name.into();

        match self.files.iter_mut().find(|f| f.name == name) {
            Some(existing) => {
                debug!("Replacing custom file {}", name);
                existing.bytes = bytes;
            }
            None => self.files.push(CustomFile { name, bytes }),
        }
    }

    pub fn remove_file(&mut self, name: &str) -> Option<CustomFile> {
        let index = self.files.iter().position(|f| f.name == name)?;

        Some(self.files.remove(index))
    }

    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    pub fn wallpaper(&self) -> Option<&Wallpaper> {
        self.wallpaper.as_ref()
    }

    pub fn files(&self) -> &[CustomFile] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty() && self.files.is_empty() && self.wallpaper.is_none()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BuildOptions {
    /// Address the first application is linked at
    pub base_address: u32,
    /// Whether to ship each application's icon next to it
    pub icons: bool,
}

impl Default for BuildOptions {
    fn default() -> BuildOptions {
        BuildOptions {
            base_address: 0,
            icons: false,
        }
    }
}

/// Where an application ended up in the external flash address space
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Placement {
    pub name: String,
    pub load_address: u32,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct BuiltArchive {
    /// The serialized container
    pub bytes: Vec<u8>,
    /// Link addresses of the applications, in selection order
    pub placements: Vec<Placement>,
}

/// Returns the address the application after one of `binary_len` bytes at `address` is linked at.
///
/// The binary is rounded up to whole blocks and followed by one spare block. Returns `None` if the
/// next address would not fit in 32 bits.
pub fn next_address(address: u32, binary_len: usize) -> Option<u32> {
    let blocks = binary_len.checked_add(2 * BLOCK_SIZE - 1)? / BLOCK_SIZE;
    let advance = u32::try_from(blocks.checked_mul(BLOCK_SIZE)?).ok()?;

    address.checked_add(advance)
}

/// Links every selected application and packs it with the icons, wallpaper and custom files.
///
/// An empty selection produces a single zeroed block without touching `source` or `tools`.
pub fn build<S, T>(
    selection: &Selection,
    options: &BuildOptions,
    source: &S,
    tools: &T,
    reporter: &mut dyn Reporter,
) -> Result<BuiltArchive, Error>
where
    S: ResourceSource + ?Sized,
    T: LinkTools + ?Sized,
{
    if selection.is_empty() {
        debug!("Nothing selected, building a blank archive");

        return Ok(BuiltArchive {
            bytes: vec![0u8; BLOCK_SIZE],
            placements: Vec::new(),
        });
    }

    let template = source
        .fetch_text(LINKER_SCRIPT_PATH)
        .map_err(Error::ScriptLoad)?;

    let mut entries = Vec::new();
    let mut placements = Vec::new();
    let mut address = options.base_address;

    for app in &selection.applications {
        reporter.report(Event::Processing(&app.name));
        info!("Processing {} at {:#x}", app.name, address);

        let binary = link::link(app, &template, address, tools)
            .map_err(|err| Error::Link(app.name.clone(), err))?;

        placements.push(Placement {
            name: app.name.clone(),
            load_address: address,
            size: binary.len(),
        });
        address = next_address(address, binary.len())
            .ok_or_else(|| Error::AddressOverflow(app.name.clone()))?;

        entries.push(PackageEntry::new(app.name.as_str(), binary, Mode::Executable));

        if options.icons {
            let icon = fetch_resource(source, &icon_path(&app.name))?;

            entries.push(PackageEntry::new(
                format!("{}.icon", app.name),
                icon,
                Mode::Regular,
            ));
        }
    }

    if let Some(wallpaper) = &selection.wallpaper {
        reporter.report(Event::Adding(&wallpaper.name));
        debug!("Converting wallpaper {}", wallpaper.name);

        entries.push(PackageEntry::new(
            WALLPAPER_ENTRY_NAME,
            encode_obm(wallpaper),
            Mode::Regular,
        ));
    }

    for file in &selection.files {
        reporter.report(Event::Adding(&file.name));

        entries.push(PackageEntry::new(
            file.name.as_str(),
            file.bytes.clone(),
            Mode::Regular,
        ));
    }

    let bytes = write_archive(&entries).map_err(Error::Archive)?;

    info!("Built archive with {} entries ({} bytes)", entries.len(), bytes.len());

    Ok(BuiltArchive { bytes, placements })
}

/// Serializes `entries` as a ustar archive
pub fn write_archive(entries: &[PackageEntry]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for entry in entries {
        let mut header = tar::Header::new_ustar();

        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.bytes.len() as u64);
        header.set_mode(entry.mode.bits());
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        builder.append_data(&mut header, &entry.name, entry.bytes.as_slice())?;
    }

    builder.into_inner()
}

/// Reads the entries back from a container produced by `write_archive`
pub fn read_archive(bytes: &[u8]) -> io::Result<Vec<PackageEntry>> {
    let mut archive = tar::Archive::new(bytes);
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mode = Mode::from_bits(entry.header().mode()?).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unexpected mode on {}", name))
        })?;

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        entries.push(PackageEntry::new(name, data, mode));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;
    use crate::obm::{WALLPAPER_HEIGHT, WALLPAPER_WIDTH};
    use crate::LinkError;

    /// Resources held in memory, counting every fetch
    #[derive(Default)]
    struct MemorySource {
        files: HashMap<String, Vec<u8>>,
        fetches: Cell<usize>,
    }

    impl MemorySource {
        fn with_script() -> MemorySource {
            let mut source = MemorySource::default();
            source.insert(LINKER_SCRIPT_PATH, b"ORIGIN = 0x90200000 + (0);");
            source
        }

        fn insert(&mut self, path: &str, bytes: &[u8]) {
            self.files.insert(path.to_owned(), bytes.to_vec());
        }
    }

    impl ResourceSource for MemorySource {
        fn fetch(&self, path: &str) -> io::Result<Vec<u8>> {
            self.fetches.set(self.fetches.get() + 1);

            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    /// Produces a binary of the length written in the ELF and remembers the linker scripts
    #[derive(Default)]
    struct SizedTools {
        scripts: RefCell<Vec<String>>,
    }

    impl LinkTools for SizedTools {
        fn link(&self, elf: &[u8], script: &str) -> Result<Vec<u8>, LinkError> {
            self.scripts.borrow_mut().push(script.to_owned());
            Ok(elf.to_vec())
        }

        fn extract(&self, elf: &[u8]) -> Result<Vec<u8>, LinkError> {
            let len: usize = String::from_utf8_lossy(elf).parse().unwrap();

            Ok(vec![0xa5; len])
        }
    }

    struct FailingTools;

    impl LinkTools for FailingTools {
        fn link(&self, _elf: &[u8], _script: &str) -> Result<Vec<u8>, LinkError> {
            Err(LinkError::MissingPlaceholder)
        }

        fn extract(&self, _elf: &[u8]) -> Result<Vec<u8>, LinkError> {
            unreachable!()
        }
    }

    fn sized_app(name: &str, len: usize) -> Application {
        Application::new(name, len.to_string().into_bytes())
    }

    fn white_wallpaper() -> Wallpaper {
        let pixels = vec![0xff; (WALLPAPER_WIDTH * WALLPAPER_HEIGHT * 4) as usize];

        Wallpaper::from_rgba("white.png", WALLPAPER_WIDTH, WALLPAPER_HEIGHT, pixels).unwrap()
    }

    fn no_report() -> impl FnMut(Event<'_>) {
        |_: Event<'_>| {}
    }

    #[test]
    fn it_should_build_a_blank_block_for_an_empty_selection() {
        let source = MemorySource::default();
        let archive = build(
            &Selection::new(),
            &BuildOptions::default(),
            &source,
            &FailingTools,
            &mut no_report(),
        )
        .unwrap();

        assert_eq!(archive.bytes, vec![0u8; 512]);
        assert_eq!(source.fetches.get(), 0);
    }

    #[test]
    fn it_should_advance_by_rounded_size_plus_one_block() {
        assert_eq!(next_address(0, 300), Some(1024));
        assert_eq!(next_address(0, 511), Some(1024));
        assert_eq!(next_address(0, 512), Some(1024));
        assert_eq!(next_address(0, 513), Some(1536));
        assert_eq!(next_address(0, 1024), Some(1536));
        assert_eq!(next_address(1024, 5000), Some(1024 + 5632));
        assert_eq!(next_address(0, 0), Some(512));
    }

    #[test]
    fn it_should_refuse_to_wrap_past_the_address_space() {
        assert_eq!(next_address(0xffff_fe00, 300), None);
        assert_eq!(next_address(0xffff_fa00, 300), Some(0xffff_fe00));
        assert_eq!(next_address(0, usize::MAX), None);
    }

    #[test]
    fn it_should_fail_builds_that_overflow_the_address_space() {
        let source = MemorySource::with_script();
        let mut selection = Selection::new();

        selection.add_application(sized_app("last", 300));

        let options = BuildOptions {
            base_address: 0xffff_fe00,
            icons: false,
        };
        let result = build(
            &selection,
            &options,
            &source,
            &SizedTools::default(),
            &mut no_report(),
        );

        assert!(matches!(result, Err(Error::AddressOverflow(ref name)) if name == "last"));
    }

    #[test]
    fn it_should_link_applications_at_increasing_addresses() {
        let source = MemorySource::with_script();
        let tools = SizedTools::default();
        let mut selection = Selection::new();

        selection.add_application(sized_app("first", 300));
        selection.add_application(sized_app("second", 5000));
        selection.add_application(sized_app("third", 10));

        let options = BuildOptions {
            base_address: 0x1000,
            icons: false,
        };
        let archive = build(&selection, &options, &source, &tools, &mut no_report()).unwrap();
        let addresses: Vec<u32> = archive.placements.iter().map(|p| p.load_address).collect();

        assert_eq!(addresses, vec![0x1000, 0x1000 + 1024, 0x1000 + 1024 + 5632]);
        assert_eq!(
            *tools.scripts.borrow(),
            vec![
                "ORIGIN = 0x90200000 + (4096);",
                "ORIGIN = 0x90200000 + (5120);",
                "ORIGIN = 0x90200000 + (10752);",
            ]
        );
    }

    #[test]
    fn it_should_order_and_mode_entries() {
        let mut source = MemorySource::with_script();
        source.insert("apps/first/app.icon", b"icon one");
        source.insert("apps/second/app.icon", b"icon two");

        let mut selection = Selection::new();
        selection.add_application(sized_app("first", 3));
        selection.add_application(sized_app("second", 4));
        selection.add_file("notes.py", b"print(1)".to_vec());
        selection.add_file("data.txt", b"abc".to_vec());
        selection.set_wallpaper(white_wallpaper());

        let options = BuildOptions {
            base_address: 0,
            icons: true,
        };
        let archive = build(
            &selection,
            &options,
            &source,
            &SizedTools::default(),
            &mut no_report(),
        )
        .unwrap();

        assert_eq!(archive.bytes.len() % BLOCK_SIZE, 0);

        let entries = read_archive(&archive.bytes).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "first",
                "first.icon",
                "second",
                "second.icon",
                "wallpaper.obm",
                "notes.py",
                "data.txt"
            ]
        );
        assert_eq!(entries[0], PackageEntry::new("first", vec![0xa5; 3], Mode::Executable));
        assert_eq!(entries[1].bytes, b"icon one");
        assert_eq!(entries[1].mode, Mode::Regular);
        assert_eq!(entries[2].mode, Mode::Executable);
        assert_eq!(entries[4].bytes, encode_obm(&white_wallpaper()));
        assert_eq!(
            entries[5],
            PackageEntry::new("notes.py", b"print(1)".to_vec(), Mode::Regular)
        );
        assert_eq!(entries[6].mode.as_str(), "664");
    }

    #[test]
    fn it_should_report_each_item() {
        let source = MemorySource::with_script();
        let mut selection = Selection::new();
        selection.add_application(sized_app("app", 1));
        selection.set_wallpaper(white_wallpaper());
        selection.add_file("readme", Vec::new());

        let mut events = Vec::new();
        let mut reporter = |event: Event<'_>| events.push(format!("{:?}", event));

        build(
            &selection,
            &BuildOptions::default(),
            &source,
            &SizedTools::default(),
            &mut reporter,
        )
        .unwrap();

        assert_eq!(
            events,
            vec![
                "Processing(\"app\")",
                "Adding(\"white.png\")",
                "Adding(\"readme\")"
            ]
        );
    }

    #[test]
    fn it_should_stop_when_the_linker_script_is_missing() {
        let source = MemorySource::default();
        let tools = SizedTools::default();
        let mut selection = Selection::new();
        selection.add_application(sized_app("app", 1));

        let result = build(
            &selection,
            &BuildOptions::default(),
            &source,
            &tools,
            &mut no_report(),
        );

        assert!(matches!(result, Err(Error::ScriptLoad(_))));
        assert!(tools.scripts.borrow().is_empty());
    }

    #[test]
    fn it_should_load_the_script_for_files_only_selections() {
        let source = MemorySource::with_script();
        let mut selection = Selection::new();
        selection.add_file("readme", b"hi".to_vec());

        build(
            &selection,
            &BuildOptions::default(),
            &source,
            &FailingTools,
            &mut no_report(),
        )
        .unwrap();

        assert_eq!(source.fetches.get(), 1);
    }

    #[test]
    fn it_should_abort_on_link_failure() {
        let source = MemorySource::with_script();
        let mut selection = Selection::new();
        selection.add_application(sized_app("broken", 1));

        let result = build(
            &selection,
            &BuildOptions::default(),
            &source,
            &FailingTools,
            &mut no_report(),
        );

        match result {
            Err(Error::Link(name, LinkError::MissingPlaceholder)) => assert_eq!(name, "broken"),
            other => panic!("unexpected result {:?}", other.map(|a| a.bytes.len())),
        }
    }

    #[test]
    fn it_should_abort_on_missing_icon() {
        let source = MemorySource::with_script();
        let mut selection = Selection::new();
        selection.add_application(sized_app("iconless", 1));

        let options = BuildOptions {
            base_address: 0,
            icons: true,
        };
        let result = build(
            &selection,
            &options,
            &source,
            &SizedTools::default(),
            &mut no_report(),
        );

        assert!(matches!(result, Err(Error::ResourceFetch(ref path, _)) if path == "apps/iconless/app.icon"));
    }

    #[test]
    fn it_should_keep_selections_free_of_duplicates() {
        let mut selection = Selection::new();

        assert!(selection.add_application(sized_app("app", 1)));
        assert!(!selection.add_application(sized_app("app", 2)));
        assert_eq!(selection.applications().len(), 1);

        selection.add_file("a", b"1".to_vec());
        selection.add_file("b", b"2".to_vec());
        selection.add_file("a", b"3".to_vec());

        assert_eq!(selection.files()[0].bytes, b"3");
        assert_eq!(selection.files().len(), 2);

        assert!(selection.remove_application("app").is_some());
        assert!(selection.remove_file("a").is_some());
        assert!(selection.remove_file("b").is_some());
        assert!(selection.is_empty());
    }
}
