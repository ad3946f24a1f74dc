use std::fs::{self, File};
use std::path::Path;

use anyhow::Context;
use log::{debug, info};
use structopt::StructOpt;

use nwas::archive::{read_archive, BuiltArchive};
use nwas::dfu::UsbDevice;
use nwas::repository::{load_application, load_firmware};
use nwas::{
    BuildOptions, ExternalTools, Flow, LogReporter, Repository, Selection, Wallpaper,
};

mod cli;

use cli::{Command, Opts, SelectionOpts};

/// Returns the file name of `path` as the archive entry name
fn entry_name(path: &Path) -> Result<String, anyhow::Error> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("'{}' has no file name", path.display()))
}

fn load_wallpaper(path: &Path) -> Result<Wallpaper, anyhow::Error> {
    let file =
        File::open(path).with_context(|| format!("Failed to open '{}'", path.display()))?;

    Wallpaper::from_png(entry_name(path)?, file)
        .with_context(|| format!("Failed to load wallpaper '{}'", path.display()))
}

fn build_archive(
    opts: &Opts,
    repository: &Repository,
    selection_opts: &SelectionOpts,
) -> Result<BuiltArchive, anyhow::Error> {
    let mut selection = Selection::new();

    for name in &selection_opts.apps {
        let app = load_application(repository, name)
            .with_context(|| format!("Failed to load application '{}'", name))?;

        if !selection.add_application(app) {
            anyhow::bail!("Application '{}' was selected twice", name);
        }
    }

    if let Some(path) = &selection_opts.wallpaper {
        selection.set_wallpaper(load_wallpaper(path)?);
    }

    for path in &selection_opts.files {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;

        selection.add_file(entry_name(path)?, bytes);
    }

    let options = BuildOptions {
        base_address: selection_opts.base_address,
        icons: selection_opts.icons,
    };
    let tools = ExternalTools::new(&opts.ld, &opts.objcopy);
    let archive = nwas::build(&selection, &options, repository, &tools, &mut LogReporter::default())
        .with_context(|| "Failed to build application archive")?;

    for placement in &archive.placements {
        info!(
            "{} linked at {:#010x} ({} bytes)",
            placement.name, placement.load_address, placement.size
        );
    }

    Ok(archive)
}

fn open_device(opts: &Opts) -> Result<UsbDevice, anyhow::Error> {
    UsbDevice::find(opts.vendor_id, opts.product_id).with_context(|| {
        "Failed to open the calculator, make sure it is connected and in DFU mode"
    })
}

fn main() -> Result<(), anyhow::Error> {
    // Create a logger with a timestamp, filtered through RUST_LOG
    pretty_env_logger::init_timed();

    // Parse the command-line arguments
    let opts = Opts::from_args();
    let repository = Repository::new(&opts.repository);

    debug!("Using repository {}", repository.root().display());

    match &opts.command {
        Command::List => {
            let names = repository.applications().with_context(|| {
                format!("Failed to list applications in '{}'", opts.repository.display())
            })?;

            for name in names {
                println!("{}", name);
            }
        }
        Command::Build { selection, output } => {
            let archive = build_archive(&opts, &repository, selection)?;

            fs::write(output, &archive.bytes)
                .with_context(|| format!("Failed to write '{}'", output.display()))?;

            println!(
                "Wrote {} bytes to {}",
                archive.bytes.len(),
                output.as_path().display()
            );
        }
        Command::Install(selection) => {
            // Fail before linking anything if there's no calculator to install to
            let mut device = open_device(&opts)?;
            let archive = build_archive(&opts, &repository, selection)?;

            Flow::Package {
                archive: archive.bytes,
            }
            .run(&mut device, &mut LogReporter::default())
            .with_context(|| "Failed to install applications")?;

            println!("Installed {} application(s)", archive.placements.len());
        }
        Command::Wallpaper { input, output } => {
            let wallpaper = load_wallpaper(input)?;

            fs::write(output, nwas::encode_obm(&wallpaper))
                .with_context(|| format!("Failed to write '{}'", output.display()))?;

            println!(
                "Converted {} to {}",
                input.as_path().display(),
                output.as_path().display()
            );
        }
        Command::Inspect { filename } => {
            let bytes = fs::read(filename)
                .with_context(|| format!("Failed to read '{}'", filename.display()))?;
            let entries = read_archive(&bytes)
                .with_context(|| format!("Failed to parse archive '{}'", filename.display()))?;

            for entry in entries {
                println!("{} {:>8} {}", entry.mode.as_str(), entry.bytes.len(), entry.name);
            }
        }
        Command::Firmware { version } => {
            let firmware = load_firmware(&repository, version)
                .with_context(|| format!("Failed to load firmware {}", version))?;
            let mut device = open_device(&opts)?;

            Flow::Firmware {
                external: firmware.external,
                internal: firmware.internal,
            }
            .run(&mut device, &mut LogReporter::default())
            .with_context(|| format!("Failed to flash firmware {}", version))?;

            println!("Flashed firmware {}", version);
        }
    }

    Ok(())
}
