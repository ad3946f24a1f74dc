use std::num::ParseIntError;
use std::path::PathBuf;

use structopt::StructOpt;

/// Parses a number given either in decimal or as `0x` prefixed hex
fn parse_u32(src: &str) -> Result<u32, ParseIntError> {
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => src.parse(),
    }
}

fn parse_u16(src: &str) -> Result<u16, ParseIntError> {
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => src.parse(),
    }
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// List the applications in the repository
    List,
    /// Build an application archive and save it to a file
    Build {
        #[structopt(flatten)]
        selection: SelectionOpts,
        /// The name of the file to save the archive to
        #[structopt(short = "o", long = "output", default_value = "apps.tar")]
        output: PathBuf,
    },
    /// Build an application archive and install it on the calculator
    Install(SelectionOpts),
    /// Convert a PNG image to a wallpaper file
    Wallpaper {
        /// The PNG image to convert
        #[structopt(required = true)]
        input: PathBuf,
        /// The name of the file to save the wallpaper to
        #[structopt(short = "o", long = "output", default_value = "wallpaper.obm")]
        output: PathBuf,
    },
    /// Print the entries of an application archive
    Inspect {
        /// The archive to read
        #[structopt(required = true)]
        filename: PathBuf,
    },
    /// Flash a firmware release from the repository
    Firmware {
        /// The firmware version, e.g. `15.3.2`
        #[structopt(required = true)]
        version: String,
    },
}

#[derive(StructOpt, Debug)]
pub struct SelectionOpts {
    /// Applications to install, in order
    #[structopt(short = "a", long = "app")]
    pub apps: Vec<String>,
    /// Additional files to add to the archive
    #[structopt(short = "f", long = "file")]
    pub files: Vec<PathBuf>,
    /// A 320x222 PNG image to use as wallpaper
    #[structopt(short = "w", long = "wallpaper")]
    pub wallpaper: Option<PathBuf>,
    /// Include the launcher icon of each application
    #[structopt(long = "icons")]
    pub icons: bool,
    /// Address the first application is linked at
    #[structopt(long = "base-address", default_value = "0", parse(try_from_str = parse_u32))]
    pub base_address: u32,
}

#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The repository holding applications and firmware
    #[structopt(
        env = "NWAS_REPOSITORY",
        short = "r",
        long = "repository",
        default_value = "."
    )]
    pub repository: PathBuf,
    /// The linker used to relocate applications
    #[structopt(env = "NWAS_LD", long = "ld", default_value = "arm-none-eabi-ld")]
    pub ld: PathBuf,
    /// The objcopy used to extract application binaries
    #[structopt(
        env = "NWAS_OBJCOPY",
        long = "objcopy",
        default_value = "arm-none-eabi-objcopy"
    )]
    pub objcopy: PathBuf,
    /// USB vendor id of the calculator in DFU mode
    #[structopt(long = "vendor-id", default_value = "0x0483", parse(try_from_str = parse_u16))]
    pub vendor_id: u16,
    /// USB product id of the calculator in DFU mode
    #[structopt(long = "product-id", default_value = "0xa291", parse(try_from_str = parse_u16))]
    pub product_id: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_hex_and_decimal_numbers() {
        assert_eq!(parse_u32("0x90200000"), Ok(0x9020_0000));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert_eq!(parse_u16("0XA291"), Ok(0xa291));
        assert!(parse_u16("0x10000").is_err());
    }

    #[test]
    fn it_should_parse_install_selections() {
        let opts = Opts::from_iter(&[
            "nwas",
            "install",
            "-a",
            "snake",
            "-a",
            "calc",
            "--icons",
            "--base-address",
            "0x1000",
        ]);

        assert_eq!(opts.vendor_id, 0x0483);
        assert_eq!(opts.product_id, 0xa291);

        match opts.command {
            Command::Install(selection) => {
                assert_eq!(selection.apps, vec!["snake", "calc"]);
                assert!(selection.icons);
                assert_eq!(selection.base_address, 0x1000);
                assert!(selection.wallpaper.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
