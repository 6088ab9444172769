//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use scanbridge::logging::LogFormat;
use scanbridge::types::{BitDepth, Driver, PaperSource};
use std::path::PathBuf;

/// Drive scanner, mail and rendering workers from the shell.
#[derive(Parser, Debug)]
#[command(name = "scanbridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Worker executable (default: next to this binary).
    #[arg(long, env = "SCANBRIDGE_WORKER_PATH", global = true)]
    pub worker_path: Option<PathBuf>,

    /// Directory for worker channel sockets.
    #[arg(long, env = "SCANBRIDGE_RUNTIME_DIR", global = true)]
    pub runtime_dir: Option<PathBuf>,

    /// Run operations in this process instead of a worker.
    #[arg(long, global = true)]
    pub in_process: bool,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format: pretty, compact, json.
    #[arg(long, value_enum, env = "SCANBRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List scanners.
    Devices(DevicesArgs),

    /// Scan pages into a directory.
    Scan(ScanArgs),

    /// Open a device's own configuration dialog.
    Configure(ConfigureArgs),

    /// Render a thumbnail of a PNM image.
    Thumbnail(ThumbnailArgs),

    /// Render the first page of a PDF.
    RenderPdf(RenderPdfArgs),

    /// Check whether a mail client can be used.
    MailCheck(MailCheckArgs),
}

/// Arguments for the devices command.
#[derive(Parser, Debug)]
pub struct DevicesArgs {
    /// Driver to enumerate.
    #[arg(short, long, value_enum, default_value_t = DriverArg::Virtual)]
    pub driver: DriverArg,
}

/// Arguments for the scan command.
#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Device id.
    #[arg(short, long, default_value = "virtual:flatbed")]
    pub device: String,

    #[arg(short = 'D', long, value_enum, default_value_t = DriverArg::Virtual)]
    pub driver: DriverArg,

    /// Resolution in dots per inch.
    #[arg(long, default_value_t = 100)]
    pub dpi: u32,

    #[arg(long, value_enum, default_value_t = BitDepthArg::Color)]
    pub bit_depth: BitDepthArg,

    /// Stop after this many pages.
    #[arg(short = 'n', long)]
    pub pages: Option<u32>,

    /// Directory the page images are written to.
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Let the worker stage large pages in this directory.
    #[arg(long)]
    pub staging: Option<PathBuf>,
}

/// Arguments for the configure command.
#[derive(Parser, Debug)]
pub struct ConfigureArgs {
    /// Device id.
    pub device: String,

    /// Native handle of the owning window.
    #[arg(long, default_value_t = 0)]
    pub window: u64,
}

/// Arguments for the thumbnail command.
#[derive(Parser, Debug)]
pub struct ThumbnailArgs {
    /// PNM image to shrink.
    pub input: PathBuf,

    /// Longest edge of the thumbnail in pixels.
    #[arg(short, long, default_value_t = 128)]
    pub size: u32,

    #[arg(short, long)]
    pub output: PathBuf,
}

/// Arguments for the render-pdf command.
#[derive(Parser, Debug)]
pub struct RenderPdfArgs {
    pub input: PathBuf,

    #[arg(long, default_value_t = 150.0)]
    pub dpi: f32,

    #[arg(short, long)]
    pub output: PathBuf,
}

/// Arguments for the mail-check command.
#[derive(Parser, Debug)]
pub struct MailCheckArgs {
    /// Mail client to check (default: the system default).
    #[arg(short, long)]
    pub client: Option<String>,
}

/// Driver argument for CLI.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum DriverArg {
    #[default]
    Virtual,
    Wia,
    Twain,
    Sane,
    Escl,
}

impl From<DriverArg> for Driver {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Virtual => Driver::Virtual,
            DriverArg::Wia => Driver::Wia,
            DriverArg::Twain => Driver::Twain,
            DriverArg::Sane => Driver::Sane,
            DriverArg::Escl => Driver::Escl,
        }
    }
}

/// Bit depth argument for CLI.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum BitDepthArg {
    #[default]
    Color,
    Grayscale,
    BlackWhite,
}

impl From<BitDepthArg> for BitDepth {
    fn from(arg: BitDepthArg) -> Self {
        match arg {
            BitDepthArg::Color => BitDepth::Color,
            BitDepthArg::Grayscale => BitDepth::Grayscale,
            BitDepthArg::BlackWhite => BitDepth::BlackWhite,
        }
    }
}

impl ScanArgs {
    /// Paper source implied by the device id.
    pub fn source(&self) -> PaperSource {
        if self.device.contains("feeder") {
            PaperSource::Feeder
        } else {
            PaperSource::Flatbed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_defaults() {
        let args = Cli::try_parse_from(["scanbridge", "scan"]).unwrap();
        match args.command {
            Commands::Scan(scan) => {
                assert_eq!(scan.device, "virtual:flatbed");
                assert_eq!(scan.dpi, 100);
                assert_eq!(scan.pages, None);
                assert_eq!(scan.source(), PaperSource::Flatbed);
            }
            _ => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_scan_with_options() {
        let args = Cli::try_parse_from([
            "scanbridge",
            "scan",
            "--device",
            "virtual:feeder",
            "-n",
            "2",
            "--bit-depth",
            "black-white",
            "--staging",
            "/tmp/stage",
        ])
        .unwrap();
        match args.command {
            Commands::Scan(scan) => {
                assert_eq!(scan.pages, Some(2));
                assert_eq!(scan.bit_depth, BitDepthArg::BlackWhite);
                assert_eq!(scan.staging, Some(PathBuf::from("/tmp/stage")));
                assert_eq!(scan.source(), PaperSource::Feeder);
            }
            _ => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Cli::try_parse_from(["scanbridge", "devices", "-vv", "--in-process"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.in_process);
    }

    #[test]
    fn test_log_format_flag() {
        let args =
            Cli::try_parse_from(["scanbridge", "--log-format", "json", "mail-check"]).unwrap();
        assert_eq!(args.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_thumbnail_requires_output() {
        assert!(Cli::try_parse_from(["scanbridge", "thumbnail", "page.pnm"]).is_err());
    }
}
