//! scanbridge - host CLI for out-of-process scanning workers

mod cli;
mod theme;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use scanbridge::logging::{self, LogConfig};
use scanbridge::types::{ImageData, ScanDevice, ScanOptions, WindowHandle};
use scanbridge::worker::{InProcessWorker, ScanEvent, WorkerApi};
use scanbridge::{BridgeConfig, BridgeError};
use std::path::Path;

use cli::{Cli, Commands};
use theme::Themed;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    logging::init(&log_config(&cli));

    if let Err(e) = run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        if e
            .downcast_ref::<BridgeError>()
            .is_some_and(BridgeError::is_launch_failure)
        {
            eprintln!(
                "  {}: point --worker-path (or SCANBRIDGE_WORKER_PATH) at scanbridge-worker, \
                 or pass --in-process",
                "hint".if_supports_color(Stderr, |text| text.cyan())
            );
        }
        std::process::exit(1);
    }
}

/// Filter implied by `-v`/`-q`, if any. These win over the environment.
fn cli_filter(cli: &Cli) -> Option<&'static str> {
    if cli.quiet {
        return Some("error");
    }
    match cli.verbose {
        0 => None,
        1 => Some("info"),
        _ => Some("debug"),
    }
}

fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::for_host();
    if let Some(filter) = cli_filter(cli) {
        config = config.with_filter(filter.to_string());
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    config.with_env_overrides()
}

fn bridge_config(cli: &Cli) -> BridgeConfig {
    let mut config = BridgeConfig::default().with_env_overrides();
    if let Some(path) = &cli.worker_path {
        config.launcher.worker_path = Some(path.clone());
    }
    if let Some(dir) = &cli.runtime_dir {
        config.launcher.runtime_dir = dir.clone();
    }
    // Workers inherit our environment; -v/-q have to be passed on explicitly.
    if let Some(filter) = cli_filter(cli) {
        config
            .launcher
            .env
            .insert("SCANBRIDGE_LOG".to_string(), filter.to_string());
    }
    // A single command needs a single worker.
    config.pool.max_workers = 1;
    config.pool.warm_spares = 0;
    config
}

fn run(cli: &Cli) -> Result<()> {
    if cli.in_process {
        let mut worker = InProcessWorker::default();
        return Ok(dispatch(cli, &mut worker)?);
    }

    let pool = bridge_config(cli).build_pool()?;
    pool.with_worker(|context| dispatch(cli, context.client()))?;

    let stats = pool.stats();
    tracing::debug!(
        launched = stats.launched,
        disposed = stats.disposed,
        faulted = stats.faulted,
        "Pool finished"
    );
    Ok(())
}

/// Run the selected command against `worker`, wherever it runs.
fn dispatch(cli: &Cli, worker: &mut dyn WorkerApi) -> scanbridge::Result<()> {
    match &cli.command {
        Commands::Devices(args) => cmd_devices(worker, args),
        Commands::Scan(args) => cmd_scan(cli, worker, args),
        Commands::Configure(args) => cmd_configure(worker, args),
        Commands::Thumbnail(args) => cmd_thumbnail(worker, args),
        Commands::RenderPdf(args) => cmd_render_pdf(worker, args),
        Commands::MailCheck(args) => cmd_mail_check(worker, args),
    }
}

fn cmd_devices(worker: &mut dyn WorkerApi, args: &cli::DevicesArgs) -> scanbridge::Result<()> {
    let options = ScanOptions {
        driver: args.driver.into(),
        ..Default::default()
    };
    let devices = worker.get_device_list(&options)?;

    if devices.is_empty() {
        println!("{}", "No devices found.".muted());
        return Ok(());
    }
    for device in devices {
        println!(
            "{}  {} {}",
            device.id.device_id(),
            device.name,
            format!("({})", device.driver).muted()
        );
    }
    Ok(())
}

fn cmd_scan(cli: &Cli, worker: &mut dyn WorkerApi, args: &cli::ScanArgs) -> scanbridge::Result<()> {
    std::fs::create_dir_all(&args.output)?;
    if let Some(staging) = &args.staging {
        worker.init(Some(staging.as_path()))?;
    }

    let mut options = ScanOptions::for_device(ScanDevice::new(
        args.device.clone(),
        String::new(),
        args.driver.into(),
    ));
    options.dpi = args.dpi;
    options.bit_depth = args.bit_depth.into();
    options.source = args.source();
    options.max_pages = args.pages;

    // Write failures are remembered and reported after the stream ends, so
    // the channel is always drained to its terminal item.
    let mut written = Vec::new();
    let mut write_error: Option<std::io::Error> = None;
    worker.scan(&options, &mut |event| match event {
        ScanEvent::PageStart => tracing::info!("Page started"),
        ScanEvent::Progress { value } => tracing::debug!(progress = value, "Scanning"),
        ScanEvent::Image { image } => {
            if write_error.is_some() {
                return;
            }
            let path = args
                .output
                .join(format!("page-{:03}.{}", image.page, image.format.extension()));
            match image.data.load().and_then(|bytes| std::fs::write(&path, bytes)) {
                Ok(()) => {
                    if !cli.quiet {
                        println!(
                            "{} {}x{} {}",
                            format!("page {}", image.page).label(),
                            image.width,
                            image.height,
                            path.display().path_style()
                        );
                    }
                    if let ImageData::Staged { path: staged } = &image.data {
                        let _ = std::fs::remove_file(staged);
                    }
                    written.push(path);
                }
                Err(e) => write_error = Some(e),
            }
        }
    })?;
    if let Some(e) = write_error {
        return Err(BridgeError::Io(e));
    }

    if !cli.quiet {
        println!(
            "{}",
            format!("Scanned {} page(s)", written.len()).success()
        );
    }
    Ok(())
}

fn cmd_configure(
    worker: &mut dyn WorkerApi,
    args: &cli::ConfigureArgs,
) -> scanbridge::Result<()> {
    match worker.native_device_ui(&args.device, WindowHandle(args.window))? {
        None => println!("{}", "Dialog cancelled.".muted()),
        Some(config) => {
            println!("{}", "Device Configuration".section_header());
            println!("{} {}", "Item:".label(), config.item_name);
            for (key, value) in &config.device_props {
                println!("{} {} = {}", "device".label(), key, value);
            }
            for (key, value) in &config.item_props {
                println!("{} {} = {}", "item".label(), key, value);
            }
        }
    }
    Ok(())
}

fn cmd_thumbnail(
    worker: &mut dyn WorkerApi,
    args: &cli::ThumbnailArgs,
) -> scanbridge::Result<()> {
    let bytes = std::fs::read(&args.input)?;
    let thumbnail = worker.render_thumbnail(&ImageData::inline(bytes), args.size)?;
    write_output(&args.output, &thumbnail)
}

fn cmd_render_pdf(
    worker: &mut dyn WorkerApi,
    args: &cli::RenderPdfArgs,
) -> scanbridge::Result<()> {
    let page = worker.render_pdf(&args.input, args.dpi)?;
    write_output(&args.output, &page)
}

fn cmd_mail_check(
    worker: &mut dyn WorkerApi,
    args: &cli::MailCheckArgs,
) -> scanbridge::Result<()> {
    let client = args.client.as_deref().unwrap_or("default");
    if worker.can_load_mail(args.client.as_deref())? {
        println!("{} {}", client.label(), "available".success());
    } else {
        println!("{} {}", client.label(), "not available".muted());
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> scanbridge::Result<()> {
    std::fs::write(path, bytes)?;
    println!(
        "{} {} ({} bytes)",
        "Wrote".success(),
        path.display().path_style(),
        bytes.len()
    );
    Ok(())
}
