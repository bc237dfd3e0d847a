mod config;
mod logging;
mod term;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Password, Select, theme::ColorfulTheme};
use diskshot_core::size::pretty_size;
use diskshot_core::{BlockDevice, EngineConfig, ImagingOptions, PartitionSelection, platform};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "diskshot")]
#[command(about = "Create byte-exact, optionally encrypted and compressed disk images", version)]
struct Cli {
    /// Engine configuration file (TOML). Defaults to ./diskshot.toml if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Image a device or partition into a file interactively
    Create {
        /// Output image file; `.enc` and `.gz` are appended as needed
        #[arg(required = true)]
        image: PathBuf,

        /// Compress the image with gzip
        #[arg(short = 'z', long)]
        compress: bool,

        /// Encrypt the image with AES-256-CBC
        #[arg(short, long)]
        encrypt: bool,

        /// Source device or partition, skipping the selection menu
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
    /// List block devices and their partitions
    List,
}

/// Presents a menu of devices, then of the chosen device's partitions.
fn select_source(devices: &[BlockDevice]) -> Result<PathBuf> {
    if devices.is_empty() {
        return Err(anyhow!("No block devices found."));
    }
    let theme = ColorfulTheme::default();

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let index = Select::with_theme(&theme)
        .with_prompt("Select the source device to image")
        .items(&items)
        .default(0)
        .interact()?;
    let device = &devices[index];
    if device.partitions.is_empty() {
        return Ok(device.path.clone());
    }

    let mut items = vec![format!("Entire device ({})", pretty_size(device.size))];
    items.extend(device.partitions.iter().map(|p| p.to_string()));
    let choice = Select::with_theme(&theme)
        .with_prompt("Image the whole device or a single partition?")
        .items(&items)
        .default(0)
        .interact()?;

    let mut selection = PartitionSelection::new();
    if let Some(partition) = choice.checked_sub(1).map(|i| &device.partitions[i]) {
        selection.toggle(partition);
    }
    Ok(selection
        .selected(device)
        .map_or_else(|| device.path.clone(), |p| p.path.clone()))
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn prompt_passphrase() -> Result<String> {
    let passphrase = Password::with_theme(&ColorfulTheme::default())
        .with_prompt("Encryption passphrase")
        .with_confirmation("Repeat passphrase", "The passphrases do not match.")
        .interact()?;
    Ok(passphrase)
}

fn prompt_admin_password(source: &Path) -> Result<String> {
    println!(
        "{} Administrator privileges are required to read '{}'.",
        style("NOTE:").yellow().bold(),
        source.display()
    );
    let password = Password::with_theme(&ColorfulTheme::default())
        .with_prompt("Administrator password")
        .interact()?;
    Ok(password)
}

/// Enumerates devices on a background thread while a spinner runs.
fn scan_devices(config: &EngineConfig) -> Result<Vec<BlockDevice>> {
    let listing = platform::spawn_listing(config).context("Failed to start device scan")?;
    let spinner = ProgressBar::new_spinner();
    spinner.set_message("Scanning block devices...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let devices = listing.recv().context("Device scan ended without a result");
    spinner.finish_and_clear();
    devices
}

fn list(config: &EngineConfig) -> Result<()> {
    let devices = scan_devices(config)?;
    if devices.is_empty() {
        println!("No block devices found.");
        return Ok(());
    }

    println!("Found {} block devices:", devices.len());
    println!("\n  {:<15} {:<25} {:>10}", "DEVICE", "MODEL", "SIZE");
    println!("  {:-<15} {:-<25} {:-<10}", "", "", "");
    for device in &devices {
        println!(
            "  {:<15} {:<25} {:>10}",
            device.path.display(),
            device.model,
            pretty_size(device.size)
        );
        for partition in &device.partitions {
            println!("    {partition}");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create(config: EngineConfig, image: PathBuf, options: ImagingOptions, device: Option<PathBuf>) -> Result<()> {
    use diskshot_core::pipeline::output_path;
    use diskshot_core::{Credentials, ExecutionController, ImagingJob, JobEvent, JobState, Secret, elevate};
    use indicatif::ProgressStyle;

    options.validate()?;
    let source = match device {
        Some(path) => path,
        None => select_source(&scan_devices(&config)?)?,
    };

    let mut credentials = Credentials::default();
    if options.encrypt {
        credentials.passphrase = Some(Secret::from(prompt_passphrase()?));
    }
    if elevate::needs_elevation(&source) {
        credentials.elevation = Some(Secret::from(prompt_admin_password(&source)?));
    }

    let output = output_path(&image, &options);
    println!("This will copy every byte of '{}' into an image file.", source.display());
    println!("  Source: {}", style(source.display()).cyan());
    println!("  Output: {}", style(output.display()).cyan());
    let features = options.features();
    if !features.is_empty() {
        println!("  Image:  {}", features.join(", "));
    }
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Imaging cancelled.");
        return Ok(());
    }
    println!();

    let mut controller = ExecutionController::new(config);
    let token = controller.cancel_token();
    ctrlc::set_handler(move || token.cancel())?;

    let job = ImagingJob::new(&source, &image)
        .with_options(options)
        .with_credentials(credentials);
    let events = controller.start(job).context("Failed to start imaging job")?;

    let bar = ProgressBar::new(100);
    bar.set_prefix("Imaging");
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {pos:>3}% {msg}")?
            .progress_chars("■ "),
    );

    let mut outcome = None;
    for event in events {
        match event {
            JobEvent::State(state) => tracing::debug!(?state, "Job state changed"),
            JobEvent::Log(line) => bar.println(line),
            JobEvent::Progress(progress) => {
                if let Some(percent) = progress.percent {
                    bar.set_position(percent.into());
                }
                if let Some(speed) = &progress.throughput {
                    bar.set_message(speed.to_string());
                }
            }
            JobEvent::Finished(finished) => outcome = Some(finished),
        }
    }
    let joined = controller.join();
    let outcome = outcome.or(joined).context("Imaging job ended without an outcome")?;

    match outcome.state {
        JobState::Completed => {
            bar.finish_with_message("Done.");
            println!("\n✨ {} Saved to {}.", outcome.message, style(output.display()).cyan());
            if let Some(checksum) = &outcome.checksum {
                println!("  SHA-256: {checksum}");
            }
            Ok(())
        }
        JobState::Cancelled => {
            bar.abandon_with_message("Cancelled.");
            Err(anyhow!(outcome.message))
        }
        _ => {
            bar.abandon_with_message("❌ Operation failed.");
            Err(anyhow!(outcome.message))
        }
    }
}

#[cfg(not(unix))]
fn create(_config: EngineConfig, _image: PathBuf, _options: ImagingOptions, _device: Option<PathBuf>) -> Result<()> {
    Err(anyhow!("Imaging is only supported on Unix-like systems."))
}

fn main() -> Result<()> {
    // Restores the terminal when main() exits.
    let _echo_guard = term::EchoGuard::new();

    let cli = Cli::parse();
    logging::init(logging::LogConfig {
        json: cli.log_json,
        verbose: cli.verbose,
    });
    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Create {
            image,
            compress,
            encrypt,
            device,
        } => {
            let options = ImagingOptions {
                compress,
                encrypt,
                ..Default::default()
            };
            create(config, image, options, device)
        }
        Commands::List => list(&config),
    }
}
