use anyhow::{Context, Result, anyhow};
use burnr_core::{
    BurnController, BurnError, Device, ErrorKind, Notification, PipelineConfig, RunHandle,
    Stage, fetch, platform,
};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "burnr")]
#[command(about = "Download an OS image and burn it onto a removable device", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an image and burn it onto a device interactively
    Burn {
        /// Image URL (http/https) or local file path
        #[arg(required = true)]
        source: String,

        /// Expected SHA-256 of the downloaded image
        #[arg(long)]
        sha256: Option<String>,

        /// Target device (e.g. /dev/sdb); prompts when omitted
        #[arg(short, long)]
        device: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// TOML file with pipeline settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Staging directory for the downloaded image
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        /// Milliseconds to wait for buffers to flush before ejecting
        #[arg(long)]
        settle_ms: Option<u64>,
    },
    /// List available removable devices
    List,
}

/// Disables `ECHOCTL` on Unix terminals while alive, so Ctrl+C during a burn
/// does not print `^C` through the progress bars.
struct TermRestorer {
    #[cfg(unix)]
    original: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original) = self.original {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a tracing subscriber was already installed");
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Maps the no-devices condition to a friendly message.
fn candidate_devices(controller: &BurnController) -> Result<Vec<Device>> {
    match controller.candidate_devices() {
        Err(BurnError::NoDevices) => Err(anyhow!("No removable devices found.")),
        other => Ok(other?),
    }
}

fn stage_bar(stage: Stage) -> Result<ProgressBar> {
    let label = match stage {
        Stage::Downloading => "Download",
        Stage::Preparing => "Prepare",
        Stage::Burning => "Burn",
        Stage::Ejecting => "Eject",
        Stage::Done => "Done",
    };

    let bar = match stage {
        Stage::Preparing | Stage::Ejecting => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {msg}")?,
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        }
        _ => {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {pos:>3}% {msg}")?
                    .progress_chars("■ "),
            );
            bar
        }
    };
    bar.set_prefix(label);
    Ok(bar)
}

/// Renders a run's notifications until the worker is done.
fn render(run: &RunHandle) -> Result<()> {
    let mut bar: Option<ProgressBar> = None;

    for notification in run.notifications().iter() {
        match notification {
            Notification::StageChanged(stage) => {
                if let Some(done) = bar.take() {
                    done.finish();
                }
                if stage != Stage::Done {
                    bar = Some(stage_bar(stage)?);
                }
            }
            Notification::Progress { percent, detail } => {
                if let Some(bar) = &bar {
                    if let Some(percent) = percent {
                        bar.set_position(u64::from(percent));
                    }
                    bar.set_message(detail);
                }
            }
            Notification::Finished(_) => {
                if let Some(bar) = bar.take() {
                    bar.abandon_with_message(style("✗ stopped").red().to_string());
                }
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn burn(
    source: String,
    sha256: Option<String>,
    device_id: Option<String>,
    yes: bool,
    no_verify: bool,
    config_path: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    settle_ms: Option<u64>,
) -> Result<()> {
    platform::request_elevated_privileges()?;

    let mut config = match config_path {
        Some(path) => PipelineConfig::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = staging_dir {
        config.staging_dir = dir;
    }
    if let Some(ms) = settle_ms {
        config.settle_delay_ms = ms;
    }
    if no_verify {
        config.verify = false;
    }

    let fetcher = fetch::fetcher_for(&source, sha256)?;
    let controller = BurnController::new(platform::backend(&config, fetcher)?, config);

    let devices = candidate_devices(&controller)?;
    let device = match device_id {
        Some(id) => devices
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow!("'{id}' is not a removable device"))?,
        None => select_device(&devices, "Select the target device to BURN to")?,
    };

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.display_name,
        device.size_gb(),
    );
    println!("  Device: {}", style(&device.id).cyan());
    println!("  Image:  {}", style(&source).cyan());
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Burn cancelled.");
        return Ok(());
    }
    println!();

    let _term_restorer = TermRestorer::new();
    let run = controller.start(device.clone())?;

    let cancel = run.cancel_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling after the current stage finishes...");
        cancel.request_cancel();
    })?;

    let rendered = render(&run);
    let outcome = run.wait();
    rendered?;

    for advisory in &outcome.advisories {
        println!("{} {}", style("NOTE:").yellow().bold(), advisory);
    }

    match outcome.error {
        None => {
            println!(
                "\n✨ Successfully burned {} onto {}.",
                style(&source).cyan(),
                style(&device.id).cyan()
            );
            Ok(())
        }
        Some(error) if error.kind == ErrorKind::WriteIncomplete => {
            println!(
                "\n{} The write to {} did not complete; the device may be unusable until it is burned again.",
                style("WARNING:").red().bold(),
                style(&device.id).cyan()
            );
            Err(error.into())
        }
        Some(error) if error.kind == ErrorKind::Cancelled => {
            println!("\nBurn cancelled.");
            Err(error.into())
        }
        Some(error) => Err(error.into()),
    }
}

fn list() -> Result<()> {
    let devices = platform::catalog()?.enumerate()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<12} {:<25} {:<10}", "DEVICE", "NAME", "SIZE");
    println!("  {:-<12} {:-<25} {:-<10}", "", "", "");
    for device in devices {
        println!(
            "  {:<12} {:<25} {:>7.1} GB",
            device.id,
            device.display_name,
            device.size_gb()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Burn {
            source,
            sha256,
            device,
            yes,
            no_verify,
            config,
            staging_dir,
            settle_ms,
        } => burn(
            source,
            sha256,
            device,
            yes,
            no_verify,
            config,
            staging_dir,
            settle_ms,
        ),
        Commands::List => list(),
    }
}
