//! beedrive CLI - Command-line tool for BEETHEFIRST 3D printers.
//!
//! ## Features
//!
//! - List attached printers
//! - Query and switch the printer mode
//! - Send raw G-code with reply waits
//! - Copy G-code to the SD card, print it, flash firmware
//! - Interactive command shell
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use beedrive::{Printer, PrinterMode, ProtocolProfile, RunStatus};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by Ctrl-C while a transfer is running.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether Ctrl-C should cancel a transfer instead of exiting.
static TRANSFER_RUNNING: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed during the current transfer.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Route Ctrl-C to the transfer for as long as `running` is set.
pub(crate) fn set_transfer_running(running: bool) {
    INTERRUPTED.store(false, Ordering::SeqCst);
    TRANSFER_RUNNING.store(running, Ordering::SeqCst);
}

mod commands;
mod config;
mod select;

use config::Config;
use select::{SelectOptions, ensure_interactive_terminal, map_prompt_error, select_printer};

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// beedrive - Drive BEETHEFIRST 3D printers over USB.
///
/// Environment variables:
///   BEEDRIVE_SERIAL             - Serial number of the printer to use
///   BEEDRIVE_CONFIG             - Path to a configuration file
///   BEEDRIVE_NON_INTERACTIVE    - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "beedrive")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  beedrive list
  beedrive send M105
  beedrive print benchy.gcode --temperature 210")]
pub(crate) struct Cli {
    /// Serial number of the printer (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BEEDRIVE_SERIAL")]
    serial: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BEEDRIVE_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "BEEDRIVE_CONFIG")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Printer modes selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Main firmware (printing).
    Firmware,
    /// Bootloader (firmware updates).
    Bootloader,
}

impl From<ModeArg> for PrinterMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Firmware => PrinterMode::Firmware,
            ModeArg::Bootloader => PrinterMode::Bootloader,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List attached printers.
    List {
        /// Output the printer list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show whether the printer runs its bootloader or firmware.
    Mode,

    /// Reboot the printer into another mode.
    Switch {
        /// Target mode.
        #[arg(value_enum)]
        target: ModeArg,
    },

    /// Show the run status.
    Status {
        /// Seconds to wait for a status reply.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send a raw G-code/M-code line and print the reply.
    Send {
        /// Command line to send.
        line: String,

        /// Keep reading until this text appears in the reply.
        #[arg(long, conflicts_with = "status")]
        wait: Option<String>,

        /// Wait for `ok`, then poll until the printer reports this status code.
        #[arg(long)]
        status: Option<u32>,

        /// Seconds to wait for the reply.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the nozzle temperature.
    Temp,

    /// List files on the SD card.
    Files,

    /// Copy a G-code file to the SD card.
    Gcode {
        /// G-code file to send.
        file: PathBuf,

        /// Name on the SD card (sanitized to 8.3).
        #[arg(long)]
        name: Option<String>,
    },

    /// Flash a firmware image.
    Flash {
        /// Firmware image.
        file: PathBuf,

        /// Version string recorded after flashing.
        #[arg(long, value_name = "VERSION")]
        firmware_version: Option<String>,
    },

    /// Copy a G-code file to the SD card and print it.
    Print {
        /// G-code file to print.
        file: PathBuf,

        /// Name on the SD card (sanitized to 8.3).
        #[arg(long)]
        name: Option<String>,

        /// Nozzle temperature to heat to while the file is copied.
        #[arg(long)]
        temperature: Option<f64>,
    },

    /// Resume a paused or shut down print.
    Resume,

    /// Leave the shutdown state without resuming.
    ClearShutdown,

    /// Interactive command console.
    Shell,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            let label = match err.downcast_ref::<CliError>() {
                Some(CliError::Cancelled(_)) => style("Cancelled:").yellow().bold(),
                _ => style("Error:").red().bold(),
            };
            eprintln!("{label} {err:#}");
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

fn log_level(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let level = log_level(cli.quiet, cli.verbose);
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "beedrive v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| {
        if TRANSFER_RUNNING.load(Ordering::SeqCst) && !INTERRUPTED.swap(true, Ordering::SeqCst) {
            return;
        }
        std::process::exit(130);
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::List { json } => commands::info::cmd_list(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
        Commands::Mode => with_printer(&cli, &config, true, commands::control::cmd_mode),
        Commands::Switch { target } => with_printer(&cli, &config, false, |printer| {
            commands::control::cmd_switch(&cli, printer, (*target).into())
        }),
        Commands::Status { timeout } => {
            let timeout = commands::control::timeout_or(*timeout, config.status_timeout());
            with_printer(&cli, &config, false, |printer| {
                commands::control::cmd_status(printer, timeout)
            })
        },
        Commands::Send {
            line,
            wait,
            status,
            timeout,
        } => {
            let reply = commands::control::reply_for(wait.as_deref(), *status, *timeout, &config);
            with_printer(&cli, &config, true, |printer| {
                commands::control::cmd_send(printer, line, &reply)
            })
        },
        Commands::Temp => with_printer(&cli, &config, true, commands::control::cmd_temp),
        Commands::Files => with_printer(&cli, &config, true, commands::control::cmd_files),
        Commands::Resume => with_printer(&cli, &config, false, |printer| {
            commands::control::cmd_resume(&cli, printer)
        }),
        Commands::ClearShutdown => with_printer(&cli, &config, false, |printer| {
            commands::control::cmd_clear_shutdown(&cli, printer)
        }),
        Commands::Gcode { file, name } => {
            commands::transfer::check_source(file)?;
            with_printer(&cli, &config, true, |printer| {
                commands::transfer::cmd_gcode(&cli, printer, file, name.as_deref())
            })
        },
        Commands::Flash {
            file,
            firmware_version,
        } => {
            commands::transfer::check_source(file)?;
            let version = firmware_version
                .clone()
                .or_else(|| config.transfer.firmware_version.clone());
            with_printer(&cli, &config, false, |printer| {
                commands::transfer::cmd_flash(&cli, printer, file, version.as_deref())
            })
        },
        Commands::Print {
            file,
            name,
            temperature,
        } => {
            commands::transfer::check_source(file)?;
            let temperature = temperature.or(config.transfer.heat_temperature);
            with_printer(&cli, &config, true, |printer| {
                commands::transfer::cmd_print(&cli, printer, file, name.as_deref(), temperature)
            })
        },
        Commands::Shell => with_printer(&cli, &config, true, |printer| {
            commands::shell::cmd_shell(printer, &config)
        }),
    }
}

/// Connect, run `f`, and release the printer whatever the outcome.
fn with_printer<F>(cli: &Cli, config: &Config, check_shutdown: bool, f: F) -> Result<()>
where
    F: FnOnce(&mut Printer) -> Result<()>,
{
    let mut printer = connect(cli, config)?;
    let result = if check_shutdown {
        offer_shutdown_recovery(cli, config, &mut printer).and_then(|()| f(&mut printer))
    } else {
        f(&mut printer)
    };
    printer.close();
    result
}

/// Select and open the printer.
fn connect(cli: &Cli, config: &Config) -> Result<Printer> {
    let options = SelectOptions {
        serial: cli.serial.clone(),
        non_interactive: cli.non_interactive,
    };
    let identity = select_printer(&options, config)?;

    if !cli.quiet {
        eprintln!("{} Using {}", style("🔌").cyan(), identity.label());
    }
    let printer = Printer::open(&identity, ProtocolProfile::default())
        .with_context(|| format!("Failed to open {}", identity.label()))?;
    if !cli.quiet {
        eprintln!(
            "{} Connected ({} mode)",
            style("✓").green(),
            printer.last_mode()
        );
    }
    Ok(printer)
}

/// Offer to resume or clear a printer found in shutdown state.
fn offer_shutdown_recovery(cli: &Cli, config: &Config, printer: &mut Printer) -> Result<()> {
    if printer.last_mode() != PrinterMode::Firmware {
        return Ok(());
    }
    match printer.status(config.status_timeout()) {
        Ok(RunStatus::Shutdown) => {},
        Ok(_) => return Ok(()),
        Err(e) => {
            debug!("Skipping shutdown check: {e}");
            return Ok(());
        },
    }

    eprintln!(
        "{} Printer is in shutdown state",
        style("⚠").yellow().bold()
    );
    if cli.non_interactive || ensure_interactive_terminal().is_err() {
        eprintln!(
            "  Run {} or {} to continue.",
            style("beedrive resume").cyan(),
            style("beedrive clear-shutdown").cyan()
        );
        return Ok(());
    }

    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("What should happen with the suspended print?")
        .items(&["Resume the print", "Clear the shutdown", "Leave it for now"])
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match choice {
        Some(0) => printer.resume()?,
        Some(1) => printer.clear_shutdown()?,
        _ => {},
    }
    Ok(())
}
