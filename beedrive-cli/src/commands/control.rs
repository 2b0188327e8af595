//! Mode, status and raw command implementations.

use {
    crate::{Cli, config::Config},
    anyhow::{Context, Result},
    beedrive::{PrintVariables, Printer, PrinterMode, Reply, RunStatus, SessionFlags},
    console::style,
    std::time::Duration,
};

/// `--timeout` in seconds, or the configured default.
pub(crate) fn timeout_or(secs: Option<u64>, default: Duration) -> Duration {
    secs.map_or(default, Duration::from_secs)
}

/// Reply wait requested by the `send` flags.
///
/// A status wait always carries a deadline; a marker wait only when
/// `--timeout` was given.
pub(crate) fn reply_for(
    wait: Option<&str>,
    status: Option<u32>,
    timeout: Option<u64>,
    config: &Config,
) -> Reply {
    match (wait, status) {
        (_, Some(code)) => Reply::Status {
            code,
            timeout: timeout_or(timeout, config.status_timeout()),
        },
        (Some(marker), None) => match timeout {
            Some(secs) => Reply::marker_within(marker, Duration::from_secs(secs)),
            None => Reply::marker(marker),
        },
        (None, None) => Reply::Immediate,
    }
}

/// Print the current mode.
pub(crate) fn cmd_mode(printer: &mut Printer) -> Result<()> {
    let mode = printer
        .printer_mode()
        .context("Failed to query the printer mode")?;
    println!("{mode}");
    Ok(())
}

/// Reboot into `target`.
pub(crate) fn cmd_switch(cli: &Cli, printer: &mut Printer, target: PrinterMode) -> Result<()> {
    if !cli.quiet {
        eprintln!("{} Switching to {target} mode...", style("🔄").cyan());
    }
    let switched = printer
        .switch_mode(target)
        .with_context(|| format!("Failed to switch to {target} mode"))?;
    if !cli.quiet {
        if switched {
            eprintln!("{} Printer is now in {target} mode", style("✓").green());
        } else {
            eprintln!("{} Printer was already in {target} mode", style("ℹ").blue());
        }
    }
    Ok(())
}

fn flag_names(flags: SessionFlags) -> Vec<&'static str> {
    let mut names = Vec::new();
    if flags.pausing {
        names.push("pausing");
    }
    if flags.paused {
        names.push("paused");
    }
    if flags.shutdown {
        names.push("shutdown");
    }
    names
}

/// Human summary of an `M32` reply.
fn progress_line(vars: &PrintVariables) -> Option<String> {
    let percent = vars.percent_complete()?;
    let mut line = format!("Printed {percent:.1}%");
    if let (Some(elapsed), Some(estimated)) = (vars.elapsed_minutes, vars.estimated_minutes) {
        line.push_str(&format!(" ({elapsed} of ~{estimated} min)"));
    }
    Some(line)
}

/// Print the run status, print progress and any sticky session flags.
pub(crate) fn cmd_status(printer: &mut Printer, timeout: Duration) -> Result<()> {
    let status = printer
        .status(timeout)
        .context("Failed to read the run status")?;
    println!("{status}");

    if status == RunStatus::SdPrint {
        let vars = printer
            .print_variables()
            .context("Failed to read the print progress")?;
        if let Some(line) = progress_line(&vars) {
            eprintln!("{} {line}", style("ℹ").blue());
        }
    }

    let flags = flag_names(printer.flags());
    if !flags.is_empty() {
        eprintln!(
            "{} Session flags: {}",
            style("ℹ").blue(),
            flags.join(", ")
        );
    }
    Ok(())
}

/// Send one raw line and print the reply.
pub(crate) fn cmd_send(printer: &mut Printer, line: &str, reply: &Reply) -> Result<()> {
    let answer = printer
        .send_command(line, reply)
        .with_context(|| format!("Command {line:?} failed"))?;
    let answer = answer.trim_end();
    if !answer.is_empty() {
        println!("{answer}");
    }
    Ok(())
}

/// Print the nozzle temperature.
pub(crate) fn cmd_temp(printer: &mut Printer) -> Result<()> {
    let temperature = printer
        .nozzle_temperature()
        .context("Failed to read the nozzle temperature")?;
    println!("{temperature:.1}");
    Ok(())
}

/// List the files on the SD card.
pub(crate) fn cmd_files(printer: &mut Printer) -> Result<()> {
    let files = printer
        .sd_files()
        .context("Failed to list the SD card")?;
    if files.is_empty() {
        eprintln!("  {}", style("No files on the SD card").dim());
    }
    for file in files {
        println!("{file}");
    }
    Ok(())
}

/// Resume a paused or shut down print.
pub(crate) fn cmd_resume(cli: &Cli, printer: &mut Printer) -> Result<()> {
    printer.resume().context("Failed to resume")?;
    if !cli.quiet {
        eprintln!("{} Print resumed", style("✓").green());
    }
    Ok(())
}

/// Leave the shutdown state.
pub(crate) fn cmd_clear_shutdown(cli: &Cli, printer: &mut Printer) -> Result<()> {
    printer
        .clear_shutdown()
        .context("Failed to clear the shutdown state")?;
    if !cli.quiet {
        eprintln!("{} Shutdown cleared", style("✓").green());
    }
    Ok(())
}
