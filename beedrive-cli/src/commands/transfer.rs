//! G-code copy, print and firmware flash commands.

use {
    crate::{Cli, CliError, set_transfer_running, use_fancy_output, was_interrupted},
    anyhow::{Context, Result, bail},
    beedrive::{Printer, TransferOutcome, TransferReport},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    std::{path::Path, thread, time::Duration},
};

/// How often the progress bar samples the transfer.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Fail early when the source file cannot be read.
pub(crate) fn check_source(file: &Path) -> Result<()> {
    let metadata = std::fs::metadata(file)
        .with_context(|| format!("Cannot read {}", file.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a file", file.display());
    }
    Ok(())
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    let pb = ProgressBar::new(100);
    if cli.quiet || !use_fancy_output() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
        return pb;
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

/// Drive the progress bar until the background job ends.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn follow_transfer(cli: &Cli, printer: &mut Printer, label: &str) -> Result<TransferReport> {
    let pb = progress_bar(cli);
    pb.set_message(label.to_string());

    set_transfer_running(true);
    let mut cancel_requested = false;
    while printer.is_transferring() {
        if was_interrupted() && !cancel_requested {
            printer.cancel_transfer();
            cancel_requested = true;
            pb.set_message("Cancelling...");
        }
        if let Some(percent) = printer.transfer_progress() {
            pb.set_position(percent.clamp(0.0, 100.0) as u64);
        }
        thread::sleep(POLL_INTERVAL);
    }
    set_transfer_running(false);

    let report = printer
        .wait_transfer()
        .context("Transfer ended without a report")?;
    if report.is_success() {
        pb.finish_with_message("done");
    } else {
        pb.abandon();
    }
    Ok(report)
}

/// Turn a finished report into the command result.
fn finish(cli: &Cli, report: TransferReport) -> Result<()> {
    let progress = report.progress;
    match report.outcome {
        TransferOutcome::Completed => {
            if !cli.quiet {
                let secs = report.elapsed.as_secs_f64();
                let speed = if secs > 0.0 {
                    progress.bytes_transferred as f64 / 1024.0 / secs
                } else {
                    0.0
                };
                eprintln!(
                    "{} {} bytes in {secs:.1}s ({speed:.1} KB/s, {} errors resolved)",
                    style("✓").green(),
                    progress.bytes_transferred,
                    progress.errors_resolved
                );
            }
            Ok(())
        },
        TransferOutcome::Cancelled => Err(CliError::Cancelled(format!(
            "Transfer stopped after {} of {} bytes",
            progress.bytes_transferred, progress.total_bytes
        ))
        .into()),
        TransferOutcome::Failed(err) => Err(anyhow::Error::new(err).context(format!(
            "Transfer of {} failed after {} of {} bytes",
            report.job.source.display(),
            progress.bytes_transferred,
            progress.total_bytes
        ))),
    }
}

/// Copy a G-code file to the SD card.
pub(crate) fn cmd_gcode(
    cli: &Cli,
    printer: &mut Printer,
    file: &Path,
    name: Option<&str>,
) -> Result<()> {
    printer
        .transfer_gcode(file, name)
        .context("Failed to start the transfer")?;
    let report = follow_transfer(cli, printer, "Copying to SD")?;
    let sd_name = report.job.sd_name();
    finish(cli, report)?;
    if !cli.quiet {
        eprintln!("{} Stored as {}", style("✓").green(), style(sd_name).cyan());
    }
    Ok(())
}

/// Copy a G-code file and start printing it.
pub(crate) fn cmd_print(
    cli: &Cli,
    printer: &mut Printer,
    file: &Path,
    name: Option<&str>,
    temperature: Option<f64>,
) -> Result<()> {
    if let (Some(t), false) = (temperature, cli.quiet) {
        eprintln!("{} Heating nozzle to {t:.1} C", style("🔥").red());
    }
    printer
        .print_file(file, name, temperature)
        .context("Failed to start the print")?;
    let report = follow_transfer(cli, printer, "Copying to SD")?;
    let sd_name = report.job.sd_name();
    finish(cli, report)?;
    if !cli.quiet {
        eprintln!("{} Printing {}", style("✓").green(), style(sd_name).cyan());
    }
    Ok(())
}

/// Flash a firmware image.
pub(crate) fn cmd_flash(
    cli: &Cli,
    printer: &mut Printer,
    file: &Path,
    version: Option<&str>,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Flashing {} (the printer restarts in bootloader mode)",
            style("📦").cyan(),
            file.display()
        );
    }
    printer
        .flash_firmware(file, version)
        .context("Failed to start flashing")?;
    let report = follow_transfer(cli, printer, "Flashing firmware")?;
    let version = report.job.firmware_version().to_string();
    finish(cli, report)?;
    if !cli.quiet {
        eprintln!(
            "{} Firmware {} written; run {} to boot it",
            style("✓").green(),
            style(version).cyan(),
            style("beedrive switch firmware").cyan()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_source_missing_file() {
        let err = check_source(Path::new("/nonexistent/benchy.gcode")).unwrap_err();
        assert!(err.to_string().contains("benchy.gcode"));
    }

    #[test]
    fn test_check_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_source(dir.path()).is_err());
    }

    #[test]
    fn test_check_source_accepts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, "G28\n").unwrap();
        assert!(check_source(&path).is_ok());
    }
}
