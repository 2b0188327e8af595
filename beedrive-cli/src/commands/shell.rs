//! Interactive command console.
//!
//! Every line is sent to the printer and the reply printed. Lines starting
//! with `-` are handled locally.

use {
    crate::config::Config,
    anyhow::Result,
    beedrive::{Printer, Reply},
    console::style,
    std::io::{self, BufRead, Write},
};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellLine {
    Empty,
    Exit,
    Status,
    Mode,
    Clean,
    Help,
    UnknownLocal(String),
    Command(String),
}

impl ShellLine {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(local) = line.strip_prefix('-') else {
            return Self::Command(line.to_string());
        };
        match local.trim().to_ascii_lowercase().as_str() {
            "exit" | "quit" => Self::Exit,
            "status" => Self::Status,
            "mode" => Self::Mode,
            "clean" => Self::Clean,
            "help" => Self::Help,
            other => Self::UnknownLocal(other.to_string()),
        }
    }
}

fn print_help() {
    eprintln!("  {}  leave the console", style("-exit").cyan());
    eprintln!("  {}  show the run status", style("-status").cyan());
    eprintln!("  {}  show the printer mode", style("-mode").cyan());
    eprintln!("  {}  drain stale replies", style("-clean").cyan());
    eprintln!("  anything else is sent to the printer");
}

fn clean_message(tries_left: usize) -> String {
    format!("Buffer clean ({tries_left} tries left)")
}

/// Run the console until `-exit` or end of input.
pub(crate) fn cmd_shell(printer: &mut Printer, config: &Config) -> Result<()> {
    eprintln!(
        "{} Console on {} ({} mode). Type {} for local commands.",
        style("ℹ").blue(),
        printer.identity().label(),
        printer.last_mode(),
        style("-help").cyan()
    );

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("{} ", style(">").green().bold());
        io::stderr().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;

        // Printer errors are reported and the console stays open.
        let outcome = match ShellLine::parse(&line) {
            ShellLine::Empty => Ok(()),
            ShellLine::Exit => break,
            ShellLine::Help => {
                print_help();
                Ok(())
            },
            ShellLine::Status => printer
                .status(config.status_timeout())
                .map(|status| println!("{status}")),
            ShellLine::Mode => printer
                .printer_mode()
                .map(|mode| println!("{mode}")),
            ShellLine::Clean => printer
                .clean_buffer()
                .map(|left| println!("{}", clean_message(left))),
            ShellLine::UnknownLocal(name) => {
                eprintln!("{} Unknown local command -{name}", style("⚠").yellow());
                Ok(())
            },
            ShellLine::Command(command) => printer
                .send_command(&command, &Reply::marker_within("ok", config.status_timeout()))
                .map(|reply| println!("{}", reply.trim_end())),
        };
        if let Err(e) = outcome {
            eprintln!("{} {e}", style("Error:").red().bold());
        }
    }
    Ok(())
}
