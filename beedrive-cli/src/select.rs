//! Printer selection.
//!
//! Picks the printer to talk to:
//! - An explicit serial number (command line or config) must match
//! - A single attached printer is used directly
//! - Several printers prompt with dialoguer, or fail in non-interactive mode

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    beedrive::{PrinterIdentity, detect_printers, format_printer_list},
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for printer selection.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Serial number given on the command line.
    pub serial: Option<String>,
    /// Fail instead of prompting.
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select the printer to open.
pub fn select_printer(options: &SelectOptions, config: &Config) -> Result<PrinterIdentity> {
    let printers = detect_printers();
    debug!("Detected {} printer(s)", printers.len());

    let serial = options
        .serial
        .as_deref()
        .or(config.connection.serial.as_deref());
    if let Some(serial) = serial {
        return find_by_serial(printers, serial);
    }

    if options.non_interactive {
        return select_non_interactive(printers);
    }

    match printers.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_interactive(printers)
        },
        Ordering::Equal => select_non_interactive(printers),
        Ordering::Less => Err(usage_err("No printer found. Is it plugged in and powered on?")),
    }
}

fn find_by_serial(printers: Vec<PrinterIdentity>, serial: &str) -> Result<PrinterIdentity> {
    printers
        .into_iter()
        .find(|p| p.serial_number.as_deref() == Some(serial))
        .ok_or_else(|| usage_err(&format!("No printer with serial number {serial}")))
}

fn select_non_interactive(printers: Vec<PrinterIdentity>) -> Result<PrinterIdentity> {
    match printers.len().cmp(&1) {
        Ordering::Equal => {
            let printer = printers
                .into_iter()
                .next()
                .ok_or_else(|| usage_err("No printer found"))?;
            info!("Auto-selected printer: {}", printer.label());
            Ok(printer)
        },
        Ordering::Greater => Err(usage_err(
            "Multiple printers connected; select one with --serial",
        )),
        Ordering::Less => Err(usage_err("No printer found. Is it plugged in and powered on?")),
    }
}

pub(crate) fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Interactive selection needs a terminal; use --serial or --non-interactive",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Selection cancelled".to_string()).into()
            } else {
                usage_err("Prompt failed")
            }
        },
    }
}

fn select_interactive(printers: Vec<PrinterIdentity>) -> Result<PrinterIdentity> {
    eprintln!(
        "{} Found {} printers",
        style("ℹ").blue(),
        printers.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = format_printer_list(&printers)
        .into_iter()
        .map(|l| console::truncate_str(&l, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a printer")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => printers
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid printer index: {index}")),
        None => Err(CliError::Cancelled("Selection cancelled".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(serial: &str) -> PrinterIdentity {
        PrinterIdentity::new(0x29C9, 0x0001).with_serial_number(serial)
    }

    fn usage_message(err: &anyhow::Error) -> String {
        match err.downcast_ref::<CliError>() {
            Some(CliError::Usage(msg)) => msg.clone(),
            other => panic!("expected usage error, got {other:?}"),
        }
    }

    #[test]
    fn test_select_options_default() {
        let options = SelectOptions::default();
        assert!(options.serial.is_none());
        assert!(!options.non_interactive);
    }

    #[test]
    fn test_non_interactive_single_printer() {
        let selected = select_non_interactive(vec![printer("BEE1")]).unwrap();
        assert_eq!(selected.serial_number.as_deref(), Some("BEE1"));
    }

    #[test]
    fn test_non_interactive_multiple_printers_is_usage_error() {
        let err = select_non_interactive(vec![printer("BEE1"), printer("BEE2")]).unwrap_err();
        assert!(usage_message(&err).contains("Multiple"));
    }

    #[test]
    fn test_non_interactive_no_printer_is_usage_error() {
        let err = select_non_interactive(Vec::new()).unwrap_err();
        assert!(usage_message(&err).contains("No printer"));
    }

    #[test]
    fn test_find_by_serial() {
        let printers = vec![printer("BEE1"), printer("BEE2")];
        let selected = find_by_serial(printers.clone(), "BEE2").unwrap();
        assert_eq!(selected.serial_number.as_deref(), Some("BEE2"));

        let err = find_by_serial(printers, "BEE9").unwrap_err();
        assert!(usage_message(&err).contains("BEE9"));
    }
}
