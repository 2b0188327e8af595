//! Printer listing.

use {anyhow::Result, beedrive::detect_printers, console::style};

/// List attached printers.
pub(crate) fn cmd_list(json: bool) -> Result<()> {
    let printers = detect_printers();

    if json {
        let entries: Vec<serde_json::Value> = printers
            .iter()
            .map(|p| {
                serde_json::json!({
                    "kind": p.kind.name(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                    "bus": p.bus,
                    "address": p.address,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "printers": entries,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Attached printers:")
            .bold()
            .underlined()
    );

    if printers.is_empty() {
        eprintln!("  {}", style("No printers found").dim());
        return Ok(());
    }

    for printer in &printers {
        let product = printer
            .product
            .as_deref()
            .unwrap_or("");
        eprintln!(
            "  {} {} [{}] ({:04X}:{:04X}){}",
            style("•").green(),
            style(printer.serial_number.as_deref().unwrap_or("no serial")).cyan(),
            style(printer.kind.name()).yellow(),
            printer.vid,
            printer.pid,
            if product.is_empty() {
                String::new()
            } else {
                format!(" - {}", style(product).dim())
            }
        );
    }

    if printers.len() == 1 {
        eprintln!(
            "\n{} This printer will be used by default",
            style("→").green().bold()
        );
    }

    Ok(())
}
