//! # beedrive
//!
//! Host-side client for BEEVERYCREATIVE 3D printers over USB.
//!
//! The printers speak a line-oriented G-code/M-code protocol over a pair of
//! bulk endpoints. This crate turns that half-duplex link into a reliable
//! request/response channel and builds on it:
//!
//! - Mode detection and switching between bootloader and firmware
//! - Run-status polling with sticky pause/shutdown flags
//! - Block transfer of G-code to the SD card with per-message recovery
//! - Firmware flashing with byte-for-byte echo verification
//! - Background transfer jobs with progress and cooperative cancellation
//!
//! ## Features
//!
//! - `native` (default): USB access through `rusb`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::{path::Path, thread, time::Duration};
//!
//! use beedrive::Printer;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut printer = Printer::connect(None)?;
//!         println!("Nozzle at {:.1} C", printer.nozzle_temperature()?);
//!
//!         printer.transfer_gcode(Path::new("benchy.gcode"), Some("benchy"))?;
//!         while let Some(percent) = printer.transfer_progress() {
//!             println!("{percent:.1}%");
//!             thread::sleep(Duration::from_secs(1));
//!         }
//!         if let Some(report) = printer.wait_transfer() {
//!             println!("{:?}", report.outcome);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod device;
pub mod error;
pub mod mode;
pub mod orchestrator;
pub mod port;
pub mod printer;
pub mod profile;
pub mod reply;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

#[cfg(feature = "native")]
pub use port::UsbPort;
pub use {
    channel::{CommandChannel, Reply},
    device::{PrinterIdentity, PrinterKind, detect_printers, find_printer, format_printer_list},
    error::{Error, Result},
    mode::{PrinterMode, RunStatus, SessionFlags},
    orchestrator::{TransferOrchestrator, TransferOutcome, TransferReport},
    port::BulkPort,
    printer::Printer,
    profile::{ProtocolProfile, StatusCodeMap, Timing},
    reply::{PrintVariables, ReplyFields},
    transfer::{TransferJob, TransferKind, TransferProgress},
    transport::Transport,
};
