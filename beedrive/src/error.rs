//! Error types for beedrive.

use std::io;
use thiserror::Error;

use crate::mode::PrinterMode;

/// Result type for beedrive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for beedrive operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (source file access).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// USB stack error.
    #[cfg(feature = "native")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No matching printer is attached.
    #[error("Printer not found")]
    DeviceNotFound,

    /// The device handle was closed or never opened.
    #[error("Printer is not connected")]
    NotConnected,

    /// A bounded wait expired before the expected reply arrived.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A command was refused because a file transfer owns the channel.
    #[error("Printer is busy with a file transfer")]
    Busy,

    /// Buffer cleaning could not bring the link back to a quiescent state.
    #[error("Command buffer is desynchronized and could not be cleaned")]
    Desync,

    /// A mode switch did not land in the requested mode.
    #[error("Mode switch to {target} failed, printer reports {observed}")]
    ModeSwitch {
        /// Requested mode.
        target: PrinterMode,
        /// Mode observed after the reconnect.
        observed: PrinterMode,
    },

    /// The operation needs the printer in another mode.
    #[error("Printer must be in {expected} mode (currently {actual})")]
    WrongMode {
        /// Mode the operation needs.
        expected: PrinterMode,
        /// Mode the printer reported.
        actual: PrinterMode,
    },

    /// The bootloader echoed different bytes than were sent.
    #[error("Firmware echo mismatch at byte offset {offset}")]
    EchoMismatch {
        /// Offset of the first byte of the rejected message.
        offset: u64,
    },

    /// SD card subsystem refused or never acknowledged an operation.
    #[error("SD card error: {0}")]
    Sd(String),

    /// Retries were exhausted during a block transfer.
    #[error(
        "Transfer aborted after {transferred} of {total} bytes ({errors_resolved} errors resolved)"
    )]
    TransferAborted {
        /// Bytes confirmed before the abort.
        transferred: u64,
        /// Source file size.
        total: u64,
        /// Transmission errors recovered before the fatal one.
        errors_resolved: u32,
    },

    /// Unexpected reply content.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}
