//! File transfer to the printer.
//!
//! Two transfer shapes share this module:
//!
//! - **Block transfer** ([`engine`]): G-code streamed to the SD card in
//!   blocks of `message_size * block_size` bytes. Each message is
//!   acknowledged individually and recovered with a buffer clean plus
//!   reconnect when the acknowledgment does not arrive.
//! - **Firmware flash** ([`firmware`]): a flat stream of small chunks, each
//!   echoed back byte-for-byte by the bootloader. Any mismatch aborts.
//!
//! Progress is published as a whole [`TransferProgress`] value into a
//! [`ProgressCell`]; readers always see a consistent snapshot.

pub mod engine;
pub mod firmware;
pub mod sd;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub use engine::{BlockPlan, BlockTransfer, MessageOutcome};
pub use sd::{DEFAULT_SD_NAME, sanitize_sd_name};

use crate::channel::CommandChannel;
use crate::error::Result;

/// What a transfer job does with its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferKind {
    /// Copy G-code to the SD card.
    Gcode,
    /// Flash a firmware image through the bootloader.
    Firmware,
    /// Copy G-code to the SD card and start printing it.
    Print,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gcode => write!(f, "gcode"),
            Self::Firmware => write!(f, "firmware"),
            Self::Print => write!(f, "print"),
        }
    }
}

/// A requested transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// File to send.
    pub source: PathBuf,
    /// Transfer kind.
    pub kind: TransferKind,
    /// SD file name for G-code and print jobs, version string for firmware
    /// jobs. Defaults apply when absent.
    pub destination: Option<String>,
}

impl TransferJob {
    /// Create a job for `source`.
    pub fn new(source: impl Into<PathBuf>, kind: TransferKind) -> Self {
        Self {
            source: source.into(),
            kind,
            destination: None,
        }
    }

    /// Set the destination name or firmware version.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sanitized SD file name for this job.
    pub fn sd_name(&self) -> String {
        self.destination
            .as_deref()
            .map_or_else(|| DEFAULT_SD_NAME.to_string(), sanitize_sd_name)
    }

    /// Version string written after a firmware flash.
    pub fn firmware_version(&self) -> &str {
        self.destination
            .as_deref()
            .unwrap_or(firmware::DEFAULT_FIRMWARE_VERSION)
    }
}

/// Point-in-time progress of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferProgress {
    /// Bytes confirmed by the printer.
    pub bytes_transferred: u64,
    /// Size of the source file.
    pub total_bytes: u64,
    /// Blocks completed.
    pub blocks_done: u64,
    /// Blocks in the file (0 for firmware streams).
    pub total_blocks: u64,
    /// Transmission errors recovered so far.
    pub errors_resolved: u32,
}

impl TransferProgress {
    /// Share of the file confirmed, or `None` for an empty file.
    pub fn percent(&self) -> Option<f64> {
        (self.total_bytes > 0)
            .then(|| self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0)
    }
}

/// Shared slot holding the latest progress snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProgressCell(Arc<Mutex<TransferProgress>>);

impl ProgressCell {
    /// Replace the snapshot.
    pub fn publish(&self, progress: TransferProgress) {
        *self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = progress;
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> TransferProgress {
        *self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Back to zero.
    pub fn reset(&self) {
        self.publish(TransferProgress::default());
    }
}

/// Cooperative cancellation flag, checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag for the next job.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a transfer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    /// Final progress values.
    pub progress: TransferProgress,
    /// Whether the run stopped on a cancel request.
    pub cancelled: bool,
    /// Wall time of the data phase.
    pub elapsed: Duration,
}

/// Run `job` to completion on `channel`.
pub fn run_job(
    channel: &mut CommandChannel,
    job: &TransferJob,
    progress: &ProgressCell,
    cancel: &CancelToken,
) -> Result<TransferSummary> {
    match job.kind {
        TransferKind::Gcode => send_gcode(channel, &job.source, &job.sd_name(), progress, cancel),
        TransferKind::Print => {
            let name = job.sd_name();
            let summary = send_gcode(channel, &job.source, &name, progress, cancel)?;
            if !summary.cancelled {
                sd::open_file(channel, &name)?;
                sd::start_print(channel, &name)?;
            }
            Ok(summary)
        },
        TransferKind::Firmware => {
            firmware::flash_file(channel, &job.source, job.firmware_version(), progress)
        },
    }
}

/// Create `sd_name` on the SD card and stream `source` into it.
pub fn send_gcode(
    channel: &mut CommandChannel,
    source: &Path,
    sd_name: &str,
    progress: &ProgressCell,
    cancel: &CancelToken,
) -> Result<TransferSummary> {
    let file = std::fs::File::open(source)?;
    let total = file.metadata()?.len();

    sd::create_file(channel, sd_name)?;
    BlockTransfer::new(channel, progress, cancel).send(std::io::BufReader::new(file), total)
}
