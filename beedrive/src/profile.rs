//! Protocol parameters for a printer family.
//!
//! Firmware revisions differ in message geometry and status codes, not in
//! protocol shape, so all of that lives in one table instead of in
//! per-model code paths.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::mode::RunStatus;

/// Delays inserted between protocol steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause before and after each dispatched command.
    pub command_gap: Duration,
    /// Wait between closing the handle and re-enumerating.
    pub reconnect_settle: Duration,
    /// Pause between a buffer clean and the following reconnect.
    pub clean_pause: Duration,
    /// Interval between `M625` probes in a status wait.
    pub status_probe_interval: Duration,
    /// Interval between polls in a run-status query.
    pub status_poll_interval: Duration,
    /// Pause after a message write before reading its acknowledgment.
    pub ack_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_gap: Duration::from_millis(9),
            reconnect_settle: Duration::from_secs(3),
            clean_pause: Duration::from_millis(500),
            status_probe_interval: Duration::from_millis(500),
            status_poll_interval: Duration::from_secs(1),
            ack_delay: Duration::from_millis(1),
        }
    }
}

impl Timing {
    /// No delays at all. Intended for simulated printers.
    pub fn immediate() -> Self {
        Self {
            command_gap: Duration::ZERO,
            reconnect_settle: Duration::ZERO,
            clean_pause: Duration::ZERO,
            status_probe_interval: Duration::ZERO,
            status_poll_interval: Duration::ZERO,
            ack_delay: Duration::ZERO,
        }
    }
}

/// Map from numeric `S:<code>` values to run states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodeMap {
    entries: Vec<(i64, RunStatus)>,
}

impl Default for StatusCodeMap {
    fn default() -> Self {
        Self {
            entries: vec![
                (3, RunStatus::Ready),
                (4, RunStatus::Moving),
                (5, RunStatus::SdPrint),
                (6, RunStatus::Transfer),
                (7, RunStatus::Pause),
                (9, RunStatus::Shutdown),
            ],
        }
    }
}

impl StatusCodeMap {
    /// Build a map from explicit entries.
    pub fn new(entries: impl IntoIterator<Item = (i64, RunStatus)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .collect(),
        }
    }

    /// Run state for `code`.
    pub fn status(&self, code: i64) -> Option<RunStatus> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, s)| *s)
    }

    /// Numeric code for `status`.
    pub fn code(&self, status: RunStatus) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, s)| *s == status)
            .map(|(c, _)| *c)
    }
}

/// Message geometry, timeouts and retry bounds for one printer family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolProfile {
    /// Bytes per transfer message.
    pub message_size: usize,
    /// Messages per block.
    pub block_size: usize,
    /// Bytes per firmware flashing message.
    pub firmware_chunk_size: usize,
    /// Maximum bytes requested per read.
    pub read_length: usize,
    /// Default read timeout.
    pub read_timeout: Duration,
    /// Default write timeout.
    pub write_timeout: Duration,
    /// Write timeout for the buffer-clean sentinel.
    pub clean_write_timeout: Duration,
    /// Read timeout while waiting for a firmware echo.
    pub echo_read_timeout: Duration,
    /// Reads allowed while waiting for a message acknowledgment.
    pub ack_reads: u32,
    /// Reads allowed while waiting for a firmware echo.
    pub echo_reads: u32,
    /// Reads allowed while waiting for a block to open.
    pub block_open_reads: u32,
    /// Clean/reconnect cycles before a message failure turns fatal.
    pub clean_cycles: u32,
    /// Times one message may be re-sent.
    pub message_resends: u32,
    /// Tries for each SD handshake.
    pub sd_tries: u32,
    /// Attempts to re-find the device after a reset.
    pub reconnect_attempts: u32,
    /// Numeric status code table.
    pub status_codes: StatusCodeMap,
    /// Inter-step delays.
    pub timing: Timing,
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self {
            message_size: 512,
            block_size: 64,
            firmware_chunk_size: 64,
            read_length: 512,
            read_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(500),
            clean_write_timeout: Duration::from_millis(50),
            echo_read_timeout: Duration::from_millis(1000),
            ack_reads: 10,
            echo_reads: 10,
            block_open_reads: 50,
            clean_cycles: 5,
            message_resends: 5,
            sd_tries: 10,
            reconnect_attempts: 5,
            status_codes: StatusCodeMap::default(),
            timing: Timing::default(),
        }
    }
}

impl ProtocolProfile {
    /// Bytes per block.
    pub fn block_bytes(&self) -> usize {
        self.message_size * self.block_size
    }

    /// Set the message geometry.
    #[must_use]
    pub fn with_geometry(mut self, message_size: usize, block_size: usize) -> Self {
        self.message_size = message_size;
        self.block_size = block_size;
        self
    }

    /// Replace the delay table.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Replace the status code table.
    #[must_use]
    pub fn with_status_codes(mut self, codes: StatusCodeMap) -> Self {
        self.status_codes = codes;
        self
    }

    /// Reject geometries the transfer engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.message_size < 8 {
            return Err(Error::Config(format!(
                "message size {} is too small for the clean sentinel",
                self.message_size
            )));
        }
        if self.block_size == 0 || self.firmware_chunk_size == 0 || self.read_length == 0 {
            return Err(Error::Config(
                "block size, firmware chunk size and read length must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
