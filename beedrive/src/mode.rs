//! Printer mode and run-status model.
//!
//! A printer is either running its bootloader or its main firmware. The
//! bootloader does not implement `M625`, which makes that command a cheap
//! mode probe: the bootloader rejects it, the firmware answers with its
//! queue state. Anything else means the reply stream is out of step with
//! the commands and the buffer has to be cleaned.

use std::fmt;

use crate::profile::StatusCodeMap;
use crate::reply::ReplyFields;

/// Probe command used for both mode detection and run-status polling.
pub const STATUS_PROBE: &str = "M625";

/// Operating context of the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrinterMode {
    /// Bootloader: accepts firmware images, no printing.
    Bootloader,
    /// Main firmware.
    Firmware,
    /// Reply did not identify either mode.
    Unknown,
}

impl PrinterMode {
    /// Decode the reply to a [`STATUS_PROBE`].
    pub fn from_reply(reply: &str) -> Self {
        if reply.contains("Bad M-code 625") {
            Self::Bootloader
        } else if reply.contains("ok Q") {
            Self::Firmware
        } else {
            Self::Unknown
        }
    }

    /// Command that makes the printer reboot into this mode.
    pub fn switch_command(self) -> Option<&'static str> {
        match self {
            Self::Firmware => Some("M630"),
            Self::Bootloader => Some("M609"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for PrinterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "Bootloader"),
            Self::Firmware => write!(f, "Firmware"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Activity reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunStatus {
    /// Idle.
    Ready,
    /// Executing movement.
    Moving,
    /// Printing from SD card.
    SdPrint,
    /// Receiving a file.
    Transfer,
    /// Print paused.
    Pause,
    /// Shutdown state (print suspended, heaters off).
    Shutdown,
}

impl RunStatus {
    /// Decode a status reply.
    ///
    /// The numeric `S:<code>` field wins; the textual markers `pause` and
    /// `shutdown` are the fallback. Returns `None` when neither is present
    /// or the code is not in the table.
    pub fn decode(reply: &str, codes: &StatusCodeMap) -> Option<Self> {
        if let Some(status) = ReplyFields::parse(reply)
            .int('S')
            .and_then(|code| codes.status(code))
        {
            return Some(status);
        }

        let lower = reply.to_lowercase();
        if lower.contains("pause") {
            Some(Self::Pause)
        } else if lower.contains("shutdown") {
            Some(Self::Shutdown)
        } else {
            None
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "Ready",
            Self::Moving => "Moving",
            Self::SdPrint => "SD_Print",
            Self::Transfer => "Transfer",
            Self::Pause => "Pause",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Sticky session flags.
///
/// Set whenever a status poll observes the state, cleared only by the
/// matching resume/clear command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// A pause was observed.
    pub paused: bool,
    /// A shutdown was observed.
    pub shutdown: bool,
    /// A pause was requested and not yet observed.
    pub pausing: bool,
}

impl SessionFlags {
    /// Record a decoded status.
    pub fn observe(&mut self, status: RunStatus) {
        match status {
            RunStatus::Pause => {
                self.paused = true;
                self.pausing = false;
            },
            RunStatus::Shutdown => self.shutdown = true,
            _ => {},
        }
    }

    /// Resume clears every pause and shutdown marker.
    pub fn resume(&mut self) {
        *self = Self::default();
    }

    /// Clear only the shutdown marker.
    pub fn clear_shutdown(&mut self) {
        self.shutdown = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_reply() {
        assert_eq!(
            PrinterMode::from_reply("Bad M-code 625\n"),
            PrinterMode::Bootloader
        );
        assert_eq!(PrinterMode::from_reply("S:3\nok Q:0\n"), PrinterMode::Firmware);
        assert_eq!(PrinterMode::from_reply("aaaaok"), PrinterMode::Unknown);
        assert_eq!(PrinterMode::from_reply(""), PrinterMode::Unknown);
    }

    #[test]
    fn test_switch_commands() {
        assert_eq!(PrinterMode::Firmware.switch_command(), Some("M630"));
        assert_eq!(PrinterMode::Bootloader.switch_command(), Some("M609"));
        assert_eq!(PrinterMode::Unknown.switch_command(), None);
    }

    #[test]
    fn test_decode_status() {
        let codes = StatusCodeMap::default();
        assert_eq!(RunStatus::decode("S:3\nok Q:0", &codes), Some(RunStatus::Ready));
        assert_eq!(RunStatus::decode("s:5", &codes), Some(RunStatus::SdPrint));
        assert_eq!(RunStatus::decode("S:9", &codes), Some(RunStatus::Shutdown));
        assert_eq!(
            RunStatus::decode("Printer in pause", &codes),
            Some(RunStatus::Pause)
        );
        assert_eq!(
            RunStatus::decode("SHUTDOWN", &codes),
            Some(RunStatus::Shutdown)
        );
        assert_eq!(RunStatus::decode("S:8 ok", &codes), None);
        assert_eq!(RunStatus::decode("ok Q:0", &codes), None);
    }

    #[test]
    fn test_sticky_flags() {
        let mut flags = SessionFlags::default();
        flags.observe(RunStatus::Pause);
        flags.observe(RunStatus::Ready);
        assert!(flags.paused);

        flags.observe(RunStatus::Shutdown);
        flags.clear_shutdown();
        assert!(!flags.shutdown);
        assert!(flags.paused);

        flags.resume();
        assert_eq!(flags, SessionFlags::default());
    }
}
