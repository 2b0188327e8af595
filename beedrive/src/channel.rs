//! Line-oriented command dispatch over the transport.
//!
//! The protocol carries no request IDs: a reply belongs to whichever
//! command was written last. A `CommandChannel` therefore always pairs a
//! write with the reads that follow it, and callers share one channel
//! behind a single mutex so those pairs never interleave.

use {
    crate::{
        device::PrinterIdentity,
        error::{Error, Result},
        mode::STATUS_PROBE,
        profile::ProtocolProfile,
        transport::Transport,
    },
    log::{debug, trace, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// How to wait for the reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// One read, whatever arrives.
    Immediate,
    /// Keep reading until `marker` appears.
    ///
    /// Without a timeout this waits for as long as the printer stays silent.
    Marker {
        /// Substring to wait for.
        marker: String,
        /// Give up and return what arrived so far after this long.
        timeout: Option<Duration>,
    },
    /// Wait for `ok`, then probe the run status until `S:<code>` appears.
    Status {
        /// Status code to wait for.
        code: u32,
        /// Deadline for the whole exchange.
        timeout: Duration,
    },
}

impl Reply {
    /// Substring wait with no deadline.
    pub fn marker(marker: impl Into<String>) -> Self {
        Self::Marker {
            marker: marker.into(),
            timeout: None,
        }
    }

    /// Substring wait with a deadline.
    pub fn marker_within(marker: impl Into<String>, timeout: Duration) -> Self {
        Self::Marker {
            marker: marker.into(),
            timeout: Some(timeout),
        }
    }
}

/// Command channel for one printer.
pub struct CommandChannel {
    transport: Transport,
    profile: ProtocolProfile,
}

impl CommandChannel {
    /// Build a channel on top of `transport`.
    pub fn new(transport: Transport, profile: ProtocolProfile) -> Self {
        let transport = transport
            .with_read_length(profile.read_length)
            .with_reconnect(profile.timing.reconnect_settle, profile.reconnect_attempts);
        Self { transport, profile }
    }

    /// Parameters in effect.
    pub fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    /// Identity of the connected unit.
    pub fn identity(&self) -> &PrinterIdentity {
        self.transport.identity()
    }

    /// Whether the device handle is live.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Write raw bytes with the default write timeout.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.transport.write(data, self.profile.write_timeout)
    }

    /// Read at most `max_len` raw bytes with an explicit timeout.
    pub fn read_bytes(&mut self, timeout: Duration, max_len: usize) -> Vec<u8> {
        self.transport.read(timeout, max_len)
    }

    /// One read with the default timeout, as text.
    pub fn read(&mut self) -> String {
        self.transport.read_text(self.profile.read_timeout)
    }

    /// Write `line` and perform exactly one read.
    ///
    /// The reply may be partial or empty.
    pub fn dispatch(&mut self, line: &str) -> String {
        let line = terminate(line);
        debug!("> {}", line.trim_end());

        thread::sleep(self.profile.timing.command_gap);
        self.write(line.as_bytes());
        thread::sleep(self.profile.timing.command_gap);

        let reply = self.read();
        trace!("< {reply:?}");
        reply
    }

    /// Send `line` and wait for its reply as described by `reply`.
    pub fn send_command(&mut self, line: &str, reply: &Reply) -> Result<String> {
        match reply {
            Reply::Immediate => Ok(self.dispatch(line)),
            Reply::Marker { marker, timeout } => Ok(self.wait_for(line, marker, *timeout)),
            Reply::Status { code, timeout } => self.wait_for_status(line, *code, *timeout),
        }
    }

    /// Write `line` once, then read until `marker` shows up or `timeout`
    /// passes. Returns everything read.
    pub fn wait_for(&mut self, line: &str, marker: &str, timeout: Option<Duration>) -> String {
        let line = terminate(line);
        debug!("> {} (waiting for {marker:?})", line.trim_end());
        let deadline = timeout.map(|t| Instant::now() + t);

        self.write(line.as_bytes());
        let mut reply = String::new();
        while !reply.contains(marker) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Timed out waiting for {marker:?} after {}", line.trim_end());
                break;
            }
            reply.push_str(&self.read());
        }

        trace!("< {reply:?}");
        reply
    }

    /// Write `line`, wait for `ok`, then probe with `M625` until
    /// `S:<code>` is reported.
    pub fn wait_for_status(&mut self, line: &str, code: u32, timeout: Duration) -> Result<String> {
        let line = terminate(line);
        debug!("> {} (waiting for status {code})", line.trim_end());
        let deadline = Instant::now() + timeout;
        let expired = |what: &str| {
            Error::Timeout(format!(
                "{what} after {} within {timeout:?}",
                line.trim_end()
            ))
        };

        self.write(line.as_bytes());
        let mut reply = String::new();
        while !reply.contains("ok") {
            if Instant::now() >= deadline {
                return Err(expired("no acknowledgment"));
            }
            reply.push_str(&self.read());
        }

        let marker = format!("S:{code}");
        let probe = terminate(STATUS_PROBE);
        while !reply.contains(&marker) {
            if Instant::now() >= deadline {
                return Err(expired(&format!("status {code} not reached")));
            }
            self.write(probe.as_bytes());
            thread::sleep(self.profile.timing.status_probe_interval);
            reply.push_str(&self.read());
        }

        trace!("< {reply:?}");
        Ok(reply)
    }

    /// Flush a desynchronized reply stream.
    ///
    /// Pads the OUT direction with a full-size `M625` sentinel until the
    /// printer answers `ok`. Returns the tries left; 0 means the stream
    /// never settled.
    pub fn clean_buffer(&mut self) -> usize {
        debug!("Cleaning command buffer");
        let sentinel = format!(
            "M625;{}\n",
            "a".repeat(self.profile.message_size.saturating_sub(6))
        );
        let timeout = self.profile.clean_write_timeout;

        self.transport.write(sentinel.as_bytes(), timeout);
        let _ = self.read();

        let mut tries = self.profile.block_size + 1;
        let mut reply = String::new();
        while !reply.to_lowercase().contains("ok") && tries > 0 {
            self.transport.write(sentinel.as_bytes(), timeout);
            reply.push_str(&self.read());
            tries -= 1;
        }

        if tries == 0 {
            warn!("Command buffer did not settle");
        } else {
            debug!("Command buffer clean ({tries} tries left)");
        }
        tries
    }

    /// Close and re-find the printer.
    pub fn reconnect(&mut self) -> Result<()> {
        self.transport.reconnect()
    }

    /// Release the device.
    pub fn close(&mut self) {
        self.transport.close();
    }
}

/// Append the line terminator if missing.
fn terminate(line: &str) -> String {
    if line.ends_with('\n') {
        line.to_string()
    } else {
        format!("{line}\n")
    }
}
