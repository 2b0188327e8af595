//! Best-effort bulk I/O with reconnect.
//!
//! The transport never lets an I/O error escape a read or write: failures
//! are logged and surface as zero bytes written or an empty read, and the
//! retry loops higher up decide what to do about it.

use {
    crate::{
        device::PrinterIdentity,
        error::{Error, Result},
        port::BulkPort,
    },
    log::{debug, error, info, warn},
    std::{thread, time::Duration},
};

/// Endpoint I/O for one connected printer.
pub struct Transport {
    port: Box<dyn BulkPort>,
    read_length: usize,
    reconnect_settle: Duration,
    reconnect_attempts: u32,
}

impl Transport {
    /// Wrap an opened port.
    pub fn new(port: Box<dyn BulkPort>) -> Self {
        Self {
            port,
            read_length: 512,
            reconnect_settle: Duration::from_secs(3),
            reconnect_attempts: 5,
        }
    }

    /// Set the default maximum read length.
    #[must_use]
    pub fn with_read_length(mut self, read_length: usize) -> Self {
        self.read_length = read_length;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, settle: Duration, attempts: u32) -> Self {
        self.reconnect_settle = settle;
        self.reconnect_attempts = attempts.max(1);
        self
    }

    /// Write `data`, returning how many bytes the device accepted.
    ///
    /// An empty write is a zero-length prime of the OUT direction and always
    /// reports 0.
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> usize {
        if data.is_empty() {
            if let Err(e) = self.port.write_bulk(data, timeout) {
                debug!("Zero-length write ignored: {e}");
            }
            return 0;
        }

        match self.port.write_bulk(data, timeout) {
            Ok(n) => n,
            Err(e) => {
                error!("USB write failed: {e}");
                0
            },
        }
    }

    /// Read up to `max_len` bytes; an error reads as nothing.
    ///
    /// Every read is preceded by a zero-length write, which some firmware
    /// revisions need before they release the IN endpoint.
    pub fn read(&mut self, timeout: Duration, max_len: usize) -> Vec<u8> {
        self.write(&[], timeout);
        match self.port.read_bulk(max_len, timeout) {
            Ok(data) => data,
            Err(e) => {
                error!("USB read failed: {e}");
                Vec::new()
            },
        }
    }

    /// Read with the default length, lossily decoded as text.
    pub fn read_text(&mut self, timeout: Duration) -> String {
        let data = self.read(timeout, self.read_length);
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Release the device.
    pub fn close(&mut self) {
        if let Err(e) = self.port.close() {
            warn!("Closing printer failed: {e}");
        }
    }

    /// Whether the handle is live.
    pub fn is_connected(&self) -> bool {
        self.port.is_open()
    }

    /// Tear the handle down and find the same unit again.
    ///
    /// The printer re-enumerates after a reset, so every attempt waits for
    /// the settle delay before searching.
    pub fn reconnect(&mut self) -> Result<()> {
        self.close();

        let mut last_error = Error::DeviceNotFound;
        for attempt in 1..=self.reconnect_attempts {
            thread::sleep(self.reconnect_settle);
            match self.port.reopen() {
                Ok(()) => {
                    info!("Reconnected to {}", self.port.identity().label());
                    return Ok(());
                },
                Err(e) => {
                    warn!(
                        "Reconnect attempt {attempt}/{} failed: {e}",
                        self.reconnect_attempts
                    );
                    last_error = e;
                },
            }
        }

        Err(last_error)
    }

    /// Identity of the connected unit.
    pub fn identity(&self) -> &PrinterIdentity {
        self.port.identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePrinter;

    #[test]
    fn test_write_and_read() {
        let fake = FakePrinter::firmware();
        let mut transport = Transport::new(Box::new(fake.clone()));

        let n = transport.write(b"M625\n", Duration::from_millis(500));
        assert_eq!(n, 5);
        let reply = transport.read_text(Duration::from_millis(2000));
        assert!(reply.contains("ok Q"));
        assert_eq!(fake.commands(), vec!["M625".to_string()]);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let fake = FakePrinter::firmware();
        let mut transport = Transport::new(Box::new(fake.clone()));
        assert_eq!(transport.write(b"", Duration::from_millis(500)), 0);
        assert!(fake.writes().is_empty());
        assert_eq!(fake.prime_writes(), 1);
    }

    #[test]
    fn test_every_read_is_primed() {
        let fake = FakePrinter::firmware();
        let mut transport = Transport::new(Box::new(fake.clone()));

        transport.write(b"M105\n", Duration::from_millis(500));
        let reply = transport.read_text(Duration::from_millis(10));
        assert!(reply.contains("T:"));
        assert!(transport.read(Duration::from_millis(10), 64).is_empty());

        assert_eq!(fake.reads(), 2);
        assert_eq!(fake.prime_writes(), 2);
        assert_eq!(fake.commands(), vec!["M105".to_string()]);
    }

    #[test]
    fn test_errors_are_absorbed() {
        let fake = FakePrinter::firmware();
        let mut transport = Transport::new(Box::new(fake.clone()));
        transport.close();

        assert!(!transport.is_connected());
        assert_eq!(transport.write(b"M105\n", Duration::from_millis(500)), 0);
        assert!(transport.read(Duration::from_millis(10), 64).is_empty());
    }

    #[test]
    fn test_reconnect_reopens_port() {
        let fake = FakePrinter::firmware();
        let mut transport =
            Transport::new(Box::new(fake.clone())).with_reconnect(Duration::ZERO, 3);

        transport.reconnect().unwrap();
        assert!(transport.is_connected());
        assert_eq!(fake.reconnects(), 1);
    }

    #[test]
    fn test_reconnect_gives_up() {
        let fake = FakePrinter::firmware();
        fake.set_unplugged(true);
        let mut transport =
            Transport::new(Box::new(fake.clone())).with_reconnect(Duration::ZERO, 2);

        assert!(matches!(transport.reconnect(), Err(Error::DeviceNotFound)));
        assert!(!transport.is_connected());
    }
}
