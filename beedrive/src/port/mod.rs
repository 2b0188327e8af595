//! Bulk endpoint abstraction.
//!
//! The printer exposes one bulk OUT and one bulk IN endpoint. Everything
//! above this module only sees the [`BulkPort`] trait, so the protocol layers
//! run unchanged against real hardware or a scripted fake.
//!
//! ```text
//! +----------------------+
//! |  Printer / Transfer  |
//! +----------+-----------+
//!            |
//! +----------v-----------+
//! |    CommandChannel    |
//! +----------+-----------+
//!            |
//! +----------v-----------+
//! |      Transport       |   absorbs I/O errors, reconnect policy
//! +----------+-----------+
//!            |
//! +----------v-----------+
//! |   BulkPort (trait)   |
//! +----------+-----------+
//!            |
//!     UsbPort (rusb)
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::{device::PrinterIdentity, error::Result};

/// Raw access to a printer's bulk endpoint pair.
///
/// Implementations report errors faithfully; the [`Transport`] above decides
/// which ones to absorb.
///
/// [`Transport`]: crate::transport::Transport
pub trait BulkPort: Send {
    /// Write `data` to the OUT endpoint, returning the number of bytes
    /// accepted by the device.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Read at most `max_len` bytes from the IN endpoint.
    ///
    /// An expired timeout is not an error: it yields an empty buffer.
    fn read_bulk(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Release the device. Further I/O fails until [`reopen`](Self::reopen).
    fn close(&mut self) -> Result<()>;

    /// Whether the device handle is live.
    fn is_open(&self) -> bool;

    /// Find the same physical unit again and rebuild the handle.
    fn reopen(&mut self) -> Result<()>;

    /// Identity of the unit behind this port.
    fn identity(&self) -> &PrinterIdentity;
}

#[cfg(feature = "native")]
pub use native::UsbPort;
