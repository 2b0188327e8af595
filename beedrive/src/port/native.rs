//! Native USB port built on `rusb` (libusb).

use {
    crate::{
        device::PrinterIdentity,
        error::{Error, Result},
        port::BulkPort,
    },
    log::{debug, trace, warn},
    rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType},
    std::{thread, time::Duration},
};

/// Interface carrying the command endpoints.
const INTERFACE: u8 = 0;

/// Configuration value selected before claiming the interface.
const CONFIGURATION: u8 = 1;

/// Delay after the device reset before endpoints are usable.
const RESET_SETTLE: Duration = Duration::from_millis(500);

/// Native USB port for one printer.
pub struct UsbPort {
    handle: Option<DeviceHandle<GlobalContext>>,
    identity: PrinterIdentity,
    ep_out: u8,
    ep_in: u8,
}

impl UsbPort {
    /// Open the printer described by `identity`.
    ///
    /// When the identity carries a serial number only that unit matches;
    /// otherwise the first device with the same VID/PID is used.
    pub fn open(identity: &PrinterIdentity) -> Result<Self> {
        let (device, found) = find_device(identity)?;
        let (handle, ep_out, ep_in) = configure(&device)?;
        let identity = PrinterIdentity {
            manufacturer: identity.manufacturer.clone(),
            product: identity.product.clone(),
            ..found
        };

        debug!(
            "Opened {} (OUT {ep_out:#04x}, IN {ep_in:#04x})",
            identity.label()
        );

        Ok(Self {
            handle: Some(handle),
            identity,
            ep_out,
            ep_in,
        })
    }

    fn handle(&self) -> Result<&DeviceHandle<GlobalContext>> {
        self.handle
            .as_ref()
            .ok_or(Error::NotConnected)
    }
}

impl BulkPort for UsbPort {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let written = self
            .handle()?
            .write_bulk(self.ep_out, data, timeout)?;
        trace!("USB OUT {written}/{} bytes", data.len());
        Ok(written)
    }

    fn read_bulk(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        match self
            .handle()?
            .read_bulk(self.ep_in, &mut buf, timeout)
        {
            Ok(n) => {
                buf.truncate(n);
                trace!("USB IN {n} bytes");
                Ok(buf)
            },
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(INTERFACE) {
                debug!("Releasing interface failed: {e}");
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn reopen(&mut self) -> Result<()> {
        self.close()?;
        let (device, found) = find_device(&self.identity)?;
        let (handle, ep_out, ep_in) = configure(&device)?;
        self.identity.pid = found.pid;
        self.identity.kind = found.kind;
        self.identity.bus = found.bus;
        self.identity.address = found.address;
        self.handle = Some(handle);
        self.ep_out = ep_out;
        self.ep_in = ep_in;
        debug!("Reopened {}", self.identity.label());
        Ok(())
    }

    fn identity(&self) -> &PrinterIdentity {
        &self.identity
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Locate the device for `identity`.
///
/// A unit is matched by serial number wherever it re-enumerates, so a
/// printer whose product ID changes with the mode is still found. The
/// returned identity describes the device as it is attached now.
fn find_device(identity: &PrinterIdentity) -> Result<(Device<GlobalContext>, PrinterIdentity)> {
    for device in rusb::devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        let mut candidate = PrinterIdentity::new(desc.vendor_id(), desc.product_id());
        if !candidate.kind.is_known() {
            continue;
        }
        candidate.serial_number = device
            .open()
            .and_then(|h| h.read_serial_number_string_ascii(&desc))
            .ok();
        if identity.serial_number.is_some() && candidate.serial_number.is_none() {
            continue;
        }
        if identity.same_unit(&candidate) {
            candidate.bus = device.bus_number();
            candidate.address = device.address();
            return Ok((device, candidate));
        }
    }

    Err(Error::DeviceNotFound)
}

/// Select configuration, reset, claim the interface and locate endpoints.
fn configure(device: &Device<GlobalContext>) -> Result<(DeviceHandle<GlobalContext>, u8, u8)> {
    let handle = device.open()?;

    // Not supported on every platform.
    let _ = handle.set_auto_detach_kernel_driver(true);

    if let Err(e) = handle.set_active_configuration(CONFIGURATION) {
        warn!("Setting USB configuration failed: {e}");
    }
    if let Err(e) = handle.reset() {
        warn!("USB reset failed: {e}");
    }
    thread::sleep(RESET_SETTLE);

    handle.claim_interface(INTERFACE)?;
    let (ep_out, ep_in) = find_bulk_endpoints(device)?;
    Ok((handle, ep_out, ep_in))
}

/// First bulk OUT and first bulk IN endpoint of the command interface.
fn find_bulk_endpoints(device: &Device<GlobalContext>) -> Result<(u8, u8)> {
    let config = device.active_config_descriptor()?;
    let mut ep_out = None;
    let mut ep_in = None;

    for interface in config
        .interfaces()
        .filter(|i| i.number() == INTERFACE)
    {
        for desc in interface.descriptors() {
            for ep in desc
                .endpoint_descriptors()
                .filter(|ep| ep.transfer_type() == TransferType::Bulk)
            {
                match ep.direction() {
                    Direction::Out if ep_out.is_none() => ep_out = Some(ep.address()),
                    Direction::In if ep_in.is_none() => ep_in = Some(ep.address()),
                    _ => {},
                }
            }
        }
    }

    match (ep_out, ep_in) {
        (Some(out), Some(input)) => Ok((out, input)),
        _ => Err(Error::Protocol(
            "printer interface has no bulk endpoint pair".to_string(),
        )),
    }
}
