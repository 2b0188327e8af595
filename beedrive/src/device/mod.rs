//! Printer discovery and classification.
//!
//! Enumeration is a thin pass over the USB bus: every device whose
//! vendor/product pair matches the identification table below is reported
//! as a [`PrinterIdentity`]. The serial number read here is what lets a
//! connection find the same physical unit again after a mode switch makes
//! it re-enumerate.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Printer hardware families known to speak the BEETHEFIRST protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrinterKind {
    /// Original BEETHEFIRST with the legacy test VID.
    BeeTheFirst,
    /// BEEVERYCREATIVE printers (BEETHEFIRST+, BEEINSCHOOL, HELLOBEE, ...).
    BeeVeryCreative,
    /// Smoothieboard-based controllers.
    Smoothieboard,
    /// Not a known printer.
    Unknown,
}

/// Known USB VID/PID pairs. An empty product list matches every product of
/// the vendor.
const KNOWN_PRINTERS: &[(u16, &[u16], PrinterKind)] = &[
    (0xFFFF, &[0x014E], PrinterKind::BeeTheFirst),
    (0x29C9, &[], PrinterKind::BeeVeryCreative),
    (0x1D50, &[], PrinterKind::Smoothieboard),
];

impl PrinterKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, kind) in KNOWN_PRINTERS {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *kind;
            }
        }
        Self::Unknown
    }

    /// Human-readable family name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeeTheFirst => "BEETHEFIRST",
            Self::BeeVeryCreative => "BEEVERYCREATIVE",
            Self::Smoothieboard => "Smoothieboard",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognised printer family.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Identity of one attached printer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PrinterIdentity {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Classified hardware family.
    pub kind: PrinterKind,
    /// Manufacturer string (if readable).
    pub manufacturer: Option<String>,
    /// Product string (if readable).
    pub product: Option<String>,
    /// Serial number (if readable).
    pub serial_number: Option<String>,
    /// USB bus number at enumeration time.
    pub bus: u8,
    /// USB device address at enumeration time.
    pub address: u8,
}

impl PrinterIdentity {
    /// Build an identity for a bare VID/PID pair.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            kind: PrinterKind::from_vid_pid(vid, pid),
            manufacturer: None,
            product: None,
            serial_number: None,
            bus: 0,
            address: 0,
        }
    }

    /// Attach a serial number.
    #[must_use]
    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Whether this identity refers to the same physical unit as `other`.
    ///
    /// Units are matched by serial number when both sides have one; the bus
    /// address changes on every re-enumeration so it is never compared.
    pub fn same_unit(&self, other: &Self) -> bool {
        match (&self.serial_number, &other.serial_number) {
            (Some(a), Some(b)) => a == b,
            _ => self.vid == other.vid && self.pid == other.pid,
        }
    }

    /// Short label used in logs and listings.
    pub fn label(&self) -> String {
        let name = self
            .product
            .as_deref()
            .unwrap_or(self.kind.name());
        match &self.serial_number {
            Some(serial) => format!("{name} ({serial})"),
            None => format!("{name} (bus {} addr {})", self.bus, self.address),
        }
    }
}

/// Enumerate attached printers.
#[cfg(feature = "native")]
pub fn detect_printers() -> Vec<PrinterIdentity> {
    let mut result = Vec::new();

    let devices = match rusb::devices() {
        Ok(devices) => devices,
        Err(e) => {
            debug!("Failed to enumerate USB devices: {e}");
            return result;
        },
    };

    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        let kind = PrinterKind::from_vid_pid(desc.vendor_id(), desc.product_id());
        if !kind.is_known() {
            continue;
        }

        let mut identity = PrinterIdentity::new(desc.vendor_id(), desc.product_id());
        identity.bus = device.bus_number();
        identity.address = device.address();

        match device.open() {
            Ok(handle) => {
                identity.manufacturer = handle
                    .read_manufacturer_string_ascii(&desc)
                    .ok();
                identity.product = handle
                    .read_product_string_ascii(&desc)
                    .ok();
                identity.serial_number = handle
                    .read_serial_number_string_ascii(&desc)
                    .ok();
            },
            Err(e) => debug!(
                "Cannot open {:04X}:{:04X} to read strings: {e}",
                identity.vid, identity.pid
            ),
        }

        trace!(
            "Found printer: VID {:04X} PID {:04X} ({:?}) serial {:?}",
            identity.vid, identity.pid, identity.kind, identity.serial_number
        );
        result.push(identity);
    }

    result
}

/// Enumerate attached printers (no USB backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_printers() -> Vec<PrinterIdentity> {
    Vec::new()
}

/// Pick a printer by serial number, or the first one attached.
pub fn find_printer(serial: Option<&str>) -> Result<PrinterIdentity> {
    let printers = detect_printers();
    select_printer(printers, serial)
}

fn select_printer(printers: Vec<PrinterIdentity>, serial: Option<&str>) -> Result<PrinterIdentity> {
    if let Some(serial) = serial {
        return printers
            .into_iter()
            .find(|p| p.serial_number.as_deref() == Some(serial))
            .ok_or(Error::DeviceNotFound);
    }

    let printer = printers
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound)?;
    #[cfg(feature = "native")]
    info!("Auto-detected printer: {}", printer.label());
    Ok(printer)
}

/// Format a list of printers for display.
pub fn format_printer_list(printers: &[PrinterIdentity]) -> Vec<String> {
    printers
        .iter()
        .map(|p| {
            let maker = p
                .manufacturer
                .as_ref()
                .map(|m| format!(" - {m}"))
                .unwrap_or_default();
            format!(
                "{} [{} {:04X}:{:04X}]{maker}",
                p.label(),
                p.kind.name(),
                p.vid,
                p.pid
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(serial: &str) -> PrinterIdentity {
        PrinterIdentity::new(0x29C9, 0x0001).with_serial_number(serial)
    }

    #[test]
    fn test_printer_kind_from_vid_pid() {
        assert_eq!(PrinterKind::from_vid_pid(0xFFFF, 0x014E), PrinterKind::BeeTheFirst);
        assert_eq!(PrinterKind::from_vid_pid(0xFFFF, 0x0001), PrinterKind::Unknown);
        assert_eq!(
            PrinterKind::from_vid_pid(0x29C9, 0x00FF),
            PrinterKind::BeeVeryCreative
        );
        assert_eq!(PrinterKind::from_vid_pid(0x1D50, 0x6015), PrinterKind::Smoothieboard);
        assert_eq!(PrinterKind::from_vid_pid(0x1A86, 0x7523), PrinterKind::Unknown);
    }

    #[test]
    fn test_same_unit_prefers_serial() {
        let a = printer("BEE001");
        let mut moved = printer("BEE001");
        moved.address = 17;
        assert!(a.same_unit(&moved));
        assert!(!a.same_unit(&printer("BEE002")));

        let bare = PrinterIdentity::new(0x29C9, 0x0001);
        assert!(bare.same_unit(&a));
    }

    #[test]
    fn test_same_unit_across_product_ids() {
        let firmware = PrinterIdentity::new(0x29C9, 0x0001).with_serial_number("BEE001");
        let bootloader = PrinterIdentity::new(0x29C9, 0x0002).with_serial_number("BEE001");
        assert!(firmware.same_unit(&bootloader));

        let bare = PrinterIdentity::new(0x29C9, 0x0001);
        assert!(!bare.same_unit(&PrinterIdentity::new(0x29C9, 0x0002)));
    }

    #[test]
    fn test_select_printer_by_serial() {
        let list = vec![printer("A1"), printer("B2")];
        let picked = select_printer(list.clone(), Some("B2")).unwrap();
        assert_eq!(picked.serial_number.as_deref(), Some("B2"));

        assert!(matches!(
            select_printer(list.clone(), Some("C3")),
            Err(Error::DeviceNotFound)
        ));
        assert_eq!(
            select_printer(list, None)
                .unwrap()
                .serial_number
                .as_deref(),
            Some("A1")
        );
        assert!(select_printer(Vec::new(), None).is_err());
    }

    #[test]
    fn test_format_printer_list() {
        let mut first = printer("BEE001");
        first.product = Some("BEETHEFIRST+".to_string());
        first.manufacturer = Some("BEEVERYCREATIVE".to_string());
        let second = PrinterIdentity::new(0xFFFF, 0x014E);

        let formatted = format_printer_list(&[first, second]);
        assert_eq!(formatted.len(), 2);
        assert!(formatted[0].contains("BEETHEFIRST+ (BEE001)"));
        assert!(formatted[0].contains("29C9:0001"));
        assert!(formatted[1].contains("bus 0 addr 0"));
    }
}
