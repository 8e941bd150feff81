//! VID/PID probe table for USB-serial bridges
//!
//! Backends that only see raw USB descriptors (the desktop backend, tests)
//! use [`ProbeTable`] to decide whether a device is a serial bridge. The
//! default table covers the common bridge vendors plus CH34x and FTDI
//! variants that stock driver tables on some Android builds miss.

use std::collections::HashMap;

use crate::traits::{DriverFamily, DriverInfo, UsbDevice};

/// Vendor ids matched regardless of product id
const VENDOR_FAMILIES: &[(u16, DriverFamily)] = &[
    (0x0403, DriverFamily::Ftdi),
    (0x10C4, DriverFamily::Cp21xx),
    (0x067B, DriverFamily::Prolific),
];

/// Exact (vendor, product) matches
const PRODUCT_FAMILIES: &[(u16, u16, DriverFamily)] = &[
    // Qinheng / WCH
    (0x1A86, 0x7523, DriverFamily::Ch34x), // CH340/CH341
    (0x1A86, 0x5523, DriverFamily::Ch34x), // CH341A programmer
    (0x1A86, 0x55D4, DriverFamily::Ch34x), // CH9102F
    (0x1A86, 0x7522, DriverFamily::Ch34x),
    // FTDI FT231X, absent from some tables
    (0x0403, 0x6015, DriverFamily::Ftdi),
    // CDC ACM bridges
    (0x2341, 0x0043, DriverFamily::Cdc), // Arduino Uno
    (0x0483, 0x5740, DriverFamily::Cdc), // STM32 virtual COM port
    (0x2E8A, 0x000A, DriverFamily::Cdc), // RP2040
];

/// Maps USB ids to serial driver families
#[derive(Debug, Clone)]
pub struct ProbeTable {
    products: HashMap<(u16, u16), DriverFamily>,
    vendors: HashMap<u16, DriverFamily>,
}

impl ProbeTable {
    /// A table with no entries
    pub fn empty() -> Self {
        Self {
            products: HashMap::new(),
            vendors: HashMap::new(),
        }
    }

    /// Register an exact vendor/product match
    pub fn add_product(&mut self, vendor_id: u16, product_id: u16, family: DriverFamily) -> &mut Self {
        self.products.insert((vendor_id, product_id), family);
        self
    }

    /// Register a vendor-wide match
    pub fn add_vendor(&mut self, vendor_id: u16, family: DriverFamily) -> &mut Self {
        self.vendors.insert(vendor_id, family);
        self
    }

    /// Driver for the device, exact matches first
    pub fn probe(&self, device: &UsbDevice) -> Option<DriverInfo> {
        self.products
            .get(&(device.vendor_id, device.product_id))
            .or_else(|| self.vendors.get(&device.vendor_id))
            .map(|family| DriverInfo::new(*family, 1))
    }
}

impl Default for ProbeTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (vendor, family) in VENDOR_FAMILIES {
            table.add_vendor(*vendor, *family);
        }
        for (vendor, product, family) in PRODUCT_FAMILIES {
            table.add_product(*vendor, *product, *family);
        }
        table
    }
}
