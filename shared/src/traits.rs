//! # Transport Collaborator Abstractions
//!
//! The link manager never talks to USB directly. Enumeration, driver
//! matching, permission negotiation and the serial handle itself are
//! provided by a backend:
//!
//! - **Android**: the JNI bridge calls back into the Java USB stack
//! - **Desktop**: the `native` feature wraps the `serialport` crate
//! - **Tests**: scripted mocks
//!
//! ## Design Rationale
//!
//! 1. **Testability**: the whole state machine runs against mock handles
//! 2. **Version shims**: differences between transport library versions live
//!    in one backend implementation instead of runtime probing
//! 3. **Shared handle**: every [`SerialHandle`] method takes `&self`, so the
//!    read loop can block in `read` while another thread calls `close` to
//!    unblock it

use core::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SerialParameters;

/// A USB device visible to the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDevice {
    /// Backend specific identifier (device path on Android, port name on desktop)
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl UsbDevice {
    pub fn new(name: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            name: name.into(),
            vendor_id,
            product_id,
            serial_number: None,
        }
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (VID={:04X} PID={:04X})",
            self.name, self.vendor_id, self.product_id
        )
    }
}

/// USB-serial chip family a driver was matched for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    Cdc,
    Ch34x,
    Ftdi,
    Cp21xx,
    Prolific,
    Custom,
}

/// Outcome of a successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub family: DriverFamily,
    /// Serial ports exposed by the driver; the link always uses the first
    pub port_count: u8,
}

impl DriverInfo {
    pub const fn new(family: DriverFamily, port_count: u8) -> Self {
        Self { family, port_count }
    }
}

/// One-shot reply for an asynchronous permission request
///
/// The backend resolves it once the user (or the OS) answers. Dropping it
/// unresolved leaves the link waiting until the next `connect`.
pub struct PermissionReply {
    resolve: Box<dyn FnOnce(bool) + Send>,
}

impl PermissionReply {
    pub fn new(resolve: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            resolve: Box::new(resolve),
        }
    }

    pub fn resolve(self, granted: bool) {
        (self.resolve)(granted)
    }

    pub fn grant(self) {
        self.resolve(true)
    }

    pub fn deny(self) {
        self.resolve(false)
    }
}

impl fmt::Debug for PermissionReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PermissionReply")
    }
}

/// The exclusive serial handle of an open device
pub trait SerialHandle: Send + Sync + 'static {
    /// Apply baud rate, frame size, stop bits and parity
    fn set_parameters(&self, params: &SerialParameters) -> io::Result<()>;

    /// Drive the DTR and RTS control lines
    fn set_control_lines(&self, dtr: bool, rts: bool) -> io::Result<()>;

    /// Discard anything pending in the hardware FIFOs
    fn purge_buffers(&self) -> io::Result<()> {
        Ok(())
    }

    /// Block until bytes arrive
    ///
    /// Returns `Ok(0)` when the backend's internal read timeout expires
    /// without data, so the caller can check its stop flag.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes or fail within `timeout`
    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<()>;

    /// Release the handle; a pending `read` must return promptly afterwards
    fn close(&self) -> io::Result<()>;
}

/// Device enumeration, driver matching, permission and open
pub trait UsbBackend: Send + Sync + 'static {
    type Handle: SerialHandle;

    /// Every USB device currently attached
    fn list_devices(&self) -> Vec<UsbDevice>;

    /// Match a serial driver for the device
    fn probe(&self, device: &UsbDevice) -> Option<DriverInfo>;

    /// Whether access to the device is already granted
    fn has_permission(&self, device: &UsbDevice) -> bool;

    /// Ask for access; the answer arrives later through `reply`
    fn request_permission(&self, device: &UsbDevice, reply: PermissionReply) -> io::Result<()>;

    /// Open the first port of the matched driver
    fn open(&self, device: &UsbDevice, driver: &DriverInfo) -> io::Result<Self::Handle>;
}
