//! Fault classification for transport errors
//!
//! Every error raised by the read loop or while opening a port goes through
//! [`classify`] exactly once. The class decides the handling policy:
//!
//! | Class              | `on_error` | Cleanup | Reconnect |
//! |--------------------|------------|---------|-----------|
//! | `BenignClose`      | no         | no      | no        |
//! | `TransientStatus`  | no         | no      | no        |
//! | `Permission`       | yes        | yes     | no        |
//! | `ConnectionClosed` | yes        | yes     | yes       |
//! | `Recoverable`      | yes        | yes     | yes       |
//! | `Critical`         | yes        | yes     | yes (weighted) |

use core::fmt;
use std::io;

/// Handling class of a transport fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Side effect of an intentional disconnect or detach
    BenignClose,
    /// Noisy status check from CH34x style controllers, data keeps flowing
    TransientStatus,
    /// Access to the device was revoked or refused
    Permission,
    /// Remote or hardware initiated closure
    ConnectionClosed,
    /// Ordinary transport error
    Recoverable,
    /// Anything not matching the above
    Critical,
}

impl FaultClass {
    /// Whether the fault is reported through `on_error`
    pub const fn reports_error(self) -> bool {
        !matches!(self, FaultClass::BenignClose | FaultClass::TransientStatus)
    }

    /// Whether the link is torn down
    pub const fn tears_down(self) -> bool {
        self.reports_error()
    }

    /// Whether a reconnect may be scheduled afterwards
    pub const fn reconnect_eligible(self) -> bool {
        matches!(
            self,
            FaultClass::ConnectionClosed | FaultClass::Recoverable | FaultClass::Critical
        )
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultClass::BenignClose => "benign close",
            FaultClass::TransientStatus => "transient status",
            FaultClass::Permission => "permission",
            FaultClass::ConnectionClosed => "connection closed",
            FaultClass::Recoverable => "recoverable",
            FaultClass::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Link conditions at the moment the fault surfaced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultContext {
    /// An explicit disconnect is running
    pub disconnecting: bool,
    /// The current device was detached
    pub detached: bool,
    /// The fault belongs to a session that has already been replaced
    pub stale: bool,
}

impl FaultContext {
    fn cancelled(self) -> bool {
        self.disconnecting || self.detached || self.stale
    }
}

const STATUS_MARKERS: &[&str] = &[
    "get_status",
    "usb status",
    "status check failed",
    "ch340",
];

const PERMISSION_MARKERS: &[&str] = &["permission denied", "access denied"];

const CLOSED_MARKERS: &[&str] = &["connection closed", "device disconnected"];

/// Matched case-sensitively, "IO" would otherwise hit every "-tion" word
const TRANSPORT_MARKERS: &[&str] = &["USB", "Serial", "serial", "IO", "I/O"];

/// Classify a transport error
pub fn classify(error: &io::Error, context: FaultContext) -> FaultClass {
    if context.cancelled() {
        return FaultClass::BenignClose;
    }

    let raw = error.to_string();
    let message = raw.to_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

    if mentions(STATUS_MARKERS) {
        return FaultClass::TransientStatus;
    }

    if error.kind() == io::ErrorKind::PermissionDenied || mentions(PERMISSION_MARKERS) {
        return FaultClass::Permission;
    }

    match error.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => return FaultClass::ConnectionClosed,
        _ if mentions(CLOSED_MARKERS) => return FaultClass::ConnectionClosed,
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::InvalidData
        | io::ErrorKind::WriteZero => return FaultClass::Recoverable,
        _ => {}
    }

    if TRANSPORT_MARKERS.iter().any(|m| raw.contains(m)) {
        FaultClass::Recoverable
    } else {
        FaultClass::Critical
    }
}
