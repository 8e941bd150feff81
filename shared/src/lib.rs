//! # Serial Link Core Library
//!
//! This crate provides the host-agnostic core of a USB serial link:
//!
//! - **Framing Buffer**: growable ring buffer that recovers packets from a byte stream
//! - **Packet Protocol**: magic + length framed packets and their command codes
//! - **Connection State Machine**: discovery, permission, open, teardown and reconnect
//! - **Transport Traits**: USB enumeration and serial handles supplied by the host
//!
//! ## Architecture
//!
//! ```text
//!  SerialHandle::read ──► FramingBuffer ──► PacketDispatcher ──► LinkListener
//!   (read loop thread)    (one mutex)       (dispatch task)       (single slot)
//!          │
//!          └── errors ──► fault::classify ──► cleanup / ReconnectPolicy
//! ```
//!
//! ## Ownership
//!
//! [`LinkManager`] is the only owner of the exclusive serial handle. Hosts
//! construct it explicitly and pass it around; there is no global instance.
//! The Android host wraps it behind JNI, desktop tools enable the `native`
//! feature for a `serialport` backed transport.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod listener;
#[cfg(feature = "native")]
pub mod native;
pub mod probe;
pub mod protocol;
pub mod reconnect;
pub mod traits;

// Re-export main types for convenience
pub use buffer::{FramingBuffer, DEFAULT_CAPACITY};
pub use config::{LinkConfig, Parity, ReconnectConfig, SerialParameters, StopBits};
pub use connection::{LinkManager, LinkState, LinkStats};
pub use dispatcher::{DispatchCounts, PacketDispatcher};
pub use error::{LinkError, LinkResult};
pub use fault::{classify, FaultClass, FaultContext};
pub use listener::{LinkEvent, LinkListener, ListenerSlot};
pub use probe::ProbeTable;
pub use protocol::{Command, FrameError, Packet, PACKET_MAGIC};
pub use reconnect::ReconnectPolicy;
pub use traits::{DriverFamily, DriverInfo, PermissionReply, SerialHandle, UsbBackend, UsbDevice};

#[cfg(feature = "native")]
pub use native::{NativeBackend, NativeHandle};

/// Library version reported in diagnostics
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
