//! # Packet Protocol Definitions
//!
//! This module defines the wire format of packets emitted by the serial
//! device. Packets are self-describing: a fixed magic marks the start and a
//! one byte length field says how much follows.
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────────┬────────┬─────────┬──────────────────────┐
//! │    Magic    │  Len   │ Command │       Payload        │
//! │ 0x68  0x00  │ 1 byte │ 1 byte  │   (Len - 1) bytes    │
//! └─────────────┴────────┴─────────┴──────────────────────┘
//!               total length = Len + 3
//! ```
//!
//! ## Command Codes
//!
//! - **0x55**: Power-on response
//! - **0x02**: Device ID query response
//! - **0xCC**: Location data
//!
//! Unknown command codes are legal on the wire; they are reported as
//! [`Command::Unknown`] and still delivered to the listener.

use core::fmt;

use thiserror::Error;

/// Magic bytes that open every packet (0x0068 transmitted as 0x68, 0x00)
pub const PACKET_MAGIC: [u8; 2] = [0x68, 0x00];

/// Bytes preceding the counted region: magic (2) + length field (1)
pub const HEADER_LEN: usize = 3;

/// Bytes needed before the length of a packet can be judged
///
/// Magic, length and command byte. Scanning never reports a packet until at
/// least this many bytes follow a candidate header.
pub const MIN_SCAN_LEN: usize = 4;

/// Largest payload a single packet can carry (length field is one byte)
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 1;

/// Largest total packet length representable on the wire
pub const MAX_PACKET_LEN: usize = u8::MAX as usize + HEADER_LEN;

/// Command codes understood by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Response sent by the device after power-on
    PowerOn,
    /// Response to a device ID query
    DeviceId,
    /// Periodic location report
    Location,
    /// Any other code, delivered untouched
    Unknown(u8),
}

impl Command {
    /// Raw command byte
    pub const fn code(self) -> u8 {
        match self {
            Command::PowerOn => 0x55,
            Command::DeviceId => 0x02,
            Command::Location => 0xCC,
            Command::Unknown(code) => code,
        }
    }

    /// Whether the code is one of the documented commands
    pub const fn is_known(self) -> bool {
        !matches!(self, Command::Unknown(_))
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x55 => Command::PowerOn,
            0x02 => Command::DeviceId,
            0xCC => Command::Location,
            other => Command::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::PowerOn => write!(f, "power-on response"),
            Command::DeviceId => write!(f, "device id response"),
            Command::Location => write!(f, "location data"),
            Command::Unknown(code) => write!(f, "unknown command 0x{code:02X}"),
        }
    }
}

/// Errors while building outbound packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload does not fit the one byte length field
    #[error("payload of {0} bytes exceeds the 254 byte limit")]
    PayloadTooLong(usize),
}

/// A complete packet, header included
///
/// Packets only come out of [`FramingBuffer::read_packet`](crate::buffer::FramingBuffer::read_packet)
/// or [`Packet::encode`], so the magic is always present and the byte count
/// always matches the length field.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Box<[u8]>,
}

impl Packet {
    /// Wrap bytes already validated by the framing buffer
    pub(crate) fn from_framed(bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() >= HEADER_LEN);
        debug_assert_eq!(bytes[..2], PACKET_MAGIC);
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// Build a packet for `command` carrying `payload`
    pub fn encode(command: u8, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }

        let mut bytes = Vec::with_capacity(payload.len() + MIN_SCAN_LEN);
        bytes.extend_from_slice(&PACKET_MAGIC);
        bytes.push((payload.len() + 1) as u8);
        bytes.push(command);
        bytes.extend_from_slice(payload);

        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// Value of the length field (command + payload)
    pub fn declared_len(&self) -> u8 {
        self.bytes[2]
    }

    /// Total packet length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false, a packet holds at least its header
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Command byte, absent only for zero-length packets
    pub fn command_code(&self) -> Option<u8> {
        self.bytes.get(HEADER_LEN).copied()
    }

    /// Decoded command
    pub fn command(&self) -> Option<Command> {
        self.command_code().map(Command::from)
    }

    /// Payload following the command byte
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(MIN_SCAN_LEN..).unwrap_or(&[])
    }

    /// Raw bytes, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take ownership of the raw bytes
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("command", &self.command())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}
