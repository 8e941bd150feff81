//! Packet dispatcher
//!
//! Takes complete packets out of the framing buffer, applies the size
//! policy, counts them per command and hands them to the listener. Unknown
//! command codes are delivered like any other packet.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::LinkConfig;
use crate::listener::{LinkEvent, ListenerSlot};
use crate::protocol::{Command, Packet};

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCounts {
    /// Packets handed to the listener
    pub dispatched: u64,
    /// Packets dropped by the size policy
    pub rejected: u64,
    pub power_on: u64,
    pub device_id: u64,
    pub location: u64,
    pub unknown: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    power_on: AtomicU64,
    device_id: AtomicU64,
    location: AtomicU64,
    unknown: AtomicU64,
}

impl Counters {
    fn for_command(&self, command: Option<Command>) -> &AtomicU64 {
        match command {
            Some(Command::PowerOn) => &self.power_on,
            Some(Command::DeviceId) => &self.device_id,
            Some(Command::Location) => &self.location,
            Some(Command::Unknown(_)) | None => &self.unknown,
        }
    }
}

/// Validates packets and forwards them to the listener
pub struct PacketDispatcher {
    min_len: usize,
    max_len: usize,
    counters: Counters,
}

impl PacketDispatcher {
    /// Dispatcher accepting packets of `min_len..=max_len` bytes
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self {
            min_len,
            max_len,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.min_packet_len, config.max_packet_len)
    }

    /// Whether `packet` passes the size policy
    pub fn accepts(&self, packet: &Packet) -> bool {
        (self.min_len..=self.max_len).contains(&packet.len())
    }

    /// Deliver one packet; returns `false` when it was rejected
    pub fn dispatch(&self, packet: Packet, listeners: &ListenerSlot) -> bool {
        if !self.accepts(&packet) {
            warn!(
                "Dropping packet of {} bytes, outside {}..={}",
                packet.len(),
                self.min_len,
                self.max_len
            );
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let command = packet.command();
        match command {
            Some(Command::PowerOn) => info!("Power-on response received"),
            Some(Command::DeviceId) => {
                debug!("Device id response, {} payload bytes", packet.payload().len())
            }
            Some(Command::Location) => {
                trace!("Location data, {} payload bytes", packet.payload().len())
            }
            Some(Command::Unknown(code)) => debug!("Unknown command 0x{:02X}", code),
            None => debug!("Packet without command byte"),
        }

        self.counters
            .for_command(command)
            .fetch_add(1, Ordering::Relaxed);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        listeners.emit(LinkEvent::DataReceived(packet));
        true
    }

    pub fn counts(&self) -> DispatchCounts {
        let c = &self.counters;
        DispatchCounts {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            power_on: c.power_on.load(Ordering::Relaxed),
            device_id: c.device_id.load(Ordering::Relaxed),
            location: c.location.load(Ordering::Relaxed),
            unknown: c.unknown.load(Ordering::Relaxed),
        }
    }
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}
