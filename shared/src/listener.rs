//! Listener boundary
//!
//! The link reports everything through a single [`LinkListener`]. Only the
//! most recently registered listener receives events; registering a new one
//! replaces the old one outright.
//!
//! While no listener is attached (a UI detached during a configuration
//! change, say) events are held in a bounded queue and replayed in order on
//! the next [`ListenerSlot::set`]. When the queue is full the oldest event is
//! dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use heapless::Deque;
use log::{trace, warn};

use crate::error::LinkError;
use crate::protocol::Packet;
use crate::traits::UsbDevice;

/// Events held while detached
pub const PENDING_EVENTS: usize = 64;

/// Callbacks produced by the link
///
/// All methods have empty defaults so implementors pick what they need.
/// Callbacks run on link threads and must not block for long.
pub trait LinkListener: Send + Sync {
    /// Result of a scan: attached devices with a matching serial driver
    fn on_device_detected(&self, _devices: &[UsbDevice]) {}

    fn on_device_connected(&self, _device: &UsbDevice) {}

    fn on_device_disconnected(&self) {}

    /// One complete packet, header included
    fn on_data_received(&self, _packet: &Packet) {}

    fn on_error(&self, _error: &LinkError) {}

    fn on_permission_denied(&self, _device: &UsbDevice) {}
}

/// An owned listener callback
#[derive(Debug, Clone)]
pub enum LinkEvent {
    DeviceDetected(Vec<UsbDevice>),
    DeviceConnected(UsbDevice),
    DeviceDisconnected,
    DataReceived(Packet),
    Error(Arc<LinkError>),
    PermissionDenied(UsbDevice),
}

impl LinkEvent {
    /// Invoke the matching callback
    pub fn deliver(&self, listener: &dyn LinkListener) {
        match self {
            LinkEvent::DeviceDetected(devices) => listener.on_device_detected(devices),
            LinkEvent::DeviceConnected(device) => listener.on_device_connected(device),
            LinkEvent::DeviceDisconnected => listener.on_device_disconnected(),
            LinkEvent::DataReceived(packet) => listener.on_data_received(packet),
            LinkEvent::Error(error) => listener.on_error(error),
            LinkEvent::PermissionDenied(device) => listener.on_permission_denied(device),
        }
    }
}

struct SlotState {
    listener: Option<Arc<dyn LinkListener>>,
    pending: Deque<LinkEvent, PENDING_EVENTS>,
    dropped: u64,
}

/// Single-subscriber callback table with a replay queue
pub struct ListenerSlot {
    state: Mutex<SlotState>,
}

impl ListenerSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                listener: None,
                pending: Deque::new(),
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach `listener`, replacing any previous one, and replay queued events
    pub fn set(&self, listener: Arc<dyn LinkListener>) {
        let replay: Vec<LinkEvent> = {
            let mut state = self.lock();
            state.listener = Some(listener.clone());
            if state.dropped > 0 {
                warn!("{} listener events dropped while detached", state.dropped);
                state.dropped = 0;
            }
            core::iter::from_fn(|| state.pending.pop_front()).collect()
        };

        for event in &replay {
            event.deliver(listener.as_ref());
        }
    }

    /// Detach the current listener; later events are queued
    pub fn clear(&self) -> Option<Arc<dyn LinkListener>> {
        self.lock().listener.take()
    }

    pub fn is_attached(&self) -> bool {
        self.lock().listener.is_some()
    }

    /// Events waiting for a listener
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Deliver now, or queue when detached
    pub fn emit(&self, event: LinkEvent) {
        let listener = {
            let mut state = self.lock();
            match &state.listener {
                Some(listener) => listener.clone(),
                None => {
                    trace!("No listener attached, queueing {:?}", event);
                    if state.pending.is_full() {
                        state.pending.pop_front();
                        state.dropped += 1;
                    }
                    // Cannot fail: a slot was freed above
                    let _ = state.pending.push_back(event);
                    return;
                }
            }
        };

        event.deliver(listener.as_ref());
    }
}

impl Default for ListenerSlot {
    fn default() -> Self {
        Self::new()
    }
}
