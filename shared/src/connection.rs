//! # Connection State Machine
//!
//! [`LinkManager`] owns the lifecycle of the single serial link: discovery,
//! permission, open, the read loop, teardown and automatic reconnects.
//!
//! ```text
//!            scan()                    permission granted
//!   Idle ───────────▶ Scanning      ┌────────────────────┐
//!    ▲ ◀──────────────────┘         │                    ▼
//!    │                      PermissionPending ──▶ Opening ──▶ Open
//!    │   connect()  ────────────────┘  (or granted already) │    │
//!    │                                                     │    │ fault
//!    │◀──────────── Closing ◀─── disconnect() / detach ────┘    ▼
//!    └─────────────────────────────────────────────────────── Faulted
//! ```
//!
//! ## Threads
//!
//! - **Read loop**: a dedicated thread blocking in [`SerialHandle::read`].
//!   Chunks go into the framing buffer and wake the dispatch task.
//! - **Dispatch task**: one tokio task per session, the only reader of the
//!   framing buffer. Delivers packets through the [`PacketDispatcher`].
//! - **Operations**: connect, permission replies, disconnect, detach, fault
//!   cleanup and reconnects serialise on one operation mutex. Listener events
//!   raised by an operation are emitted after that mutex is released, so
//!   callbacks may call back into the manager.
//!
//! Every session gets a generation number. A fault reported by a session
//! that has already been replaced or torn down is treated as benign.

use core::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer::FramingBuffer;
use crate::config::{LinkConfig, SerialParameters};
use crate::dispatcher::{DispatchCounts, PacketDispatcher};
use crate::error::{LinkError, LinkResult};
use crate::fault::{classify, FaultClass, FaultContext};
use crate::listener::{LinkEvent, LinkListener, ListenerSlot};
use crate::protocol::Packet;
use crate::reconnect::ReconnectPolicy;
use crate::traits::{DriverInfo, PermissionReply, SerialHandle, UsbBackend, UsbDevice};

/// Pause after a transient status error before reading again
const TRANSIENT_PAUSE: Duration = Duration::from_millis(10);

/// Name of the read loop thread
const READ_THREAD_NAME: &str = "serial-read-loop";

/// Lifecycle state of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    /// Waiting for the user to answer a permission request
    PermissionPending(UsbDevice),
    Opening(UsbDevice),
    Open(UsbDevice),
    Closing,
    /// Last session ended with a fault; holds the error message
    Faulted(String),
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Scanning => "scanning",
            LinkState::PermissionPending(_) => "permission_pending",
            LinkState::Opening(_) => "opening",
            LinkState::Open(_) => "open",
            LinkState::Closing => "closing",
            LinkState::Faulted(_) => "faulted",
        }
    }

    /// Whether a new connect may start from this state
    fn is_at_rest(&self) -> bool {
        matches!(
            self,
            LinkState::Idle | LinkState::Scanning | LinkState::Faulted(_)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::PermissionPending(device)
            | LinkState::Opening(device)
            | LinkState::Open(device) => write!(f, "{} {}", self.name(), device),
            LinkState::Faulted(reason) => write!(f, "faulted: {}", reason),
            _ => f.write_str(self.name()),
        }
    }
}

/// Snapshot returned by [`LinkManager::stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub state: String,
    pub device: Option<UsbDevice>,
    pub bytes_received: u64,
    pub packets: DispatchCounts,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    /// Times the framing buffer was cleared for holding too many undecodable bytes
    pub overflow_clears: u64,
    /// Reconnect attempts charged in the current window
    pub reconnect_attempts: u32,
}

/// What the read loop does after reporting a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadControl {
    Continue,
    Stop,
}

#[derive(Default)]
struct Counters {
    bytes_received: AtomicU64,
    overflow_clears: AtomicU64,
}

/// Blocking reader feeding the framing buffer
struct ReadLoop<H> {
    generation: u64,
    handle: Arc<H>,
    buffer: Arc<Mutex<FramingBuffer>>,
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    chunk_size: usize,
    done: mpsc::Sender<()>,
}

impl<H: SerialHandle> ReadLoop<H> {
    fn run(self, on_fault: impl Fn(u64, io::Error) -> ReadControl) {
        debug!("Read loop {} started", self.generation);
        let mut chunk = vec![0u8; self.chunk_size.max(1)];

        while !self.stop.load(Ordering::Acquire) {
            match self.handle.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => {
                    trace!("Read {} bytes", n);
                    lock(&self.buffer).write(&chunk[..n]);
                    self.counters
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    self.notify.notify_one();
                }
                Err(err) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    match on_fault(self.generation, err) {
                        ReadControl::Continue => thread::sleep(TRANSIENT_PAUSE),
                        ReadControl::Stop => break,
                    }
                }
            }
        }

        debug!("Read loop {} finished", self.generation);
        let _ = self.done.send(());
    }
}

/// Resources of one open link
struct Session<H> {
    generation: u64,
    device: UsbDevice,
    handle: Arc<H>,
    buffer: Arc<Mutex<FramingBuffer>>,
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    reader: Option<thread::JoinHandle<()>>,
    dispatch: JoinHandle<()>,
}

struct PendingPermission {
    id: u64,
    device: UsbDevice,
    driver: DriverInfo,
}

/// Reconnect waiting out its backoff delay
struct ScheduledReconnect {
    device: UsbDevice,
    /// Epoch at scheduling time; a later epoch means it was cancelled
    epoch: u64,
}

struct Inner<B: UsbBackend> {
    backend: B,
    runtime: Handle,
    config: LinkConfig,
    serial: Mutex<SerialParameters>,
    listeners: ListenerSlot,
    dispatcher: PacketDispatcher,
    counters: Arc<Counters>,

    op: Mutex<()>,
    state: Mutex<LinkState>,
    session: Mutex<Option<Session<B::Handle>>>,
    pending: Mutex<Option<PendingPermission>>,
    policy: Mutex<ReconnectPolicy>,
    reconnect: Mutex<Option<ScheduledReconnect>>,

    next_generation: AtomicU64,
    /// Generation of the live session, 0 when there is none
    active_generation: AtomicU64,
    next_request: AtomicU64,
    /// Bumped by explicit disconnects and detaches to cancel pending reconnects
    epoch: AtomicU64,
    disconnecting: AtomicBool,
    detached: AtomicBool,
    shut_down: AtomicBool,
}

/// Owner of the serial link
///
/// Cheap to clone; all clones drive the same link. Construct one per
/// application and hand it to whoever needs it.
pub struct LinkManager<B: UsbBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: UsbBackend> Clone for LinkManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: UsbBackend> LinkManager<B> {
    /// Create a manager; background tasks run on `runtime`
    pub fn new(backend: B, config: LinkConfig, runtime: Handle) -> Self {
        info!(
            "Link manager created ({} baud, reconnect {})",
            config.serial.baud_rate,
            if config.reconnect.enabled { "on" } else { "off" }
        );

        let inner = Inner {
            serial: Mutex::new(config.serial),
            dispatcher: PacketDispatcher::from_config(&config),
            policy: Mutex::new(ReconnectPolicy::new(config.reconnect.clone())),
            backend,
            runtime,
            config,
            listeners: ListenerSlot::new(),
            counters: Arc::new(Counters::default()),
            op: Mutex::new(()),
            state: Mutex::new(LinkState::Idle),
            session: Mutex::new(None),
            pending: Mutex::new(None),
            reconnect: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            active_generation: AtomicU64::new(0),
            next_request: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            disconnecting: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Replace the listener; events queued while none was attached are replayed
    pub fn set_listener(&self, listener: Arc<dyn LinkListener>) {
        self.inner.listeners.set(listener);
    }

    pub fn clear_listener(&self) {
        self.inner.listeners.clear();
    }

    /// Enumerate devices with a matching serial driver
    ///
    /// The result is also reported through `on_device_detected`. Scanning
    /// while a link is active leaves its state untouched.
    pub fn scan(&self) -> Vec<UsbDevice> {
        self.inner.scan()
    }

    /// Connect to `device`
    ///
    /// Returns once the link is open, or once a permission request has been
    /// issued. Failures are returned and also reported through `on_error`.
    pub fn connect(&self, device: &UsbDevice) -> LinkResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(LinkError::ShutDown);
        }
        self.inner
            .with_op(|outbox| self.inner.connect_locked(device.clone(), outbox))
    }

    /// Close the link; a no-op when nothing is connected
    pub fn disconnect(&self) {
        self.inner.with_op(|outbox| {
            self.inner.cancel_reconnects();
            self.inner.disconnecting.store(true, Ordering::Release);
            self.inner.close_locked(outbox);
            self.inner.disconnecting.store(false, Ordering::Release);
        });
    }

    /// A USB device appeared
    ///
    /// Rescans, and connects to the device when it probes as serial, the
    /// link is idle and auto-connect is enabled.
    pub fn on_device_attached(&self, device: &UsbDevice) {
        info!("Device attached: {}", device);
        self.inner.scan();

        if !self.inner.config.auto_connect_on_attach
            || self.inner.shut_down.load(Ordering::Acquire)
        {
            return;
        }
        if !self.state().is_at_rest() || self.inner.backend.probe(device).is_none() {
            return;
        }
        if let Err(err) = self.connect(device) {
            debug!("Auto-connect to {} failed: {}", device, err);
        }
    }

    /// A USB device went away; closes the link when it was ours
    pub fn on_device_detached(&self, device: &UsbDevice) {
        self.inner.with_op(|outbox| {
            let inner = &self.inner;
            let current = match &*lock(&inner.state) {
                LinkState::Open(current)
                | LinkState::Opening(current)
                | LinkState::PermissionPending(current) => current == device,
                _ => false,
            };
            // A read fault usually beats the detach notification
            let awaiting_reconnect = lock(&inner.reconnect)
                .as_ref()
                .is_some_and(|scheduled| &scheduled.device == device);
            let ours = current || awaiting_reconnect;
            if !ours {
                debug!("Detached device {} is not the current device", device);
                return;
            }

            warn!("Current device detached: {}", device);
            inner.cancel_reconnects();
            inner.detached.store(true, Ordering::Release);
            inner.close_locked(outbox);
            inner.detached.store(false, Ordering::Release);
        });
    }

    /// Write raw bytes with the configured write timeout
    pub fn send(&self, data: &[u8]) -> LinkResult<()> {
        let handle = lock(&self.inner.session)
            .as_ref()
            .map(|session| session.handle.clone())
            .ok_or(LinkError::NotConnected)?;

        handle
            .write(data, self.inner.config.write_timeout)
            .map_err(|err| {
                warn!("Write of {} bytes failed: {}", data.len(), err);
                LinkError::Io(err)
            })
    }

    /// Encode and write one framed packet
    pub fn send_packet(&self, command: u8, payload: &[u8]) -> LinkResult<()> {
        let packet = Packet::encode(command, payload)?;
        self.send(packet.as_bytes())
    }

    /// Store new line parameters and apply them to an open link
    pub fn set_serial_parameters(&self, params: SerialParameters) -> LinkResult<()> {
        *lock(&self.inner.serial) = params;

        let handle = lock(&self.inner.session)
            .as_ref()
            .map(|session| session.handle.clone());
        if let Some(handle) = handle {
            handle.set_parameters(&params).map_err(|err| {
                warn!("Applying serial parameters failed: {}", err);
                LinkError::Io(err)
            })?;
            info!("Serial parameters applied: {} baud", params.baud_rate);
        }
        Ok(())
    }

    pub fn serial_parameters(&self) -> SerialParameters {
        *lock(&self.inner.serial)
    }

    pub fn state(&self) -> LinkState {
        lock(&self.inner.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*lock(&self.inner.state), LinkState::Open(_))
    }

    /// Device being opened or currently open
    pub fn current_device(&self) -> Option<UsbDevice> {
        match &*lock(&self.inner.state) {
            LinkState::Opening(device) | LinkState::Open(device) => Some(device.clone()),
            _ => None,
        }
    }

    pub fn stats(&self) -> LinkStats {
        let inner = &self.inner;
        let (buffer_len, buffer_capacity) = match &*lock(&inner.session) {
            Some(session) => {
                let buffer = lock(&session.buffer);
                (buffer.len(), buffer.capacity())
            }
            None => (0, inner.config.buffer_capacity),
        };
        let state = lock(&inner.state).clone();

        LinkStats {
            state: state.name().to_string(),
            device: match state {
                LinkState::Opening(device) | LinkState::Open(device) => Some(device),
                _ => None,
            },
            bytes_received: inner.counters.bytes_received.load(Ordering::Relaxed),
            packets: inner.dispatcher.counts(),
            buffer_len,
            buffer_capacity,
            overflow_clears: inner.counters.overflow_clears.load(Ordering::Relaxed),
            reconnect_attempts: lock(&inner.policy).attempts(),
        }
    }

    /// Close the link for good and detach the listener
    ///
    /// Later calls to `connect` fail with [`LinkError::ShutDown`].
    pub fn shutdown(&self) {
        info!("Shutting down link manager");
        self.inner.shut_down.store(true, Ordering::Release);
        self.disconnect();
        self.inner.listeners.clear();
    }
}

impl<B: UsbBackend> Inner<B> {
    /// Run an operation under the operation mutex, emitting its events after release
    fn with_op<T>(self: &Arc<Self>, f: impl FnOnce(&mut Vec<LinkEvent>) -> T) -> T {
        let mut outbox = Vec::new();
        let result = {
            let _op = lock(&self.op);
            f(&mut outbox)
        };
        for event in outbox {
            self.listeners.emit(event);
        }
        result
    }

    fn set_state(&self, state: LinkState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("State {} -> {}", current.name(), state.name());
            *current = state;
        }
    }

    fn cancel_reconnects(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(scheduled) = lock(&self.reconnect).take() {
            debug!("Cancelled reconnect to {}", scheduled.device);
        }
        lock(&self.pending).take();
    }

    fn scan(&self) -> Vec<UsbDevice> {
        let entered = {
            let mut state = lock(&self.state);
            if matches!(*state, LinkState::Idle | LinkState::Faulted(_)) {
                *state = LinkState::Scanning;
                true
            } else {
                false
            }
        };

        let devices: Vec<UsbDevice> = self
            .backend
            .list_devices()
            .into_iter()
            .filter(|device| self.backend.probe(device).is_some())
            .collect();
        info!("Scan found {} serial device(s)", devices.len());

        if entered {
            let mut state = lock(&self.state);
            if *state == LinkState::Scanning {
                *state = LinkState::Idle;
            }
        }

        self.listeners
            .emit(LinkEvent::DeviceDetected(devices.clone()));
        devices
    }

    fn connect_locked(self: &Arc<Self>, device: UsbDevice, outbox: &mut Vec<LinkEvent>) -> LinkResult<()> {
        let current = lock(&self.state).clone();
        match current {
            LinkState::Open(ref open) if *open == device => {
                debug!("Already connected to {}", device);
                return Ok(());
            }
            LinkState::Open(ref open) => {
                info!("Switching from {} to {}", open, device);
                self.close_locked(outbox);
            }
            LinkState::PermissionPending(ref waiting) => {
                debug!("Replacing pending permission request for {}", waiting);
                lock(&self.pending).take();
            }
            _ => {}
        }

        let driver = match self.backend.probe(&device) {
            Some(driver) => driver,
            None => return self.reject(LinkError::NoDriver(device.to_string()), outbox),
        };
        if driver.port_count == 0 {
            return self.reject(LinkError::NoPorts(device.to_string()), outbox);
        }

        if self.backend.has_permission(&device) {
            return self.open_locked(device, driver, outbox);
        }

        let id = self.next_request.fetch_add(1, Ordering::AcqRel);
        info!("Requesting permission for {}", device);
        *lock(&self.pending) = Some(PendingPermission {
            id,
            device: device.clone(),
            driver,
        });
        self.set_state(LinkState::PermissionPending(device.clone()));

        let weak = Arc::downgrade(self);
        let reply = PermissionReply::new(move |granted| {
            if let Some(inner) = weak.upgrade() {
                let runtime = inner.runtime.clone();
                runtime.spawn_blocking(move || inner.permission_result(id, granted));
            }
        });

        if let Err(err) = self.backend.request_permission(&device, reply) {
            lock(&self.pending).take();
            return self.reject(LinkError::Io(err), outbox);
        }
        Ok(())
    }

    /// Report a connect precondition failure and return to idle
    fn reject(&self, err: LinkError, outbox: &mut Vec<LinkEvent>) -> LinkResult<()> {
        error!("Cannot connect: {}", err);
        self.set_state(LinkState::Idle);
        outbox.push(LinkEvent::Error(Arc::new(copy_error(&err))));
        Err(err)
    }

    fn permission_result(self: &Arc<Self>, id: u64, granted: bool) {
        self.with_op(|outbox| {
            let pending = {
                let mut pending = lock(&self.pending);
                match pending.as_ref() {
                    Some(request) if request.id == id => pending.take(),
                    _ => None,
                }
            };
            let Some(request) = pending else {
                debug!("Ignoring stale permission reply");
                return;
            };
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }

            if !granted {
                warn!("Permission denied for {}", request.device);
                self.set_state(LinkState::Idle);
                outbox.push(LinkEvent::PermissionDenied(request.device));
                return;
            }

            info!("Permission granted for {}", request.device);
            if let Err(err) = self.open_locked(request.device, request.driver, outbox) {
                debug!("Open after permission grant failed: {}", err);
            }
        });
    }

    fn open_locked(
        self: &Arc<Self>,
        device: UsbDevice,
        driver: DriverInfo,
        outbox: &mut Vec<LinkEvent>,
    ) -> LinkResult<()> {
        self.set_state(LinkState::Opening(device.clone()));
        info!("Opening {} ({:?} driver)", device, driver.family);

        let handle = match self.backend.open(&device, &driver) {
            Ok(handle) => Arc::new(handle),
            Err(err) => return self.open_failed(device, err, outbox),
        };

        let params = *lock(&self.serial);
        let configured = handle
            .set_parameters(&params)
            .and_then(|_| handle.set_control_lines(true, true));
        if let Err(err) = configured {
            let _ = handle.close();
            return self.open_failed(device, err, outbox);
        }
        if let Err(err) = handle.purge_buffers() {
            debug!("Purging hardware buffers failed: {}", err);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let session = match self.start_session(generation, device.clone(), handle.clone()) {
            Ok(session) => session,
            Err(err) => {
                let _ = handle.close();
                return self.open_failed(device, err, outbox);
            }
        };

        *lock(&self.session) = Some(session);
        self.active_generation.store(generation, Ordering::Release);
        lock(&self.policy).reset();
        self.set_state(LinkState::Open(device.clone()));
        info!(
            "Connected to {} at {} baud (session {})",
            device, params.baud_rate, generation
        );
        outbox.push(LinkEvent::DeviceConnected(device));
        Ok(())
    }

    fn start_session(
        self: &Arc<Self>,
        generation: u64,
        device: UsbDevice,
        handle: Arc<B::Handle>,
    ) -> io::Result<Session<B::Handle>> {
        let buffer = Arc::new(Mutex::new(FramingBuffer::with_capacity(
            self.config.buffer_capacity,
        )));
        let notify = Arc::new(Notify::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let read_loop = ReadLoop {
            generation,
            handle: handle.clone(),
            buffer: buffer.clone(),
            notify: notify.clone(),
            stop: stop.clone(),
            counters: self.counters.clone(),
            chunk_size: self.config.read_chunk_size,
            done: done_tx,
        };
        let weak = Arc::downgrade(self);
        let reader = thread::Builder::new()
            .name(READ_THREAD_NAME.into())
            .spawn(move || {
                read_loop.run(|generation, err| match weak.upgrade() {
                    Some(inner) => inner.report_read_fault(generation, err),
                    None => ReadControl::Stop,
                })
            })?;

        let dispatch = self.runtime.spawn(dispatch_loop(
            Arc::downgrade(self),
            buffer.clone(),
            notify,
        ));

        Ok(Session {
            generation,
            device,
            handle,
            buffer,
            stop,
            done: done_rx,
            reader: Some(reader),
            dispatch,
        })
    }

    /// Classify and report a failed open
    fn open_failed(
        self: &Arc<Self>,
        device: UsbDevice,
        err: io::Error,
        outbox: &mut Vec<LinkEvent>,
    ) -> LinkResult<()> {
        let class = classify(&err, self.fault_context(false));
        let error = LinkError::Fault { class, source: err };

        if !class.reports_error() {
            debug!("Open of {} interrupted: {}", device, error);
            self.set_state(LinkState::Idle);
            return Err(error);
        }

        error!("Opening {} failed: {}", device, error);
        self.set_state(LinkState::Faulted(error.to_string()));
        outbox.push(LinkEvent::Error(Arc::new(copy_error(&error))));
        if class == FaultClass::Permission {
            outbox.push(LinkEvent::PermissionDenied(device.clone()));
        }
        self.schedule_reconnect(device, class);
        Err(error)
    }

    fn fault_context(&self, stale: bool) -> FaultContext {
        FaultContext {
            disconnecting: self.disconnecting.load(Ordering::Acquire),
            detached: self.detached.load(Ordering::Acquire),
            stale,
        }
    }

    /// Called on the read thread for every read error
    fn report_read_fault(self: &Arc<Self>, generation: u64, err: io::Error) -> ReadControl {
        let stale = self.active_generation.load(Ordering::Acquire) != generation;
        let class = classify(&err, self.fault_context(stale));

        match class {
            FaultClass::BenignClose => {
                debug!("Read loop {} closed: {}", generation, err);
                ReadControl::Stop
            }
            FaultClass::TransientStatus => {
                debug!("Ignoring transient status error: {}", err);
                ReadControl::Continue
            }
            _ => {
                warn!("Read loop {} fault ({}): {}", generation, class, err);
                // Cleanup joins the read thread, so it must run elsewhere
                let inner = self.clone();
                self.runtime
                    .spawn_blocking(move || inner.handle_fault(generation, class, err));
                ReadControl::Stop
            }
        }
    }

    fn handle_fault(self: &Arc<Self>, generation: u64, class: FaultClass, err: io::Error) {
        self.with_op(|outbox| {
            if self.active_generation.load(Ordering::Acquire) != generation {
                debug!("Fault from replaced session {} ignored: {}", generation, err);
                return;
            }

            let Some(device) = self.teardown_locked(outbox) else {
                return;
            };

            let error = LinkError::Fault { class, source: err };
            error!("Link to {} failed: {}", device, error);
            self.set_state(LinkState::Faulted(error.to_string()));
            outbox.push(LinkEvent::Error(Arc::new(error)));
            if class == FaultClass::Permission {
                outbox.push(LinkEvent::PermissionDenied(device.clone()));
            }
            self.schedule_reconnect(device, class);
        });
    }

    /// Tear down whatever is active and return to idle
    fn close_locked(&self, outbox: &mut Vec<LinkEvent>) {
        lock(&self.pending).take();
        match self.teardown_locked(outbox) {
            Some(device) => info!("Disconnected from {}", device),
            None => debug!("Disconnect with no open link"),
        }
        self.set_state(LinkState::Idle);
    }

    /// Stop the read loop, release the handle and clear the buffer
    ///
    /// Returns the device of the session that was closed.
    fn teardown_locked(&self, outbox: &mut Vec<LinkEvent>) -> Option<UsbDevice> {
        let mut session = lock(&self.session).take()?;
        self.active_generation.store(0, Ordering::Release);
        self.set_state(LinkState::Closing);

        session.stop.store(true, Ordering::Release);
        if let Err(err) = session.handle.set_control_lines(false, false) {
            debug!("Dropping DTR/RTS failed: {}", err);
        }
        if let Err(err) = session.handle.close() {
            debug!("Closing port failed: {}", err);
        }

        match session.done.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(reader) = session.reader.take() {
                    if reader.join().is_err() {
                        error!("Read loop {} panicked", session.generation);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Read loop {} did not stop within {:?}, abandoning it",
                    session.generation, self.config.join_timeout
                );
            }
        }

        session.dispatch.abort();
        lock(&session.buffer).clear();
        outbox.push(LinkEvent::DeviceDisconnected);
        Some(session.device)
    }

    fn schedule_reconnect(self: &Arc<Self>, device: UsbDevice, class: FaultClass) {
        if !class.reconnect_eligible()
            || self.shut_down.load(Ordering::Acquire)
            || self.disconnecting.load(Ordering::Acquire)
            || self.detached.load(Ordering::Acquire)
        {
            return;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut scheduled = lock(&self.reconnect);
        if scheduled.as_ref().is_some_and(|pending| pending.epoch == epoch) {
            debug!("Reconnect already scheduled");
            return;
        }

        let weight = if class == FaultClass::Critical {
            self.config.reconnect.critical_attempt_weight
        } else {
            1
        };
        let now = tokio::time::Instant::now().into_std();
        let (delay, attempts) = {
            let mut policy = lock(&self.policy);
            (policy.next_delay(now, weight), policy.attempts())
        };
        let Some(delay) = delay else {
            warn!(
                "Reconnect budget exhausted after {} attempts, waiting for cooldown",
                attempts
            );
            return;
        };

        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            device, delay, attempts, self.config.reconnect.max_attempts
        );
        *scheduled = Some(ScheduledReconnect {
            device: device.clone(),
            epoch,
        });
        drop(scheduled);

        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let _ = tokio::task::spawn_blocking(move || inner.run_reconnect(device, epoch)).await;
            }
        });
    }

    fn run_reconnect(self: &Arc<Self>, device: UsbDevice, epoch: u64) {
        self.with_op(|outbox| {
            let current = {
                let mut scheduled = lock(&self.reconnect);
                match scheduled.as_ref() {
                    Some(pending) if pending.epoch == epoch => scheduled.take().is_some(),
                    _ => false,
                }
            };

            if !current
                || self.epoch.load(Ordering::Acquire) != epoch
                || self.shut_down.load(Ordering::Acquire)
            {
                debug!("Reconnect to {} cancelled", device);
                return;
            }
            if !lock(&self.state).is_at_rest() {
                debug!("Link busy, skipping reconnect to {}", device);
                return;
            }

            info!("Reconnect attempt to {}", device);
            if let Err(err) = self.connect_locked(device, outbox) {
                debug!("Reconnect failed: {}", err);
            }
        });
    }

    /// Deliver every complete packet; clear the buffer if garbage piles up
    fn drain(&self, buffer: &Mutex<FramingBuffer>) {
        loop {
            let packet = {
                let mut buffer = lock(buffer);
                match buffer.read_packet() {
                    Some(packet) => packet,
                    None => {
                        if buffer.len() > self.config.max_pending_bytes {
                            warn!(
                                "Discarding {} undecodable bytes from framing buffer",
                                buffer.len()
                            );
                            buffer.clear();
                            self.counters.overflow_clears.fetch_add(1, Ordering::Relaxed);
                        }
                        return;
                    }
                }
            };
            self.dispatcher.dispatch(packet, &self.listeners);
        }
    }
}

impl<B: UsbBackend> Drop for Inner<B> {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(session) = session {
            debug!("Releasing session {} on drop", session.generation);
            session.stop.store(true, Ordering::Release);
            let _ = session.handle.close();
            session.dispatch.abort();
        }
    }
}

async fn dispatch_loop<B: UsbBackend>(
    inner: Weak<Inner<B>>,
    buffer: Arc<Mutex<FramingBuffer>>,
    notify: Arc<Notify>,
) {
    loop {
        notify.notified().await;
        match inner.upgrade() {
            Some(inner) => inner.drain(&buffer),
            None => break,
        }
    }
}

/// Recover the guard from a poisoned mutex
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rebuild an error for a second recipient (io::Error is not Clone)
fn copy_error(err: &LinkError) -> LinkError {
    let copy_io = |err: &io::Error| io::Error::new(err.kind(), err.to_string());
    match err {
        LinkError::NoDriver(device) => LinkError::NoDriver(device.clone()),
        LinkError::NoPorts(device) => LinkError::NoPorts(device.clone()),
        LinkError::PermissionDenied(device) => LinkError::PermissionDenied(device.clone()),
        LinkError::NotConnected => LinkError::NotConnected,
        LinkError::ShutDown => LinkError::ShutDown,
        LinkError::Fault { class, source } => LinkError::Fault {
            class: *class,
            source: copy_io(source),
        },
        LinkError::Io(source) => LinkError::Io(copy_io(source)),
        LinkError::Frame(source) => LinkError::Frame(*source),
        LinkError::Config(message) => LinkError::Config(message.clone()),
    }
}
