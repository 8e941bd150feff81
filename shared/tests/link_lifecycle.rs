//! End-to-end tests of the link manager against a scripted backend
//!
//! The mock port reads from a channel the test feeds, so packets, faults
//! and closures can be injected at any point of a session.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_link::{
    DriverInfo, LinkConfig, LinkError, LinkListener, LinkManager, LinkState, Packet,
    PermissionReply, ProbeTable, ReconnectConfig, SerialHandle, SerialParameters, UsbBackend,
    UsbDevice,
};

// ============================================================================
// Mock transport
// ============================================================================

struct MockPort {
    inject: Mutex<Sender<io::Result<Vec<u8>>>>,
    reads: Mutex<Receiver<io::Result<Vec<u8>>>>,
    closed: AtomicBool,
    control_lines: Mutex<Vec<(bool, bool)>>,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl MockPort {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        Arc::new(Self {
            inject: Mutex::new(tx),
            reads: Mutex::new(rx),
            closed: AtomicBool::new(false),
            control_lines: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        })
    }

    fn feed(&self, bytes: &[u8]) {
        let _ = self.inject.lock().unwrap().send(Ok(bytes.to_vec()));
    }

    fn fail(&self, err: io::Error) {
        let _ = self.inject.lock().unwrap().send(Err(err));
    }
}

struct MockHandle(Arc<MockPort>);

impl SerialHandle for MockHandle {
    fn set_parameters(&self, _params: &SerialParameters) -> io::Result<()> {
        Ok(())
    }

    fn set_control_lines(&self, dtr: bool, rts: bool) -> io::Result<()> {
        self.0.control_lines.lock().unwrap().push((dtr, rts));
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(io::Error::other("Connection closed"));
        }
        match self
            .0
            .reads
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_millis(5))
        {
            Ok(Ok(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::other("Device disconnected")),
        }
    }

    fn write(&self, data: &[u8], _timeout: Duration) -> io::Result<()> {
        self.0.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.0.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MockBackend {
    devices: Vec<UsbDevice>,
    table: ProbeTable,
    granted: AtomicBool,
    reply: Mutex<Option<PermissionReply>>,
    fail_next_opens: AtomicUsize,
    opens: AtomicUsize,
    ports: Mutex<VecDeque<Arc<MockPort>>>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            devices: vec![ch340(), ftdi(), UsbDevice::new("keyboard", 0x046D, 0xC31C)],
            table: ProbeTable::default(),
            granted: AtomicBool::new(true),
            reply: Mutex::new(None),
            fail_next_opens: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            ports: Mutex::new(VecDeque::new()),
        }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Port of the most recent successful open
    fn port(&self) -> Arc<MockPort> {
        self.ports.lock().unwrap().back().cloned().expect("no port opened")
    }

    fn take_reply(&self) -> PermissionReply {
        self.reply.lock().unwrap().take().expect("no permission request")
    }
}

impl UsbBackend for MockBackend {
    type Handle = MockHandle;

    fn list_devices(&self) -> Vec<UsbDevice> {
        self.devices.clone()
    }

    fn probe(&self, device: &UsbDevice) -> Option<DriverInfo> {
        self.table.probe(device)
    }

    fn has_permission(&self, _device: &UsbDevice) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request_permission(&self, _device: &UsbDevice, reply: PermissionReply) -> io::Result<()> {
        *self.reply.lock().unwrap() = Some(reply);
        Ok(())
    }

    fn open(&self, _device: &UsbDevice, _driver: &DriverInfo) -> io::Result<MockHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::other("USB device not found"));
        }

        let port = MockPort::new();
        self.ports.lock().unwrap().push_back(port.clone());
        Ok(MockHandle(port))
    }
}

// ============================================================================
// Recording listener
// ============================================================================

#[derive(Default)]
struct Recorder {
    detected: Mutex<Vec<Vec<UsbDevice>>>,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    errors: Mutex<Vec<String>>,
    denied: AtomicUsize,
    packets: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn errors(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }
}

impl LinkListener for Recorder {
    fn on_device_detected(&self, devices: &[UsbDevice]) {
        self.detected.lock().unwrap().push(devices.to_vec());
    }

    fn on_device_connected(&self, _device: &UsbDevice) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_device_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_data_received(&self, packet: &Packet) {
        self.packets.lock().unwrap().push(packet.as_bytes().to_vec());
    }

    fn on_error(&self, error: &LinkError) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn on_permission_denied(&self, _device: &UsbDevice) {
        self.denied.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn ch340() -> UsbDevice {
    UsbDevice::new("/dev/bus/usb/001/004", 0x1A86, 0x7523)
}

fn ftdi() -> UsbDevice {
    UsbDevice::new("/dev/bus/usb/001/005", 0x0403, 0x6015)
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..ReconnectConfig::default()
        },
        ..LinkConfig::default()
    }
}

fn setup(config: LinkConfig) -> (LinkManager<MockBackend>, Arc<Recorder>) {
    let link = LinkManager::new(MockBackend::new(), config, tokio::runtime::Handle::current());
    let recorder = Arc::new(Recorder::default());
    link.set_listener(recorder.clone());
    (link, recorder)
}

async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn location_packet() -> Vec<u8> {
    let payload: Vec<u8> = (0..41).collect();
    Packet::encode(0xCC, &payload).unwrap().into_vec()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_reports_serial_devices_only() {
    let (link, recorder) = setup(LinkConfig::default());

    let devices = link.scan();
    assert_eq!(devices, vec![ch340(), ftdi()]);
    assert_eq!(recorder.detected.lock().unwrap().as_slice(), &[devices]);
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_packets_survive_fragmentation() {
    let (link, recorder) = setup(LinkConfig::default());
    link.connect(&ch340()).unwrap();
    let port = link.backend().port();

    let location = location_packet();
    port.feed(&[0xFF, 0xFE]);
    port.feed(&location[..10]);
    port.feed(&location[10..]);
    port.feed(&[0x68, 0x00, 0x01, 0x55, 0x68, 0x00]);
    port.feed(&[0x05, 0x02, 0x01, 0x02, 0x03, 0x04]);

    assert!(wait_until(|| recorder.packets().len() == 3).await);
    let packets = recorder.packets();
    assert_eq!(packets[0], location);
    assert_eq!(packets[1], vec![0x68, 0x00, 0x01, 0x55]);
    assert_eq!(packets[2], vec![0x68, 0x00, 0x05, 0x02, 0x01, 0x02, 0x03, 0x04]);

    let stats = link.stats();
    assert_eq!(stats.packets.location, 1);
    assert_eq!(stats.packets.power_on, 1);
    assert_eq!(stats.packets.device_id, 1);
    assert_eq!(stats.bytes_received, 2 + 45 + 12);
    assert_eq!(stats.buffer_len, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_connect_is_noop() {
    let (link, recorder) = setup(LinkConfig::default());

    link.connect(&ch340()).unwrap();
    link.connect(&ch340()).unwrap();

    assert_eq!(link.backend().opens(), 1);
    assert_eq!(recorder.connected(), 1);
    assert_eq!(link.state(), LinkState::Open(ch340()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_other_device_switches() {
    let (link, recorder) = setup(LinkConfig::default());

    link.connect(&ch340()).unwrap();
    let first = link.backend().port();
    link.connect(&ftdi()).unwrap();

    assert!(first.closed.load(Ordering::SeqCst));
    assert_eq!(recorder.connected(), 2);
    assert_eq!(recorder.disconnected(), 1);
    assert_eq!(link.current_device(), Some(ftdi()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_device_is_rejected() {
    let (link, recorder) = setup(LinkConfig::default());

    let keyboard = UsbDevice::new("keyboard", 0x046D, 0xC31C);
    assert!(matches!(link.connect(&keyboard), Err(LinkError::NoDriver(_))));
    assert_eq!(recorder.errors(), 1);
    assert_eq!(link.state(), LinkState::Idle);
    assert_eq!(link.backend().opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_then_benign_fault() {
    let (link, recorder) = setup(fast_config());
    link.connect(&ch340()).unwrap();
    let port = link.backend().port();

    link.disconnect();
    port.fail(io::Error::other("Connection closed"));
    link.disconnect();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(recorder.errors(), 0);
    assert_eq!(recorder.disconnected(), 1);
    assert_eq!(link.backend().opens(), 1);
    assert!(port.closed.load(Ordering::SeqCst));
    assert_eq!(port.control_lines.lock().unwrap().last(), Some(&(false, false)));
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_status_keeps_link() {
    let (link, recorder) = setup(fast_config());
    link.connect(&ch340()).unwrap();
    let port = link.backend().port();

    port.fail(io::Error::other("USB get_status request failed"));
    port.feed(&[0x68, 0x00, 0x01, 0x55]);

    assert!(wait_until(|| recorder.packets().len() == 1).await);
    assert_eq!(recorder.errors(), 0);
    assert!(link.is_connected());
    assert_eq!(link.backend().opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fault_cleans_up_and_reconnects() {
    let (link, recorder) = setup(fast_config());
    link.connect(&ch340()).unwrap();
    let port = link.backend().port();

    port.fail(io::Error::other("USB bulk transfer failed"));

    assert!(wait_until(|| recorder.connected() == 2).await);
    assert!(port.closed.load(Ordering::SeqCst));
    assert_eq!(recorder.errors(), 1);
    assert_eq!(recorder.disconnected(), 1);
    assert_eq!(link.backend().opens(), 2);
    assert!(link.is_connected());
    assert_eq!(link.stats().reconnect_attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permission_fault_never_reconnects() {
    let (link, recorder) = setup(fast_config());
    link.connect(&ch340()).unwrap();

    link.backend()
        .port()
        .fail(io::Error::new(io::ErrorKind::PermissionDenied, "revoked"));

    assert!(wait_until(|| matches!(link.state(), LinkState::Faulted(_))).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(recorder.errors(), 1);
    assert_eq!(recorder.denied.load(Ordering::SeqCst), 1);
    assert_eq!(link.backend().opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_budget_and_cooldown() {
    let config = LinkConfig {
        reconnect: ReconnectConfig {
            max_attempts: 3,
            cooldown: Duration::from_millis(400),
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            ..ReconnectConfig::default()
        },
        ..LinkConfig::default()
    };
    let (link, recorder) = setup(config);

    // Initial open plus three retries, all failing
    link.backend().fail_next_opens.store(4, Ordering::SeqCst);
    assert!(link.connect(&ch340()).is_err());

    assert!(wait_until(|| link.backend().opens() == 4).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(link.backend().opens(), 4);
    assert_eq!(recorder.errors(), 4);
    assert_eq!(link.stats().reconnect_attempts, 3);

    // After the cooldown the budget is available again
    tokio::time::sleep(Duration::from_millis(400)).await;
    link.backend().fail_next_opens.store(1, Ordering::SeqCst);
    assert!(link.connect(&ch340()).is_err());

    assert!(wait_until(|| link.is_connected()).await);
    assert_eq!(link.backend().opens(), 6);
    assert_eq!(link.stats().reconnect_attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detach_forces_close() {
    let (link, recorder) = setup(fast_config());
    link.connect(&ch340()).unwrap();
    let port = link.backend().port();

    // Someone else's device
    link.on_device_detached(&ftdi());
    assert!(link.is_connected());

    link.on_device_detached(&ch340());
    assert_eq!(link.state(), LinkState::Idle);
    assert!(port.closed.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(recorder.disconnected(), 1);
    assert_eq!(recorder.errors(), 0);
    assert_eq!(link.backend().opens(), 1);
}

fn slow_reconnect_config() -> LinkConfig {
    LinkConfig {
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(200),
            ..ReconnectConfig::default()
        },
        ..LinkConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detach_after_fault_cancels_reconnect() {
    let (link, recorder) = setup(slow_reconnect_config());
    link.connect(&ch340()).unwrap();

    // Unplugging usually surfaces as a read error before the detach event
    link.backend()
        .port()
        .fail(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
    assert!(wait_until(|| matches!(link.state(), LinkState::Faulted(_))).await);

    link.on_device_detached(&ch340());
    assert_eq!(link.state(), LinkState::Idle);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(link.backend().opens(), 1);
    assert_eq!(recorder.connected(), 1);
    assert!(!link.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fault_after_reconnect_cancel_is_retried() {
    let (link, recorder) = setup(slow_reconnect_config());
    link.connect(&ch340()).unwrap();

    link.backend()
        .port()
        .fail(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
    assert!(wait_until(|| matches!(link.state(), LinkState::Faulted(_))).await);

    // Cancels the first reconnect while its delay is still running
    link.disconnect();
    link.connect(&ch340()).unwrap();
    link.backend()
        .port()
        .fail(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
    assert!(wait_until(|| matches!(link.state(), LinkState::Faulted(_))).await);

    assert!(wait_until(|| link.is_connected()).await);
    assert_eq!(link.backend().opens(), 3);
    assert_eq!(recorder.errors(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permission_granted_later() {
    let (link, recorder) = setup(LinkConfig::default());
    link.backend().granted.store(false, Ordering::SeqCst);

    link.connect(&ch340()).unwrap();
    assert_eq!(link.state(), LinkState::PermissionPending(ch340()));
    assert_eq!(link.backend().opens(), 0);

    link.backend().take_reply().grant();

    assert!(wait_until(|| link.is_connected()).await);
    assert_eq!(recorder.connected(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permission_denied() {
    let (link, recorder) = setup(LinkConfig::default());
    link.backend().granted.store(false, Ordering::SeqCst);

    link.connect(&ch340()).unwrap();
    link.backend().take_reply().deny();

    assert!(wait_until(|| recorder.denied.load(Ordering::SeqCst) == 1).await);
    assert_eq!(link.state(), LinkState::Idle);
    assert_eq!(link.backend().opens(), 0);
    assert_eq!(recorder.errors(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reply_after_disconnect_is_ignored() {
    let (link, recorder) = setup(LinkConfig::default());
    link.backend().granted.store(false, Ordering::SeqCst);

    link.connect(&ch340()).unwrap();
    let reply = link.backend().take_reply();
    link.disconnect();
    reply.grant();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(link.backend().opens(), 0);
    assert_eq!(recorder.connected(), 0);
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_auto_connects() {
    let (link, recorder) = setup(LinkConfig::default());

    link.on_device_attached(&ch340());

    assert!(link.is_connected());
    assert_eq!(recorder.detected.lock().unwrap().len(), 1);
    assert_eq!(recorder.connected(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_replayed_to_late_listener() {
    let link = LinkManager::new(
        MockBackend::new(),
        LinkConfig::default(),
        tokio::runtime::Handle::current(),
    );
    link.connect(&ch340()).unwrap();

    let recorder = Arc::new(Recorder::default());
    link.set_listener(recorder.clone());
    assert_eq!(recorder.connected(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_and_garbage_ceiling() {
    let config = LinkConfig {
        max_pending_bytes: 16,
        ..LinkConfig::default()
    };
    let (link, _recorder) = setup(config);
    link.connect(&ch340()).unwrap();
    let port = link.backend().port();

    link.send_packet(0x02, &[0x01]).unwrap();
    assert_eq!(
        port.writes.lock().unwrap().as_slice(),
        &[vec![0x68, 0x00, 0x02, 0x02, 0x01]]
    );

    port.feed(&[0xAB; 40]);
    assert!(wait_until(|| link.stats().overflow_clears == 1).await);
    assert_eq!(link.stats().buffer_len, 0);
}
