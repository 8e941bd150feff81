//! Desktop backend over the `serialport` crate
//!
//! Enumerates USB serial ports the OS already exposes, so every listed port
//! probes successfully and permission is always granted. Reads use a short
//! port timeout, which lets the read loop observe `close` promptly.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use serialport::{ClearBuffer, DataBits, SerialPort, SerialPortType};

use crate::config::{Parity, SerialParameters, StopBits};
use crate::probe::ProbeTable;
use crate::traits::{DriverFamily, DriverInfo, PermissionReply, SerialHandle, UsbBackend, UsbDevice};

/// Read timeout used when none is configured
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// [`UsbBackend`] for desktop hosts
pub struct NativeBackend {
    table: ProbeTable,
    read_timeout: Duration,
}

impl NativeBackend {
    pub fn new(table: ProbeTable, read_timeout: Duration) -> Self {
        Self {
            table,
            read_timeout,
        }
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new(ProbeTable::default(), DEFAULT_READ_TIMEOUT)
    }
}

impl UsbBackend for NativeBackend {
    type Handle = NativeHandle;

    fn list_devices(&self) -> Vec<UsbDevice> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(err) => {
                debug!("Port enumeration failed: {}", err);
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) => Some(UsbDevice {
                    name: port.port_name,
                    vendor_id: info.vid,
                    product_id: info.pid,
                    serial_number: info.serial_number,
                }),
                _ => None,
            })
            .collect()
    }

    fn probe(&self, device: &UsbDevice) -> Option<DriverInfo> {
        // The OS only lists ports it has a driver for
        self.table
            .probe(device)
            .or(Some(DriverInfo::new(DriverFamily::Custom, 1)))
    }

    fn has_permission(&self, _device: &UsbDevice) -> bool {
        true
    }

    fn request_permission(&self, _device: &UsbDevice, reply: PermissionReply) -> io::Result<()> {
        reply.grant();
        Ok(())
    }

    fn open(&self, device: &UsbDevice, _driver: &DriverInfo) -> io::Result<NativeHandle> {
        let port = serialport::new(&device.name, SerialParameters::default().baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        info!("Opened {}", device.name);
        NativeHandle::new(port)
    }
}

/// Open port split into a reader and a writer clone
pub struct NativeHandle {
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    closed: AtomicBool,
}

impl NativeHandle {
    fn new(port: Box<dyn SerialPort>) -> io::Result<Self> {
        let writer = port.try_clone()?;
        Ok(Self {
            reader: Mutex::new(Some(port)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        })
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn SerialPort>) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut writer = lock(&self.writer);
        match writer.as_mut() {
            Some(port) => f(port),
            None => Err(closed()),
        }
    }
}

impl SerialHandle for NativeHandle {
    fn set_parameters(&self, params: &SerialParameters) -> io::Result<()> {
        let data_bits = to_data_bits(params.data_bits)?;
        let parity = to_parity(params.parity)?;
        let stop_bits = to_stop_bits(params.stop_bits);

        self.with_writer(|port| {
            port.set_baud_rate(params.baud_rate)?;
            port.set_data_bits(data_bits)?;
            port.set_parity(parity)?;
            port.set_stop_bits(stop_bits)?;
            Ok(())
        })
    }

    fn set_control_lines(&self, dtr: bool, rts: bool) -> io::Result<()> {
        self.with_writer(|port| {
            port.write_data_terminal_ready(dtr)?;
            port.write_request_to_send(rts)?;
            Ok(())
        })
    }

    fn purge_buffers(&self) -> io::Result<()> {
        self.with_writer(|port| Ok(port.clear(ClearBuffer::All)?))
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = lock(&self.reader);
        if self.closed.load(Ordering::Acquire) {
            reader.take();
            return Err(closed());
        }
        let port = reader.as_mut().ok_or_else(closed)?;

        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<()> {
        self.with_writer(|port| {
            port.set_timeout(timeout)?;
            port.write_all(data)?;
            port.flush()
        })
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        lock(&self.writer).take();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
}

fn to_data_bits(bits: u8) -> io::Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported data bits: {other}"),
        )),
    }
}

fn to_parity(parity: Parity) -> io::Result<serialport::Parity> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark | Parity::Space => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{parity:?} parity is not supported on this platform"),
        )),
    }
}

/// 1.5 stop bits has no desktop equivalent and maps to two
fn to_stop_bits(stop_bits: StopBits) -> serialport::StopBits {
    match stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::OnePointFive | StopBits::Two => serialport::StopBits::Two,
    }
}
