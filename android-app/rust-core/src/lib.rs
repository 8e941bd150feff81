//! # Android JNI Rust Core Library
//!
//! This library exposes the serial link core to the Android USB serial
//! plugin. It handles:
//!
//! - Link lifecycle (scan, permission, connect, reconnect) via `serial-link`
//! - Calls into the Java USB stack for enumeration and port I/O
//! - Forwarding packets and link events back to Java
//!
//! ## JNI Bridge Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Android Plugin (Kotlin)                      │
//! │                                                                 │
//! │  ┌─────────────────┐     ┌──────────────────────────────────┐  │
//! │  │  USB receivers  │────►│   RustBridge (owns UsbManager)   │  │
//! │  └─────────────────┘     └──────────────────────────────────┘  │
//! │                               │  JNI calls        ▲ callbacks  │
//! │                               ▼                   │            │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │                    rust_core (this lib)                   │  │
//! │  │                                                           │  │
//! │  │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐   │  │
//! │  │  │ LinkManager │  │ JniBackend  │  │   JniListener   │   │  │
//! │  │  │ (shared)    │  │ (port I/O)  │  │   (events)      │   │  │
//! │  │  └─────────────┘  └─────────────┘  └─────────────────┘   │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## JNI Functions Exported
//!
//! All functions live on `com.saemaps.android.usbserial.RustBridge`:
//!
//! - `init`: Initialize logging
//! - `create` / `destroy`: Own a link manager through an opaque `long` handle
//! - `scan`, `connect`, `disconnect`: Link lifecycle
//! - `onPermissionResult`, `onDeviceAttached`, `onDeviceDetached`: USB broadcasts
//! - `send`, `setSerialParameters`, `isConnected`, `getStats`
//!
//! `connect` and `disconnect` block while a port opens or closes; call them
//! off the main thread.

use std::io;
use std::sync::{Arc, Once};
use std::time::Duration;

use jni::objects::{JByteArray, JClass, JObject, JString};
use jni::sys::{jboolean, jint, jlong, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{debug, error, info, warn, LevelFilter};
use thiserror::Error;
use tokio::runtime::Runtime;

use serial_link::{LinkConfig, LinkError, LinkManager, UsbDevice};

pub mod java;
pub mod params;

use java::{JavaBridge, JniBackend, JniListener};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Time given to background tasks when a bridge is destroyed
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur in the JNI bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid bridge handle")]
    InvalidHandle,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("JNI error: {0}")]
    Jni(#[from] jni::errors::Error),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("runtime error: {0}")]
    Runtime(#[from] io::Error),
}

/// Everything behind one Java handle
pub struct Bridge {
    runtime: Runtime,
    link: LinkManager<JniBackend>,
}

impl Bridge {
    pub fn new(java: JavaBridge, config: LinkConfig) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("serial-link-rt")
            .enable_time()
            .build()?;

        let link = LinkManager::new(
            JniBackend::new(java.clone()),
            config,
            runtime.handle().clone(),
        );
        link.set_listener(Arc::new(JniListener::new(java)));

        Ok(Self { runtime, link })
    }

    pub fn link(&self) -> &LinkManager<JniBackend> {
        &self.link
    }

    fn shutdown(self) {
        self.link.shutdown();
        self.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    }
}

fn into_handle(bridge: Bridge) -> jlong {
    Box::into_raw(Box::new(bridge)) as jlong
}

/// Borrow the bridge behind a handle returned by `create`
///
/// # Safety
///
/// `handle` must be 0 or a value returned by `create` that has not yet been
/// passed to `destroy`.
unsafe fn bridge_ref<'a>(handle: jlong) -> Result<&'a Bridge, BridgeError> {
    (handle as *const Bridge)
        .as_ref()
        .ok_or(BridgeError::InvalidHandle)
}

fn to_jboolean(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// Log a failed call and substitute the sentinel value
fn or_log<T>(call: &str, result: Result<T, BridgeError>, fallback: T) -> T {
    result.unwrap_or_else(|err| {
        error!("{} failed: {}", call, err);
        fallback
    })
}

fn java_string(env: &mut JNIEnv, value: &JString) -> Result<String, BridgeError> {
    Ok(env.get_string(value)?.into())
}

fn parse_device(json: &str) -> Result<UsbDevice, BridgeError> {
    Ok(serde_json::from_str(json)?)
}

fn parse_config(json: Option<&str>) -> Result<LinkConfig, BridgeError> {
    match json.map(str::trim) {
        None | Some("") => Ok(LinkConfig::default()),
        Some(json) => Ok(LinkConfig::from_json(json)?),
    }
}

/// Initialize the Rust native library
///
/// Called from Kotlin:
/// ```kotlin
/// external fun init(): Boolean
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_init(
    _env: JNIEnv,
    _class: JClass,
) -> jboolean {
    // Initialize Android logger (only once)
    INIT_LOGGER.call_once(|| {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(LevelFilter::Debug)
                .with_tag("RustCore"),
        );
    });

    info!("Rust core library initialized");
    info!("Serial link version: {}", serial_link::VERSION);

    JNI_TRUE
}

/// Create a link manager bound to a Java bridge object
///
/// Called from Kotlin:
/// ```kotlin
/// external fun create(bridge: RustBridge, configJson: String?): Long
/// ```
///
/// Returns: Handle for the other calls, or 0 on error
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_create(
    mut env: JNIEnv,
    _class: JClass,
    bridge: JObject,
    config_json: JString,
) -> jlong {
    let result = (|| -> Result<jlong, BridgeError> {
        let json = if config_json.is_null() {
            None
        } else {
            Some(java_string(&mut env, &config_json)?)
        };
        let config = parse_config(json.as_deref())?;

        let vm = env.get_java_vm()?;
        let object = env.new_global_ref(&bridge)?;
        let bridge = Bridge::new(JavaBridge::new(vm, object), config)?;
        info!("Link bridge created");
        Ok(into_handle(bridge))
    })();

    or_log("create", result, 0)
}

/// Shut the link down and free the handle
///
/// Called from Kotlin:
/// ```kotlin
/// external fun destroy(handle: Long)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_destroy(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle == 0 {
        warn!("destroy called with a null handle");
        return;
    }
    // SAFETY: the handle came from `create` and Java drops it after this call
    let bridge = unsafe { Box::from_raw(handle as *mut Bridge) };
    bridge.shutdown();
    info!("Link bridge destroyed");
}

/// Scan for serial devices
///
/// Called from Kotlin:
/// ```kotlin
/// external fun scan(handle: Long): String
/// ```
///
/// Returns: JSON array of devices, or null on error
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_scan(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = (|| -> Result<jstring, BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let json = serde_json::to_string(&bridge.link.scan())?;
        Ok(env.new_string(json)?.into_raw())
    })();

    or_log("scan", result, std::ptr::null_mut())
}

/// Connect to a device
///
/// Called from Kotlin:
/// ```kotlin
/// external fun connect(handle: Long, deviceJson: String): Boolean
/// ```
///
/// Returns: true when open or waiting for permission
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_connect(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    device_json: JString,
) -> jboolean {
    let result = (|| -> Result<jboolean, BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let device = parse_device(&java_string(&mut env, &device_json)?)?;
        info!("Connecting to {}", device);
        bridge.link.connect(&device)?;
        Ok(JNI_TRUE)
    })();

    or_log("connect", result, JNI_FALSE)
}

/// Disconnect
///
/// Called from Kotlin:
/// ```kotlin
/// external fun disconnect(handle: Long)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_disconnect(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    // SAFETY: see `bridge_ref`
    match unsafe { bridge_ref(handle) } {
        Ok(bridge) => bridge.link.disconnect(),
        Err(err) => error!("disconnect failed: {}", err),
    }
}

/// Answer to the permission dialog
///
/// Called from Kotlin:
/// ```kotlin
/// external fun onPermissionResult(handle: Long, granted: Boolean)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_onPermissionResult(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    granted: jboolean,
) {
    // SAFETY: see `bridge_ref`
    match unsafe { bridge_ref(handle) } {
        Ok(bridge) => {
            debug!("Permission result: {}", granted != JNI_FALSE);
            bridge.link.backend().resolve_permission(granted != JNI_FALSE);
        }
        Err(err) => error!("onPermissionResult failed: {}", err),
    }
}

/// USB device attached broadcast
///
/// Called from Kotlin:
/// ```kotlin
/// external fun onDeviceAttached(handle: Long, deviceJson: String)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_onDeviceAttached(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    device_json: JString,
) {
    let result = (|| -> Result<(), BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let device = parse_device(&java_string(&mut env, &device_json)?)?;
        bridge.link.on_device_attached(&device);
        Ok(())
    })();

    or_log("onDeviceAttached", result, ());
}

/// USB device detached broadcast
///
/// Called from Kotlin:
/// ```kotlin
/// external fun onDeviceDetached(handle: Long, deviceJson: String)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_onDeviceDetached(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    device_json: JString,
) {
    let result = (|| -> Result<(), BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let device = parse_device(&java_string(&mut env, &device_json)?)?;
        bridge.link.on_device_detached(&device);
        Ok(())
    })();

    or_log("onDeviceDetached", result, ());
}

/// Send raw bytes to the device
///
/// Called from Kotlin:
/// ```kotlin
/// external fun send(handle: Long, data: ByteArray): Int
/// ```
///
/// Returns: Number of bytes sent, or -1 on error
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_send(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    data: JByteArray,
) -> jint {
    let result = (|| -> Result<jint, BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let bytes = env.convert_byte_array(&data)?;
        bridge.link.send(&bytes)?;
        debug!("Sent {} bytes", bytes.len());
        Ok(jint::try_from(bytes.len()).unwrap_or(jint::MAX))
    })();

    or_log("send", result, -1)
}

/// Change baud rate, data bits, stop bits and parity
///
/// Called from Kotlin:
/// ```kotlin
/// external fun setSerialParameters(handle: Long, baud: Int, dataBits: Int, stopBits: Int, parity: Int): Boolean
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_setSerialParameters(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    baud_rate: jint,
    data_bits: jint,
    stop_bits: jint,
    parity: jint,
) -> jboolean {
    let result = (|| -> Result<jboolean, BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let params = params::from_java_codes(baud_rate, data_bits, stop_bits, parity)?;
        bridge.link.set_serial_parameters(params)?;
        Ok(JNI_TRUE)
    })();

    or_log("setSerialParameters", result, JNI_FALSE)
}

/// Check if the link is open
///
/// Called from Kotlin:
/// ```kotlin
/// external fun isConnected(handle: Long): Boolean
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_isConnected(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    // SAFETY: see `bridge_ref`
    match unsafe { bridge_ref(handle) } {
        Ok(bridge) => to_jboolean(bridge.link.is_connected()),
        Err(_) => JNI_FALSE,
    }
}

/// Get link statistics as JSON
///
/// Called from Kotlin:
/// ```kotlin
/// external fun getStats(handle: Long): String
/// ```
#[no_mangle]
pub extern "system" fn Java_com_saemaps_android_usbserial_RustBridge_getStats(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = (|| -> Result<jstring, BridgeError> {
        // SAFETY: see `bridge_ref`
        let bridge = unsafe { bridge_ref(handle) }?;
        let json = serde_json::to_string(&bridge.link.stats())?;
        Ok(env.new_string(json)?.into_raw())
    })();

    or_log("getStats", result, std::ptr::null_mut())
}
