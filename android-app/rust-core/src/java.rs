//! Java side of the link
//!
//! The Kotlin plugin hands over one bridge object that owns the Android USB
//! stack. [`JniBackend`] and [`JniHandle`] call into it for enumeration,
//! permission and port I/O; [`JniListener`] forwards link events back to it.
//!
//! Expected methods on the bridge object:
//!
//! | Method                | Signature                                 |
//! |-----------------------|-------------------------------------------|
//! | `listDevices`         | `()Ljava/lang/String;` (JSON array)       |
//! | `probeDriver`         | `(Ljava/lang/String;)Ljava/lang/String;`  |
//! | `hasPermission`       | `(Ljava/lang/String;)Z`                   |
//! | `requestPermission`   | `(Ljava/lang/String;)V`                   |
//! | `openPort`            | `(Ljava/lang/String;)V`                   |
//! | `portSetParameters`   | `(IIII)V`                                 |
//! | `portSetControlLines` | `(ZZ)V`                                   |
//! | `portPurge`           | `()V`                                     |
//! | `portRead`            | `(II)[B`                                  |
//! | `portWrite`           | `([BI)V`                                  |
//! | `portClose`           | `()V`                                     |
//!
//! Listener callbacks: `onDeviceDetected(String)`, `onDeviceConnected(String)`,
//! `onDeviceDisconnected()`, `onDataReceived(byte[])`, `onError(String)`,
//! `onPermissionDenied(String)`. Devices always travel as JSON.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jni::objects::{GlobalRef, JByteArray, JObject, JString, JValue};
use jni::{JNIEnv, JavaVM};
use log::{debug, warn};

use serial_link::{
    DriverInfo, LinkError, LinkListener, Packet, PermissionReply, SerialHandle, SerialParameters,
    UsbBackend, UsbDevice,
};

use crate::params::to_java_codes;

/// How long one `portRead` call may block on the Java side
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Local references created per call are released with the frame
const LOCAL_FRAME_CAPACITY: i32 = 16;

/// Cached VM plus a global reference to the bridge object
#[derive(Clone)]
pub struct JavaBridge {
    vm: Arc<JavaVM>,
    object: GlobalRef,
}

impl JavaBridge {
    pub fn new(vm: JavaVM, object: GlobalRef) -> Self {
        Self {
            vm: Arc::new(vm),
            object,
        }
    }

    /// Run `f` on an attached thread inside a local frame
    ///
    /// A pending Java exception becomes an `io::Error` carrying its message.
    fn with_env<T>(
        &self,
        f: impl FnOnce(&mut JNIEnv, &JObject) -> jni::errors::Result<T>,
    ) -> io::Result<T> {
        let mut env = self
            .vm
            .attach_current_thread_permanently()
            .map_err(|err| io::Error::other(format!("JNI attach failed: {err}")))?;

        let object = self.object.as_obj();
        let result = env.with_local_frame(LOCAL_FRAME_CAPACITY, |env| f(env, object));
        match result {
            Ok(value) => Ok(value),
            Err(jni::errors::Error::JavaException) => Err(take_exception(&mut env)),
            Err(err) => Err(io::Error::other(format!("JNI call failed: {err}"))),
        }
    }

    fn call_void(&self, name: &str, sig: &str, args: &[JValue]) -> io::Result<()> {
        self.with_env(|env, object| {
            env.call_method(object, name, sig, args)?;
            Ok(())
        })
    }

    /// Call a method taking the device as a JSON string
    fn call_with_device<T>(
        &self,
        name: &str,
        sig: &str,
        device: &UsbDevice,
        map: impl FnOnce(&mut JNIEnv, jni::objects::JValueOwned) -> jni::errors::Result<T>,
    ) -> io::Result<T> {
        let json = serde_json::to_string(device).map_err(io::Error::other)?;
        self.with_env(|env, object| {
            let json = env.new_string(&json)?;
            let value = env.call_method(object, name, sig, &[(&json).into()])?;
            map(env, value)
        })
    }
}

/// Turn the pending Java exception into an `io::Error`
fn take_exception(env: &mut JNIEnv) -> io::Error {
    fn describe(env: &mut JNIEnv) -> jni::errors::Result<(bool, String)> {
        let throwable = env.exception_occurred()?;
        env.exception_clear()?;
        let security = env.is_instance_of(&throwable, "java/lang/SecurityException")?;
        let text = env
            .call_method(&throwable, "toString", "()Ljava/lang/String;", &[])?
            .l()?;
        let text: String = env.get_string(&JString::from(text))?.into();
        Ok((security, text))
    }

    match describe(env) {
        Ok((true, text)) => io::Error::new(io::ErrorKind::PermissionDenied, text),
        Ok((false, text)) => io::Error::other(text),
        Err(err) => {
            let _ = env.exception_clear();
            io::Error::other(format!("unreadable Java exception: {err}"))
        }
    }
}

fn string_result(env: &mut JNIEnv, value: JObject) -> jni::errors::Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(env.get_string(&JString::from(value))?.into()))
}

/// [`UsbBackend`] over the Android USB manager
pub struct JniBackend {
    java: JavaBridge,
    pending: Mutex<Option<PermissionReply>>,
}

impl JniBackend {
    pub fn new(java: JavaBridge) -> Self {
        Self {
            java,
            pending: Mutex::new(None),
        }
    }

    /// Deliver the user's answer to the outstanding permission request
    pub fn resolve_permission(&self, granted: bool) {
        let reply = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match reply {
            Some(reply) => reply.resolve(granted),
            None => debug!("Permission result without a pending request"),
        }
    }
}

impl UsbBackend for JniBackend {
    type Handle = JniHandle;

    fn list_devices(&self) -> Vec<UsbDevice> {
        let json = self.java.with_env(|env, object| {
            let value = env
                .call_method(object, "listDevices", "()Ljava/lang/String;", &[])?
                .l()?;
            string_result(env, value)
        });

        match json {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|err| {
                warn!("Malformed device list from Java: {}", err);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("Listing devices failed: {}", err);
                Vec::new()
            }
        }
    }

    fn probe(&self, device: &UsbDevice) -> Option<DriverInfo> {
        let json = self.java.call_with_device(
            "probeDriver",
            "(Ljava/lang/String;)Ljava/lang/String;",
            device,
            |env, value| {
                let value = value.l()?;
                string_result(env, value)
            },
        );

        match json {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(driver) => Some(driver),
                Err(err) => {
                    warn!("Malformed driver info for {}: {}", device, err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("Probing {} failed: {}", device, err);
                None
            }
        }
    }

    fn has_permission(&self, device: &UsbDevice) -> bool {
        self.java
            .call_with_device("hasPermission", "(Ljava/lang/String;)Z", device, |_, value| {
                value.z()
            })
            .unwrap_or_else(|err| {
                warn!("Permission check for {} failed: {}", device, err);
                false
            })
    }

    fn request_permission(&self, device: &UsbDevice, reply: PermissionReply) -> io::Result<()> {
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(reply);
        if replaced.is_some() {
            debug!("Dropping earlier permission request");
        }

        self.java.call_with_device(
            "requestPermission",
            "(Ljava/lang/String;)V",
            device,
            |_, _| Ok(()),
        )
    }

    fn open(&self, device: &UsbDevice, _driver: &DriverInfo) -> io::Result<JniHandle> {
        self.java
            .call_with_device("openPort", "(Ljava/lang/String;)V", device, |_, _| Ok(()))?;
        Ok(JniHandle {
            java: self.java.clone(),
        })
    }
}

/// Port opened by the Java bridge
pub struct JniHandle {
    java: JavaBridge,
}

impl SerialHandle for JniHandle {
    fn set_parameters(&self, params: &SerialParameters) -> io::Result<()> {
        let (baud, data_bits, stop_bits, parity) = to_java_codes(params);
        self.java.call_void(
            "portSetParameters",
            "(IIII)V",
            &[
                JValue::Int(baud),
                JValue::Int(data_bits),
                JValue::Int(stop_bits),
                JValue::Int(parity),
            ],
        )
    }

    fn set_control_lines(&self, dtr: bool, rts: bool) -> io::Result<()> {
        self.java.call_void(
            "portSetControlLines",
            "(ZZ)V",
            &[JValue::Bool(dtr.into()), JValue::Bool(rts.into())],
        )
    }

    fn purge_buffers(&self) -> io::Result<()> {
        self.java.call_void("portPurge", "()V", &[])
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let max_len = i32::try_from(buf.len()).unwrap_or(i32::MAX);
        let bytes = self.java.with_env(|env, object| {
            let value = env
                .call_method(
                    object,
                    "portRead",
                    "(II)[B",
                    &[
                        JValue::Int(max_len),
                        JValue::Int(READ_TIMEOUT.as_millis() as i32),
                    ],
                )?
                .l()?;
            if value.is_null() {
                return Ok(Vec::new());
            }
            env.convert_byte_array(JByteArray::from(value))
        })?;

        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.java.with_env(|env, object| {
            let array = env.byte_array_from_slice(data)?;
            env.call_method(
                object,
                "portWrite",
                "([BI)V",
                &[(&array).into(), JValue::Int(timeout_ms)],
            )?;
            Ok(())
        })
    }

    fn close(&self) -> io::Result<()> {
        self.java.call_void("portClose", "()V", &[])
    }
}

/// Forwards link events to the bridge object
pub struct JniListener {
    java: JavaBridge,
}

impl JniListener {
    pub fn new(java: JavaBridge) -> Self {
        Self { java }
    }

    fn call_with_string(&self, name: &str, text: &str) {
        let result = self.java.with_env(|env, object| {
            let text = env.new_string(text)?;
            env.call_method(object, name, "(Ljava/lang/String;)V", &[(&text).into()])?;
            Ok(())
        });
        if let Err(err) = result {
            warn!("Callback {} failed: {}", name, err);
        }
    }

    fn call_with_json(&self, name: &str, value: &impl serde::Serialize) {
        match serde_json::to_string(value) {
            Ok(json) => self.call_with_string(name, &json),
            Err(err) => warn!("Serializing {} argument failed: {}", name, err),
        }
    }
}

impl LinkListener for JniListener {
    fn on_device_detected(&self, devices: &[UsbDevice]) {
        self.call_with_json("onDeviceDetected", &devices);
    }

    fn on_device_connected(&self, device: &UsbDevice) {
        self.call_with_json("onDeviceConnected", device);
    }

    fn on_device_disconnected(&self) {
        if let Err(err) = self.java.call_void("onDeviceDisconnected", "()V", &[]) {
            warn!("Callback onDeviceDisconnected failed: {}", err);
        }
    }

    fn on_data_received(&self, packet: &Packet) {
        let result = self.java.with_env(|env, object| {
            let array = env.byte_array_from_slice(packet.as_bytes())?;
            env.call_method(object, "onDataReceived", "([B)V", &[(&array).into()])?;
            Ok(())
        });
        if let Err(err) = result {
            warn!("Callback onDataReceived failed: {}", err);
        }
    }

    fn on_error(&self, error: &LinkError) {
        self.call_with_string("onError", &error.to_string());
    }

    fn on_permission_denied(&self, device: &UsbDevice) {
        self.call_with_json("onPermissionDenied", device);
    }
}
