//! Serial parameter codes shared with the Java USB serial driver
//!
//! Stop bits use the driver's constants (1, 3 for 1.5, 2), parity uses
//! 0 none, 1 odd, 2 even, 3 mark, 4 space.

use serial_link::{Parity, SerialParameters, StopBits};

use crate::BridgeError;

/// Convert to `(baud, data_bits, stop_bits, parity)` codes
pub fn to_java_codes(params: &SerialParameters) -> (i32, i32, i32, i32) {
    let stop_bits = match params.stop_bits {
        StopBits::One => 1,
        StopBits::OnePointFive => 3,
        StopBits::Two => 2,
    };
    let parity = match params.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
        Parity::Mark => 3,
        Parity::Space => 4,
    };
    (
        i32::try_from(params.baud_rate).unwrap_or(i32::MAX),
        i32::from(params.data_bits),
        stop_bits,
        parity,
    )
}

/// Parse codes received from Java
pub fn from_java_codes(
    baud_rate: i32,
    data_bits: i32,
    stop_bits: i32,
    parity: i32,
) -> Result<SerialParameters, BridgeError> {
    let invalid = |what: &str, value: i32| BridgeError::InvalidParameter(format!("{what} {value}"));

    let baud_rate = u32::try_from(baud_rate)
        .ok()
        .filter(|baud| *baud > 0)
        .ok_or_else(|| invalid("baud rate", baud_rate))?;
    let data_bits = match data_bits {
        5..=8 => data_bits as u8,
        other => return Err(invalid("data bits", other)),
    };
    let stop_bits = match stop_bits {
        1 => StopBits::One,
        3 => StopBits::OnePointFive,
        2 => StopBits::Two,
        other => return Err(invalid("stop bits", other)),
    };
    let parity = match parity {
        0 => Parity::None,
        1 => Parity::Odd,
        2 => Parity::Even,
        3 => Parity::Mark,
        4 => Parity::Space,
        other => return Err(invalid("parity", other)),
    };

    Ok(SerialParameters {
        baud_rate,
        data_bits,
        stop_bits,
        parity,
    })
}
