//! Hex helpers for wire dumps

use std::fmt::Write;

/// Encode bytes as space separated lowercase pairs
/// Example: [0x10, 0x81, 0x00] -> "10 81 00"
pub fn dump(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02x}", byte);
    }
    result
}

/// Encode bytes as a contiguous lowercase string
/// Example: [0x01, 0x30, 0x01] -> "013001"
pub fn encode_lower(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(&mut result, "{:02x}", byte);
    }
    result
}
