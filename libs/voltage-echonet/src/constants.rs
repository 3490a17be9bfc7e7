//! ECHONET Lite protocol constants
//!
//! Values follow the ECHONET Lite specification (frame format 1) and the
//! device object appendices for home air conditioners (0x0130xx) and
//! general lighting (0x0290xx).

use std::net::Ipv4Addr;
use std::time::Duration;

// ============================================================================
// Frame Layout
// ============================================================================

/// EHD1 + EHD2 for ECHONET Lite with specified message format
pub const EHD: u16 = 0x1081;

/// Fixed header length
/// Format: EHD(2) + TID(2) + SEOJ(3) + DEOJ(3) + ESV(1) + OPC(1) = 12 bytes
pub const HEADER_LEN: usize = 12;

/// Each property contributes EPC(1) + PDC(1) before its data
pub const PROPERTY_HEADER_LEN: usize = 2;

/// Largest datagram the receive loops accept
pub const MAX_FRAME_SIZE: usize = 1500;

/// Object codes are 24-bit
pub const OBJECT_CODE_MASK: u32 = 0x00FF_FFFF;

// ============================================================================
// Network
// ============================================================================

/// Well-known UDP port for both unicast and multicast traffic
pub const ECHONET_PORT: u16 = 3610;

/// Well-known IPv4 multicast group
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 0);

/// Controller-side object used as SEOJ on every outbound frame (node profile)
pub const LOCAL_OBJECT: u32 = 0x0E_F001;

/// Pacing after a frame to a climate-control unit
pub const AIRCON_PACING: Duration = Duration::from_millis(700);

/// Pacing after a frame to a switchable load
pub const LIGHT_PACING: Duration = Duration::from_millis(600);

/// Pacing after a multicast announce
pub const ANNOUNCE_PACING: Duration = Duration::from_millis(250);

/// Interface name prefixes never joined to the multicast group
/// (tunnels and Apple wireless-direct adapters)
pub const DEFAULT_EXCLUDED_INTERFACES: &[&str] = &["utun", "llw", "awdl"];

// ============================================================================
// Property Codes (EPC)
// ============================================================================

/// Operation status
pub const EPC_POWER: u8 = 0x80;
/// Instantaneous power consumption (W, 2 bytes)
pub const EPC_WATT: u8 = 0x84;
/// Status change announcement property map
pub const EPC_ANNOUNCE_MAP: u8 = 0x9D;
/// Set property map
pub const EPC_SET_MAP: u8 = 0x9E;
/// Get property map
pub const EPC_GET_MAP: u8 = 0x9F;
/// Air flow rate setting
pub const EPC_FAN: u8 = 0xA0;
/// Air flow direction (swing) setting
pub const EPC_SWING: u8 = 0xA3;
/// Operation mode setting
pub const EPC_MODE: u8 = 0xB0;
/// Set temperature value
pub const EPC_TARGET_TEMP: u8 = 0xB3;
/// Set relative humidity in dehumidifying mode
pub const EPC_TARGET_HUMIDITY: u8 = 0xB4;
/// Measured value of room relative humidity
pub const EPC_ROOM_HUMIDITY: u8 = 0xBA;
/// Measured value of room temperature
pub const EPC_ROOM_TEMP: u8 = 0xBB;
/// Measured outdoor air temperature
pub const EPC_OUTDOOR_TEMP: u8 = 0xBE;
/// Humidifier function setting
pub const EPC_HUMIDIFY: u8 = 0xC1;
/// Amount of humidification
pub const EPC_HUMIDIFY_LEVEL: u8 = 0xC4;
/// Self-node instance list S (node profile)
pub const EPC_INSTANCE_LIST_S: u8 = 0xD6;
/// Instance list notification (node profile)
pub const EPC_INSTANCE_LIST: u8 = 0xD5;

/// Property codes whose payload is a property map
pub const PROPERTY_MAP_CODES: [u8; 3] = [EPC_ANNOUNCE_MAP, EPC_SET_MAP, EPC_GET_MAP];

/// Property codes that feed the cached device state
pub const STATE_PROPERTY_CODES: [u8; 10] = [
    EPC_POWER,
    EPC_MODE,
    EPC_TARGET_TEMP,
    EPC_TARGET_HUMIDITY,
    EPC_ROOM_HUMIDITY,
    EPC_ROOM_TEMP,
    EPC_OUTDOOR_TEMP,
    EPC_FAN,
    EPC_SWING,
    EPC_WATT,
];

// ============================================================================
// Property Values (EDT)
// ============================================================================

pub const EDT_ON: u8 = 0x30;
pub const EDT_OFF: u8 = 0x31;
pub const EDT_AUTO: u8 = 0x41;

/// Target temperature reported while the unit manages temperature itself
pub const TEMP_AUTO_SENTINEL: u8 = 0xFD;

/// Valid target temperature range (degrees Celsius)
pub const TARGET_TEMP_MIN: i32 = 0;
pub const TARGET_TEMP_MAX: i32 = 50;

/// Valid target humidity range (percent)
pub const TARGET_HUMIDITY_MIN: i32 = 0;
pub const TARGET_HUMIDITY_MAX: i32 = 100;

/// Signed sensor readings outside this window are read errors
pub const SENSOR_TEMP_MIN: i32 = -127;
pub const SENSOR_TEMP_MAX: i32 = 125;

/// Substituted for out-of-window sensor readings.
///
/// Placeholder only: not mandated by the protocol and should be calibrated
/// per product. Override per device with `temperature_fallback`.
pub const SENSOR_TEMP_FALLBACK: i32 = 0;

/// Property-map payload length that selects the bitmap form
pub const PROPERTY_MAP_BITMAP_LEN: usize = 17;
