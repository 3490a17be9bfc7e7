//! Per-device model
//!
//! A [`DeviceObject`] is built once per configured device. It owns the
//! device's transaction counter and cached property values, builds command
//! and query frames, and folds response frames into its cache.
//!
//! Cache writes only happen in [`DeviceObject::apply_response`], which runs
//! on the receive tasks; readers take a [`DeviceSnapshot`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::error::{EchonetError, Result};
use crate::frame::{Frame, ObjectCode, ServiceCode};
use crate::propmap::PropertyMap;

// ============================================================================
// Configuration
// ============================================================================

/// Catalog of supported device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceKind {
    /// Switchable load (lighting, outlets)
    Light,
    /// Climate-control unit (home air conditioner)
    Aircon,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Aircon => "aircon",
        }
    }

    /// Default delay after each frame sent to this kind of device
    pub fn default_pacing(self) -> Duration {
        match self {
            Self::Light => LIGHT_PACING,
            Self::Aircon => AIRCON_PACING,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = EchonetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "light" => Ok(Self::Light),
            "aircon" => Ok(Self::Aircon),
            other => Err(EchonetError::UnsupportedDeviceKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceKind {
    type Error = EchonetError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceKind> for String {
    fn from(kind: DeviceKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type", alias = "kind")]
    pub kind: DeviceKind,
    pub name: String,
    pub addr: Ipv4Addr,
    pub eoj: ObjectCode,
    /// Reported in place of unreadable room/outdoor temperatures
    #[serde(default)]
    pub temperature_fallback: Option<i32>,
}

impl DeviceConfig {
    pub fn new(kind: DeviceKind, name: impl Into<String>, addr: Ipv4Addr, eoj: ObjectCode) -> Self {
        Self {
            kind,
            name: name.into(),
            addr,
            eoj,
            temperature_fallback: None,
        }
    }
}

// ============================================================================
// Value Tables
// ============================================================================

/// Operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Off,
    Auto,
    Cool,
    Heat,
    Dry,
    Fan,
    Other,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::Cool => "cool",
            Self::Heat => "heat",
            Self::Dry => "dry",
            Self::Fan => "fan",
            Self::Other => "other",
        }
    }

    /// MODE byte to mode; `None` for unrecognised bytes
    pub fn from_edt(edt: u8) -> Option<Self> {
        match edt {
            0x41 => Some(Self::Auto),
            0x42 => Some(Self::Cool),
            0x43 => Some(Self::Heat),
            0x44 => Some(Self::Dry),
            0x45 => Some(Self::Fan),
            0x40 | 0x46 => Some(Self::Other),
            _ => None,
        }
    }

    /// MODE byte to send; `Off` and `Other` have none
    fn edt(self) -> Option<u8> {
        match self {
            Self::Auto => Some(EDT_AUTO),
            Self::Cool => Some(0x42),
            Self::Heat => Some(0x43),
            Self::Dry => Some(0x44),
            Self::Fan => Some(0x45),
            Self::Off | Self::Other => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = EchonetError;

    /// Accepts the settable modes only
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            "cool" => Ok(Self::Cool),
            "heat" => Ok(Self::Heat),
            "dry" => Ok(Self::Dry),
            "fan" => Ok(Self::Fan),
            other => Err(EchonetError::invalid(format!("invalid mode: {}", other))),
        }
    }
}

/// Air flow rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanLevel {
    Auto,
    Low,
    Medium,
    High,
}

impl FanLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    fn edt(self) -> u8 {
        match self {
            Self::Auto => EDT_AUTO,
            Self::Low => 0x31,
            Self::Medium => 0x33,
            Self::High => 0x35,
        }
    }

    /// Devices report eight flow levels; they fold onto three names
    pub fn from_edt(edt: u8) -> Self {
        match edt {
            0x31 | 0x32 => Self::Low,
            0x33 | 0x34 => Self::Medium,
            0x35..=0x38 => Self::High,
            _ => Self::Auto,
        }
    }
}

impl FromStr for FanLevel {
    type Err = EchonetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(EchonetError::invalid(format!("invalid fan level: {}", other))),
        }
    }
}

/// Air flow direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swing {
    Off,
    UpDown,
    LeftRight,
    On,
}

impl Swing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::UpDown => "ud",
            Self::LeftRight => "lr",
            Self::On => "on",
        }
    }

    fn edt(self) -> u8 {
        match self {
            Self::Off => EDT_OFF,
            Self::UpDown => 0x41,
            Self::LeftRight => 0x42,
            Self::On => 0x43,
        }
    }

    /// Unknown bytes read as off
    pub fn from_edt(edt: u8) -> Self {
        match edt {
            0x41 => Self::UpDown,
            0x42 => Self::LeftRight,
            0x43 => Self::On,
            _ => Self::Off,
        }
    }
}

impl FromStr for Swing {
    type Err = EchonetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "ud" => Ok(Self::UpDown),
            "lr" => Ok(Self::LeftRight),
            "on" => Ok(Self::On),
            other => Err(EchonetError::invalid(format!("invalid swing: {}", other))),
        }
    }
}

/// Parse an `on`/`off` payload
pub fn parse_power(s: &str) -> Result<bool> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(EchonetError::invalid(format!("invalid power: {}", other))),
    }
}

/// What happens to the cached mode when a reply leaves the device powered off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOffModePolicy {
    /// Cached mode becomes `off`
    ForceOff,
    /// Cached mode keeps the last reported operating mode
    RetainLast,
}

pub const POWER_OFF_MODE_POLICY: PowerOffModePolicy = PowerOffModePolicy::ForceOff;

// ============================================================================
// Cached State
// ============================================================================

/// Cached property values, defaulting to zero / off until first reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub power: bool,
    pub mode: Mode,
    /// Raw target temperature byte; `TEMP_AUTO_SENTINEL` while in auto
    pub target_temp: u8,
    pub target_humidity: u8,
    pub room_humidity: u8,
    pub room_temp: i32,
    pub outdoor_temp: i32,
    /// Raw FAN byte
    pub fan: u8,
    /// Raw SWING byte
    pub swing: u8,
    pub watts: u16,
}

impl DeviceState {
    #[inline]
    pub fn target_is_auto(&self) -> bool {
        self.target_temp == TEMP_AUTO_SENTINEL
    }

    /// Target temperature as reported outward; the room temperature stands
    /// in while the device manages its own target
    pub fn reported_target_temperature(&self) -> i32 {
        if self.target_is_auto() {
            self.room_temp
        } else {
            i32::from(self.target_temp)
        }
    }

    pub fn power_str(&self) -> &'static str {
        if self.power {
            "on"
        } else {
            "off"
        }
    }

    pub fn fan_level(&self) -> FanLevel {
        FanLevel::from_edt(self.fan)
    }

    pub fn swing(&self) -> Swing {
        Swing::from_edt(self.swing)
    }
}

/// Property maps advertised by the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMaps {
    pub announce: PropertyMap,
    pub set: PropertyMap,
    pub get: PropertyMap,
}

/// Consistent copy of a device's identity and cache
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub kind: DeviceKind,
    pub name: String,
    pub state: DeviceState,
    /// Device advertised instantaneous power in its get map
    pub watt_supported: bool,
}

impl DeviceSnapshot {
    pub fn watts(&self) -> Option<u16> {
        self.watt_supported.then_some(self.state.watts)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Emitted by a device after it processes a response
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Cache was refreshed from a get-response, set-get-response or notify
    Changed(Arc<DeviceObject>),
    /// Device replied with an SNA service code
    Denied {
        device: Arc<DeviceObject>,
        service: ServiceCode,
        properties: Vec<u8>,
    },
}

impl DeviceEvent {
    pub fn device(&self) -> &Arc<DeviceObject> {
        match self {
            Self::Changed(device) => device,
            Self::Denied { device, .. } => device,
        }
    }
}

pub type EventSender = mpsc::Sender<DeviceEvent>;
pub type EventReceiver = mpsc::Receiver<DeviceEvent>;

/// Bounded queue between receive tasks and the control loop
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Result of folding a frame into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Service code does not carry state, or the frame reported no state
    /// property (property maps alone do not count)
    Ignored,
    Updated,
    Denied,
}

// ============================================================================
// Device Object
// ============================================================================

pub struct DeviceObject {
    config: DeviceConfig,
    tid: AtomicU16,
    state: RwLock<DeviceState>,
    maps: RwLock<PropertyMaps>,
    events: EventSender,
}

impl fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceObject")
            .field("kind", &self.config.kind)
            .field("name", &self.config.name)
            .field("addr", &self.config.addr)
            .field("eoj", &self.config.eoj)
            .finish()
    }
}

impl DeviceObject {
    pub fn new(config: DeviceConfig, events: EventSender) -> Self {
        Self {
            config,
            tid: AtomicU16::new(0),
            state: RwLock::new(DeviceState::default()),
            maps: RwLock::new(PropertyMaps::default()),
            events,
        }
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub fn kind(&self) -> DeviceKind {
        self.config.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn addr(&self) -> Ipv4Addr {
        self.config.addr
    }

    #[inline]
    pub fn eoj(&self) -> ObjectCode {
        self.config.eoj
    }

    /// `kind/name`, unique within a registry
    pub fn label(&self) -> String {
        format!("{}/{}", self.config.kind, self.config.name)
    }

    /// Next transaction id; wraps from 0xFFFF to 0
    pub fn next_tid(&self) -> u16 {
        self.tid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            kind: self.config.kind,
            name: self.config.name.clone(),
            state: *self.state.read(),
            watt_supported: self.maps.read().get.contains(EPC_WATT),
        }
    }

    pub fn property_maps(&self) -> PropertyMaps {
        self.maps.read().clone()
    }

    fn temperature_fallback(&self) -> i32 {
        self.config.temperature_fallback.unwrap_or(SENSOR_TEMP_FALLBACK)
    }

    fn require_climate(&self, operation: &str) -> Result<()> {
        match self.config.kind {
            DeviceKind::Aircon => Ok(()),
            kind => Err(EchonetError::UnsupportedDeviceKind(format!(
                "{} does not support {}",
                kind, operation
            ))),
        }
    }

    fn set_frame(&self) -> Frame {
        Frame::request(self.config.eoj, ServiceCode::SetI)
    }

    // ------------------------------------------------------------------------
    // Command builders
    // ------------------------------------------------------------------------

    pub fn set_power(&self, on: bool) -> Result<Frame> {
        self.set_frame()
            .with_property(EPC_POWER, vec![if on { EDT_ON } else { EDT_OFF }])
    }

    /// `Off` powers the unit down; every other mode powers it up as well
    pub fn set_mode(&self, mode: Mode) -> Result<Frame> {
        self.require_climate("mode")?;
        if mode == Mode::Off {
            return self.set_power(false);
        }
        let edt = mode
            .edt()
            .ok_or_else(|| EchonetError::invalid(format!("mode '{}' cannot be set", mode)))?;

        let mut frame = self.set_frame();
        frame.add_property(EPC_POWER, vec![EDT_ON])?;
        frame.add_property(EPC_MODE, vec![edt])?;
        if mode == Mode::Heat {
            frame.add_property(EPC_HUMIDIFY, vec![EDT_AUTO])?;
            frame.add_property(EPC_HUMIDIFY_LEVEL, vec![EDT_AUTO])?;
        }
        Ok(frame)
    }

    pub fn set_fan(&self, level: FanLevel) -> Result<Frame> {
        self.require_climate("fan")?;
        self.set_frame().with_property(EPC_FAN, vec![level.edt()])
    }

    pub fn set_swing(&self, swing: Swing) -> Result<Frame> {
        self.require_climate("swing")?;
        self.set_frame().with_property(EPC_SWING, vec![swing.edt()])
    }

    /// `Ok(None)` while the device reports an automatic target
    pub fn set_target_temperature(&self, celsius: i32) -> Result<Option<Frame>> {
        self.require_climate("temperature")?;
        if !(TARGET_TEMP_MIN..=TARGET_TEMP_MAX).contains(&celsius) {
            return Err(EchonetError::out_of_range(
                i64::from(celsius),
                i64::from(TARGET_TEMP_MIN),
                i64::from(TARGET_TEMP_MAX),
            ));
        }
        if self.state.read().target_is_auto() {
            debug!("{}: target temperature is automatic, ignoring set", self.label());
            return Ok(None);
        }
        self.set_frame()
            .with_property(EPC_TARGET_TEMP, vec![celsius as u8])
            .map(Some)
    }

    pub fn set_target_humidity(&self, percent: i32) -> Result<Frame> {
        self.require_climate("humidity")?;
        if !(TARGET_HUMIDITY_MIN..=TARGET_HUMIDITY_MAX).contains(&percent) {
            return Err(EchonetError::out_of_range(
                i64::from(percent),
                i64::from(TARGET_HUMIDITY_MIN),
                i64::from(TARGET_HUMIDITY_MAX),
            ));
        }
        self.set_frame()
            .with_property(EPC_TARGET_HUMIDITY, vec![percent as u8])
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Get request for every property this kind of device reports
    pub fn query_state(&self) -> Result<Frame> {
        let mut frame = Frame::request(self.config.eoj, ServiceCode::Get);
        match self.config.kind {
            DeviceKind::Aircon => {
                for code in [
                    EPC_POWER,
                    EPC_MODE,
                    EPC_TARGET_TEMP,
                    EPC_TARGET_HUMIDITY,
                    EPC_ROOM_HUMIDITY,
                    EPC_ROOM_TEMP,
                    EPC_OUTDOOR_TEMP,
                    EPC_FAN,
                    EPC_SWING,
                ] {
                    frame.add_property(code, Vec::new())?;
                }
                if self.maps.read().get.contains(EPC_WATT) {
                    frame.add_property(EPC_WATT, Vec::new())?;
                }
            },
            DeviceKind::Light => frame.add_property(EPC_POWER, Vec::new())?,
        }
        Ok(frame)
    }

    /// Get request for the announce, set and get property maps
    pub fn query_property_maps(&self) -> Result<Frame> {
        let mut frame = Frame::request(self.config.eoj, ServiceCode::Get);
        for code in PROPERTY_MAP_CODES {
            frame.add_property(code, Vec::new())?;
        }
        Ok(frame)
    }

    // ------------------------------------------------------------------------
    // Response handling
    // ------------------------------------------------------------------------

    /// Fold a frame from this device into the cache
    pub fn apply_response(&self, frame: &Frame) -> ResponseOutcome {
        if frame.esv.is_denied() {
            return ResponseOutcome::Denied;
        }
        if !frame.esv.is_state_update() {
            return ResponseOutcome::Ignored;
        }

        let fallback = self.temperature_fallback();
        let mut state = self.state.write();
        let mut reported = false;
        for prop in frame.properties() {
            let Some(first) = prop.first_byte() else {
                continue;
            };
            reported |= STATE_PROPERTY_CODES.contains(&prop.code);
            match prop.code {
                EPC_POWER => state.power = first == EDT_ON,
                EPC_MODE => match Mode::from_edt(first) {
                    Some(mode) => state.mode = mode,
                    None => debug!("{}: ignoring mode byte 0x{:02x}", self.label(), first),
                },
                EPC_TARGET_TEMP => state.target_temp = first,
                EPC_TARGET_HUMIDITY => state.target_humidity = first,
                EPC_ROOM_HUMIDITY => state.room_humidity = first,
                EPC_ROOM_TEMP => state.room_temp = sensor_temperature(first, fallback),
                EPC_OUTDOOR_TEMP => state.outdoor_temp = sensor_temperature(first, fallback),
                EPC_FAN => state.fan = first,
                EPC_SWING => state.swing = first,
                EPC_WATT => match prop.data.as_slice() {
                    [hi, lo, ..] => state.watts = u16::from_be_bytes([*hi, *lo]),
                    _ => debug!("{}: short WATT payload", self.label()),
                },
                EPC_ANNOUNCE_MAP | EPC_SET_MAP | EPC_GET_MAP => {
                    self.store_property_map(prop.code, &prop.data);
                },
                _ => {},
            }
        }

        if !reported {
            return ResponseOutcome::Ignored;
        }
        if !state.power && POWER_OFF_MODE_POLICY == PowerOffModePolicy::ForceOff {
            state.mode = Mode::Off;
        }
        ResponseOutcome::Updated
    }

    fn store_property_map(&self, code: u8, edt: &[u8]) {
        let map = PropertyMap::from_edt(edt);
        info!("{}: property map {:02x} = {}", self.label(), code, map);
        let mut maps = self.maps.write();
        match code {
            EPC_ANNOUNCE_MAP => maps.announce = map,
            EPC_SET_MAP => maps.set = map,
            _ => maps.get = map,
        }
    }

    /// Apply a frame and emit the matching event
    ///
    /// Returns whether an event was emitted.
    pub async fn handle_response(self: &Arc<Self>, frame: &Frame) -> bool {
        let event = match self.apply_response(frame) {
            ResponseOutcome::Ignored => return false,
            ResponseOutcome::Updated => DeviceEvent::Changed(Arc::clone(self)),
            ResponseOutcome::Denied => {
                warn!("{}: request denied ({})", self.label(), frame.esv);
                DeviceEvent::Denied {
                    device: Arc::clone(self),
                    service: frame.esv,
                    properties: frame.property_codes(),
                }
            },
        };
        if self.events.send(event).await.is_err() {
            debug!("{}: event receiver closed", self.label());
            return false;
        }
        true
    }
}

/// Signed sensor byte, with out-of-window readings replaced by `fallback`
fn sensor_temperature(raw: u8, fallback: i32) -> i32 {
    let value = i32::from(raw as i8);
    if (SENSOR_TEMP_MIN..=SENSOR_TEMP_MAX).contains(&value) {
        value
    } else {
        fallback
    }
}
