//! Topic mapping between MQTT and devices
//!
//! ```text
//! <kind>/<name>/<attribute>          state, published on change
//! sensor/<kind>/<name>/<attribute>   read-only sensor values
//! <kind>/<name>/<attribute>/set      commands
//! <kind>/<name>/<attribute>/error    rejected commands
//! <kind>/<name>/error                denied requests
//! ```

use std::fmt;
use std::str::FromStr;

use voltage_echonet::{
    parse_power, DeviceKind, DeviceObject, DeviceSnapshot, EchonetError, Frame, Result,
};

const SET_SUFFIX: &str = "/set";

/// Writable attribute named in a command topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Power,
    Mode,
    Temperature,
    Humidity,
    Fan,
    Swing,
}

impl Attribute {
    pub const AIRCON: [Attribute; 6] = [
        Attribute::Power,
        Attribute::Mode,
        Attribute::Temperature,
        Attribute::Humidity,
        Attribute::Fan,
        Attribute::Swing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Mode => "mode",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Fan => "fan",
            Self::Swing => "swing",
        }
    }

    /// Writable attributes for a kind of device
    pub fn for_kind(kind: DeviceKind) -> &'static [Attribute] {
        match kind {
            DeviceKind::Light => &[Attribute::Power],
            DeviceKind::Aircon => &Self::AIRCON,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = EchonetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "power" => Ok(Self::Power),
            "mode" => Ok(Self::Mode),
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "fan" => Ok(Self::Fan),
            "swing" => Ok(Self::Swing),
            other => Err(EchonetError::invalid(format!("unknown attribute: {}", other))),
        }
    }
}

/// A validated inbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCommand {
    pub kind: DeviceKind,
    pub name: String,
    pub attribute: Attribute,
    pub payload: String,
}

impl TopicCommand {
    /// Parse `kind/name/attribute[/set]` and a UTF-8 payload
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        let (kind, name, attribute) = match parts.as_slice() {
            [kind, name, attribute] | [kind, name, attribute, "set"] => (*kind, *name, *attribute),
            _ => {
                return Err(EchonetError::invalid(format!(
                    "malformed command topic: {}",
                    topic
                )))
            },
        };
        if name.is_empty() {
            return Err(EchonetError::invalid(format!("empty device name: {}", topic)));
        }

        let kind: DeviceKind = kind.parse()?;
        let attribute: Attribute = attribute.parse()?;
        if !Attribute::for_kind(kind).contains(&attribute) {
            return Err(EchonetError::invalid(format!(
                "{} has no writable {}",
                kind, attribute
            )));
        }

        let payload = std::str::from_utf8(payload)
            .map_err(|_| EchonetError::invalid("payload is not UTF-8"))?
            .trim()
            .to_string();

        Ok(Self {
            kind,
            name: name.to_string(),
            attribute,
            payload,
        })
    }

    /// Frame for this command, or `None` when the device ignores it
    pub fn to_frame(&self, device: &DeviceObject) -> Result<Option<Frame>> {
        let payload = self.payload.as_str();
        match self.attribute {
            Attribute::Power => device.set_power(parse_power(payload)?).map(Some),
            Attribute::Mode => device.set_mode(payload.parse()?).map(Some),
            Attribute::Temperature => device.set_target_temperature(parse_number(payload)?),
            Attribute::Humidity => device.set_target_humidity(parse_number(payload)?).map(Some),
            Attribute::Fan => device.set_fan(payload.parse()?).map(Some),
            Attribute::Swing => device.set_swing(payload.parse()?).map(Some),
        }
    }
}

/// Decimal payload, fraction truncated toward zero
pub fn parse_number(payload: &str) -> Result<i32> {
    let value: f64 = payload
        .trim()
        .parse()
        .map_err(|_| EchonetError::invalid(format!("not a number: {}", payload)))?;
    if !value.is_finite() {
        return Err(EchonetError::invalid(format!("not a number: {}", payload)));
    }
    // Saturating cast keeps huge values out of range rather than wrapping
    Ok(value.trunc() as i32)
}

/// Where to report a rejected command
pub fn error_topic(command_topic: &str) -> String {
    let base = command_topic
        .strip_suffix(SET_SUFFIX)
        .unwrap_or(command_topic);
    format!("{}/error", base)
}

/// Where to report a denied request for a device
pub fn device_error_topic(kind: DeviceKind, name: &str) -> String {
    format!("{}/{}/error", kind, name)
}

/// Command topics to subscribe for one device
pub fn subscriptions(device: &DeviceObject) -> Vec<String> {
    Attribute::for_kind(device.kind())
        .iter()
        .map(|attr| format!("{}/{}/{}{}", device.kind(), device.name(), attr, SET_SUFFIX))
        .collect()
}

/// State publications for a snapshot, in a stable order
pub fn state_publications(snapshot: &DeviceSnapshot) -> Vec<(String, String)> {
    let kind = snapshot.kind;
    let name = snapshot.name.as_str();
    let state = &snapshot.state;
    let topic = |attr: &str| format!("{}/{}/{}", kind, name, attr);
    let sensor = |attr: &str| format!("sensor/{}/{}/{}", kind, name, attr);

    let mut out = vec![(topic("power"), state.power_str().to_string())];
    if kind == DeviceKind::Aircon {
        out.push((topic("mode"), state.mode.as_str().to_string()));
        out.push((
            topic("temperature"),
            state.reported_target_temperature().to_string(),
        ));
        out.push((topic("humidity"), state.target_humidity.to_string()));
        out.push((topic("fan"), state.fan_level().as_str().to_string()));
        out.push((topic("swing"), state.swing().as_str().to_string()));
        out.push((sensor("temperature"), state.room_temp.to_string()));
        out.push((sensor("outtemp"), state.outdoor_temp.to_string()));
        out.push((sensor("humidity"), state.room_humidity.to_string()));
        if let Some(watts) = snapshot.watts() {
            out.push((sensor("watt"), watts.to_string()));
        }
    }
    out
}
