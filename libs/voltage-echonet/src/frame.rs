//! ECHONET Lite frame codec
//!
//! Wire layout (big-endian):
//!
//! ```text
//! | EHD (2) | TID (2) | SEOJ (3) | DEOJ (3) | ESV (1) | OPC (1) | OPC x (EPC, PDC, EDT[PDC]) |
//! ```

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{
    EHD, EPC_INSTANCE_LIST, EPC_INSTANCE_LIST_S, HEADER_LEN, LOCAL_OBJECT, OBJECT_CODE_MASK,
    PROPERTY_HEADER_LEN, PROPERTY_MAP_CODES,
};
use crate::error::{EchonetError, Result};
use crate::propmap::PropertyMap;

// ============================================================================
// Object Code
// ============================================================================

/// 24-bit object code (class group, class, instance)
///
/// Written in configuration as six hex digits, e.g. `"013001"` for the first
/// home air conditioner instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectCode(u32);

impl ObjectCode {
    /// Node profile object
    pub const NODE_PROFILE: ObjectCode = ObjectCode(LOCAL_OBJECT);

    #[inline]
    pub const fn new(code: u32) -> Self {
        Self(code & OBJECT_CODE_MASK)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn class_group(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub const fn class(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub const fn instance(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for ObjectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

impl FromStr for ObjectCode {
    type Err = EchonetError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        if digits.is_empty() || digits.len() > 6 {
            return Err(EchonetError::config(format!(
                "object code '{}' must be 1-6 hex digits",
                s
            )));
        }
        u32::from_str_radix(digits, 16)
            .map(ObjectCode::new)
            .map_err(|e| EchonetError::config(format!("object code '{}': {}", s, e)))
    }
}

impl TryFrom<String> for ObjectCode {
    type Error = EchonetError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObjectCode> for String {
    fn from(code: ObjectCode) -> Self {
        code.to_string()
    }
}

// ============================================================================
// Service Code
// ============================================================================

/// ESV field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCode {
    SetI,
    SetC,
    Get,
    InfReq,
    SetGet,
    SetRes,
    GetRes,
    Inf,
    Infc,
    InfcRes,
    SetGetRes,
    SetISna,
    SetCSna,
    GetSna,
    InfSna,
    SetGetSna,
    Other(u8),
}

impl ServiceCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x60 => Self::SetI,
            0x61 => Self::SetC,
            0x62 => Self::Get,
            0x63 => Self::InfReq,
            0x6E => Self::SetGet,
            0x71 => Self::SetRes,
            0x72 => Self::GetRes,
            0x73 => Self::Inf,
            0x74 => Self::Infc,
            0x7A => Self::InfcRes,
            0x7E => Self::SetGetRes,
            0x50 => Self::SetISna,
            0x51 => Self::SetCSna,
            0x52 => Self::GetSna,
            0x53 => Self::InfSna,
            0x5E => Self::SetGetSna,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::SetI => 0x60,
            Self::SetC => 0x61,
            Self::Get => 0x62,
            Self::InfReq => 0x63,
            Self::SetGet => 0x6E,
            Self::SetRes => 0x71,
            Self::GetRes => 0x72,
            Self::Inf => 0x73,
            Self::Infc => 0x74,
            Self::InfcRes => 0x7A,
            Self::SetGetRes => 0x7E,
            Self::SetISna => 0x50,
            Self::SetCSna => 0x51,
            Self::GetSna => 0x52,
            Self::InfSna => 0x53,
            Self::SetGetSna => 0x5E,
            Self::Other(code) => code,
        }
    }

    /// Only these replies may change cached device state
    #[inline]
    pub fn is_state_update(self) -> bool {
        matches!(self, Self::GetRes | Self::SetGetRes | Self::Inf)
    }

    /// Device refused the request ("SNA" variants)
    #[inline]
    pub fn is_denied(self) -> bool {
        matches!(
            self,
            Self::SetISna | Self::SetCSna | Self::GetSna | Self::InfSna | Self::SetGetSna
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SetI => "SetI",
            Self::SetC => "SetC",
            Self::Get => "Get",
            Self::InfReq => "INF_REQ",
            Self::SetGet => "SetGet",
            Self::SetRes => "Set_Res",
            Self::GetRes => "Get_Res",
            Self::Inf => "INF",
            Self::Infc => "INFC",
            Self::InfcRes => "INFC_Res",
            Self::SetGetRes => "SetGet_Res",
            Self::SetISna => "SetI_SNA",
            Self::SetCSna => "SetC_SNA",
            Self::GetSna => "Get_SNA",
            Self::InfSna => "INF_SNA",
            Self::SetGetSna => "SetGet_SNA",
            Self::Other(_) => "Unknown",
        }
    }
}

impl From<u8> for ServiceCode {
    fn from(code: u8) -> Self {
        Self::from_u8(code)
    }
}

impl fmt::Display for ServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "0x{:02x}", code),
            known => f.write_str(known.name()),
        }
    }
}

// ============================================================================
// Property / Frame
// ============================================================================

/// One EPC/PDC/EDT triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub code: u8,
    pub data: Vec<u8>,
}

impl Property {
    #[inline]
    pub fn first_byte(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// A decoded or outbound frame
///
/// The property count is kept private and advanced by [`Frame::add_property`],
/// so it always matches the property list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tid: u16,
    pub seoj: ObjectCode,
    pub deoj: ObjectCode,
    pub esv: ServiceCode,
    opc: u8,
    properties: Vec<Property>,
}

impl Frame {
    pub fn new(seoj: ObjectCode, deoj: ObjectCode, esv: ServiceCode) -> Self {
        Self {
            tid: 0,
            seoj,
            deoj,
            esv,
            opc: 0,
            properties: Vec::new(),
        }
    }

    /// Frame from the local controller object to `deoj`
    pub fn request(deoj: ObjectCode, esv: ServiceCode) -> Self {
        Self::new(ObjectCode::NODE_PROFILE, deoj, esv)
    }

    /// Append a property and advance the property count
    pub fn add_property(&mut self, code: u8, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        if self.opc == u8::MAX {
            return Err(EchonetError::invalid("frame already carries 255 properties"));
        }
        if data.len() > u8::MAX as usize {
            return Err(EchonetError::invalid(format!(
                "property 0x{:02x} data too long: {} bytes",
                code,
                data.len()
            )));
        }
        self.properties.push(Property { code, data });
        self.opc += 1;
        Ok(())
    }

    /// Fluent form of [`Frame::add_property`]
    pub fn with_property(mut self, code: u8, data: impl Into<Vec<u8>>) -> Result<Self> {
        self.add_property(code, data)?;
        Ok(self)
    }

    #[inline]
    pub fn opc(&self) -> u8 {
        self.opc
    }

    #[inline]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, code: u8) -> Option<&Property> {
        self.properties.iter().find(|p| p.code == code)
    }

    pub fn property_codes(&self) -> Vec<u8> {
        self.properties.iter().map(|p| p.code).collect()
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let body: usize = self
            .properties
            .iter()
            .map(|p| PROPERTY_HEADER_LEN + p.data.len())
            .sum();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body);

        buf.put_u16(EHD);
        buf.put_u16(self.tid);
        buf.put_uint(u64::from(self.seoj.value()), 3);
        buf.put_uint(u64::from(self.deoj.value()), 3);
        buf.put_u8(self.esv.as_u8());
        buf.put_u8(self.opc);
        for prop in &self.properties {
            buf.put_u8(prop.code);
            buf.put_u8(prop.data.len() as u8);
            buf.put_slice(&prop.data);
        }
        buf.freeze()
    }

    /// Parse wire bytes
    ///
    /// Never reads past `data`; trailing bytes after the last property are
    /// ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(EchonetError::malformed(format!(
                "{} bytes is shorter than the {}-byte header",
                data.len(),
                HEADER_LEN
            )));
        }

        let mut buf = data;
        let ehd = buf.get_u16();
        if ehd != EHD {
            return Err(EchonetError::malformed(format!(
                "bad EHD 0x{:04x} (expected 0x{:04x})",
                ehd, EHD
            )));
        }

        let tid = buf.get_u16();
        let seoj = ObjectCode::new(buf.get_uint(3) as u32);
        let deoj = ObjectCode::new(buf.get_uint(3) as u32);
        let esv = ServiceCode::from_u8(buf.get_u8());
        let declared = buf.get_u8();

        let mut frame = Frame::new(seoj, deoj, esv);
        frame.tid = tid;
        for index in 0..declared {
            if buf.remaining() < PROPERTY_HEADER_LEN {
                return Err(EchonetError::malformed(format!(
                    "property {} of {} missing header",
                    index + 1,
                    declared
                )));
            }
            let code = buf.get_u8();
            let pdc = buf.get_u8() as usize;
            if buf.remaining() < pdc {
                return Err(EchonetError::malformed(format!(
                    "property 0x{:02x} declares {} bytes, {} left",
                    code,
                    pdc,
                    buf.remaining()
                )));
            }
            frame.add_property(code, buf[..pdc].to_vec())?;
            buf.advance(pdc);
        }

        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EOJ:{}=>{} TID:{} {}",
            self.seoj, self.deoj, self.tid, self.esv
        )?;
        for prop in &self.properties {
            if PROPERTY_MAP_CODES.contains(&prop.code) && !prop.data.is_empty() {
                write!(f, " ({:02x} {})", prop.code, PropertyMap::from_edt(&prop.data))?;
            } else {
                write!(f, " ({:02x} {})", prop.code, common::hex::encode_lower(&prop.data))?;
            }
        }
        Ok(())
    }
}

/// Object codes advertised in an instance list (EPC 0xD5 / 0xD6)
///
/// Returns an empty list for other properties. A short payload yields the
/// complete entries only.
pub fn parse_instance_list(prop: &Property) -> Vec<ObjectCode> {
    if prop.code != EPC_INSTANCE_LIST && prop.code != EPC_INSTANCE_LIST_S {
        return Vec::new();
    }
    let Some((&count, rest)) = prop.data.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(3)
        .take(count as usize)
        .map(|c| ObjectCode::new((u32::from(c[0]) << 16) | (u32::from(c[1]) << 8) | u32::from(c[2])))
        .collect()
}
