//! Property map decoding (EPC 0x9D / 0x9E / 0x9F)
//!
//! A property map lists the property codes an object supports. Its payload
//! starts with a member count and then takes one of two forms:
//!
//! - fewer than 16 members: the codes themselves, one per byte
//! - 16 or more members: a 16-byte bitmap, 17 bytes in total
//!
//! In the bitmap, bit `i` of byte `1 + j` marks code `0x80 + i * 0x10 + j`.

use std::fmt;

use crate::constants::PROPERTY_MAP_BITMAP_LEN;

/// Members at or above this count are sent as a bitmap
const BITMAP_THRESHOLD: usize = 16;

/// Decode a property-map payload into ascending property codes
///
/// Form is selected by payload length alone. An empty payload yields an
/// empty list.
pub fn decode_property_map(edt: &[u8]) -> Vec<u8> {
    if edt.len() == PROPERTY_MAP_BITMAP_LEN {
        let mut codes = Vec::new();
        for i in 0..8u8 {
            for j in 0..16u8 {
                if edt[1 + j as usize] & (1 << i) != 0 {
                    codes.push(0x80 + i * 0x10 + j);
                }
            }
        }
        codes
    } else {
        edt.get(1..).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

/// Encode property codes the way a device would advertise them
///
/// Codes below 0x80 cannot be represented and are skipped.
pub fn encode_property_map(codes: &[u8]) -> Vec<u8> {
    let mut codes: Vec<u8> = codes.iter().copied().filter(|c| *c >= 0x80).collect();
    codes.sort_unstable();
    codes.dedup();

    if codes.len() < BITMAP_THRESHOLD {
        let mut edt = Vec::with_capacity(codes.len() + 1);
        edt.push(codes.len() as u8);
        edt.extend_from_slice(&codes);
        return edt;
    }

    let mut edt = vec![0u8; PROPERTY_MAP_BITMAP_LEN];
    edt[0] = codes.len() as u8;
    for code in codes {
        let offset = code - 0x80;
        let (i, j) = (offset >> 4, offset & 0x0F);
        edt[1 + j as usize] |= 1 << i;
    }
    edt
}

/// Decoded set of supported property codes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    codes: Vec<u8>,
}

impl PropertyMap {
    pub fn from_edt(edt: &[u8]) -> Self {
        let mut codes = decode_property_map(edt);
        codes.sort_unstable();
        codes.dedup();
        Self { codes }
    }

    #[inline]
    pub fn contains(&self, code: u8) -> bool {
        self.codes.binary_search(&code).is_ok()
    }

    #[inline]
    pub fn codes(&self) -> &[u8] {
        &self.codes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl fmt::Display for PropertyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, code) in self.codes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", code)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_two_members() {
        let mut edt = [0u8; 17];
        edt[0] = 2;
        edt[1] |= 1 << 0; // i=0, j=0 -> 0x80
        edt[1 + 3] |= 1 << 1; // i=1, j=3 -> 0x93
        assert_eq!(decode_property_map(&edt), vec![0x80, 0x93]);
    }

    #[test]
    fn test_bitmap_ascending_order() {
        let mut edt = [0u8; 17];
        edt[0] = 3;
        edt[1 + 15] |= 1 << 7; // 0xFF
        edt[1] |= 1 << 3; // 0xB0
        edt[1 + 1] |= 1 << 0; // 0x81
        assert_eq!(decode_property_map(&edt), vec![0x81, 0xB0, 0xFF]);
    }

    #[test]
    fn test_explicit_list_returned_unchanged() {
        let edt = [0x03, 0xB0, 0x80, 0xBB];
        assert_eq!(decode_property_map(&edt), vec![0xB0, 0x80, 0xBB]);
    }

    #[test]
    fn test_empty_payload() {
        assert!(decode_property_map(&[]).is_empty());
        assert!(decode_property_map(&[0x00]).is_empty());
    }

    #[test]
    fn test_encode_switches_to_bitmap() {
        let codes: Vec<u8> = (0x80..0x90).collect();
        let edt = encode_property_map(&codes);
        assert_eq!(edt.len(), PROPERTY_MAP_BITMAP_LEN);
        assert_eq!(decode_property_map(&edt), codes);

        let short = encode_property_map(&[0x9F, 0x80]);
        assert_eq!(short, vec![0x02, 0x80, 0x9F]);
    }

    #[test]
    fn test_property_map_contains() {
        let map = PropertyMap::from_edt(&[0x03, 0xBB, 0x80, 0x84]);
        assert!(map.contains(0x84));
        assert!(!map.contains(0xBE));
        assert_eq!(map.to_string(), "[80 84 bb]");
    }
}
