//! Common L2 types shared by the flow key and the learning table

use std::fmt;
use std::str::FromStr;

/// MAC address (6 bytes)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// IEEE 802.1D reserved control addresses (01:80:c2:00:00:0x),
    /// which a bridge must never forward.
    pub fn is_reserved(&self) -> bool {
        self.0[..5] == [0x01, 0x80, 0xc2, 0x00, 0x00] && self.0[5] & 0xf0 == 0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error type for MAC address parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacAddrError {
    kind: ParseMacAddrErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseMacAddrErrorKind {
    Length,
    Format,
    Hex,
}

impl fmt::Display for ParseMacAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ParseMacAddrErrorKind::Length => write!(f, "invalid MAC address length"),
            ParseMacAddrErrorKind::Format => write!(f, "invalid MAC address format"),
            ParseMacAddrErrorKind::Hex => write!(f, "invalid hex digit in MAC address"),
        }
    }
}

impl std::error::Error for ParseMacAddrError {}

impl FromStr for MacAddr {
    type Err = ParseMacAddrError;

    /// Parse a MAC address from string
    ///
    /// Supported formats:
    /// - Colon-separated: "00:11:22:33:44:55"
    /// - Hyphen-separated: "00-11-22-33-44-55"
    /// - No separator: "001122334455"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else if s.len() == 12 {
            // No separator format
            let mut result = [0u8; 6];
            for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
                let hex_str = std::str::from_utf8(chunk).map_err(|_| ParseMacAddrError {
                    kind: ParseMacAddrErrorKind::Hex,
                })?;
                result[i] = u8::from_str_radix(hex_str, 16).map_err(|_| ParseMacAddrError {
                    kind: ParseMacAddrErrorKind::Hex,
                })?;
            }
            return Ok(MacAddr(result));
        } else {
            return Err(ParseMacAddrError {
                kind: ParseMacAddrErrorKind::Format,
            });
        };

        if bytes.len() != 6 {
            return Err(ParseMacAddrError {
                kind: ParseMacAddrErrorKind::Length,
            });
        }

        let mut result = [0u8; 6];
        for (i, byte_str) in bytes.iter().enumerate() {
            if byte_str.len() != 2 {
                return Err(ParseMacAddrError {
                    kind: ParseMacAddrErrorKind::Format,
                });
            }
            result[i] = u8::from_str_radix(byte_str, 16).map_err(|_| ParseMacAddrError {
                kind: ParseMacAddrErrorKind::Hex,
            })?;
        }

        Ok(MacAddr(result))
    }
}

/// EtherType values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
}

/// ARP opcodes, carried in the flow key's L3 protocol slot for ARP frames
pub const ARP_OP_REQUEST: u8 = 1;
pub const ARP_OP_REPLY: u8 = 2;

/// 802.1Q tag control information
///
/// A value of zero means the frame carried no 802.1Q header. A non-zero
/// TCI with VID 0 is a priority-tagged frame, which belongs to VLAN 0 just
/// like an untagged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VlanTci(pub u16);

impl VlanTci {
    pub const NONE: VlanTci = VlanTci(0);

    pub fn new(vid: u16, pcp: u8) -> Self {
        Self(((pcp as u16 & 0x07) << 13) | (vid & 0x0FFF))
    }

    /// VLAN ID (12 bits, 0-4095)
    pub fn vid(&self) -> u16 {
        self.0 & 0x0FFF
    }

    /// Priority Code Point (3 bits)
    pub fn pcp(&self) -> u8 {
        ((self.0 >> 13) & 0x07) as u8
    }
}
