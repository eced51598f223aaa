//! Entity identifiers
//!
//! Every DUNDi node is named by a 6-byte EID, conventionally derived from
//! a MAC address. The long form (`00:50:8b:f0:3c:11`) is used for display
//! and configuration, the short form (`00508bf03c11`) for cache keys.

use std::fmt;
use std::str::FromStr;

use ring::rand::{SecureRandom, SystemRandom};

/// Length of an EID on the wire
pub const EID_LEN: usize = 6;

/// 6-byte entity identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eid(pub [u8; EID_LEN]);

/// Error returned when parsing an EID string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEidError(pub String);

impl fmt::Display for ParseEidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid entity identifier '{}'", self.0)
    }
}

impl std::error::Error for ParseEidError {}

impl Eid {
    pub const ZERO: Eid = Eid([0u8; EID_LEN]);

    /// Build an EID from a byte slice of exactly 6 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != EID_LEN {
            return None;
        }
        let mut eid = [0u8; EID_LEN];
        eid.copy_from_slice(bytes);
        Some(Eid(eid))
    }

    /// Random locally-administered EID, used when none is configured
    pub fn random() -> Self {
        let mut eid = [0u8; EID_LEN];
        if SystemRandom::new().fill(&mut eid).is_err() {
            log::warn!("System RNG unavailable, using zero entity id");
            return Eid::ZERO;
        }
        // unicast, locally administered
        eid[0] = (eid[0] & 0xfe) | 0x02;
        Eid(eid)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; EID_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; EID_LEN] {
        &self.0
    }

    /// Compact hex form used inside cache and registration keys
    pub fn short(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the compact hex form produced by [`Eid::short`]
    pub fn from_short(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Eid::from_slice(&bytes)
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for Eid {
    type Err = ParseEidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != EID_LEN {
            return Err(ParseEidError(s.to_string()));
        }
        let mut eid = [0u8; EID_LEN];
        for (slot, part) in eid.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(ParseEidError(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseEidError(s.to_string()))?;
        }
        Ok(Eid(eid))
    }
}

/// Checksum of an avoid list, independent of the order of its members.
///
/// Each EID contributes its CRC32 and the contributions are combined with
/// XOR, so any permutation of the same set yields the same value.
pub fn avoid_crc32(avoid: &[Eid]) -> u32 {
    avoid
        .iter()
        .fold(0u32, |acc, eid| acc ^ crc32fast::hash(eid.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let eid: Eid = "00:50:8B:f0:3c:11".parse().unwrap();
        assert_eq!(eid.0, [0x00, 0x50, 0x8b, 0xf0, 0x3c, 0x11]);
        assert_eq!(eid.to_string(), "00:50:8b:f0:3c:11");
        assert_eq!(eid.short(), "00508bf03c11");
        assert_eq!(Eid::from_short("00508bf03c11"), Some(eid));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("00:50:8b:f0:3c".parse::<Eid>().is_err());
        assert!("00:50:8b:f0:3c:zz".parse::<Eid>().is_err());
        assert!("00:50:8b:f0:3c:111".parse::<Eid>().is_err());
        assert!("".parse::<Eid>().is_err());
    }

    #[test]
    fn test_random_is_locally_administered() {
        let eid = Eid::random();
        assert_eq!(eid.0[0] & 0x03, 0x02);
    }

    #[test]
    fn test_avoid_crc32_order_independent() {
        let a = Eid([1, 2, 3, 4, 5, 6]);
        let b = Eid([6, 5, 4, 3, 2, 1]);
        let c = Eid([9, 9, 9, 9, 9, 9]);
        assert_eq!(avoid_crc32(&[a, b]), avoid_crc32(&[b, a]));
        assert_eq!(avoid_crc32(&[a, b, c]), avoid_crc32(&[c, a, b]));
        assert_ne!(avoid_crc32(&[a]), avoid_crc32(&[b]));
        assert_eq!(avoid_crc32(&[]), 0);
    }
}
