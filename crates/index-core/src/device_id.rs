//! DeviceId: Unique identifier for a device sharing folders.
//!
//! Wraps a u64 internally (compact in version vectors) but displays as
//! a 16-character hex string for human readability.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("Invalid device ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
    #[error("Device ID cannot be zero")]
    Zero,
}

/// A unique identifier for a device in the sync network.
///
/// # Examples
/// ```
/// use index_core::DeviceId;
///
/// let device = DeviceId::generate();
/// println!("{}", device); // "a1b2c3d4e5f67890"
///
/// let parsed: DeviceId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Generate a new random device ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// First 7 hex characters, for compact log lines.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full[..7].to_string()
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DeviceIdError::InvalidFormat);
        }
        let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
        if id == 0 {
            return Err(DeviceIdError::Zero);
        }
        Ok(Self(id))
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<DeviceId> for u64 {
    fn from(device: DeviceId) -> u64 {
        device.0
    }
}

// Serialize as hex string so JSON indexes and logs agree
impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        let device = DeviceId(0xff);
        assert_eq!(device.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_mixed_case() {
        let device: DeviceId = "A1b2C3d4E5f67890".parse().unwrap();
        assert_eq!(device.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!("".parse::<DeviceId>().is_err());
        assert!("a1b2c3d4e5f6789".parse::<DeviceId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<DeviceId>().is_err());
        assert!(matches!(
            "0000000000000000".parse::<DeviceId>(),
            Err(DeviceIdError::Zero)
        ));
    }

    #[test]
    fn test_short_form() {
        let device = DeviceId(0xa1b2c3d4e5f67890);
        assert_eq!(device.short(), "a1b2c3d");
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(DeviceId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_serde_as_hex_string() {
        let device = DeviceId(0x1234);
        let json = serde_json::to_string(&device).unwrap();
        assert_eq!(json, "\"0000000000001234\"");
        let parsed: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, device);
    }
}
