use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::busline::common::{Error, Result};

pub const GUID_LENGTH_BYTES: usize = 16;
pub const GUID_LENGTH_HEX: usize = GUID_LENGTH_BYTES * 2;

/// A server's globally unique identity, embedded in addresses as guid=<hex>
/// and verified by clients after the handshake. 16 bytes rendered as 32
/// lowercase hex chars: 12 random bytes followed by a 4-byte unix timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGuid(String);

impl ServerGuid {
    pub fn new() -> Self {
        let mut raw = [0u8; GUID_LENGTH_BYTES];
        rand::thread_rng().fill_bytes(&mut raw[..12]);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        raw[12..].copy_from_slice(&ts.to_be_bytes());
        ServerGuid(hex::encode(raw))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != GUID_LENGTH_HEX || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::bad_address(format!("'{}' is not a valid guid", s)));
        }
        Ok(ServerGuid(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerGuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_guid_is_valid() {
        let guid = ServerGuid::new();
        assert_eq!(guid.as_str().len(), GUID_LENGTH_HEX);
        assert!(ServerGuid::from_hex(guid.as_str()).is_ok());
    }

    #[test]
    fn test_guids_are_unique() {
        assert_ne!(ServerGuid::new(), ServerGuid::new());
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(ServerGuid::from_hex("tooshort").is_err());
        assert!(ServerGuid::from_hex(&"zz".repeat(16)).is_err());
    }
}
