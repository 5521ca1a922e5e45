//! Integrity tags for controller <-> node compute traffic.
//!
//! The payload is not secret, so messages travel in clear text with a
//! base64 HMAC-SHA256 tag in front:
//!
//! ```text
//! <base64(hmac(payload))> <payload>
//! ```
//!
//! Requests and results use the same key and algorithm.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{GridError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Pre-shared key between controller and nodes
#[derive(Clone)]
pub struct IntegrityKey {
    mac: HmacSha256,
}

impl std::fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityKey").finish_non_exhaustive()
    }
}

impl IntegrityKey {
    pub fn new(key: Vec<u8>) -> Result<Self> {
        if key.is_empty() {
            return Err(GridError::KeyMaterial("empty integrity key".to_string()));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(&key)
            .map_err(|e| GridError::KeyMaterial(format!("invalid integrity key: {}", e)))?;
        Ok(Self { mac })
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    /// Base64 tag over the exact payload text
    pub fn tag(&self, payload: &str) -> String {
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of `tag` against `payload`
    pub fn verify(&self, tag: &str, payload: &str) -> bool {
        let Ok(raw) = STANDARD.decode(tag) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&raw).is_ok()
    }

    /// Prefix `payload` with its tag, ready to be written as one line
    pub fn seal(&self, payload: &str) -> String {
        format!("{} {}", self.tag(payload), payload)
    }

    /// Split a tagged line and verify it.
    ///
    /// Returns the payload on success and `Tampered` carrying the payload
    /// otherwise; a line with no separator at all is a protocol error.
    pub fn open<'a>(&self, line: &'a str) -> Result<&'a str> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (tag, payload) = line
            .split_once(' ')
            .ok_or_else(|| GridError::Protocol(format!("untagged message: {}", line)))?;

        if self.verify(tag, payload) {
            Ok(payload)
        } else {
            Err(GridError::Tampered {
                payload: payload.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> IntegrityKey {
        IntegrityKey::new(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let key = key();
        let line = key.seal("!compute 3 + 4");
        assert_eq!(key.open(&line).unwrap(), "!compute 3 + 4");
    }

    #[test]
    fn test_flipped_payload_byte_is_tampered() {
        let key = key();
        let tag = key.tag("!compute 3 + 4");
        assert!(key.verify(&tag, "!compute 3 + 4"));
        assert!(!key.verify(&tag, "!compute 3 + 5"));

        let line = format!("{} !compute 9 + 4", tag);
        match key.open(&line) {
            Err(GridError::Tampered { payload }) => assert_eq!(payload, "!compute 9 + 4"),
            other => panic!("expected tampered, got {:?}", other),
        }
    }

    #[test]
    fn test_flipped_tag_byte_is_rejected() {
        let key = key();
        let mut tag = key.tag("!result 7").into_bytes();
        tag[0] = if tag[0] == b'A' { b'B' } else { b'A' };
        let tag = String::from_utf8(tag).unwrap();
        assert!(!key.verify(&tag, "!result 7"));
        assert!(!key.verify("not base64 at all!", "!result 7"));
    }

    #[test]
    fn test_different_keys_disagree() {
        let other = IntegrityKey::new(b"another key".to_vec()).unwrap();
        let line = key().seal("!result 7");
        assert!(matches!(other.open(&line), Err(GridError::Tampered { .. })));
    }

    #[test]
    fn test_untagged_line() {
        assert!(matches!(key().open("!result"), Err(GridError::Protocol(_))));
        assert!(IntegrityKey::new(Vec::new()).is_err());
    }
}
