//! Frame authentication with the pre-shared device key.
//!
//! Every frame ends in `*` followed by 32 lowercase hex digits: the HMAC-MD5 of
//! all bytes before the `*`, keyed by the shared secret.

use crate::error::{CommError, DaqError};
use hmac::{Hmac, Mac};
use md5::Md5;
use std::fmt;

type HmacMd5 = Hmac<Md5>;

/// Length of the hex digest trailer.
pub const MAC_HEX_LEN: usize = 32;

/// Separator between frame body and digest.
pub const MAC_SEPARATOR: char = '*';

/// Keyed MAC state, built once per gateway and cloned per frame.
#[derive(Clone)]
pub struct SessionKey {
    mac: HmacMd5,
}

impl SessionKey {
    /// Key the MAC with the shared secret.
    pub fn new(secret: &[u8]) -> Result<Self, DaqError> {
        let mac = HmacMd5::new_from_slice(secret)
            .map_err(|e| DaqError::Configuration(format!("Invalid HMAC key: {e}")))?;
        Ok(Self { mac })
    }

    /// Lowercase hex HMAC of `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// `body` followed by `*` and its digest.
    pub fn seal(&self, body: &str) -> String {
        let digest = self.sign(body.as_bytes());
        format!("{body}{MAC_SEPARATOR}{digest}")
    }

    /// Check the trailer of `frame` (newline already stripped) and return the body.
    ///
    /// A missing separator, a short frame, non-lowercase-hex digits and a digest
    /// mismatch all fail with [`CommError::InvalidMac`].
    pub fn open<'a>(&self, frame: &'a str) -> Result<&'a str, CommError> {
        if frame.len() < MAC_HEX_LEN + 1 {
            return Err(CommError::InvalidMac);
        }

        let split = frame.len() - MAC_HEX_LEN;
        if !frame.is_char_boundary(split - 1) || !frame.is_char_boundary(split) {
            return Err(CommError::InvalidMac);
        }
        let (head, digest) = frame.split_at(split);
        let body = head
            .strip_suffix(MAC_SEPARATOR)
            .ok_or(CommError::InvalidMac)?;

        if !digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(CommError::InvalidMac);
        }
        let expected = hex::decode(digest).map_err(|_| CommError::InvalidMac)?;

        let mut mac = self.mac.clone();
        mac.update(body.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| CommError::InvalidMac)?;

        Ok(body)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new(b"abc123").unwrap()
    }

    #[test]
    fn test_known_digest() {
        // RFC 2104 test vector 2
        let key = SessionKey::new(b"Jefe").unwrap();
        assert_eq!(
            key.sign(b"what do ya want for nothing?"),
            "750c783e6ab0b503eaa86e310a5db738"
        );
    }

    #[test]
    fn test_seal_then_open() {
        let key = key();
        let frame = key.seal("QS:17:3:A\t");
        assert_eq!(frame.len(), "QS:17:3:A\t".len() + 1 + MAC_HEX_LEN);
        assert_eq!(key.open(&frame).unwrap(), "QS:17:3:A\t");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let frame = key().seal("A:HE:1:0:0:2\tv1\t");
        let other = SessionKey::new(b"other").unwrap();
        assert!(matches!(other.open(&frame), Err(CommError::InvalidMac)));
    }

    #[test]
    fn test_malformed_trailer_rejected() {
        let key = key();
        let frame = key.seal("A:QS:1:0:0:");

        let upper = frame.to_uppercase();
        assert!(matches!(key.open(&upper), Err(CommError::InvalidMac)));

        let no_star = frame.replace('*', "#");
        assert!(matches!(key.open(&no_star), Err(CommError::InvalidMac)));

        assert!(matches!(key.open("short"), Err(CommError::InvalidMac)));
        assert!(matches!(key.open(&frame[..frame.len() - 1]), Err(CommError::InvalidMac)));
    }
}
