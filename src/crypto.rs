use crate::geo::GeoPoint;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub(crate) enum CryptoError {
    #[error("unknown key version: {0}")]
    UnknownVersion(i32),
    #[error("duplicate key version: {0}")]
    DuplicateVersion(i32),
    #[error("invalid key for version {version}: {reason}")]
    InvalidKey { version: i32, reason: String },
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("ciphertext failed authentication")]
    Authentication,
}

/// AES-256-GCM keys indexed by version. New ciphertexts always use the current
/// version, older versions are only kept around for decryption.
#[derive(Clone)]
pub(crate) struct Keyring {
    current: i32,
    ciphers: BTreeMap<i32, Aes256Gcm>,
}

impl Keyring {
    pub fn new(current: i32, current_key: &[u8]) -> Result<Self, CryptoError> {
        let mut ciphers = BTreeMap::new();
        ciphers.insert(current, cipher_for(current, current_key)?);
        Ok(Self { current, ciphers })
    }

    /// Parses hex encoded keys, `previous` being `version:hexkey` pairs.
    pub fn from_hex<'a>(current: i32, current_key: &str, previous: impl IntoIterator<Item = (i32, &'a str)>) -> Result<Self, CryptoError> {
        let mut ring = Self::new(current, &decode_key(current, current_key)?)?;
        for (version, key) in previous {
            ring.add(version, &decode_key(version, key)?)?;
        }
        Ok(ring)
    }

    pub fn add(&mut self, version: i32, key: &[u8]) -> Result<(), CryptoError> {
        if self.ciphers.contains_key(&version) {
            return Err(CryptoError::DuplicateVersion(version));
        }
        self.ciphers.insert(version, cipher_for(version, key)?);
        Ok(())
    }

    pub fn current_version(&self) -> i32 {
        self.current
    }

    pub fn is_current(&self, version: i32) -> bool {
        version == self.current
    }

    pub fn encrypt_point(&self, point: GeoPoint) -> Result<(String, i32), CryptoError> {
        let cipher = self.ciphers.get(&self.current).ok_or(CryptoError::UnknownVersion(self.current))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let plaintext = format!("{},{}", point.latitude, point.longitude);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Authentication)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok((hex::encode(out), self.current))
    }

    pub fn decrypt_point(&self, ciphertext: &str, version: i32) -> Result<GeoPoint, CryptoError> {
        let cipher = self.ciphers.get(&version).ok_or(CryptoError::UnknownVersion(version))?;
        let raw = hex::decode(ciphertext).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        // nonce followed by at least the 16 byte tag
        if raw.len() < NONCE_LEN + 16 {
            return Err(CryptoError::Malformed(format!("{} bytes is too short", raw.len())));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Authentication)?;
        let plain = String::from_utf8(plain).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        parse_point(&plain)
    }
}

fn cipher_for(version: i32, key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey {
            version,
            reason: format!("expected {} bytes, got {}", KEY_LEN, key.len()),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey { version, reason: e.to_string() })
}

fn decode_key(version: i32, key: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(key.trim()).map_err(|e| CryptoError::InvalidKey { version, reason: e.to_string() })
}

fn parse_point(s: &str) -> Result<GeoPoint, CryptoError> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| CryptoError::Malformed("missing separator".to_owned()))?;
    let latitude = lat.parse::<f64>().map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let longitude = lon.parse::<f64>().map_err(|e| CryptoError::Malformed(e.to_string()))?;
    Ok(GeoPoint { latitude, longitude })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) const KEY_1: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    pub(crate) const KEY_2: &str = "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100";

    #[test]
    fn test_encrypt_decrypt() {
        let ring = Keyring::from_hex(1, KEY_1, []).unwrap();
        let point = GeoPoint::new(48.8566, 2.3522);
        let (ct, version) = ring.encrypt_point(point).unwrap();
        assert_eq!(version, 1);
        assert_eq!(ring.decrypt_point(&ct, version).unwrap(), point);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let ring = Keyring::from_hex(1, KEY_1, []).unwrap();
        let point = GeoPoint::new(45.764, 4.8357);
        let (a, _) = ring.encrypt_point(point).unwrap();
        let (b, _) = ring.encrypt_point(point).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_previous_key_decrypts() {
        let old = Keyring::from_hex(1, KEY_1, []).unwrap();
        let (ct, version) = old.encrypt_point(GeoPoint::new(1.5, -2.25)).unwrap();
        let rotated = Keyring::from_hex(2, KEY_2, [(1, KEY_1)]).unwrap();
        assert!(!rotated.is_current(version));
        assert_eq!(rotated.decrypt_point(&ct, version).unwrap(), GeoPoint::new(1.5, -2.25));
        assert_eq!(rotated.encrypt_point(GeoPoint::new(0.0, 0.0)).unwrap().1, 2);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let a = Keyring::from_hex(1, KEY_1, []).unwrap();
        let b = Keyring::from_hex(1, KEY_2, []).unwrap();
        let (ct, version) = a.encrypt_point(GeoPoint::new(10.0, 10.0)).unwrap();
        assert!(matches!(b.decrypt_point(&ct, version), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_unknown_version() {
        let ring = Keyring::from_hex(1, KEY_1, []).unwrap();
        assert!(matches!(ring.decrypt_point("00", 9), Err(CryptoError::UnknownVersion(9))));
    }

    #[test]
    fn test_malformed_ciphertext() {
        let ring = Keyring::from_hex(1, KEY_1, []).unwrap();
        assert!(matches!(ring.decrypt_point("zz", 1), Err(CryptoError::Malformed(_))));
        assert!(matches!(ring.decrypt_point("0011", 1), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(Keyring::from_hex(1, "abcd", []), Err(CryptoError::InvalidKey { version: 1, .. })));
        assert!(matches!(Keyring::from_hex(1, KEY_1, [(1, KEY_2)]), Err(CryptoError::DuplicateVersion(1))));
    }
}
