use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::thread_rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::suite::{Suite, SuiteError, ELEMENT_SIZE};

/// Size of a secret key in bytes
pub const PRIVATE_KEY_SIZE: usize = ELEMENT_SIZE;
/// Size of a public key in bytes
pub const PUBLIC_KEY_SIZE: usize = ELEMENT_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key: {0}")]
    Suite(#[from] SuiteError),
}

/// Long-term or ephemeral public key: a Ristretto point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(RistrettoPoint);

impl PublicKey {
    pub fn from_point(point: RistrettoPoint) -> Self {
        Self(point)
    }

    pub fn point(&self) -> &RistrettoPoint {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(Self(Suite.point_from_bytes(bytes)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim())?;
        Self::from_bytes(&bytes)
    }
}

impl Deref for PublicKey {
    type Target = RistrettoPoint;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<RistrettoPoint> for PublicKey {
    fn from(point: RistrettoPoint) -> Self {
        Self(point)
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Secret scalar paired with a [`PublicKey`] as `public = g · secret`.
#[derive(Clone)]
pub struct SecretKey(Scalar);

impl SecretKey {
    pub fn generate() -> Self {
        Self(Scalar::random(&mut thread_rng()))
    }

    pub fn from_scalar(scalar: Scalar) -> Self {
        Self(scalar)
    }

    pub fn scalar(&self) -> &Scalar {
        &self.0
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(RISTRETTO_BASEPOINT_POINT * self.0)
    }

    /// Diffie-Hellman: `peer · secret`.
    pub fn shared_point(&self, peer: &PublicKey) -> RistrettoPoint {
        peer.0 * self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim())?;
        Ok(Self(Suite.scalar_from_bytes(&bytes)?))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let sk = SecretKey::generate();
        let pk = sk.public();
        let sk2 = SecretKey::from_hex(&sk.to_hex()).unwrap();
        assert_eq!(sk2.public(), pk);
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
    }

    #[test]
    fn test_shared_point_is_symmetric() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        assert_eq!(a.shared_point(&b.public()), b.shared_point(&a.public()));
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("00ff").is_err());
    }
}
