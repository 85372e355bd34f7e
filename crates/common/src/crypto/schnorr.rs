//! Schnorr signatures over Ristretto255.
//!
//! A signature on `msg` by `sk` is `(R, k)` with `R = g·a` and
//! `k = a + v·sk`, where the challenge `v` is drawn from a merlin
//! transcript over the context label, the signer's public key, `R` and
//! `msg`. Verification checks `g·k == R + pk·v`.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use merlin::Transcript;
use rand::thread_rng;

use super::keys::{PublicKey, SecretKey};
use super::suite::{Suite, SuiteError, ELEMENT_SIZE};
use super::transcript::{TranscriptProtocol, TranscriptRngProtocol};

/// Size of an encoded signature
pub const SIGNATURE_SIZE: usize = 2 * ELEMENT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature does not verify")]
    BadSignature,
    #[error("signature must be {SIGNATURE_SIZE} bytes, got {0}")]
    BadLength(usize),
    #[error("signature carries a non-canonical element")]
    BadEncoding,
}

impl From<SuiteError> for SignatureError {
    fn from(_: SuiteError) -> Self {
        SignatureError::BadEncoding
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    big_a: RistrettoPoint,
    k: Scalar,
}

fn challenge(context: &'static [u8], pk: &PublicKey, big_a: &RistrettoPoint, msg: &[u8]) -> Scalar {
    let mut t = Transcript::new(b"prifi-schnorr");
    t.domain_sep(context);
    t.commit_point(b"pk", pk.point());
    t.commit_point(b"big_a", big_a);
    t.commit_bytes(b"msg", msg);
    t.challenge_scalar(b"v")
}

impl Signature {
    pub fn sign(sk: &SecretKey, context: &'static [u8], msg: &[u8]) -> Self {
        let pk = sk.public();
        let mut t = Transcript::new(b"prifi-schnorr-nonce");
        t.commit_bytes(b"msg", msg);
        let mut rng = t
            .build_rng()
            .commit_scalar(b"sk", sk.scalar())
            .finalize(&mut thread_rng());

        let a = Scalar::random(&mut rng);
        let big_a = Suite.generator() * a;
        let v = challenge(context, &pk, &big_a, msg);

        Self {
            big_a,
            k: a + v * sk.scalar(),
        }
    }

    pub fn verify(&self, pk: &PublicKey, context: &'static [u8], msg: &[u8]) -> Result<(), SignatureError> {
        let v = challenge(context, pk, &self.big_a, msg);
        if Suite.generator() * self.k == self.big_a + pk.point() * v {
            Ok(())
        } else {
            Err(SignatureError::BadSignature)
        }
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        let mut out = [0u8; SIGNATURE_SIZE];
        out[..ELEMENT_SIZE].copy_from_slice(self.big_a.compress().as_bytes());
        out[ELEMENT_SIZE..].copy_from_slice(self.k.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(SignatureError::BadLength(bytes.len()));
        }
        Ok(Self {
            big_a: Suite.point_from_bytes(&bytes[..ELEMENT_SIZE])?,
            k: Suite.scalar_from_bytes(&bytes[ELEMENT_SIZE..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_agree() {
        let sk = SecretKey::generate();
        let sig = Signature::sign(&sk, b"test", b"hello");
        assert_eq!(sig.verify(&sk.public(), b"test", b"hello"), Ok(()));
    }

    #[test]
    fn test_wrong_key_message_or_context_fails() {
        let sk = SecretKey::generate();
        let other = SecretKey::generate();
        let sig = Signature::sign(&sk, b"test", b"hello");
        assert_eq!(
            sig.verify(&other.public(), b"test", b"hello"),
            Err(SignatureError::BadSignature)
        );
        assert_eq!(
            sig.verify(&sk.public(), b"test", b"hellO"),
            Err(SignatureError::BadSignature)
        );
        assert_eq!(
            sig.verify(&sk.public(), b"other", b"hello"),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn test_encoding_round_trip() {
        let sk = SecretKey::generate();
        let sig = Signature::sign(&sk, b"test", b"m");
        let back = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, back);
        assert_eq!(
            Signature::from_bytes(&[0u8; 10]),
            Err(SignatureError::BadLength(10))
        );
    }
}
