//! Equivocation protection.
//!
//! Every node folds each downstream into a rolling history. Pads are
//! hashed to scalars and weighted by `h = H(history)`: a client's σ adds
//! `h·Σ_j H(p_ij)`, a trustee's σ subtracts `h·Σ_i H(p_ij)`. With matching
//! histories the weighted terms cancel and `Σσ` leaves only the slot
//! owner's payload key. A relay that shows different downstreams to
//! different clients leaves a residue and the payload decrypts to noise.

use curve25519_dalek::scalar::Scalar;

use crate::crypto::Suite;

/// Rolling digest of every downstream seen in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    suite: Suite,
    state: [u8; 32],
}

impl History {
    pub fn new(suite: Suite) -> Self {
        Self {
            suite,
            state: [0u8; 32],
        }
    }

    /// Digest of a downstream payload, as forwarded to trustees.
    pub fn digest(suite: &Suite, payload: &[u8]) -> [u8; 32] {
        suite.hash(payload)
    }

    pub fn absorb_payload(&mut self, payload: &[u8]) {
        let digest = Self::digest(&self.suite, payload);
        self.absorb_digest(&digest);
    }

    pub fn absorb_digest(&mut self, digest: &[u8; 32]) {
        let mut material = [0u8; 64];
        material[..32].copy_from_slice(&self.state);
        material[32..].copy_from_slice(digest);
        self.state = self.suite.hash(&material);
    }

    pub fn scalar(&self) -> Scalar {
        self.suite.hash_to_scalar(&self.state)
    }

    pub fn state(&self) -> &[u8; 32] {
        &self.state
    }
}

/// Keystream the slot owner encrypts its payload under, keyed by `k`.
pub(crate) fn payload_pad(suite: &Suite, k: &Scalar, len: usize) -> Vec<u8> {
    suite.cipher(k.as_bytes()).next_bytes(len)
}

pub(crate) fn pad_scalar(suite: &Suite, pad: &[u8]) -> Scalar {
    suite.hash_to_scalar(pad)
}
