use curve25519_dalek::ristretto::RistrettoPoint;

use crate::crypto::{ShufflePublics, ShuffleProof, Suite};

use super::ScheduleError;

/// The ordered `(G_j, E^(j), proof_j)` outputs of the shuffle chain.
///
/// `bases[0]`/`keys[0]` are the chain input (the generator and the
/// clients' ephemeral keys); `proofs[j]` takes step `j` to step `j + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleTranscript {
    pub bases: Vec<RistrettoPoint>,
    pub keys: Vec<Vec<RistrettoPoint>>,
    pub proofs: Vec<ShuffleProof>,
}

impl ShuffleTranscript {
    pub fn new(base: RistrettoPoint, keys: Vec<RistrettoPoint>) -> Self {
        Self {
            bases: vec![base],
            keys: vec![keys],
            proofs: Vec::new(),
        }
    }

    /// Number of completed shuffle steps.
    pub fn steps(&self) -> usize {
        self.proofs.len()
    }

    pub fn last_base(&self) -> &RistrettoPoint {
        // never empty: constructed with the chain input
        &self.bases[self.bases.len() - 1]
    }

    pub fn last_keys(&self) -> &[RistrettoPoint] {
        &self.keys[self.keys.len() - 1]
    }

    /// Verifies step `index` and appends it.
    pub fn push(
        &mut self,
        base: RistrettoPoint,
        keys: Vec<RistrettoPoint>,
        proof: ShuffleProof,
    ) -> Result<(), ScheduleError> {
        let index = self.proofs.len();
        proof
            .verify(ShufflePublics {
                base: self.last_base(),
                keys: self.last_keys(),
                new_base: &base,
                new_keys: &keys,
            })
            .map_err(|_| ScheduleError::BadShuffle { index })?;
        self.bases.push(base);
        self.keys.push(keys);
        self.proofs.push(proof);
        Ok(())
    }

    /// Checks the shape, that the chain starts at the generator, and every
    /// proof. Returns the index of the first failing proof.
    pub fn verify(&self, suite: &Suite) -> Result<(), ScheduleError> {
        let steps = self.proofs.len();
        if self.bases.len() != steps + 1 || self.keys.len() != steps + 1 {
            return Err(ScheduleError::MalformedTranscript(format!(
                "{} proofs for {} bases and {} key lists",
                steps,
                self.bases.len(),
                self.keys.len()
            )));
        }
        if self.bases[0] != suite.generator() {
            return Err(ScheduleError::MalformedTranscript(
                "chain does not start at the generator".to_string(),
            ));
        }
        for (index, proof) in self.proofs.iter().enumerate() {
            proof
                .verify(ShufflePublics {
                    base: &self.bases[index],
                    keys: &self.keys[index],
                    new_base: &self.bases[index + 1],
                    new_keys: &self.keys[index + 1],
                })
                .map_err(|_| ScheduleError::BadShuffle { index })?;
        }
        Ok(())
    }

    /// Bytes every trustee signs: `G_M ‖ E_1 ‖ … ‖ E_N` compressed.
    pub fn signed_payload(base: &RistrettoPoint, keys: &[RistrettoPoint]) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * (keys.len() + 1));
        out.extend_from_slice(base.compress().as_bytes());
        for k in keys {
            out.extend_from_slice(k.compress().as_bytes());
        }
        out
    }
}
