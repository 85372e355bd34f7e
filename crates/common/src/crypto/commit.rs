//! Pedersen vector commitments

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::MultiscalarMul;
use rand::{CryptoRng, RngCore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("commitment does not open to the given values")]
    BadOpening,
    #[error("expected {expected} values, got {actual}")]
    WrongArity { expected: usize, actual: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pedersen {
    h: RistrettoPoint,
    g: Vec<RistrettoPoint>,
}

impl Pedersen {
    /// Returns `None` if two generators coincide.
    pub fn new(h: RistrettoPoint, g: Vec<RistrettoPoint>) -> Option<Self> {
        for i in 0..g.len() {
            if g[i] == h || g[..i].contains(&g[i]) {
                return None;
            }
        }
        Some(Self { h, g })
    }

    pub fn shared_point(&self) -> &RistrettoPoint {
        &self.h
    }

    pub fn points(&self) -> &[RistrettoPoint] {
        &self.g
    }

    pub fn len(&self) -> usize {
        self.g.len()
    }

    pub fn is_empty(&self) -> bool {
        self.g.is_empty()
    }

    pub fn commit_to<R: RngCore + CryptoRng>(
        &self,
        m: &[Scalar],
        rng: &mut R,
    ) -> Result<(RistrettoPoint, Scalar), CommitError> {
        let r = Scalar::random(rng);
        let c = self.commit_by(m, &r)?;
        Ok((c, r))
    }

    pub fn commit_by(&self, m: &[Scalar], r: &Scalar) -> Result<RistrettoPoint, CommitError> {
        if m.len() != self.g.len() {
            return Err(CommitError::WrongArity {
                expected: self.g.len(),
                actual: m.len(),
            });
        }
        let gm = RistrettoPoint::multiscalar_mul(m.iter(), self.g.iter());
        Ok(gm + self.h * r)
    }

    pub fn open(&self, c: &RistrettoPoint, m: &[Scalar], r: &Scalar) -> Result<(), CommitError> {
        if *c == self.commit_by(m, r)? {
            Ok(())
        } else {
            Err(CommitError::BadOpening)
        }
    }
}
