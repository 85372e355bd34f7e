//! Fiat-Shamir helpers over merlin transcripts.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use merlin::{Transcript, TranscriptRngBuilder};

use super::commit::Pedersen;
use super::perm::Permutation;

pub(crate) trait TranscriptProtocol {
    fn domain_sep(&mut self, domain: &'static [u8]);
    fn commit_bytes(&mut self, label: &'static [u8], bytes: &[u8]);
    fn commit_point(&mut self, label: &'static [u8], point: &RistrettoPoint);
    fn commit_points(&mut self, label: &'static [u8], points: &[RistrettoPoint]);
    fn commit_scalar(&mut self, label: &'static [u8], scalar: &Scalar);
    fn commit_scalars(&mut self, label: &'static [u8], scalars: &[Scalar]);
    fn commit_pedersen(&mut self, label: &'static [u8], com: &Pedersen);
    fn challenge_scalar(&mut self, label: &'static [u8]) -> Scalar;
    fn challenge_scalars(&mut self, label: &'static [u8], n: usize) -> Vec<Scalar>;
    fn challenge_point(&mut self, label: &'static [u8]) -> RistrettoPoint;
    fn challenge_pedersen(&mut self, label: &'static [u8], n: usize) -> Pedersen;
}

impl TranscriptProtocol for Transcript {
    fn domain_sep(&mut self, domain: &'static [u8]) {
        self.append_message(b"$domain", domain);
    }

    fn commit_bytes(&mut self, label: &'static [u8], bytes: &[u8]) {
        self.append_message(label, bytes);
    }

    fn commit_point(&mut self, label: &'static [u8], point: &RistrettoPoint) {
        self.append_message(label, point.compress().as_bytes());
    }

    fn commit_points(&mut self, label: &'static [u8], points: &[RistrettoPoint]) {
        self.append_u64(label, points.len() as u64);
        for p in points {
            self.commit_point(label, p);
        }
    }

    fn commit_scalar(&mut self, label: &'static [u8], scalar: &Scalar) {
        self.append_message(label, scalar.as_bytes());
    }

    fn commit_scalars(&mut self, label: &'static [u8], scalars: &[Scalar]) {
        self.append_u64(label, scalars.len() as u64);
        for s in scalars {
            self.commit_scalar(label, s);
        }
    }

    fn commit_pedersen(&mut self, label: &'static [u8], com: &Pedersen) {
        self.commit_point(label, com.shared_point());
        self.commit_points(label, com.points());
    }

    fn challenge_scalar(&mut self, label: &'static [u8]) -> Scalar {
        let mut buf = [0u8; 64];
        self.challenge_bytes(label, &mut buf);
        Scalar::from_bytes_mod_order_wide(&buf)
    }

    fn challenge_scalars(&mut self, label: &'static [u8], n: usize) -> Vec<Scalar> {
        (0..n).map(|_| self.challenge_scalar(label)).collect()
    }

    fn challenge_point(&mut self, label: &'static [u8]) -> RistrettoPoint {
        let mut buf = [0u8; 64];
        self.challenge_bytes(label, &mut buf);
        RistrettoPoint::from_uniform_bytes(&buf)
    }

    fn challenge_pedersen(&mut self, label: &'static [u8], n: usize) -> Pedersen {
        loop {
            let h = self.challenge_point(label);
            let g = (0..n).map(|_| self.challenge_point(label)).collect();
            if let Some(com) = Pedersen::new(h, g) {
                return com;
            }
        }
    }
}

/// Binds witness values into a transcript RNG so nonces depend on secrets.
pub(crate) trait TranscriptRngProtocol {
    fn commit_scalar(self, label: &'static [u8], scalar: &Scalar) -> Self;
    fn commit_permutation(self, label: &'static [u8], pi: &Permutation) -> Self;
}

impl TranscriptRngProtocol for TranscriptRngBuilder {
    fn commit_scalar(self, label: &'static [u8], scalar: &Scalar) -> Self {
        self.rekey_with_witness_bytes(label, scalar.as_bytes())
    }

    fn commit_permutation(self, label: &'static [u8], pi: &Permutation) -> Self {
        pi.iter().fold(self, |b, &i| {
            b.rekey_with_witness_bytes(label, &(i as u64).to_le_bytes())
        })
    }
}
