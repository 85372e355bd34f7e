//! Chaum-Pedersen proof that `log_g a == log_h b`.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use merlin::Transcript;
use rand::thread_rng;

use super::ShuffleError;
use crate::crypto::transcript::{TranscriptProtocol, TranscriptRngProtocol};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Proof {
    pub(crate) c: Scalar,
    pub(crate) r: Scalar,
}

#[derive(Copy, Clone)]
pub struct Publics<'a> {
    pub a: &'a RistrettoPoint,
    pub b: &'a RistrettoPoint,
    pub g: &'a RistrettoPoint,
    pub h: &'a RistrettoPoint,
}

fn commit_publics(transcript: &mut Transcript, publics: Publics) {
    transcript.domain_sep(b"dlog_eq");
    transcript.commit_point(b"a", publics.a);
    transcript.commit_point(b"b", publics.b);
    transcript.commit_point(b"g", publics.g);
    transcript.commit_point(b"h", publics.h);
}

impl Proof {
    pub fn create(transcript: &mut Transcript, publics: Publics, x: &Scalar) -> Self {
        commit_publics(transcript, publics);

        let mut rng = transcript
            .build_rng()
            .commit_scalar(b"x", x)
            .finalize(&mut thread_rng());
        let w = Scalar::random(&mut rng);

        transcript.commit_point(b"t1", &(publics.g * w));
        transcript.commit_point(b"t2", &(publics.h * w));

        let c = transcript.challenge_scalar(b"c");
        Self { c, r: w - c * x }
    }

    pub fn verify(&self, transcript: &mut Transcript, publics: Publics) -> Result<(), ShuffleError> {
        commit_publics(transcript, publics);

        let t1 = publics.a * self.c + publics.g * self.r;
        let t2 = publics.b * self.c + publics.h * self.r;
        transcript.commit_point(b"t1", &t1);
        transcript.commit_point(b"t2", &t2);

        if transcript.challenge_scalar(b"c") == self.c {
            Ok(())
        } else {
            Err(ShuffleError::BadProof)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prove_and_verify_agree() {
        let mut rng = thread_rng();
        let g = &RistrettoPoint::random(&mut rng);
        let h = &RistrettoPoint::random(&mut rng);
        let x = Scalar::random(&mut rng);
        let a = &(g * x);
        let b = &(h * x);
        let publics = Publics { a, b, g, h };

        let proof = Proof::create(&mut Transcript::new(b"test"), publics, &x);
        assert!(proof.verify(&mut Transcript::new(b"test"), publics).is_ok());

        let wrong = Proof::create(&mut Transcript::new(b"test"), publics, &Scalar::ONE);
        assert!(matches!(
            wrong.verify(&mut Transcript::new(b"test"), publics),
            Err(ShuffleError::BadProof)
        ));
    }
}
