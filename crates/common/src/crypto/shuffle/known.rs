//! Argument that a Pedersen commitment holds a permutation of known scalars.
//!
//! Groth, "A Verifiable Secret Shuffle of Homomorphic Encryptions",
//! ePrint 2005/246, section 3. Needs at least two elements.

use std::iter;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use merlin::Transcript;
use rand::thread_rng;

use super::ShuffleError;
use crate::crypto::commit::Pedersen;
use crate::crypto::perm::Permutation;
use crate::crypto::transcript::{TranscriptProtocol, TranscriptRngProtocol};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    pub(crate) cd: RistrettoPoint,
    pub(crate) cdd: RistrettoPoint,
    pub(crate) cda: RistrettoPoint,
    pub(crate) f: Vec<Scalar>,
    pub(crate) z: Scalar,
    pub(crate) fd: Vec<Scalar>,
    pub(crate) zd: Scalar,
}

#[derive(Copy, Clone)]
pub struct Publics<'a> {
    pub com: &'a Pedersen,
    /// Commitment to `m` permuted by the secret permutation
    pub c: &'a RistrettoPoint,
    pub m: &'a [Scalar],
}

#[derive(Copy, Clone)]
pub struct Secrets<'a> {
    pub pi: &'a Permutation,
    pub r: &'a Scalar,
}

fn commit_publics(transcript: &mut Transcript, publics: Publics) {
    transcript.domain_sep(b"known_shuffle");
    transcript.commit_pedersen(b"com", publics.com);
    transcript.commit_point(b"c", publics.c);
    transcript.commit_scalars(b"m", publics.m);
}

impl Proof {
    pub fn create(
        transcript: &mut Transcript,
        publics: Publics,
        secrets: Secrets,
    ) -> Result<Self, ShuffleError> {
        let n = publics.m.len();
        if n < 2 {
            return Err(ShuffleError::TooSmall(n));
        }
        commit_publics(transcript, publics);

        let rekey_rng = |t: &Transcript| {
            t.build_rng()
                .commit_permutation(b"pi", secrets.pi)
                .commit_scalar(b"r", secrets.r)
                .finalize(&mut thread_rng())
        };
        let mut rng = rekey_rng(&*transcript);

        let d: Vec<_> = iter::repeat_with(|| Scalar::random(&mut rng))
            .take(n)
            .collect();

        let mut delta = Vec::with_capacity(n);
        delta.push(d[0]);
        delta.extend(iter::repeat_with(|| Scalar::random(&mut rng)).take(n - 2));
        delta.push(Scalar::ZERO);

        let x = transcript.challenge_scalar(b"x");
        let a: Vec<_> = (1..=n)
            .map(|i| {
                secrets
                    .pi
                    .iter()
                    .take(i)
                    .map(|&p| publics.m[p] - x)
                    .product::<Scalar>()
            })
            .collect();

        let mut rng = rekey_rng(&*transcript);
        let (cd, rd) = publics.com.commit_to(&d, &mut rng)?;
        transcript.commit_point(b"cd", &cd);

        let mut rng = rekey_rng(&*transcript);
        let mut dd: Vec<_> = (1..n).map(|i| (-delta[i - 1]) * d[i]).collect();
        dd.push(Scalar::ZERO);
        let (cdd, rdd) = publics.com.commit_to(&dd, &mut rng)?;
        transcript.commit_point(b"cdd", &cdd);

        let mut rng = rekey_rng(&*transcript);
        let mut da: Vec<_> = (1..n)
            .map(|i| delta[i] - (publics.m[secrets.pi[i]] - x) * delta[i - 1] - a[i - 1] * d[i])
            .collect();
        da.push(Scalar::ZERO);
        let (cda, rda) = publics.com.commit_to(&da, &mut rng)?;
        transcript.commit_point(b"cda", &cda);

        let e = transcript.challenge_scalar(b"e");
        let f: Vec<_> = secrets
            .pi
            .iter()
            .zip(d.iter())
            .map(|(&p, d)| e * publics.m[p] + d)
            .collect();
        let z = e * secrets.r + rd;

        let mut fd: Vec<_> = (1..n)
            .map(|i| {
                e * (delta[i] - (publics.m[secrets.pi[i]] - x) * delta[i - 1] - a[i - 1] * d[i])
                    - delta[i - 1] * d[i]
            })
            .collect();
        fd.push(Scalar::ZERO);
        let zd = e * rda + rdd;

        Ok(Self {
            cd,
            cdd,
            cda,
            f,
            z,
            fd,
            zd,
        })
    }

    pub fn verify(&self, transcript: &mut Transcript, publics: Publics) -> Result<(), ShuffleError> {
        let n = publics.m.len();
        if n < 2 || self.f.len() != n || self.fd.len() != n {
            return Err(ShuffleError::BadProof);
        }
        commit_publics(transcript, publics);

        let x = transcript.challenge_scalar(b"x");
        transcript.commit_point(b"cd", &self.cd);
        transcript.commit_point(b"cdd", &self.cdd);
        transcript.commit_point(b"cda", &self.cda);
        let e = transcript.challenge_scalar(b"e");

        let cecd = publics.c * e + self.cd;
        publics.com.open(&cecd, &self.f, &self.z)?;
        let ceca = self.cda * e + self.cdd;
        publics.com.open(&ceca, &self.fd, &self.zd)?;

        let ex = e * x;
        let e_inv = e.invert();
        let mut ff = self.f[0] - ex;
        for i in 1..n {
            ff = (ff * (self.f[i] - ex) + self.fd[i - 1]) * e_inv;
        }
        let prod = publics.m.iter().map(|m| m - x).product::<Scalar>();
        if ff == e * prod {
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
        let m: Vec<_> = (0..6).map(|_| Scalar::random(&mut rng)).collect();
        let pi = Permutation::random(6, &mut rng);
        let mp = pi.apply(&m);

        let com = Transcript::new(b"gens").challenge_pedersen(b"com", 6);
        let (c, r) = com.commit_to(&mp, &mut rng).unwrap();
        let publics = Publics { com: &com, c: &c, m: &m };

        let mut proof = Proof::create(
            &mut Transcript::new(b"test"),
            publics,
            Secrets { pi: &pi, r: &r },
        )
        .unwrap();
        assert!(proof.verify(&mut Transcript::new(b"test"), publics).is_ok());

        proof.z += Scalar::ONE;
        assert!(proof.verify(&mut Transcript::new(b"test"), publics).is_err());
    }

    #[test]
    fn test_single_element_is_refused() {
        let com = Transcript::new(b"gens").challenge_pedersen(b"com", 1);
        let m = [Scalar::ONE];
        let c = com.commit_by(&m, &Scalar::ONE).unwrap();
        let res = Proof::create(
            &mut Transcript::new(b"test"),
            Publics { com: &com, c: &c, m: &m },
            Secrets {
                pi: &Permutation::identity(1),
                r: &Scalar::ONE,
            },
        );
        assert!(matches!(res, Err(ShuffleError::TooSmall(1))));
    }
}
