//! Verifiable shuffle-and-rebase of a list of public keys.
//!
//! Given a base `G` and keys `X_0..X_{n-1}`, a trustee picks a secret
//! scalar `s` and permutation `π` and publishes `G' = s·G` together with
//! `Y_i = s·X_{π(i)}`. The proof commits to `π`, reduces the statement to
//! a shuffle of known scalars over the committed permutation, and ties
//! `G'` to the permuted keys with a discrete-log-equality proof over a
//! challenge-weighted sum of the inputs.

mod dleq;
mod known;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::MultiscalarMul;
use merlin::Transcript;
use rand::{thread_rng, CryptoRng, RngCore};

use super::commit::CommitError;
use super::perm::Permutation;
use super::transcript::{TranscriptProtocol, TranscriptRngProtocol};

pub use dleq::Proof as DleqProof;
pub use known::Proof as KnownShuffleProof;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ShuffleError {
    #[error("shuffle proof does not verify")]
    BadProof,
    #[error("cannot shuffle an empty key list")]
    Empty,
    #[error("known-content argument needs at least two elements, got {0}")]
    TooSmall(usize),
    #[error("input has {input} keys but output has {output}")]
    LengthMismatch { input: usize, output: usize },
    #[error("commitment error: {0}")]
    Commit(#[from] CommitError),
}

/// How the prover shows the committed values are a permutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermutationArgument {
    Known(KnownShuffleProof),
    /// With one element the only permutation is the identity, so the
    /// commitment is simply opened.
    Opening(Scalar),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleProof {
    pub(crate) c: RistrettoPoint,
    pub(crate) cd: RistrettoPoint,
    pub(crate) ed: RistrettoPoint,
    pub(crate) f: Vec<Scalar>,
    pub(crate) argument: PermutationArgument,
    pub(crate) dleq: DleqProof,
}

/// The statement a shuffle proof is about.
#[derive(Copy, Clone)]
pub struct Publics<'a> {
    pub base: &'a RistrettoPoint,
    pub keys: &'a [RistrettoPoint],
    pub new_base: &'a RistrettoPoint,
    pub new_keys: &'a [RistrettoPoint],
}

#[derive(Copy, Clone)]
pub struct Secrets<'a> {
    pub s: &'a Scalar,
    pub pi: &'a Permutation,
}

fn commit_publics(transcript: &mut Transcript, publics: Publics) -> Result<usize, ShuffleError> {
    let n = publics.keys.len();
    if n == 0 {
        return Err(ShuffleError::Empty);
    }
    if publics.new_keys.len() != n {
        return Err(ShuffleError::LengthMismatch {
            input: n,
            output: publics.new_keys.len(),
        });
    }
    transcript.domain_sep(b"key_shuffle");
    transcript.commit_point(b"g", publics.base);
    transcript.commit_points(b"x", publics.keys);
    transcript.commit_point(b"gp", publics.new_base);
    transcript.commit_points(b"y", publics.new_keys);
    Ok(n)
}

fn known_domain(l: &Scalar, t: &[Scalar]) -> Vec<Scalar> {
    t.iter()
        .enumerate()
        .map(|(i, t)| l * Scalar::from((i + 1) as u64) + t)
        .collect()
}

impl ShuffleProof {
    pub fn create(publics: Publics, secrets: Secrets) -> Result<Self, ShuffleError> {
        let mut transcript = Transcript::new(b"prifi-key-shuffle");
        let n = commit_publics(&mut transcript, publics)?;
        let com = transcript.challenge_pedersen(b"com", n);

        let rekey_rng = |t: &Transcript| {
            t.build_rng()
                .commit_permutation(b"pi", secrets.pi)
                .commit_scalar(b"s", secrets.s)
                .finalize(&mut thread_rng())
        };
        let mut rng = rekey_rng(&transcript);

        let p1: Vec<_> = secrets
            .pi
            .iter()
            .map(|&p| Scalar::from((p + 1) as u64))
            .collect();
        let (c, r) = com.commit_to(&p1, &mut rng)?;
        transcript.commit_point(b"c", &c);

        let mut rng = rekey_rng(&transcript);
        let d: Vec<_> = (0..n).map(|_| Scalar::random(&mut rng)).collect();
        let (cd, rd) = com.commit_to(&d, &mut rng)?;
        transcript.commit_point(b"cd", &cd);

        let ed = RistrettoPoint::multiscalar_mul(d.iter(), publics.new_keys.iter());
        transcript.commit_point(b"ed", &ed);

        let t = transcript.challenge_scalars(b"t", n);
        let f: Vec<_> = secrets
            .pi
            .iter()
            .zip(d.iter())
            .map(|(&p, d)| t[p] - d)
            .collect();
        transcript.commit_scalars(b"f", &f);

        let l = transcript.challenge_scalar(b"l");
        let m = known_domain(&l, &t);
        let commit = c * l + cd + com.commit_by(&f, &Scalar::ZERO)?;
        let rho = l * r + rd;

        let argument = if n == 1 {
            PermutationArgument::Opening(rho)
        } else {
            PermutationArgument::Known(KnownShuffleProof::create(
                &mut transcript,
                known::Publics {
                    com: &com,
                    c: &commit,
                    m: &m,
                },
                known::Secrets {
                    pi: secrets.pi,
                    r: &rho,
                },
            )?)
        };

        let big_t = RistrettoPoint::multiscalar_mul(t.iter(), publics.keys.iter());
        let target = ed + RistrettoPoint::multiscalar_mul(f.iter(), publics.new_keys.iter());
        let dleq = DleqProof::create(
            &mut transcript,
            dleq::Publics {
                a: publics.new_base,
                b: &target,
                g: publics.base,
                h: &big_t,
            },
            secrets.s,
        );

        Ok(Self {
            c,
            cd,
            ed,
            f,
            argument,
            dleq,
        })
    }

    pub fn verify(&self, publics: Publics) -> Result<(), ShuffleError> {
        let mut transcript = Transcript::new(b"prifi-key-shuffle");
        let n = commit_publics(&mut transcript, publics)?;
        if self.f.len() != n {
            return Err(ShuffleError::BadProof);
        }
        let com = transcript.challenge_pedersen(b"com", n);

        transcript.commit_point(b"c", &self.c);
        transcript.commit_point(b"cd", &self.cd);
        transcript.commit_point(b"ed", &self.ed);
        let t = transcript.challenge_scalars(b"t", n);
        transcript.commit_scalars(b"f", &self.f);

        let l = transcript.challenge_scalar(b"l");
        let m = known_domain(&l, &t);
        let commit = self.c * l + self.cd + com.commit_by(&self.f, &Scalar::ZERO)?;

        match (&self.argument, n) {
            (PermutationArgument::Opening(rho), 1) => com
                .open(&commit, &m, rho)
                .map_err(|_| ShuffleError::BadProof)?,
            (PermutationArgument::Known(proof), n) if n >= 2 => proof
                .verify(
                    &mut transcript,
                    known::Publics {
                        com: &com,
                        c: &commit,
                        m: &m,
                    },
                )
                .map_err(|_| ShuffleError::BadProof)?,
            _ => return Err(ShuffleError::BadProof),
        }

        let big_t = RistrettoPoint::multiscalar_mul(t.iter(), publics.keys.iter());
        let target =
            self.ed + RistrettoPoint::multiscalar_mul(self.f.iter(), publics.new_keys.iter());
        self.dleq.verify(
            &mut transcript,
            dleq::Publics {
                a: publics.new_base,
                b: &target,
                g: publics.base,
                h: &big_t,
            },
        )
    }
}

/// One trustee's shuffle step: rebases and permutes `keys` under a fresh
/// secret, returning `(G', Y, proof)`.
pub fn shuffle<R: RngCore + CryptoRng>(
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
    rng: &mut R,
) -> Result<(RistrettoPoint, Vec<RistrettoPoint>, ShuffleProof), ShuffleError> {
    let s = Scalar::random(rng);
    let pi = Permutation::random(keys.len(), rng);
    let new_base = base * s;
    let new_keys: Vec<_> = pi.apply(keys).into_iter().map(|k| k * s).collect();
    let proof = ShuffleProof::create(
        Publics {
            base,
            keys,
            new_base: &new_base,
            new_keys: &new_keys,
        },
        Secrets { s: &s, pi: &pi },
    )?;
    Ok((new_base, new_keys, proof))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suite::Suite;

    fn keys(n: usize) -> (Vec<Scalar>, Vec<RistrettoPoint>) {
        let mut rng = thread_rng();
        let secrets: Vec<_> = (0..n).map(|_| Scalar::random(&mut rng)).collect();
        let points = secrets.iter().map(|e| Suite.generator() * e).collect();
        (secrets, points)
    }

    fn publics<'a>(
        base: &'a RistrettoPoint,
        keys: &'a [RistrettoPoint],
        new_base: &'a RistrettoPoint,
        new_keys: &'a [RistrettoPoint],
    ) -> Publics<'a> {
        Publics {
            base,
            keys,
            new_base,
            new_keys,
        }
    }

    #[test]
    fn test_shuffle_verifies_and_preserves_keys() {
        let (secrets, points) = keys(5);
        let g = Suite.generator();
        let (gp, y, proof) = shuffle(&g, &points, &mut thread_rng()).unwrap();
        assert!(proof.verify(publics(&g, &points, &gp, &y)).is_ok());

        // every ephemeral secret reprojects onto exactly one output key
        for e in &secrets {
            let mine = gp * e;
            assert_eq!(y.iter().filter(|k| **k == mine).count(), 1);
        }
    }

    #[test]
    fn test_single_key_shuffle_still_carries_a_proof() {
        let (_, points) = keys(1);
        let g = Suite.generator();
        let (gp, y, proof) = shuffle(&g, &points, &mut thread_rng()).unwrap();
        assert!(matches!(proof.argument, PermutationArgument::Opening(_)));
        assert!(proof.verify(publics(&g, &points, &gp, &y)).is_ok());
    }

    #[test]
    fn test_tampered_outputs_are_rejected() {
        let (_, points) = keys(4);
        let g = Suite.generator();
        let (gp, mut y, proof) = shuffle(&g, &points, &mut thread_rng()).unwrap();
        y[2] = Suite.random_point(&mut thread_rng());
        assert_eq!(
            proof.verify(publics(&g, &points, &gp, &y)),
            Err(ShuffleError::BadProof)
        );
    }

    #[test]
    fn test_tampered_proof_is_rejected() {
        let (_, points) = keys(3);
        let g = Suite.generator();
        let (gp, y, mut proof) = shuffle(&g, &points, &mut thread_rng()).unwrap();
        proof.f[0] += Scalar::ONE;
        assert!(proof.verify(publics(&g, &points, &gp, &y)).is_err());
    }

    #[test]
    fn test_chain_of_shuffles() {
        let (secrets, points) = keys(3);
        let mut base = Suite.generator();
        let mut current = points;
        for _ in 0..4 {
            let (nb, nk, proof) = shuffle(&base, &current, &mut thread_rng()).unwrap();
            assert!(proof.verify(publics(&base, &current, &nb, &nk)).is_ok());
            base = nb;
            current = nk;
        }
        for e in &secrets {
            assert!(current.contains(&(base * e)));
        }
    }

    #[test]
    fn test_length_mismatch() {
        let (_, points) = keys(2);
        let g = Suite.generator();
        let (gp, y, proof) = shuffle(&g, &points, &mut thread_rng()).unwrap();
        assert!(matches!(
            proof.verify(publics(&g, &points, &gp, &y[..1])),
            Err(ShuffleError::LengthMismatch { .. })
        ));
    }
}
