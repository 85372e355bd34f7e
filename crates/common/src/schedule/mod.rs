//! Setup schedule: the trustee shuffle chain over the clients' ephemeral
//! keys, the trustees' signatures over its output, and each client's slot
//! lookup in the signed key list.

mod transcript;

pub use transcript::ShuffleTranscript;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};

use crate::crypto::{shuffle, PublicKey, SecretKey, ShuffleError, ShuffleProof, Signature, Suite};
use crate::error::ProtocolError;

/// Signing context for the final `(G_M, E^(M))` list.
pub const SCHEDULE_CONTEXT: &[u8] = b"prifi-schedule-signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("shuffle proof {index} does not verify")]
    BadShuffle { index: usize },
    #[error("malformed transcript: {0}")]
    MalformedTranscript(String),
    #[error("own shuffle output altered at index {index}")]
    ContributionAltered { index: usize },
    #[error("signature of trustee {trustee} does not verify")]
    BadSignature { trustee: usize },
    #[error("expected {expected} signatures, got {actual}")]
    SignatureCount { expected: usize, actual: usize },
    #[error("no ephemeral key matches this client")]
    NoSlot,
    #[error("{0} ephemeral keys match this client")]
    AmbiguousSlot(usize),
    #[error("shuffle failed: {0}")]
    Shuffle(#[from] ShuffleError),
}

impl From<ScheduleError> for ProtocolError {
    fn from(e: ScheduleError) -> Self {
        ProtocolError::CryptoInvariant(e.to_string())
    }
}

/// One trustee's shuffle output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleStep {
    pub base: RistrettoPoint,
    pub keys: Vec<RistrettoPoint>,
    pub proof: ShuffleProof,
}

impl ShuffleStep {
    pub fn run<R: RngCore + CryptoRng>(
        base: &RistrettoPoint,
        keys: &[RistrettoPoint],
        rng: &mut R,
    ) -> Result<Self, ScheduleError> {
        let (base, keys, proof) = shuffle(base, keys, rng)?;
        Ok(Self { base, keys, proof })
    }
}

/// Produces a trustee's shuffle step in phase D.
pub trait ShuffleProver: Send + Sync {
    fn prove(
        &self,
        base: &RistrettoPoint,
        keys: &[RistrettoPoint],
    ) -> Result<ShuffleStep, ScheduleError>;
}

/// Shuffles with fresh randomness from the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct HonestProver;

impl ShuffleProver for HonestProver {
    fn prove(
        &self,
        base: &RistrettoPoint,
        keys: &[RistrettoPoint],
    ) -> Result<ShuffleStep, ScheduleError> {
        ShuffleStep::run(base, keys, &mut rand::rngs::OsRng)
    }
}

/// Key the DC-net pads of a run are bound to: the compressed final base.
pub fn session_tag(final_base: &RistrettoPoint) -> [u8; 32] {
    final_base.compress().to_bytes()
}

/// Run id carried by every downstream datagram: the first four bytes of
/// the session tag.
pub fn run_id(final_base: &RistrettoPoint) -> u32 {
    let tag = session_tag(final_base);
    u32::from_be_bytes([tag[0], tag[1], tag[2], tag[3]])
}

/// Trustee side of phase E.
///
/// Verifies the whole chain, checks that step `index` is exactly `own`,
/// and signs the final key list.
pub fn verify_and_sign(
    suite: &Suite,
    transcript: &ShuffleTranscript,
    index: usize,
    own: &ShuffleStep,
    secret: &SecretKey,
) -> Result<Signature, ScheduleError> {
    transcript.verify(suite)?;
    if transcript.steps() <= index
        || transcript.bases[index + 1] != own.base
        || transcript.keys[index + 1] != own.keys
    {
        return Err(ScheduleError::ContributionAltered { index });
    }
    let payload = ShuffleTranscript::signed_payload(transcript.last_base(), transcript.last_keys());
    Ok(Signature::sign(secret, SCHEDULE_CONTEXT, &payload))
}

/// Checks one signature per trustee, in trustee order.
pub fn verify_signatures(
    trustees: &[PublicKey],
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
    signatures: &[Signature],
) -> Result<(), ScheduleError> {
    if trustees.len() != signatures.len() {
        return Err(ScheduleError::SignatureCount {
            expected: trustees.len(),
            actual: signatures.len(),
        });
    }
    let payload = ShuffleTranscript::signed_payload(base, keys);
    for (trustee, (pk, sig)) in trustees.iter().zip(signatures).enumerate() {
        sig.verify(pk, SCHEDULE_CONTEXT, &payload)
            .map_err(|_| ScheduleError::BadSignature { trustee })?;
    }
    Ok(())
}

/// Finds the unique index `k` with `keys[k] == base · ephemeral`.
pub fn find_slot(
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
    ephemeral: &Scalar,
) -> Result<usize, ScheduleError> {
    let mine = base * ephemeral;
    let matches: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == mine)
        .map(|(i, _)| i)
        .collect();
    match matches.as_slice() {
        [slot] => Ok(*slot),
        [] => Err(ScheduleError::NoSlot),
        many => Err(ScheduleError::AmbiguousSlot(many.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    struct Cohort {
        client_secrets: Vec<Scalar>,
        trustee_keys: Vec<SecretKey>,
        transcript: ShuffleTranscript,
        steps: Vec<ShuffleStep>,
    }

    fn run_chain(n_clients: usize, n_trustees: usize) -> Cohort {
        let mut rng = thread_rng();
        let suite = Suite;
        let client_secrets: Vec<Scalar> = (0..n_clients)
            .map(|_| suite.random_scalar(&mut rng))
            .collect();
        let ephemerals = client_secrets
            .iter()
            .map(|e| suite.generator() * e)
            .collect();
        let mut transcript = ShuffleTranscript::new(suite.generator(), ephemerals);
        let mut steps = Vec::new();
        for _ in 0..n_trustees {
            let step =
                ShuffleStep::run(transcript.last_base(), transcript.last_keys(), &mut rng).unwrap();
            transcript
                .push(step.base, step.keys.clone(), step.proof.clone())
                .unwrap();
            steps.push(step);
        }
        Cohort {
            client_secrets,
            trustee_keys: (0..n_trustees).map(|_| SecretKey::generate()).collect(),
            transcript,
            steps,
        }
    }

    #[test]
    fn test_single_trustee_single_client() {
        let cohort = run_chain(1, 1);
        let sig = verify_and_sign(
            &Suite,
            &cohort.transcript,
            0,
            &cohort.steps[0],
            &cohort.trustee_keys[0],
        )
        .unwrap();
        let base = cohort.transcript.last_base();
        let keys = cohort.transcript.last_keys();
        verify_signatures(&[cohort.trustee_keys[0].public()], base, keys, &[sig]).unwrap();
        assert_eq!(find_slot(base, keys, &cohort.client_secrets[0]).unwrap(), 0);
    }

    #[test]
    fn test_every_client_finds_a_distinct_slot() {
        let cohort = run_chain(4, 3);
        let base = cohort.transcript.last_base();
        let keys = cohort.transcript.last_keys();
        let mut slots: Vec<usize> = cohort
            .client_secrets
            .iter()
            .map(|e| find_slot(base, keys, e).unwrap())
            .collect();
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_five_trustees_each_report_the_tampered_proof() {
        let mut cohort = run_chain(2, 5);
        cohort.transcript.proofs[2].f[0] += Scalar::ONE;
        for (j, step) in cohort.steps.iter().enumerate() {
            let err = verify_and_sign(
                &Suite,
                &cohort.transcript,
                j,
                step,
                &cohort.trustee_keys[j],
            )
            .unwrap_err();
            assert_eq!(err, ScheduleError::BadShuffle { index: 2 });
        }
    }

    #[test]
    fn test_altered_contribution_is_detected() {
        let cohort = run_chain(2, 2);
        let mut other = cohort.steps[0].clone();
        other.keys.reverse();
        let err = verify_and_sign(
            &Suite,
            &cohort.transcript,
            0,
            &other,
            &cohort.trustee_keys[0],
        )
        .unwrap_err();
        assert_eq!(err, ScheduleError::ContributionAltered { index: 0 });
    }

    #[test]
    fn test_signature_from_wrong_trustee() {
        let cohort = run_chain(2, 2);
        let sigs: Vec<_> = (0..2)
            .map(|j| {
                verify_and_sign(
                    &Suite,
                    &cohort.transcript,
                    j,
                    &cohort.steps[j],
                    &cohort.trustee_keys[j],
                )
                .unwrap()
            })
            .collect();
        let pks = vec![
            cohort.trustee_keys[1].public(),
            cohort.trustee_keys[0].public(),
        ];
        let err = verify_signatures(
            &pks,
            cohort.transcript.last_base(),
            cohort.transcript.last_keys(),
            &sigs,
        )
        .unwrap_err();
        assert_eq!(err, ScheduleError::BadSignature { trustee: 0 });
    }

    #[test]
    fn test_randomised_keys_leave_no_slot() {
        let cohort = run_chain(3, 1);
        let mut rng = thread_rng();
        let keys: Vec<_> = (0..3).map(|_| Suite.random_point(&mut rng)).collect();
        for e in &cohort.client_secrets {
            assert_eq!(
                find_slot(cohort.transcript.last_base(), &keys, e),
                Err(ScheduleError::NoSlot)
            );
        }
    }

    #[test]
    fn test_duplicate_keys_are_ambiguous() {
        let e = Scalar::from(7u64);
        let g = Suite.generator();
        let keys = vec![g * e, g * e];
        assert_eq!(find_slot(&g, &keys, &e), Err(ScheduleError::AmbiguousSlot(2)));
    }

    #[test]
    fn test_run_id_differs_between_runs() {
        let first = run_chain(2, 1);
        let second = run_chain(2, 1);
        let base = first.transcript.last_base();
        assert_eq!(run_id(base), run_id(base));
        assert_eq!(&run_id(base).to_be_bytes(), &session_tag(base)[..4]);
        assert_ne!(run_id(base), run_id(second.transcript.last_base()));
    }
}
