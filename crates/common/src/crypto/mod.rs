//! Cryptographic primitives for PriFi
//!
//! - **Suite**: the Ristretto255 group, blake3 hash and keyed-XOF stream
//!   cipher every node agrees on, plus point embedding for short payloads
//! - **Keys**: long-term and ephemeral `(SecretKey, PublicKey)` pairs and
//!   Diffie-Hellman shared points
//! - **Authentication**: ElGamal encryption of relay challenges and
//!   Schnorr signatures over them
//! - **Shuffle**: the verifiable shuffle-and-rebase trustees apply to the
//!   clients' ephemeral keys

mod commit;
mod elgamal;
mod keys;
mod perm;
mod schnorr;
mod shuffle;
mod suite;
mod transcript;

pub use commit::{CommitError, Pedersen};
pub use elgamal::{decrypt, encrypt, Ciphertext};
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
pub use perm::{InvalidPermutation, Permutation};
pub use schnorr::{Signature, SignatureError, SIGNATURE_SIZE};
pub use shuffle::{
    shuffle, DleqProof, KnownShuffleProof, PermutationArgument, Publics as ShufflePublics,
    ShuffleError, ShuffleProof,
};
pub use suite::{xor_into, StreamCipher, Suite, SuiteError, ELEMENT_SIZE, EMBED_CAPACITY};

pub use curve25519_dalek::ristretto::RistrettoPoint;
pub use curve25519_dalek::scalar::Scalar;
