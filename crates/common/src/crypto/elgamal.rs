use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};

use super::keys::{PublicKey, SecretKey};
use super::suite::Suite;

/// ElGamal ciphertext `(K = g·k, C = M + pk·k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ciphertext {
    pub k: RistrettoPoint,
    pub c: RistrettoPoint,
}

pub fn encrypt<R: RngCore + CryptoRng>(
    pk: &PublicKey,
    message: &RistrettoPoint,
    rng: &mut R,
) -> Ciphertext {
    let k = Scalar::random(rng);
    Ciphertext {
        k: Suite.generator() * k,
        c: message + pk.point() * k,
    }
}

pub fn decrypt(sk: &SecretKey, ciphertext: &Ciphertext) -> RistrettoPoint {
    ciphertext.c - ciphertext.k * sk.scalar()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn test_decrypt_inverts_encrypt() {
        let mut rng = thread_rng();
        let sk = SecretKey::generate();
        let m = Suite.random_point(&mut rng);
        let ct = encrypt(&sk.public(), &m, &mut rng);
        assert_eq!(decrypt(&sk, &ct), m);
        assert_ne!(decrypt(&SecretKey::generate(), &ct), m);
    }
}
