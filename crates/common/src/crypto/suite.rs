use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::{CryptoRng, Rng, RngCore};

/// Size of a serialized point or scalar
pub const ELEMENT_SIZE: usize = 32;
/// Bytes a single point can carry through [`Suite::pick`]
pub const EMBED_CAPACITY: usize = 29;

const CIPHER_CONTEXT: &str = "prifi 2025-01 stream cipher seed";
const HASH_SCALAR_CONTEXT: &str = "prifi 2025-01 hash to scalar";

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("expected {ELEMENT_SIZE} bytes, got {0}")]
    BadLength(usize),
    #[error("bytes are not a canonical point encoding")]
    InvalidPoint,
    #[error("bytes are not a canonical scalar encoding")]
    InvalidScalar,
    #[error("cannot embed {0} bytes in a point (max {EMBED_CAPACITY})")]
    EmbedTooLarge(usize),
    #[error("point does not carry embedded data")]
    NotEmbedded,
}

/// The group, hash and stream cipher every node agrees on.
///
/// Ristretto255 with blake3 as hash and keyed XOF. Constructed once at
/// startup and handed to every component that needs it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Suite;

impl Suite {
    pub fn generator(&self) -> RistrettoPoint {
        RISTRETTO_BASEPOINT_POINT
    }

    pub fn identity(&self) -> RistrettoPoint {
        RistrettoPoint::identity()
    }

    pub fn random_scalar<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Scalar {
        Scalar::random(rng)
    }

    pub fn random_point<R: RngCore + CryptoRng>(&self, rng: &mut R) -> RistrettoPoint {
        RistrettoPoint::random(rng)
    }

    pub fn scalar_len(&self) -> usize {
        ELEMENT_SIZE
    }

    pub fn point_len(&self) -> usize {
        ELEMENT_SIZE
    }

    pub fn hash(&self, bytes: &[u8]) -> [u8; 32] {
        *blake3::hash(bytes).as_bytes()
    }

    /// Maps arbitrary bytes to a uniformly distributed scalar.
    pub fn hash_to_scalar(&self, bytes: &[u8]) -> Scalar {
        let mut hasher = blake3::Hasher::new_derive_key(HASH_SCALAR_CONTEXT);
        hasher.update(bytes);
        let mut wide = [0u8; 64];
        hasher.finalize_xof().fill(&mut wide);
        Scalar::from_bytes_mod_order_wide(&wide)
    }

    /// A keystream seeded directly by a 32-byte key.
    pub fn cipher(&self, key: &[u8; 32]) -> StreamCipher {
        StreamCipher {
            reader: blake3::Hasher::new_keyed(key).finalize_xof(),
        }
    }

    /// A keystream seeded by hashing arbitrary material.
    pub fn cipher_from_bytes(&self, seed: &[u8]) -> StreamCipher {
        self.cipher(&blake3::derive_key(CIPHER_CONTEXT, seed))
    }

    /// Derives a stream key from a shared point, bound to a context tag.
    pub fn derive_key(&self, context: &str, point: &RistrettoPoint, tag: &[u8]) -> [u8; 32] {
        let mut material = Vec::with_capacity(ELEMENT_SIZE + tag.len());
        material.extend_from_slice(point.compress().as_bytes());
        material.extend_from_slice(tag);
        blake3::derive_key(context, &material)
    }

    /// Embeds up to [`EMBED_CAPACITY`] bytes into a point, returning the
    /// bytes that did not fit.
    ///
    /// Byte 0 of the encoding holds the length (shifted so the encoding
    /// stays non-negative), the data follows, and the remaining bytes are
    /// resampled until the encoding decompresses.
    pub fn pick<'a, R: Rng + CryptoRng>(
        &self,
        data: &'a [u8],
        rng: &mut R,
    ) -> (RistrettoPoint, &'a [u8]) {
        let take = data.len().min(EMBED_CAPACITY);
        let (head, rest) = data.split_at(take);
        loop {
            let mut bytes = [0u8; ELEMENT_SIZE];
            rng.fill_bytes(&mut bytes);
            bytes[0] = (take as u8) << 1;
            bytes[1..1 + take].copy_from_slice(head);
            bytes[31] &= 0x7f;
            if let Some(point) = CompressedRistretto(bytes).decompress() {
                return (point, rest);
            }
        }
    }

    /// Recovers the bytes carried by a point produced by [`Suite::pick`].
    pub fn data(&self, point: &RistrettoPoint) -> Result<Vec<u8>, SuiteError> {
        let bytes = point.compress().to_bytes();
        let len = (bytes[0] >> 1) as usize;
        if len > EMBED_CAPACITY {
            return Err(SuiteError::NotEmbedded);
        }
        Ok(bytes[1..1 + len].to_vec())
    }

    pub fn point_to_bytes(&self, point: &RistrettoPoint) -> [u8; ELEMENT_SIZE] {
        point.compress().to_bytes()
    }

    pub fn point_from_bytes(&self, bytes: &[u8]) -> Result<RistrettoPoint, SuiteError> {
        let compressed =
            CompressedRistretto::from_slice(bytes).map_err(|_| SuiteError::BadLength(bytes.len()))?;
        compressed.decompress().ok_or(SuiteError::InvalidPoint)
    }

    pub fn scalar_from_bytes(&self, bytes: &[u8]) -> Result<Scalar, SuiteError> {
        let array: [u8; ELEMENT_SIZE] = bytes
            .try_into()
            .map_err(|_| SuiteError::BadLength(bytes.len()))?;
        Option::from(Scalar::from_canonical_bytes(array)).ok_or(SuiteError::InvalidScalar)
    }
}

/// An endless pseudorandom byte stream.
pub struct StreamCipher {
    reader: blake3::OutputReader,
}

impl StreamCipher {
    /// Fills `buf` with the next keystream bytes.
    pub fn fill(&mut self, buf: &mut [u8]) {
        self.reader.fill(buf);
    }

    /// XORs the next `buf.len()` keystream bytes into `buf`.
    pub fn xor_keystream(&mut self, buf: &mut [u8]) {
        let mut pad = vec![0u8; buf.len()];
        self.reader.fill(&mut pad);
        xor_into(buf, &pad);
    }

    pub fn next_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.reader.fill(&mut out);
        out
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamCipher(..)")
    }
}

/// `dst ^= src` over the shorter of the two.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn test_pick_and_data_round_trip() {
        let suite = Suite;
        let mut rng = thread_rng();
        let challenge = [7u8; 20];
        let (point, rest) = suite.pick(&challenge, &mut rng);
        assert!(rest.is_empty());
        assert_eq!(suite.data(&point).unwrap(), challenge.to_vec());
    }

    #[test]
    fn test_pick_returns_overflow() {
        let suite = Suite;
        let data = [1u8; 40];
        let (point, rest) = suite.pick(&data, &mut thread_rng());
        assert_eq!(rest.len(), 40 - EMBED_CAPACITY);
        assert_eq!(suite.data(&point).unwrap().len(), EMBED_CAPACITY);
    }

    #[test]
    fn test_same_key_same_stream() {
        let suite = Suite;
        let key = [3u8; 32];
        let a = suite.cipher(&key).next_bytes(64);
        let b = suite.cipher(&key).next_bytes(64);
        assert_eq!(a, b);
        let c = suite.cipher(&[4u8; 32]).next_bytes(64);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stream_continues_across_reads() {
        let suite = Suite;
        let mut one = suite.cipher_from_bytes(b"seed");
        let whole = one.next_bytes(32);
        let mut two = suite.cipher_from_bytes(b"seed");
        let mut first = two.next_bytes(16);
        first.extend(two.next_bytes(16));
        assert_eq!(whole, first);
    }

    #[test]
    fn test_point_bytes_are_checked() {
        let suite = Suite;
        let point = suite.random_point(&mut thread_rng());
        let bytes = suite.point_to_bytes(&point);
        assert_eq!(suite.point_from_bytes(&bytes).unwrap(), point);
        assert!(suite.point_from_bytes(&bytes[..31]).is_err());
        assert!(suite.scalar_from_bytes(&[0xff; 32]).is_err());
    }
}
