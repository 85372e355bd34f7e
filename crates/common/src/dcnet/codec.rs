use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::thread_rng;

use super::cell::SIGMA_SIZE;
use super::equivocation::{pad_scalar, payload_pad, History};
use super::CodecError;
use crate::config::DcNetType;
use crate::crypto::{xor_into, StreamCipher, Suite};

const PAD_CONTEXT: &str = "prifi 2025-01 dc-net pad";

/// Size of one client or trustee ciphertext cell.
pub fn cipher_size(kind: DcNetType, cell_size: usize) -> usize {
    match kind {
        DcNetType::Plain => cell_size,
        DcNetType::Equivocation => cell_size + SIGMA_SIZE,
    }
}

/// Per-pair pad stream, keyed by the shared point and the run's session tag.
pub fn pad_stream(suite: &Suite, shared: &RistrettoPoint, session_tag: &[u8]) -> StreamCipher {
    suite.cipher(&suite.derive_key(PAD_CONTEXT, shared, session_tag))
}

/// Client side: masks its payload with one pad per trustee.
#[derive(Debug)]
pub struct ClientCodec {
    suite: Suite,
    kind: DcNetType,
    cell_size: usize,
    pads: Vec<StreamCipher>,
    history: History,
}

impl ClientCodec {
    /// `shared` holds `S_ij` for every trustee `j`, in trustee order.
    pub fn new(
        suite: Suite,
        kind: DcNetType,
        cell_size: usize,
        shared: &[RistrettoPoint],
        session_tag: &[u8],
    ) -> Self {
        Self {
            suite,
            kind,
            cell_size,
            pads: shared
                .iter()
                .map(|s| pad_stream(&suite, s, session_tag))
                .collect(),
            history: History::new(suite),
        }
    }

    pub fn cipher_size(&self) -> usize {
        cipher_size(self.kind, self.cell_size)
    }

    /// Encodes one round. `owned` is `Some(payload)` when this client owns
    /// the slot; everyone else encodes zeros.
    pub fn encode(&mut self, owned: Option<&[u8]>) -> Result<Vec<u8>, CodecError> {
        let mut payload = vec![0u8; self.cell_size];
        if let Some(data) = owned {
            if data.len() > self.cell_size {
                return Err(CodecError::PayloadTooLarge {
                    len: data.len(),
                    cell_size: self.cell_size,
                });
            }
            payload[..data.len()].copy_from_slice(data);
        }

        match self.kind {
            DcNetType::Plain => {
                for pad in self.pads.iter_mut() {
                    pad.xor_keystream(&mut payload);
                }
                Ok(payload)
            }
            DcNetType::Equivocation => {
                let k = if owned.is_some() {
                    Scalar::random(&mut thread_rng())
                } else {
                    Scalar::ZERO
                };
                if owned.is_some() {
                    xor_into(&mut payload, &payload_pad(&self.suite, &k, self.cell_size));
                }
                let mut weight = Scalar::ZERO;
                for pad in self.pads.iter_mut() {
                    let p = pad.next_bytes(self.cell_size);
                    weight += pad_scalar(&self.suite, &p);
                    xor_into(&mut payload, &p);
                }
                let sigma = k + self.history.scalar() * weight;

                let mut out = Vec::with_capacity(SIGMA_SIZE + self.cell_size);
                out.extend_from_slice(sigma.as_bytes());
                out.extend_from_slice(&payload);
                Ok(out)
            }
        }
    }

    /// Folds a received downstream into the history before the round's encode.
    pub fn absorb_downstream(&mut self, payload: &[u8]) {
        if self.kind == DcNetType::Equivocation {
            self.history.absorb_payload(payload);
        }
    }
}

/// Trustee side: XOR of its pads with every client.
#[derive(Debug)]
pub struct TrusteeCodec {
    suite: Suite,
    kind: DcNetType,
    cell_size: usize,
    pads: Vec<StreamCipher>,
    history: History,
}

impl TrusteeCodec {
    /// `shared` holds `S_ij` for every client `i`, in client order.
    pub fn new(
        suite: Suite,
        kind: DcNetType,
        cell_size: usize,
        shared: &[RistrettoPoint],
        session_tag: &[u8],
    ) -> Self {
        Self {
            suite,
            kind,
            cell_size,
            pads: shared
                .iter()
                .map(|s| pad_stream(&suite, s, session_tag))
                .collect(),
            history: History::new(suite),
        }
    }

    pub fn cipher_size(&self) -> usize {
        cipher_size(self.kind, self.cell_size)
    }

    pub fn encode(&mut self) -> Vec<u8> {
        let mut contribution = vec![0u8; self.cell_size];
        match self.kind {
            DcNetType::Plain => {
                for pad in self.pads.iter_mut() {
                    pad.xor_keystream(&mut contribution);
                }
                contribution
            }
            DcNetType::Equivocation => {
                let mut weight = Scalar::ZERO;
                for pad in self.pads.iter_mut() {
                    let p = pad.next_bytes(self.cell_size);
                    weight += pad_scalar(&self.suite, &p);
                    xor_into(&mut contribution, &p);
                }
                let sigma = -(self.history.scalar() * weight);

                let mut out = Vec::with_capacity(SIGMA_SIZE + self.cell_size);
                out.extend_from_slice(sigma.as_bytes());
                out.extend_from_slice(&contribution);
                out
            }
        }
    }

    /// Folds the digest of a downstream the relay forwarded.
    pub fn absorb_digest(&mut self, digest: &[u8; 32]) {
        if self.kind == DcNetType::Equivocation {
            self.history.absorb_digest(digest);
        }
    }
}

/// Relay side: combines one round's cells.
#[derive(Debug, Clone)]
pub struct RelayCodec {
    suite: Suite,
    kind: DcNetType,
    cell_size: usize,
}

/// XOR and σ accumulated for one round.
#[derive(Debug, Clone)]
pub struct Accumulator {
    xor: Vec<u8>,
    sigma: Scalar,
}

impl RelayCodec {
    pub fn new(suite: Suite, kind: DcNetType, cell_size: usize) -> Self {
        Self {
            suite,
            kind,
            cell_size,
        }
    }

    pub fn cipher_size(&self) -> usize {
        cipher_size(self.kind, self.cell_size)
    }

    pub fn accumulator(&self) -> Accumulator {
        Accumulator {
            xor: vec![0u8; self.cell_size],
            sigma: Scalar::ZERO,
        }
    }

    /// XORs one client or trustee cell into the round.
    ///
    /// Cells shorter than the payload are treated as zero padded; cells of
    /// any other size than the codec's cipher size are rejected.
    pub fn add(&self, acc: &mut Accumulator, cell: &[u8]) -> Result<(), CodecError> {
        let payload = match self.kind {
            DcNetType::Plain => {
                if cell.len() > self.cell_size {
                    return Err(CodecError::WrongCellSize {
                        expected: self.cell_size,
                        actual: cell.len(),
                    });
                }
                cell
            }
            DcNetType::Equivocation => {
                if cell.len() < SIGMA_SIZE || cell.len() > SIGMA_SIZE + self.cell_size {
                    return Err(CodecError::WrongCellSize {
                        expected: self.cipher_size(),
                        actual: cell.len(),
                    });
                }
                let sigma = self
                    .suite
                    .scalar_from_bytes(&cell[..SIGMA_SIZE])
                    .map_err(|_| CodecError::BadSigma)?;
                acc.sigma += sigma;
                &cell[SIGMA_SIZE..]
            }
        };
        xor_into(&mut acc.xor, payload);
        Ok(())
    }

    /// Recovers the slot owner's plaintext of `cell_size` bytes.
    pub fn decode(&self, acc: Accumulator) -> Vec<u8> {
        let Accumulator { mut xor, sigma } = acc;
        if self.kind == DcNetType::Equivocation && sigma != Scalar::ZERO {
            xor_into(&mut xor, &payload_pad(&self.suite, &sigma, self.cell_size));
        }
        xor
    }
}
