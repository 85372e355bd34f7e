//! DC-net cell codec.
//!
//! Each client XORs its payload (zeros unless it owns the slot) with one
//! pad per trustee; each trustee emits the XOR of its pads with every
//! client. The relay XORs all cells of a round and every pad cancels,
//! leaving the slot owner's plaintext. The equivocation variant adds a
//! scalar σ in front of each cell, see [`equivocation`].

pub mod cell;
mod codec;
pub mod equivocation;

pub use codec::{cipher_size, pad_stream, Accumulator, ClientCodec, RelayCodec, TrusteeCodec};
pub use equivocation::History;

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("cell of {actual} bytes, expected {expected}")]
    WrongCellSize { expected: usize, actual: usize },
    #[error("payload of {len} bytes exceeds cell size {cell_size}")]
    PayloadTooLarge { len: usize, cell_size: usize },
    #[error("cell carries a non-canonical σ scalar")]
    BadSigma,
}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        ProtocolError::MalformedFrame(e.to_string())
    }
}

impl From<cell::CellError> for ProtocolError {
    fn from(e: cell::CellError) -> Self {
        ProtocolError::MalformedFrame(e.to_string())
    }
}
