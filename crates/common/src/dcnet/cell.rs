//! Plaintext cell layout: `u32 conn_id, u16 length, u16 packet_type, data`.
//!
//! Cells too small for the packet type carry only the id and length.
//! A zero id or zero length marks an empty cell.

use bytes::{Bytes, BytesMut};

use crate::net::framing::{FramingError, WireReader, WireWriter};

/// Id and length: the smallest legal cell
pub const MIN_CELL_SIZE: usize = 6;
/// Full header including the packet type
pub const HEADER_SIZE: usize = 8;
/// Size of the equivocation scalar prepended to ciphertext cells
pub const SIGMA_SIZE: usize = 32;

/// Ordinary multiplexed stream data
pub const PACKET_DATA: u16 = 0;
/// Latency probe whose data is the sender's timestamp in milliseconds
pub const PACKET_LATENCY: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("cell declares {declared} data bytes but only {capacity} fit")]
    Garbled { declared: usize, capacity: usize },
    #[error("{len} data bytes do not fit a cell holding {capacity}")]
    TooLong { len: usize, capacity: usize },
    #[error("cell of {0} bytes is smaller than a header")]
    TooSmall(usize),
}

impl From<FramingError> for CellError {
    fn from(_: FramingError) -> Self {
        CellError::TooSmall(0)
    }
}

/// A piece of one multiplexed connection's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub conn_id: u32,
    pub packet_type: u16,
    pub data: Bytes,
}

impl Chunk {
    pub fn data(conn_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            conn_id,
            packet_type: PACKET_DATA,
            data: data.into(),
        }
    }
}

pub fn header_size(cell_size: usize) -> usize {
    if cell_size >= HEADER_SIZE {
        HEADER_SIZE
    } else {
        MIN_CELL_SIZE
    }
}

/// Data bytes a cell of `cell_size` can carry.
pub fn capacity(cell_size: usize) -> usize {
    cell_size.saturating_sub(header_size(cell_size))
}

/// Lays out `chunk` into exactly `cell_size` bytes, zero padded.
pub fn encode(cell_size: usize, chunk: &Chunk) -> Result<Vec<u8>, CellError> {
    let mut cell = encode_unpadded(cell_size, chunk)?;
    cell.resize(cell_size, 0);
    Ok(cell)
}

/// Lays out `chunk` with no trailing padding, for variable-size downstreams.
pub fn encode_unpadded(cell_size: usize, chunk: &Chunk) -> Result<Vec<u8>, CellError> {
    if cell_size < MIN_CELL_SIZE {
        return Err(CellError::TooSmall(cell_size));
    }
    let capacity = capacity(cell_size);
    if chunk.data.len() > capacity {
        return Err(CellError::TooLong {
            len: chunk.data.len(),
            capacity,
        });
    }
    let mut w = WireWriter::new();
    w.put_u32(chunk.conn_id).put_u16(chunk.data.len() as u16);
    if header_size(cell_size) == HEADER_SIZE {
        w.put_u16(chunk.packet_type);
    }
    w.put_raw(&chunk.data);
    Ok(w.finish().to_vec())
}

/// Parses a decoded plaintext. `Ok(None)` is a legitimate empty cell.
///
/// `cell_size` is the configured size, which fixes the header layout even
/// when `plaintext` was sent without padding.
pub fn decode(cell_size: usize, plaintext: &[u8]) -> Result<Option<Chunk>, CellError> {
    if plaintext.is_empty() {
        return Ok(None);
    }
    let header = header_size(cell_size);
    if plaintext.len() < header {
        return Err(CellError::TooSmall(plaintext.len()));
    }
    let mut r = WireReader::new(plaintext);
    let conn_id = r.get_u32()?;
    let length = r.get_u16()? as usize;
    let packet_type = if header == HEADER_SIZE {
        r.get_u16()?
    } else {
        PACKET_DATA
    };
    if conn_id == 0 || length == 0 {
        return Ok(None);
    }
    let capacity = plaintext.len() - header;
    if length > capacity {
        return Err(CellError::Garbled {
            declared: length,
            capacity,
        });
    }
    let mut data = BytesMut::with_capacity(length);
    data.extend_from_slice(r.take(length)?);
    Ok(Some(Chunk {
        conn_id,
        packet_type,
        data: data.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_prifi_layout() {
        let chunk = Chunk::data(0x42, &b"HELLO PRIFI"[..]);
        let cell = encode(128, &chunk).unwrap();
        assert_eq!(cell.len(), 128);
        assert_eq!(&cell[..4], &[0, 0, 0, 0x42]);
        assert_eq!(&cell[4..6], &[0, 0x0b]);
        assert_eq!(&cell[8..19], b"HELLO PRIFI");
        assert_eq!(decode(128, &cell).unwrap(), Some(chunk));
    }

    #[test]
    fn test_zero_cells_are_empty() {
        assert_eq!(decode(64, &[0u8; 64]).unwrap(), None);
        assert_eq!(decode(64, &[]).unwrap(), None);
        let mut id_only = [0u8; 64];
        id_only[3] = 9;
        assert_eq!(decode(64, &id_only).unwrap(), None);
    }

    #[test]
    fn test_minimum_cell_is_always_empty() {
        assert_eq!(capacity(MIN_CELL_SIZE), 0);
        let cell = encode(MIN_CELL_SIZE, &Chunk::data(5, Bytes::new())).unwrap();
        assert_eq!(cell.len(), MIN_CELL_SIZE);
        assert_eq!(decode(MIN_CELL_SIZE, &cell).unwrap(), None);
        assert!(encode(MIN_CELL_SIZE, &Chunk::data(5, &b"x"[..])).is_err());
    }

    #[test]
    fn test_garbled_length_is_an_error() {
        let mut cell = vec![0xffu8; 32];
        cell[4] = 0xff;
        assert!(matches!(decode(32, &cell), Err(CellError::Garbled { .. })));
    }

    #[test]
    fn test_unpadded_downstream() {
        let chunk = Chunk {
            conn_id: 3,
            packet_type: PACKET_LATENCY,
            data: Bytes::from_static(b"1234"),
        };
        let bytes = encode_unpadded(1000, &chunk).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        assert_eq!(decode(1000, &bytes).unwrap(), Some(chunk));
    }
}
