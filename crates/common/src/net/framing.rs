//! Length-prefixed framing and the big-endian field codec.
//!
//! Every reliable message is a 4-byte big-endian length followed by that
//! many bytes. Inside a frame, fields are laid out with [`WireWriter`] and
//! read back with [`WireReader`]; no other module touches byte order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Suite, ELEMENT_SIZE};
use crate::error::ProtocolError;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;
/// Room for message tags, round numbers, ids and field lengths around a cell
pub const HEADER_OVERHEAD: usize = 64;
/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
/// Largest reliable frame; setup transcripts grow with clients times trustees
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("connection closed: {0}")]
    Closed(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame truncated: wanted {wanted} bytes, {available} available")]
    Truncated { wanted: usize, available: usize },
    #[error("{0} trailing bytes after message")]
    Trailing(usize),
    #[error("invalid group element in field")]
    BadElement,
}

impl From<FramingError> for ProtocolError {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::Closed(e) => ProtocolError::TransportClosed(e.to_string()),
            other => ProtocolError::MalformedFrame(other.to_string()),
        }
    }
}

/// Reads one length-prefixed frame, failing if it exceeds `max_len`.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max_len {
        return Err(FramingError::TooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Strips the length prefix from a complete frame, e.g. a datagram.
pub fn unframe(buf: &[u8]) -> Result<Bytes, FramingError> {
    let mut reader = WireReader::new(buf);
    let len = reader.get_u32()? as usize;
    let body = reader.take(len)?;
    reader.finish()?;
    Ok(Bytes::copy_from_slice(body))
}

#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    /// Raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// `u32` length then the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self
    }

    pub fn put_point(&mut self, point: &RistrettoPoint) -> &mut Self {
        self.put_bytes(point.compress().as_bytes())
    }

    pub fn put_points(&mut self, points: &[RistrettoPoint]) -> &mut Self {
        self.put_u32(points.len() as u32);
        for p in points {
            self.put_point(p);
        }
        self
    }

    pub fn put_scalar(&mut self, scalar: &Scalar) -> &mut Self {
        self.put_bytes(scalar.as_bytes())
    }

    pub fn put_scalars(&mut self, scalars: &[Scalar]) -> &mut Self {
        self.put_u32(scalars.len() as u32);
        for s in scalars {
            self.put_scalar(s);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, wanted: usize) -> Result<(), FramingError> {
        if self.buf.remaining() < wanted {
            return Err(FramingError::Truncated {
                wanted,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, FramingError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, FramingError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32, FramingError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], FramingError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], FramingError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_point(&mut self) -> Result<RistrettoPoint, FramingError> {
        let bytes = self.get_bytes()?;
        if bytes.len() != ELEMENT_SIZE {
            return Err(FramingError::BadElement);
        }
        Suite
            .point_from_bytes(bytes)
            .map_err(|_| FramingError::BadElement)
    }

    pub fn get_points(&mut self) -> Result<Vec<RistrettoPoint>, FramingError> {
        let n = self.get_count(ELEMENT_SIZE)?;
        (0..n).map(|_| self.get_point()).collect()
    }

    pub fn get_scalar(&mut self) -> Result<Scalar, FramingError> {
        let bytes = self.get_bytes()?;
        Suite
            .scalar_from_bytes(bytes)
            .map_err(|_| FramingError::BadElement)
    }

    pub fn get_scalars(&mut self) -> Result<Vec<Scalar>, FramingError> {
        let n = self.get_count(ELEMENT_SIZE)?;
        (0..n).map(|_| self.get_scalar()).collect()
    }

    /// Reads a list count, rejecting counts the remaining bytes cannot hold.
    pub fn get_count(&mut self, min_item_size: usize) -> Result<usize, FramingError> {
        let n = self.get_u32()? as usize;
        let wanted = n.saturating_mul(min_item_size.max(1));
        self.need(wanted)?;
        Ok(n)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> Result<(), FramingError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FramingError::Trailing(self.buf.len()))
        }
    }
}
