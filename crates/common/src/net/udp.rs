//! Downstream broadcast over UDP.
//!
//! Datagram layout: `u32 total_length, u32 run, u32 round, payload,
//! u32 flag_resync` where `total_length` counts everything after itself and
//! `run` identifies the protocol run. Receivers drop datagrams whose length
//! does not match or that belong to another run, and dedupe by round.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;

use super::framing::{FramingError, WireReader, WireWriter, HEADER_OVERHEAD, MAX_DATAGRAM_SIZE};

/// Run, round and flag words counted by `total_length`.
const FIXED_FIELDS: usize = 12;

/// One decoded downstream datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub run: u32,
    pub round: u32,
    pub payload: Bytes,
    pub flag_resync: bool,
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u32((self.payload.len() + FIXED_FIELDS) as u32)
            .put_u32(self.run)
            .put_u32(self.round)
            .put_raw(&self.payload)
            .put_u32(self.flag_resync as u32);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(buf);
        let total = r.get_u32()? as usize;
        if total < FIXED_FIELDS || total != r.remaining() {
            return Err(FramingError::Truncated {
                wanted: total,
                available: r.remaining(),
            });
        }
        let run = r.get_u32()?;
        let round = r.get_u32()?;
        let payload = Bytes::copy_from_slice(r.take(total - FIXED_FIELDS)?);
        let flag_resync = r.get_u32()? != 0;
        r.finish()?;
        Ok(Self {
            run,
            round,
            payload,
            flag_resync,
        })
    }
}

/// Relay side: sends every downstream to the broadcast address.
#[derive(Debug)]
pub struct UdpBroadcaster {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpBroadcaster {
    pub async fn bind(target: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, target })
    }

    pub async fn send(&self, datagram: &Datagram) -> Result<(), FramingError> {
        let bytes = datagram.encode();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(FramingError::TooLarge {
                len: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.send_to(&bytes, self.target).await?;
        Ok(())
    }
}

/// Client side: listens on the run's UDP port.
#[derive(Debug)]
pub struct UdpReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpReceiver {
    pub async fn bind(addr: SocketAddr, max_payload: usize) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            buf: vec![0u8; (max_payload + HEADER_OVERHEAD).min(MAX_DATAGRAM_SIZE)],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next well-formed datagram, skipping garbage.
    pub async fn recv(&mut self) -> std::io::Result<Datagram> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.buf).await?;
            match Datagram::decode(&self.buf[..len]) {
                Ok(datagram) => return Ok(datagram),
                Err(e) => tracing::debug!("dropping datagram from {}: {}", from, e),
            }
        }
    }
}
