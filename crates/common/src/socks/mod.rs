//! Byte-stream multiplexing for the anonymous channel.
//!
//! Local TCP streams are cut into chunks that fit one cell and tagged with
//! a connection id; the other side writes each chunk to the stream of its
//! id, in order. No SOCKS5 negotiation happens here: the egress forwards
//! every id to one fixed exit address.

mod tcp;

pub use tcp::{TcpEgress, TcpIngress};

use std::net::SocketAddr;

use tokio::sync::watch;

use crate::client::UpstreamQueue;
use crate::config::PrifiConfig;
use crate::dcnet::cell::Chunk;
use crate::error::ProtocolError;

/// Where chunks read from local streams go.
pub trait ChunkSink: Send + Sync + 'static {
    fn push(&self, chunk: Chunk);
}

impl ChunkSink for UpstreamQueue {
    fn push(&self, chunk: Chunk) {
        if let Some(evicted) = UpstreamQueue::push(self, chunk) {
            tracing::debug!("upstream queue full, dropped a chunk of conn {}", evicted.conn_id);
        }
    }
}

impl ChunkSink for flume::Sender<Chunk> {
    fn push(&self, chunk: Chunk) {
        if self.send(chunk).is_err() {
            tracing::debug!("chunk receiver is gone");
        }
    }
}

/// Wires an ingress on `SocksClientPort` straight to an egress towards
/// `SocksServerPort`, both on localhost, with no DC-net in between.
pub async fn sockstest(
    config: &PrifiConfig,
    shutdown: watch::Receiver<()>,
) -> Result<(), ProtocolError> {
    config.validate()?;
    let (up_tx, up_rx) = flume::unbounded();
    let (down_tx, down_rx) = flume::unbounded();
    let listen = SocketAddr::from(([127, 0, 0, 1], config.socks_client_port));
    let exit = SocketAddr::from(([127, 0, 0, 1], config.socks_server_port));

    let ingress = TcpIngress::bind(listen, config.cell_size_up, up_tx).await?;
    let egress = TcpEgress::new(exit, config.cell_size_down, down_tx);
    tracing::info!("sockstest: {} -> {}", ingress.local_addr()?, exit);

    tokio::join!(
        ingress.run(down_rx, shutdown.clone()),
        egress.run(up_rx, shutdown)
    );
    Ok(())
}
