use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::ChunkSink;
use crate::client::LATENCY_CONN_ID;
use crate::dcnet::cell::{self, Chunk, PACKET_DATA};

type Streams = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>>;

/// Accepts local connections and chunks what they send.
pub struct TcpIngress {
    listener: TcpListener,
    capacity: usize,
    sink: Arc<dyn ChunkSink>,
}

impl TcpIngress {
    /// `cell_size` is the upstream cell size the chunks must fit.
    pub async fn bind(
        addr: SocketAddr,
        cell_size: usize,
        sink: impl ChunkSink,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let capacity = cell::capacity(cell_size);
        if capacity == 0 {
            tracing::warn!("cells of {} bytes carry no data, ingress will stay silent", cell_size);
        }
        Ok(Self {
            listener,
            capacity,
            sink: Arc::new(sink),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections and writes `downstream` chunks back to them until
    /// `shutdown` fires. Chunks for unknown ids are ignored.
    pub async fn run(self, downstream: flume::Receiver<Chunk>, mut shutdown: watch::Receiver<()>) {
        let streams: Streams = Arc::default();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("ingress accept failed: {}", e);
                            continue;
                        }
                    };
                    let conn_id = fresh_id(&streams.lock());
                    tracing::debug!("conn {} opened by {}", conn_id, peer);
                    let (reader, writer) = stream.into_split();
                    let tx = spawn_writer(&mut tasks, conn_id, writer);
                    streams.lock().insert(conn_id, tx);

                    let sink = self.sink.clone();
                    let streams = streams.clone();
                    let capacity = self.capacity;
                    tasks.spawn(async move {
                        read_chunks(reader, conn_id, capacity, sink.as_ref()).await;
                        streams.lock().remove(&conn_id);
                        tracing::debug!("conn {} closed", conn_id);
                    });
                }
                chunk = downstream.recv_async() => {
                    let Ok(chunk) = chunk else {
                        break;
                    };
                    if chunk.packet_type != PACKET_DATA {
                        continue;
                    }
                    if let Some(tx) = streams.lock().get(&chunk.conn_id) {
                        let _ = tx.send(chunk.data);
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Opens one connection to the exit per id and chunks its replies.
pub struct TcpEgress {
    exit: SocketAddr,
    capacity: usize,
    replies: Arc<dyn ChunkSink>,
}

impl TcpEgress {
    /// `cell_size` is the downstream cell size replies must fit.
    pub fn new(exit: SocketAddr, cell_size: usize, replies: impl ChunkSink) -> Self {
        Self {
            exit,
            capacity: cell::capacity(cell_size),
            replies: Arc::new(replies),
        }
    }

    pub async fn run(self, upstream: flume::Receiver<Chunk>, mut shutdown: watch::Receiver<()>) {
        let streams: Streams = Arc::default();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                chunk = upstream.recv_async() => {
                    let Ok(chunk) = chunk else {
                        break;
                    };
                    if chunk.packet_type != PACKET_DATA || chunk.conn_id == 0 {
                        continue;
                    }
                    let known = streams.lock().get(&chunk.conn_id).cloned();
                    let tx = match known {
                        Some(tx) => tx,
                        None => match self.open(chunk.conn_id, &streams, &mut tasks).await {
                            Ok(tx) => tx,
                            Err(e) => {
                                tracing::warn!("conn {}: cannot reach {}: {}", chunk.conn_id, self.exit, e);
                                continue;
                            }
                        },
                    };
                    let _ = tx.send(chunk.data);
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn open(
        &self,
        conn_id: u32,
        streams: &Streams,
        tasks: &mut JoinSet<()>,
    ) -> std::io::Result<mpsc::UnboundedSender<Bytes>> {
        let stream = TcpStream::connect(self.exit).await?;
        tracing::debug!("conn {} -> {}", conn_id, self.exit);
        let (reader, writer) = stream.into_split();
        let tx = spawn_writer(tasks, conn_id, writer);
        streams.lock().insert(conn_id, tx.clone());

        let replies = self.replies.clone();
        let streams = streams.clone();
        let capacity = self.capacity;
        tasks.spawn(async move {
            read_chunks(reader, conn_id, capacity, replies.as_ref()).await;
            streams.lock().remove(&conn_id);
        });
        Ok(tx)
    }
}

/// A random id that is neither empty, the probe id, nor in use.
fn fresh_id(streams: &HashMap<u32, mpsc::UnboundedSender<Bytes>>) -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 && id != LATENCY_CONN_ID && !streams.contains_key(&id) {
            return id;
        }
    }
}

fn spawn_writer(
    tasks: &mut JoinSet<()>,
    conn_id: u32,
    mut writer: OwnedWriteHalf,
) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    tasks.spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                tracing::debug!("conn {}: write failed: {}", conn_id, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    tx
}

async fn read_chunks(mut reader: OwnedReadHalf, conn_id: u32, capacity: usize, sink: &dyn ChunkSink) {
    if capacity == 0 {
        return;
    }
    let mut buf = vec![0u8; capacity];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.push(Chunk::data(conn_id, Bytes::copy_from_slice(&buf[..n]))),
            Err(e) => {
                tracing::debug!("conn {}: read failed: {}", conn_id, e);
                break;
            }
        }
    }
}
