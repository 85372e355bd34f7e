use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::framing::{read_message, write_message, MAX_FRAME_SIZE};
use super::messages::Message;
use crate::error::ProtocolError;

/// Capacity of a connection's outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Cloneable handle on a connection's writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// Queues without waiting; a full queue is `ResourceExhausted`.
    pub fn try_send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) => ProtocolError::ResourceExhausted(format!(
                "outbound queue full, dropped {}",
                msg.name()
            )),
            mpsc::error::TrySendError::Closed(_) => {
                ProtocolError::TransportClosed("writer stopped".to_string())
            }
        })
    }

    pub async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ProtocolError::TransportClosed("writer stopped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A TCP connection split into a reader task and a writer task.
///
/// The reader decodes every frame and hands it, wrapped by the caller, to
/// an inbox. The first error is delivered too, then the reader stops.
#[derive(Debug)]
pub struct Connection {
    pub peer: SocketAddr,
    outbound: Outbound,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn spawn<T, F>(stream: TcpStream, inbox: flume::Sender<T>, wrap: F) -> std::io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(Result<Message, ProtocolError>) -> T + Send + 'static,
    {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        Ok(Self {
            peer,
            outbound: Outbound { tx },
            reader: tokio::spawn(read_loop(read_half, inbox, wrap).in_current_span()),
            writer: tokio::spawn(write_loop(write_half, rx).in_current_span()),
        })
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Stops reading and lets the writer drain what is queued, then close.
    pub fn close(self) {
        self.reader.abort();
        drop(self.outbound);
        // the writer exits once every Outbound clone is dropped
        drop(self.writer);
    }

    /// Waits until the writer has flushed its queue and closed the socket.
    pub async fn drain(self) {
        self.reader.abort();
        drop(self.outbound);
        let _ = self.writer.await;
    }
}

async fn read_loop<T, F>(mut reader: OwnedReadHalf, inbox: flume::Sender<T>, wrap: F)
where
    F: Fn(Result<Message, ProtocolError>) -> T,
{
    loop {
        let result = match read_message(&mut reader, MAX_FRAME_SIZE).await {
            Ok(frame) => Message::decode(&frame).map_err(ProtocolError::from),
            Err(e) => Err(e.into()),
        };
        let failed = result.is_err();
        if inbox.send_async(wrap(result)).await.is_err() || failed {
            break;
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg.encode()).await {
            tracing::debug!("write of {} failed: {}", msg.name(), e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Connects to `addr`, retrying every `interval` until it succeeds or
/// `shutdown` fires.
pub async fn connect_with_retry(
    addr: SocketAddr,
    interval: Duration,
    shutdown: &mut watch::Receiver<()>,
) -> Option<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Some(stream);
            }
            Err(e) => tracing::debug!("connect to {} failed: {}", addr, e),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dial.await.unwrap();

        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        let a = Connection::spawn(accepted, a_tx, |m| m).unwrap();
        let b = Connection::spawn(dialed, b_tx, |m| m).unwrap();

        a.outbound()
            .send(Message::RateChange { window: 0 })
            .await
            .unwrap();
        b.outbound()
            .try_send(Message::DownstreamNack {
                client_id: 1,
                round: 4,
            })
            .unwrap();

        assert_eq!(
            b_rx.recv_async().await.unwrap().unwrap(),
            Message::RateChange { window: 0 }
        );
        assert_eq!(
            a_rx.recv_async().await.unwrap().unwrap(),
            Message::DownstreamNack {
                client_id: 1,
                round: 4
            }
        );

        // draining a's writer closes the socket; b sees the close
        a.drain().await;
        let err = b_rx.recv_async().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransportClosed);
        b.close();
    }

    #[tokio::test]
    async fn test_retry_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = watch::channel(());
        let attempt = tokio::spawn(async move {
            connect_with_retry(addr, Duration::from_millis(10), &mut rx).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        assert!(attempt.await.unwrap().is_none());
    }
}
