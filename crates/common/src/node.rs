//! Plumbing shared by client and trustee nodes: connecting and
//! authenticating to the relay, reading its messages and the status handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::crypto::SecretKey;
use crate::error::ProtocolError;
use crate::net::{authenticate_to_relay, connect_with_retry, Message};

pub(crate) type Inbox = flume::Receiver<Result<Message, ProtocolError>>;

/// Progress of a node across reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    /// Setups that completed
    pub setups: u32,
    /// Cells sent in the current run
    pub cells_sent: u64,
    /// Client slot in the current run
    pub slot: Option<usize>,
    /// Dense id in the current run
    pub participant_id: Option<u32>,
    pub connected: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeHandle {
    status: Arc<Mutex<NodeStatus>>,
}

impl NodeHandle {
    pub fn status(&self) -> NodeStatus {
        self.status.lock().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut NodeStatus)) {
        f(&mut self.status.lock())
    }

    /// Marks the end of a run.
    pub(crate) fn disconnected(&self, error: Option<&ProtocolError>) {
        self.update(|s| {
            s.connected = false;
            s.slot = None;
            s.participant_id = None;
            if let Some(e) = error {
                s.last_error = Some(e.to_string());
            }
        });
    }
}

/// Connects (retrying every `interval`) and authenticates. `None` once
/// `shutdown` fires.
pub(crate) async fn join_relay(
    relay: SocketAddr,
    roster_id: u32,
    secret: &SecretKey,
    interval: Duration,
    shutdown: &mut watch::Receiver<()>,
) -> Option<Result<TcpStream, ProtocolError>> {
    let mut stream = connect_with_retry(relay, interval, shutdown).await?;
    let result = tokio::select! {
        result = authenticate_to_relay(&mut stream, roster_id, secret) => result,
        _ = shutdown.changed() => return None,
    };
    Some(result.map(|()| stream).map_err(ProtocolError::from))
}

/// Waits for the next relay message. `Shutdown` and transport errors end
/// the current run.
pub(crate) async fn next_message(inbox: &Inbox) -> Result<Message, ProtocolError> {
    match inbox.recv_async().await {
        Ok(Ok(Message::Shutdown)) => Err(ProtocolError::TransportClosed(
            "relay asked to reconnect".to_string(),
        )),
        Ok(result) => result,
        Err(_) => Err(ProtocolError::TransportClosed("inbox closed".to_string())),
    }
}

pub(crate) fn unexpected(msg: &Message, phase: &str) -> ProtocolError {
    ProtocolError::MalformedFrame(format!("unexpected {} during {}", msg.name(), phase))
}

/// Sleeps for `interval`; true if `shutdown` fired first.
pub(crate) async fn backoff(interval: Duration, shutdown: &mut watch::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown.changed() => true,
    }
}

/// Aborts the wrapped task when dropped.
pub(crate) struct TaskGuard<T>(pub tokio::task::JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
