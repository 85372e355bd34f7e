//! The relay: accepts and authenticates participants, runs the setup
//! schedule over each cohort and drives the DC-net rounds.
//!
//! Every connection gets a reader and a writer task. Readers feed one
//! churn controller, which owns the waiting set and starts a session task
//! per protocol run; the session owns the round coordinator.

mod churn;
mod round;
mod session;
mod state;

pub use churn::WaitingSet;
pub use round::{Decoded, Opened, Plaintext, RelayReport, RoundConfig, RoundCoordinator};
pub use state::{RelayState, StateError};

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::Instrument;

use churn::{ChurnController, ChurnEvent, Participant};
use crate::config::PrifiConfig;
use crate::crypto::{PublicKey, Suite};
use crate::dcnet::cell::Chunk;
use crate::error::ProtocolError;
use crate::net::{authenticate_peer, Connection, UdpBroadcaster};
use crate::roster::Roster;

/// How long a connecting node has to finish authenticating.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the queue from connection readers to the churn controller.
/// Readers wait when it is full, which stops them reading their sockets.
pub const EVENT_QUEUE_SIZE: usize = 1024;

/// What every session of a relay shares.
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub suite: Suite,
    pub config: Arc<PrifiConfig>,
    pub udp: Option<Arc<UdpBroadcaster>>,
    /// Decoded upstream chunks
    pub egress: Option<flume::Sender<Chunk>>,
    /// Replies to send downstream
    pub replies: Option<flume::Receiver<Chunk>>,
}

/// Observes a relay while it runs.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
    banned: Arc<Mutex<HashSet<PublicKey>>>,
    waiting: Arc<Mutex<WaitingSet>>,
}

impl RelayHandle {
    pub fn state(&self) -> RelayState {
        *self.state.lock()
    }

    /// Keys of trustees ejected for failed proofs.
    pub fn banned(&self) -> Vec<PublicKey> {
        self.banned.lock().iter().copied().collect()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.lock().len()
    }
}

pub struct Relay {
    suite: Suite,
    config: Arc<PrifiConfig>,
    roster: Arc<Roster>,
    listener: TcpListener,
    udp: Option<Arc<UdpBroadcaster>>,
    egress: Option<flume::Sender<Chunk>>,
    replies: Option<flume::Receiver<Chunk>>,
    handle: RelayHandle,
    span: tracing::Span,
}

impl Relay {
    pub async fn bind(
        suite: Suite,
        addr: SocketAddr,
        roster: Roster,
        config: PrifiConfig,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        roster.validate()?;
        let listener = TcpListener::bind(addr).await?;
        let udp = if config.use_udp {
            let ip: IpAddr = config.udp_broadcast_address.parse().map_err(|_| {
                ProtocolError::ConfigInvalid(format!(
                    "bad UdpBroadcastAddress {:?}",
                    config.udp_broadcast_address
                ))
            })?;
            let target = SocketAddr::new(ip, config.udp_port);
            Some(Arc::new(UdpBroadcaster::bind(target).await?))
        } else {
            None
        };
        tracing::info!("relay listening on {}", listener.local_addr()?);
        Ok(Self {
            suite,
            config: Arc::new(config),
            roster: Arc::new(roster),
            listener,
            udp,
            egress: None,
            replies: None,
            handle: RelayHandle {
                state: Arc::new(Mutex::new(RelayState::Idle)),
                banned: Arc::new(Mutex::new(HashSet::new())),
                waiting: Arc::new(Mutex::new(WaitingSet::default())),
            },
            span: tracing::info_span!("relay"),
        })
    }

    /// Routes decoded upstream chunks to `egress` and sends `replies`
    /// downstream.
    pub fn with_egress(
        mut self,
        egress: flume::Sender<Chunk>,
        replies: flume::Receiver<Chunk>,
    ) -> Self {
        self.egress = Some(egress);
        self.replies = Some(replies);
        self
    }

    /// Sends downstream datagrams through `udp` instead of to
    /// `UdpBroadcastAddress:UdpPort`. Ignored unless `UseUDP` is set.
    pub fn with_udp_broadcaster(mut self, udp: UdpBroadcaster) -> Self {
        if self.config.use_udp {
            self.udp = Some(Arc::new(udp));
        }
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Logs under `parent`, which carries the process's sink.
    pub fn with_span(mut self, parent: &tracing::Span) -> Self {
        self.span = tracing::info_span!(parent: parent, "relay");
        self
    }

    /// Serves participants until a run reaches the reporting limit or
    /// `shutdown` fires. Returns one report per protocol run.
    pub async fn run(self, shutdown: watch::Receiver<()>) -> Vec<RelayReport> {
        let span = self.span.clone();
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, shutdown: watch::Receiver<()>) -> Vec<RelayReport> {
        let (events_tx, events_rx) = flume::bounded(EVENT_QUEUE_SIZE);
        let ctx = RelayContext {
            suite: self.suite,
            config: self.config.clone(),
            udp: self.udp.clone(),
            egress: self.egress.clone(),
            replies: self.replies.clone(),
        };
        let controller = ChurnController::new(
            ctx,
            events_rx,
            self.handle.waiting.clone(),
            self.handle.banned.clone(),
            self.handle.state.clone(),
        );

        let acceptor = tokio::spawn(accept_loop(
            self.listener,
            self.roster,
            self.handle.clone(),
            events_tx,
        )
        .in_current_span());
        let reports = controller.run(shutdown).await;
        acceptor.abort();
        reports
    }
}

async fn accept_loop(
    listener: TcpListener,
    roster: Arc<Roster>,
    handle: RelayHandle,
    events: flume::Sender<ChurnEvent>,
) {
    let next_conn = Arc::new(AtomicU64::new(1));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let conn_id = next_conn.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(admit(
            stream,
            peer,
            conn_id,
            roster.clone(),
            handle.clone(),
            events.clone(),
        )
        .in_current_span());
    }
}

/// Authenticates one connection and adds it to the waiting set.
async fn admit(
    mut stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    roster: Arc<Roster>,
    handle: RelayHandle,
    events: flume::Sender<ChurnEvent>,
) {
    let _ = stream.set_nodelay(true);
    let banned = handle.banned.clone();
    let auth = tokio::time::timeout(
        AUTH_TIMEOUT,
        authenticate_peer(&mut stream, &roster, |pk| banned.lock().contains(pk)),
    )
    .await;
    let auth = match auth {
        Ok(Ok(auth)) => auth,
        Ok(Err(e)) => {
            tracing::warn!("authentication of {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::warn!("authentication of {} timed out", peer);
            return;
        }
    };
    tracing::info!("{} {} authenticated from {}", auth.role, auth.roster_id, peer);

    let connection = match Connection::spawn(stream, events.clone(), move |msg| {
        ChurnEvent::Inbound { conn_id, msg }
    }) {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!("{} went away after authenticating: {}", peer, e);
            return;
        }
    };
    let replaced = handle.waiting.lock().insert(Participant {
        conn_id,
        auth,
        connection,
    });
    if let Some(old) = replaced {
        tracing::debug!("closing previous connection of node {}", old.auth.roster_id);
        old.connection.close();
    }
    let _ = events.send_async(ChurnEvent::Joined { conn_id }).await;
}
