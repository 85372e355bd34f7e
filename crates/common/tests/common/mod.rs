//! Shared harness for end-to-end runs over loopback
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::client::{Client, UpstreamQueue};
use common::config::PrifiConfig;
use common::crypto::{SecretKey, Suite};
use common::dcnet::cell::Chunk;
use common::net::UdpBroadcaster;
use common::relay::{Relay, RelayHandle, RelayReport};
use common::roster::{Roster, RosterEntry};
use common::schedule::ShuffleProver;
use common::trustee::Trustee;
use common::NodeHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Roster ids of clients start here; trustees count from 0.
pub const FIRST_CLIENT_ID: u32 = 100;

/// Logs to the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small cells and short timers so runs finish quickly.
pub fn test_config() -> PrifiConfig {
    PrifiConfig {
        cell_size_up: 128,
        cell_size_down: 128,
        relay_window_size: 2,
        relay_round_timeout: 2_000,
        client_reconnect_interval: 100,
        relay_setup_settle_time: 200,
        ..Default::default()
    }
}

pub struct Keys {
    pub clients: Vec<SecretKey>,
    pub trustees: Vec<SecretKey>,
}

impl Keys {
    pub fn generate(n_clients: usize, n_trustees: usize) -> Self {
        Self {
            clients: (0..n_clients).map(|_| SecretKey::generate()).collect(),
            trustees: (0..n_trustees).map(|_| SecretKey::generate()).collect(),
        }
    }

    pub fn roster(&self) -> Roster {
        Roster {
            trustees: self
                .trustees
                .iter()
                .enumerate()
                .map(|(j, sk)| RosterEntry {
                    id: j as u32,
                    public_key: sk.public(),
                })
                .collect(),
            clients: self
                .clients
                .iter()
                .enumerate()
                .map(|(i, sk)| RosterEntry {
                    id: FIRST_CLIENT_ID + i as u32,
                    public_key: sk.public(),
                })
                .collect(),
        }
    }
}

/// A relay with its clients and trustees, all on 127.0.0.1.
pub struct Cluster {
    pub keys: Keys,
    pub relay_addr: SocketAddr,
    pub relay: RelayHandle,
    pub clients: Vec<NodeHandle>,
    pub trustees: Vec<NodeHandle>,
    pub upstreams: Vec<UpstreamQueue>,
    /// Decoded upstream chunks leaving the relay
    pub egress: flume::Receiver<Chunk>,
    /// Chunks the relay sends downstream
    pub replies: flume::Sender<Chunk>,
    pub downstreams: Vec<flume::Receiver<Chunk>>,
    relay_task: JoinHandle<Vec<RelayReport>>,
    node_tasks: Vec<JoinHandle<()>>,
    trustee_stops: Vec<watch::Sender<()>>,
    stop: watch::Sender<()>,
}

impl Cluster {
    pub async fn start(n_clients: usize, n_trustees: usize, config: PrifiConfig) -> Self {
        Self::start_with(n_clients, n_trustees, config, Vec::new()).await
    }

    /// Starts a cluster where trustee `j` uses the given prover.
    pub async fn start_with(
        n_clients: usize,
        n_trustees: usize,
        config: PrifiConfig,
        provers: Vec<(usize, Arc<dyn ShuffleProver>)>,
    ) -> Self {
        Self::launch(n_clients, n_trustees, config, provers, None).await
    }

    /// Starts a cluster whose relay sends its datagrams through `udp`.
    pub async fn start_via(
        n_clients: usize,
        n_trustees: usize,
        config: PrifiConfig,
        udp: UdpBroadcaster,
    ) -> Self {
        Self::launch(n_clients, n_trustees, config, Vec::new(), Some(udp)).await
    }

    async fn launch(
        n_clients: usize,
        n_trustees: usize,
        config: PrifiConfig,
        provers: Vec<(usize, Arc<dyn ShuffleProver>)>,
        udp: Option<UdpBroadcaster>,
    ) -> Self {
        init_tracing();
        let keys = Keys::generate(n_clients, n_trustees);
        let (stop, shutdown) = watch::channel(());
        let (egress_tx, egress) = flume::unbounded();
        let (replies, replies_rx) = flume::unbounded();

        let mut relay = Relay::bind(
            Suite,
            "127.0.0.1:0".parse().unwrap(),
            keys.roster(),
            config.clone(),
        )
        .await
        .unwrap()
        .with_egress(egress_tx, replies_rx);
        if let Some(udp) = udp {
            relay = relay.with_udp_broadcaster(udp);
        }
        let relay_addr = relay.local_addr().unwrap();
        let relay_handle = relay.handle();
        let relay_task = tokio::spawn(relay.run(shutdown.clone()));

        let mut node_tasks = Vec::new();
        let mut trustees = Vec::new();
        let mut trustee_stops = Vec::new();
        for (j, sk) in keys.trustees.iter().enumerate() {
            let mut trustee = Trustee::new(Suite, relay_addr, j as u32, sk.clone(), config.clone())
                .unwrap();
            if let Some((_, prover)) = provers.iter().find(|(k, _)| *k == j) {
                trustee = trustee.with_prover(prover.clone());
            }
            let (own_stop, own_shutdown) = watch::channel(());
            trustees.push(trustee.handle());
            trustee_stops.push(own_stop);
            let shutdown = shutdown.clone();
            node_tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = trustee.run(own_shutdown) => {}
                    _ = wait_stop(shutdown) => {}
                }
            }));
        }

        let mut clients = Vec::new();
        let mut upstreams = Vec::new();
        let mut downstreams = Vec::new();
        for (i, sk) in keys.clients.iter().enumerate() {
            let (down_tx, down_rx) = flume::unbounded();
            let client = Client::new(
                Suite,
                relay_addr,
                FIRST_CLIENT_ID + i as u32,
                sk.clone(),
                config.clone(),
            )
            .unwrap()
            .with_downstream(down_tx);
            clients.push(client.handle());
            upstreams.push(client.upstream());
            downstreams.push(down_rx);
            node_tasks.push(tokio::spawn(client.run(shutdown.clone())));
        }

        Self {
            keys,
            relay_addr,
            relay: relay_handle,
            clients,
            trustees,
            upstreams,
            egress,
            replies,
            downstreams,
            relay_task,
            node_tasks,
            trustee_stops,
            stop,
        }
    }

    /// Stops trustee `j` only; it tells the relay it is leaving.
    pub fn stop_trustee(&self, j: usize) {
        let _ = self.trustee_stops[j].send(());
    }

    /// Waits for the relay to return on its own, as it does when a run
    /// reaches the reporting limit.
    pub async fn finished(self, within: Duration) -> Vec<RelayReport> {
        let reports = tokio::time::timeout(within, self.relay_task)
            .await
            .expect("relay did not finish in time")
            .unwrap();
        let _ = self.stop.send(());
        for task in self.node_tasks {
            let _ = task.await;
        }
        reports
    }

    /// Stops everything and returns the relay's reports.
    pub async fn shutdown(self) -> Vec<RelayReport> {
        let _ = self.stop.send(());
        let reports = tokio::time::timeout(Duration::from_secs(10), self.relay_task)
            .await
            .expect("relay did not stop")
            .unwrap();
        for task in self.node_tasks {
            let _ = task.await;
        }
        reports
    }
}

async fn wait_stop(mut shutdown: watch::Receiver<()>) {
    let _ = shutdown.changed().await;
}

/// Polls `check` every 20ms until it holds, failing after `within`.
pub async fn wait_until<F>(within: Duration, what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Awaits `fut`, failing after `within`.
pub async fn within<T>(within: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(within, fut)
        .await
        .expect("operation timed out")
}

/// A loopback UDP port nobody is bound to right now.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
