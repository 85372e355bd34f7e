//! Client node.
//!
//! A client joins the relay, takes part in the setup schedule to learn its
//! secret slot, then answers every downstream with one DC-net cell. The
//! cell carries a queued upstream chunk when the round belongs to its slot
//! and zeros otherwise. Any failure closes the connection and the client
//! reconnects after `ClientReconnectInterval`.

mod scheduler;

pub use scheduler::{Downstream, DownstreamSequencer, UpstreamQueue};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::rngs::OsRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::config::PrifiConfig;
use crate::crypto::{RistrettoPoint, SecretKey, Suite};
use crate::dcnet::cell::{self, Chunk, PACKET_LATENCY};
use crate::dcnet::ClientCodec;
use crate::error::ProtocolError;
use crate::net::{Connection, Datagram, Message, Outbound, Parameters, UdpReceiver};
use crate::node::{backoff, join_relay, next_message, unexpected, Inbox, NodeHandle};
use crate::schedule::{find_slot, run_id, session_tag, verify_signatures};

/// Connection id of latency probes. Never assigned to a stream.
pub const LATENCY_CONN_ID: u32 = u32::MAX;

pub struct Client {
    suite: Suite,
    relay: SocketAddr,
    roster_id: u32,
    secret: SecretKey,
    config: Arc<PrifiConfig>,
    upstream: UpstreamQueue,
    downstream: Option<flume::Sender<Chunk>>,
    handle: NodeHandle,
    span: tracing::Span,
}

/// What one completed setup leaves behind.
struct Slot {
    codec: ClientCodec,
    index: usize,
    of: usize,
    /// Datagrams stamped with any other run are ignored.
    run: u32,
}

impl Client {
    pub fn new(
        suite: Suite,
        relay: SocketAddr,
        roster_id: u32,
        secret: SecretKey,
        config: PrifiConfig,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            suite,
            relay,
            roster_id,
            secret,
            upstream: UpstreamQueue::new(config.relay_window_size as usize),
            config: Arc::new(config),
            downstream: None,
            handle: NodeHandle::default(),
            span: tracing::info_span!("client", id = roster_id),
        })
    }

    /// Queue feeding the client's slot.
    pub fn upstream(&self) -> UpstreamQueue {
        self.upstream.clone()
    }

    /// Sends every downstream chunk to `tx`.
    pub fn with_downstream(mut self, tx: flume::Sender<Chunk>) -> Self {
        self.downstream = Some(tx);
        self
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Logs under `parent`, which carries the process's sink.
    pub fn with_span(mut self, parent: &tracing::Span) -> Self {
        self.span = tracing::info_span!(parent: parent, "client", id = self.roster_id);
        self
    }

    /// Joins, runs and rejoins until `shutdown` fires.
    pub async fn run(self, shutdown: watch::Receiver<()>) {
        let span = self.span.clone();
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, mut shutdown: watch::Receiver<()>) {
        let interval = self.config.reconnect_interval();
        let mut udp: Option<UdpFeed> = None;
        loop {
            let stream = match join_relay(
                self.relay,
                self.roster_id,
                &self.secret,
                interval,
                &mut shutdown,
            )
            .await
            {
                None => break,
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    tracing::warn!("client {} could not join {}: {}", self.roster_id, self.relay, e);
                    self.handle.disconnected(Some(&e));
                    if backoff(interval, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            let (tx, inbox) = flume::unbounded();
            let connection = match Connection::spawn(stream, tx, |msg| msg) {
                Ok(connection) => connection,
                Err(e) => {
                    self.handle.disconnected(Some(&ProtocolError::from(e)));
                    if backoff(interval, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            tracing::info!("client {} connected to relay {}", self.roster_id, self.relay);
            self.handle.update(|s| {
                s.connected = true;
                s.cells_sent = 0;
            });

            let result = tokio::select! {
                result = self.serve(connection.outbound(), &inbox, &mut udp) => Some(result),
                _ = shutdown.changed() => None,
            };
            match result {
                None => {
                    let _ = connection.outbound().try_send(Message::Shutdown);
                    connection.drain().await;
                    self.handle.disconnected(None);
                    break;
                }
                Some(Ok(())) => {
                    tracing::info!("client {} resyncing", self.roster_id);
                    connection.close();
                    self.handle.disconnected(None);
                }
                Some(Err(e)) => {
                    tracing::warn!("client {} left the run: {}", self.roster_id, e);
                    connection.close();
                    self.handle.disconnected(Some(&e));
                }
            }
            if backoff(interval, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("client {} stopped", self.roster_id);
    }

    /// One protocol run. `Ok` when the relay asked for a resync.
    async fn serve(
        &self,
        outbound: &Outbound,
        inbox: &Inbox,
        udp: &mut Option<UdpFeed>,
    ) -> Result<(), ProtocolError> {
        let params = match next_message(inbox).await? {
            Message::Parameters(params) => params,
            other => return Err(unexpected(&other, "setup")),
        };
        tracing::debug!("parameters: {:?}", params);
        self.upstream.set_capacity(params.window_size as usize);
        self.handle
            .update(|s| s.participant_id = Some(params.participant_id));

        if params.use_udp {
            let port = params.udp_port as u16;
            let max_payload = params.down_cell_size as usize;
            let reusable = udp
                .as_ref()
                .map(|feed| feed.port == port && feed.max_payload >= max_payload)
                .unwrap_or(false);
            if !reusable {
                *udp = None;
                *udp = Some(UdpFeed::bind(port, max_payload).await?);
            }
            if let Some(feed) = udp.as_ref() {
                feed.clear();
            }
        }

        let slot = self.setup(&params, outbound, inbox).await?;
        tracing::info!(
            "client {} owns slot {} of {}",
            params.participant_id,
            slot.index,
            slot.of
        );
        self.handle.update(|s| {
            s.setups += 1;
            s.slot = Some(slot.index);
        });

        let feed = if params.use_udp { udp.as_ref() } else { None };
        self.rounds(&params, slot, outbound, inbox, feed).await
    }

    async fn setup(
        &self,
        params: &Parameters,
        outbound: &Outbound,
        inbox: &Inbox,
    ) -> Result<Slot, ProtocolError> {
        let trustees = match next_message(inbox).await? {
            Message::TrusteeKeys { trustees } => trustees,
            other => return Err(unexpected(&other, "setup")),
        };
        if trustees.len() != params.n_trustees as usize {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} trustee keys for {} trustees",
                trustees.len(),
                params.n_trustees
            )));
        }
        let shared: Vec<RistrettoPoint> = trustees
            .iter()
            .map(|pk| self.secret.shared_point(pk))
            .collect();

        let ephemeral = self.suite.random_scalar(&mut OsRng);
        outbound
            .send(Message::ClientKeys {
                public_key: self.secret.public(),
                ephemeral: self.suite.generator() * ephemeral,
            })
            .await?;

        let (base, keys, signatures) = match next_message(inbox).await? {
            Message::Schedule {
                base,
                ephemerals,
                signatures,
            } => (base, ephemerals, signatures),
            other => return Err(unexpected(&other, "setup")),
        };
        if keys.len() != params.n_clients as usize {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} shuffled keys for {} clients",
                keys.len(),
                params.n_clients
            )));
        }
        verify_signatures(&trustees, &base, &keys, &signatures)?;
        let index = find_slot(&base, &keys, &ephemeral)?;

        let codec = ClientCodec::new(
            self.suite,
            params.dcnet_type,
            params.up_cell_size as usize,
            &shared,
            &session_tag(&base),
        );
        Ok(Slot {
            codec,
            index,
            of: keys.len(),
            run: run_id(&base),
        })
    }

    async fn rounds(
        &self,
        params: &Parameters,
        mut slot: Slot,
        outbound: &Outbound,
        inbox: &Inbox,
        udp: Option<&UdpFeed>,
    ) -> Result<(), ProtocolError> {
        let retry = self.config.round_timeout() / 2;
        let mut sequencer = DownstreamSequencer::new(Instant::now());
        let mut ticker = tokio::time::interval(retry);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let downstream = tokio::select! {
                msg = next_message(inbox) => match msg? {
                    Message::Downstream { round, data, flag_resync } => Downstream {
                        round,
                        payload: data,
                        flag_resync,
                    },
                    other => return Err(unexpected(&other, "rounds")),
                },
                datagram = recv_datagram(udp) => {
                    if datagram.run != slot.run {
                        tracing::debug!(
                            "dropping datagram for round {} of run {:08x}",
                            datagram.round,
                            datagram.run
                        );
                        continue;
                    }
                    Downstream {
                        round: datagram.round,
                        payload: datagram.payload,
                        flag_resync: datagram.flag_resync,
                    }
                }
                _ = ticker.tick(), if udp.is_some() => {
                    self.nack(&mut sequencer, params, outbound, retry).await?;
                    continue;
                }
            };
            if downstream.flag_resync {
                tracing::info!("relay requested a resync at round {}", downstream.round);
                return Ok(());
            }
            if !sequencer.push(downstream) {
                continue;
            }
            while let Some(downstream) = sequencer.pop_ready(Instant::now()) {
                self.answer(params, &mut slot, downstream, outbound).await?;
            }
            if udp.is_some() {
                self.nack(&mut sequencer, params, outbound, retry).await?;
            }
        }
    }

    /// Delivers one in-order downstream and sends the round's cell.
    async fn answer(
        &self,
        params: &Parameters,
        slot: &mut Slot,
        downstream: Downstream,
        outbound: &Outbound,
    ) -> Result<(), ProtocolError> {
        let round = downstream.round;
        slot.codec.absorb_downstream(&downstream.payload);
        self.deliver(params, round, &downstream.payload);

        let owned = if round as usize % slot.of == slot.index {
            self.next_upstream(params)
        } else {
            None
        };
        let cell = slot.codec.encode(owned.as_deref())?;
        outbound
            .send(Message::UpstreamCell {
                round,
                client_id: params.participant_id,
                data: Bytes::from(cell),
            })
            .await?;
        self.handle.update(|s| s.cells_sent += 1);
        Ok(())
    }

    fn deliver(&self, params: &Parameters, round: u32, payload: &[u8]) {
        let Some(tx) = &self.downstream else {
            return;
        };
        match cell::decode(params.down_cell_size as usize, payload) {
            Ok(Some(chunk)) => {
                if tx.send(chunk).is_err() {
                    tracing::debug!("downstream receiver gone, dropping round {}", round);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("downstream {} is not a cell: {}", round, e),
        }
    }

    /// The padded plaintext for an owned slot, if there is anything to send.
    fn next_upstream(&self, params: &Parameters) -> Option<Vec<u8>> {
        let cell_size = params.up_cell_size as usize;
        while let Some(chunk) = self.upstream.pop() {
            match cell::encode(cell_size, &chunk) {
                Ok(plaintext) => return Some(plaintext),
                Err(e) => tracing::warn!("dropping chunk for conn {}: {}", chunk.conn_id, e),
            }
        }
        if params.do_latency_tests && cell::capacity(cell_size) >= 8 {
            return cell::encode(cell_size, &latency_probe()).ok();
        }
        None
    }

    async fn nack(
        &self,
        sequencer: &mut DownstreamSequencer,
        params: &Parameters,
        outbound: &Outbound,
        retry: std::time::Duration,
    ) -> Result<(), ProtocolError> {
        if let Some(round) = sequencer.nack_due(Instant::now(), retry) {
            tracing::debug!("requesting downstream {} over TCP", round);
            outbound
                .send(Message::DownstreamNack {
                    client_id: params.participant_id,
                    round,
                })
                .await?;
        }
        Ok(())
    }
}

fn latency_probe() -> Chunk {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    Chunk {
        conn_id: LATENCY_CONN_ID,
        packet_type: PACKET_LATENCY,
        data: Bytes::copy_from_slice(&now_ms.to_be_bytes()),
    }
}

/// UDP listener kept across runs so the port stays bound.
struct UdpFeed {
    port: u16,
    max_payload: usize,
    datagrams: flume::Receiver<Datagram>,
    reader: JoinHandle<()>,
}

impl UdpFeed {
    async fn bind(port: u16, max_payload: usize) -> Result<Self, ProtocolError> {
        let mut receiver =
            UdpReceiver::bind(SocketAddr::from(([0, 0, 0, 0], port)), max_payload).await?;
        tracing::debug!("listening for downstream on {}", receiver.local_addr()?);
        let (tx, datagrams) = flume::unbounded();
        let forward = async move {
            loop {
                match receiver.recv().await {
                    Ok(datagram) => {
                        if tx.send(datagram).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("UDP receive failed: {}", e);
                        break;
                    }
                }
            }
        };
        let reader = tokio::spawn(forward.in_current_span());
        Ok(Self {
            port,
            max_payload,
            datagrams,
            reader,
        })
    }

    /// Drops datagrams left over from an earlier run.
    fn clear(&self) {
        let stale = self.datagrams.drain().count();
        if stale > 0 {
            tracing::debug!("dropped {} stale datagrams", stale);
        }
    }
}

impl Drop for UdpFeed {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn recv_datagram(udp: Option<&UdpFeed>) -> Datagram {
    match udp {
        Some(feed) => match feed.datagrams.recv_async().await {
            Ok(datagram) => datagram,
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DcNetType;

    fn params(do_latency_tests: bool) -> Parameters {
        Parameters {
            n_clients: 2,
            n_trustees: 1,
            up_cell_size: 64,
            down_cell_size: 64,
            window_size: 2,
            use_udp: false,
            use_dummy_data_down: false,
            reporting_limit: 0,
            start_now: true,
            dcnet_type: DcNetType::Plain,
            participant_id: 0,
            udp_port: 0,
            do_latency_tests,
        }
    }

    fn client() -> Client {
        Client::new(
            Suite,
            "127.0.0.1:1".parse().unwrap(),
            0,
            SecretKey::generate(),
            PrifiConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_owned_slot_prefers_queued_data() {
        let client = client();
        client.upstream().push(Chunk::data(7, &b"hello"[..]));
        let plaintext = client.next_upstream(&params(true)).unwrap();
        assert_eq!(plaintext.len(), 64);
        let chunk = cell::decode(64, &plaintext).unwrap().unwrap();
        assert_eq!(chunk.conn_id, 7);
        assert_eq!(chunk.data.as_ref(), b"hello");
    }

    #[test]
    fn test_idle_slot_sends_latency_probe() {
        let client = client();
        let plaintext = client.next_upstream(&params(true)).unwrap();
        let chunk = cell::decode(64, &plaintext).unwrap().unwrap();
        assert_eq!(chunk.conn_id, LATENCY_CONN_ID);
        assert_eq!(chunk.packet_type, PACKET_LATENCY);
        assert_eq!(chunk.data.len(), 8);
    }

    #[test]
    fn test_idle_slot_without_probes_is_empty() {
        assert!(client().next_upstream(&params(false)).is_none());
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = PrifiConfig {
            relay_window_size: 0,
            ..Default::default()
        };
        let result = Client::new(
            Suite,
            "127.0.0.1:1".parse().unwrap(),
            0,
            SecretKey::generate(),
            config,
        );
        assert!(result.is_err());
    }
}
