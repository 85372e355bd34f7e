//! Trustee node.
//!
//! A trustee shuffles the clients' ephemeral keys once per run, checks
//! and signs the final schedule, then streams one DC-net cell per round
//! at the pace the relay allows through `RateChange`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::config::{DcNetType, PrifiConfig};
use crate::crypto::{PublicKey, RistrettoPoint, SecretKey, Suite};
use crate::dcnet::TrusteeCodec;
use crate::error::ProtocolError;
use crate::net::{Connection, Message, Outbound, Parameters};
use crate::node::{backoff, join_relay, next_message, unexpected, Inbox, NodeHandle, TaskGuard};
use crate::schedule::{
    session_tag, verify_and_sign, HonestProver, ScheduleError, ShuffleProver, ShuffleStep,
};

pub struct Trustee {
    suite: Suite,
    relay: SocketAddr,
    roster_id: u32,
    secret: SecretKey,
    config: Arc<PrifiConfig>,
    prover: Arc<dyn ShuffleProver>,
    handle: NodeHandle,
    span: tracing::Span,
}

impl Trustee {
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
            config: Arc::new(config),
            prover: Arc::new(HonestProver),
            handle: NodeHandle::default(),
            span: tracing::info_span!("trustee", id = roster_id),
        })
    }

    /// Replaces the shuffle step this trustee contributes.
    pub fn with_prover(mut self, prover: Arc<dyn ShuffleProver>) -> Self {
        self.prover = prover;
        self
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn with_span(mut self, parent: &tracing::Span) -> Self {
        self.span = tracing::info_span!(parent: parent, "trustee", id = self.roster_id);
        self
    }

    /// Joins, runs and rejoins until `shutdown` fires.
    pub async fn run(self, shutdown: watch::Receiver<()>) {
        let span = self.span.clone();
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, mut shutdown: watch::Receiver<()>) {
        let interval = self.config.reconnect_interval();
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
                    tracing::warn!("trustee {} could not join {}: {}", self.roster_id, self.relay, e);
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
            tracing::info!("trustee {} connected to relay {}", self.roster_id, self.relay);
            self.handle.update(|s| {
                s.connected = true;
                s.cells_sent = 0;
            });

            let result = tokio::select! {
                result = self.serve(connection.outbound(), &inbox) => Some(result),
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
                    connection.close();
                    self.handle.disconnected(None);
                }
                Some(Err(e)) => {
                    tracing::info!("trustee {} left the run: {}", self.roster_id, e);
                    connection.close();
                    self.handle.disconnected(Some(&e));
                }
            }
            if backoff(interval, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("trustee {} stopped", self.roster_id);
    }

    /// One protocol run; ends with the connection.
    async fn serve(&self, outbound: &Outbound, inbox: &Inbox) -> Result<(), ProtocolError> {
        let params = match next_message(inbox).await? {
            Message::Parameters(params) => params,
            other => return Err(unexpected(&other, "setup")),
        };
        tracing::debug!("parameters: {:?}", params);
        self.handle
            .update(|s| s.participant_id = Some(params.participant_id));

        let (clients, final_base) = self.setup(&params, outbound, inbox).await?;
        self.handle.update(|s| s.setups += 1);
        tracing::info!(
            "trustee {} signed the schedule of {} clients",
            params.participant_id,
            clients.len()
        );

        let shared: Vec<RistrettoPoint> = clients
            .iter()
            .map(|pk| self.secret.shared_point(pk))
            .collect();
        let codec = TrusteeCodec::new(
            self.suite,
            params.dcnet_type,
            params.up_cell_size as usize,
            &shared,
            &session_tag(&final_base),
        );
        self.rounds(&params, codec, outbound, inbox).await
    }

    /// Phases D and E. Returns the clients' long-term keys and the signed
    /// final base.
    async fn setup(
        &self,
        params: &Parameters,
        outbound: &Outbound,
        inbox: &Inbox,
    ) -> Result<(Vec<PublicKey>, RistrettoPoint), ProtocolError> {
        let trustee_id = params.participant_id;
        let (clients, own) = match next_message(inbox).await? {
            Message::ShuffleRequest {
                clients,
                ephemerals,
                base,
            } => {
                if clients.len() != params.n_clients as usize || ephemerals.len() != clients.len() {
                    return Err(ProtocolError::MalformedFrame(format!(
                        "shuffle request with {} clients and {} keys for {} clients",
                        clients.len(),
                        ephemerals.len(),
                        params.n_clients
                    )));
                }
                let step: ShuffleStep = self.prover.prove(&base, &ephemerals)?;
                outbound
                    .send(Message::ShuffleResponse {
                        base: step.base,
                        ephemerals: step.keys.clone(),
                        proof: step.proof.clone(),
                    })
                    .await?;
                (clients, step)
            }
            other => return Err(unexpected(&other, "shuffle")),
        };

        let transcript = match next_message(inbox).await? {
            Message::Transcript(transcript) => transcript,
            other => return Err(unexpected(&other, "transcript check")),
        };
        let verdict = verify_and_sign(
            &self.suite,
            &transcript,
            trustee_id as usize,
            &own,
            &self.secret,
        );
        let signature = match verdict {
            Ok(signature) => signature,
            Err(e) => {
                let faulty = match &e {
                    ScheduleError::BadShuffle { index }
                    | ScheduleError::ContributionAltered { index } => Some(*index),
                    _ => None,
                };
                if let Some(index) = faulty {
                    tracing::warn!("rejecting transcript: {}", e);
                    outbound
                        .send(Message::ShuffleReject {
                            trustee_id,
                            faulty_index: index as u32,
                        })
                        .await?;
                    // the relay settles the blame and ends the run
                    while next_message(inbox).await.is_ok() {}
                }
                return Err(e.into());
            }
        };
        outbound
            .send(Message::ShuffleSignature {
                trustee_id,
                signature,
            })
            .await?;
        Ok((clients, *transcript.last_base()))
    }

    async fn rounds(
        &self,
        params: &Parameters,
        codec: TrusteeCodec,
        outbound: &Outbound,
        inbox: &Inbox,
    ) -> Result<(), ProtocolError> {
        let window = params.window_size.max(1);
        let (rate_tx, rate_rx) = watch::channel(window);
        let (cell_tx, cell_rx) = mpsc::channel(window as usize);
        let (digest_tx, digest_rx) = mpsc::unbounded_channel();
        let equivocation = params.dcnet_type == DcNetType::Equivocation;

        let mut encoder = TaskGuard(tokio::spawn(encode_cells(
            codec,
            params.participant_id,
            rate_rx,
            equivocation.then_some(digest_rx),
            cell_tx,
        )
        .in_current_span()));
        let _sender = TaskGuard(tokio::spawn(send_cells(
            cell_rx,
            outbound.clone(),
            self.handle.clone(),
        )
        .in_current_span()));

        loop {
            let msg = tokio::select! {
                msg = next_message(inbox) => msg?,
                result = &mut encoder.0 => {
                    return match result {
                        Ok(result) => result,
                        Err(e) => Err(ProtocolError::ResourceExhausted(format!("encoder stopped: {}", e))),
                    };
                }
            };
            match msg {
                Message::RateChange { window } => {
                    tracing::debug!("rate change to {}", window);
                    let _ = rate_tx.send(window);
                }
                Message::DownstreamDigest { round, digest } if equivocation => {
                    let _ = digest_tx.send((round, digest));
                }
                other => return Err(unexpected(&other, "rounds")),
            }
        }
    }
}

/// Produces round cells in order while the relay's window is open.
async fn encode_cells(
    mut codec: TrusteeCodec,
    trustee_id: u32,
    mut rate: watch::Receiver<u32>,
    mut digests: Option<mpsc::UnboundedReceiver<(u32, [u8; 32])>>,
    cells: mpsc::Sender<Message>,
) -> Result<(), ProtocolError> {
    let mut round = 0u32;
    loop {
        if rate.wait_for(|window| *window > 0).await.is_err() {
            return Ok(());
        }
        if let Some(digests) = digests.as_mut() {
            match digests.recv().await {
                Some((r, digest)) if r == round => codec.absorb_digest(&digest),
                Some((r, _)) => {
                    return Err(ProtocolError::MalformedFrame(format!(
                        "digest for round {} while encoding round {}",
                        r, round
                    )))
                }
                None => return Ok(()),
            }
        }
        let data = Bytes::from(codec.encode());
        let cell = Message::TrusteeCell {
            round,
            trustee_id,
            data,
        };
        if cells.send(cell).await.is_err() {
            return Ok(());
        }
        // the relay resyncs before the round numbers run out
        round = match round.checked_add(1) {
            Some(next) => next,
            None => return Ok(()),
        };
    }
}

async fn send_cells(mut cells: mpsc::Receiver<Message>, outbound: Outbound, handle: NodeHandle) {
    while let Some(cell) = cells.recv().await {
        if outbound.send(cell).await.is_err() {
            break;
        }
        handle.update(|s| s.cells_sent += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcnet::ClientCodec;

    fn codecs(kind: DcNetType) -> (ClientCodec, TrusteeCodec) {
        let client = SecretKey::generate();
        let trustee = SecretKey::generate();
        let tag = [3u8; 32];
        let shared = client.shared_point(&trustee.public());
        (
            ClientCodec::new(Suite, kind, 32, &[shared], &tag),
            TrusteeCodec::new(Suite, kind, 32, &[shared], &tag),
        )
    }

    #[tokio::test]
    async fn test_encoder_respects_pause() {
        let (_, codec) = codecs(DcNetType::Plain);
        let (rate_tx, rate_rx) = watch::channel(0u32);
        let (cell_tx, mut cell_rx) = mpsc::channel(4);
        let encoder = tokio::spawn(encode_cells(codec, 1, rate_rx, None, cell_tx));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(cell_rx.try_recv().is_err());

        rate_tx.send(2).unwrap();
        for expected in 0..3 {
            match cell_rx.recv().await.unwrap() {
                Message::TrusteeCell {
                    round, trustee_id, ..
                } => {
                    assert_eq!(round, expected);
                    assert_eq!(trustee_id, 1);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        encoder.abort();
    }

    #[tokio::test]
    async fn test_equivocation_encoder_waits_for_digests() {
        let (_, codec) = codecs(DcNetType::Equivocation);
        let (_rate_tx, rate_rx) = watch::channel(1u32);
        let (cell_tx, mut cell_rx) = mpsc::channel(4);
        let (digest_tx, digest_rx) = mpsc::unbounded_channel();
        let encoder = tokio::spawn(encode_cells(codec, 0, rate_rx, Some(digest_rx), cell_tx));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(cell_rx.try_recv().is_err());

        digest_tx.send((0, [9u8; 32])).unwrap();
        match cell_rx.recv().await.unwrap() {
            Message::TrusteeCell { round, data, .. } => {
                assert_eq!(round, 0);
                assert_eq!(data.len(), 64);
            }
            other => panic!("unexpected {:?}", other),
        }

        digest_tx.send((5, [9u8; 32])).unwrap();
        assert!(encoder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_encoder_stops_when_receiver_goes() {
        let (_, codec) = codecs(DcNetType::Plain);
        let (_rate_tx, rate_rx) = watch::channel(1u32);
        let (cell_tx, cell_rx) = mpsc::channel(1);
        drop(cell_rx);
        let result = encode_cells(codec, 0, rate_rx, None, cell_tx).await;
        assert!(result.is_ok());
    }
}
