//! One protocol run: parameters, the setup phases and the round loop.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;

use super::churn::{Cohort, Member};
use super::round::{Decoded, Plaintext, RelayReport, RoundConfig, RoundCoordinator};
use super::state::RelayState;
use super::RelayContext;
use crate::crypto::{PublicKey, RistrettoPoint, ShufflePublics};
use crate::dcnet::cell;
use crate::error::ProtocolError;
use crate::net::{Datagram, Message, Parameters};
use crate::roster::{ParticipantRef, Role};
use crate::schedule::{
    run_id, verify_signatures, ScheduleError, ShuffleTranscript, SCHEDULE_CONTEXT,
};

/// What the churn controller forwards to a running session.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Inbound {
        from: ParticipantRef,
        msg: Result<Message, ProtocolError>,
    },
    /// A node authenticated while this run was in progress
    Newcomer(u32),
}

#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// The reporting limit was reached
    Finished,
    Cancelled,
    Rejoin {
        roster_id: u32,
    },
    Failed {
        error: ProtocolError,
        offenders: Vec<ParticipantRef>,
        eject: Vec<PublicKey>,
    },
}

#[derive(Debug)]
pub(crate) struct SessionOutcome {
    pub report: RelayReport,
    pub end: SessionEnd,
}

/// Why a phase stopped early.
#[derive(Debug)]
enum Stop {
    Cancelled,
    Rejoin(u32),
    Failed {
        error: ProtocolError,
        offenders: Vec<ParticipantRef>,
        eject: Vec<PublicKey>,
    },
}

impl Stop {
    fn by(who: ParticipantRef, error: impl Into<ProtocolError>) -> Self {
        Stop::Failed {
            error: error.into(),
            offenders: vec![who],
            eject: Vec::new(),
        }
    }
}

impl From<ProtocolError> for Stop {
    fn from(error: ProtocolError) -> Self {
        let offenders = error.offenders().to_vec();
        Stop::Failed {
            error,
            offenders,
            eject: Vec::new(),
        }
    }
}

impl From<Stop> for SessionEnd {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::Cancelled => SessionEnd::Cancelled,
            Stop::Rejoin(roster_id) => SessionEnd::Rejoin { roster_id },
            Stop::Failed {
                error,
                offenders,
                eject,
            } => SessionEnd::Failed {
                error,
                offenders,
                eject,
            },
        }
    }
}

pub(crate) struct Session {
    ctx: RelayContext,
    cohort: Cohort,
    state: Arc<Mutex<RelayState>>,
    inbox: mpsc::Receiver<SessionEvent>,
    cancel: watch::Receiver<()>,
    /// Stamped on downstream datagrams once setup has fixed the final base.
    run: u32,
}

impl Session {
    pub(crate) fn new(
        ctx: RelayContext,
        cohort: Cohort,
        state: Arc<Mutex<RelayState>>,
        inbox: mpsc::Receiver<SessionEvent>,
        cancel: watch::Receiver<()>,
    ) -> Self {
        Self {
            ctx,
            cohort,
            state,
            inbox,
            cancel,
            run: 0,
        }
    }

    pub(crate) async fn run(self) -> SessionOutcome {
        let span = tracing::info_span!(
            "run",
            clients = self.cohort.clients.len(),
            trustees = self.cohort.trustees.len()
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> SessionOutcome {
        let base = match self.setup().await {
            Ok(base) => base,
            Err(stop) => {
                if !matches!(stop, Stop::Cancelled) {
                    self.set_state(RelayState::Resync);
                }
                return SessionOutcome {
                    report: RelayReport::default(),
                    end: stop.into(),
                };
            }
        };
        tracing::info!(
            "setup complete, final base {}",
            hex::encode(base.compress().as_bytes())
        );
        self.run = run_id(&base);
        self.set_state(RelayState::Running);

        let config = &self.ctx.config;
        let mut coordinator = RoundCoordinator::new(
            self.ctx.suite,
            RoundConfig {
                n_clients: self.cohort.clients.len(),
                n_trustees: self.cohort.trustees.len(),
                up_cell_size: config.cell_size_up,
                window_size: config.relay_window_size,
                dcnet_type: config.dcnet_type,
                round_timeout: config.round_timeout(),
                reporting_limit: config.relay_reporting_limit,
                max_consecutive_failed_rounds: config
                    .relay_max_number_of_consecutive_failed_rounds,
            },
        );
        let result = self.rounds(&mut coordinator).await;
        let next_round = coordinator.next_open();
        let report = coordinator.into_report();
        match result {
            Ok(()) => SessionOutcome {
                report,
                end: SessionEnd::Finished,
            },
            Err(Stop::Cancelled) => SessionOutcome {
                report,
                end: SessionEnd::Cancelled,
            },
            Err(stop) => {
                self.announce_resync(next_round).await;
                SessionOutcome {
                    report,
                    end: stop.into(),
                }
            }
        }
    }

    fn set_state(&self, to: RelayState) {
        if let Err(e) = self.state.lock().transition(to) {
            tracing::error!("{}", e);
        }
    }

    /// Final downstream telling clients to resync, over TCP.
    async fn announce_resync(&self, round: u32) {
        self.set_state(RelayState::Resync);
        for client in &self.cohort.clients {
            let _ = client
                .outbound
                .send(Message::Downstream {
                    round,
                    data: Bytes::new(),
                    flag_resync: true,
                })
                .await;
        }
    }

    async fn send(&self, to: ParticipantRef, msg: Message) -> Result<(), Stop> {
        let member = self.member(to)?;
        member.outbound.send(msg).await.map_err(|e| Stop::by(to, e))
    }

    fn member(&self, who: ParticipantRef) -> Result<&Member, Stop> {
        self.cohort
            .member(who)
            .ok_or_else(|| Stop::by(who, ProtocolError::MalformedFrame(format!("no {}", who))))
    }

    /// Next message from any member, failing on timeout with `waiting_on`
    /// as offenders.
    async fn next_inbound(
        &mut self,
        deadline: Instant,
        waiting_on: &[ParticipantRef],
    ) -> Result<(ParticipantRef, Message), Stop> {
        let event = tokio::select! {
            event = self.inbox.recv() => event,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ProtocolError::RoundTimeout {
                    round: 0,
                    offenders: waiting_on.to_vec(),
                }
                .into());
            }
            _ = self.cancel.changed() => return Err(Stop::Cancelled),
        };
        match event {
            None => Err(Stop::Cancelled),
            Some(SessionEvent::Newcomer(roster_id)) => Err(Stop::Rejoin(roster_id)),
            Some(SessionEvent::Inbound { from, msg: Err(e) }) => {
                tracing::warn!("{} dropped out: {}", from, e);
                Err(Stop::by(from, e))
            }
            Some(SessionEvent::Inbound { from, msg: Ok(msg) }) => Ok((from, msg)),
        }
    }

    fn unexpected(from: ParticipantRef, msg: &Message, phase: &str) -> Stop {
        Stop::by(
            from,
            ProtocolError::MalformedFrame(format!("unexpected {} during {}", msg.name(), phase)),
        )
    }

    fn parameters(&self, participant_id: u32) -> Parameters {
        let config = &self.ctx.config;
        Parameters {
            n_clients: self.cohort.clients.len() as u32,
            n_trustees: self.cohort.trustees.len() as u32,
            up_cell_size: config.cell_size_up as u32,
            down_cell_size: config.cell_size_down as u32,
            window_size: config.relay_window_size,
            use_udp: config.use_udp,
            use_dummy_data_down: config.relay_use_dummy_data_down,
            reporting_limit: config.relay_reporting_limit,
            start_now: true,
            dcnet_type: config.dcnet_type,
            participant_id,
            udp_port: config.udp_port as u32,
            do_latency_tests: config.do_latency_tests,
        }
    }

    /// Runs phases A to F, returning the signed final base.
    async fn setup(&mut self) -> Result<RistrettoPoint, Stop> {
        let suite = self.ctx.suite;
        let timeout = self.ctx.config.round_timeout();
        let clients: Vec<ParticipantRef> = (0..self.cohort.clients.len() as u32)
            .map(ParticipantRef::client)
            .collect();
        let trustees: Vec<ParticipantRef> = (0..self.cohort.trustees.len() as u32)
            .map(ParticipantRef::trustee)
            .collect();
        let trustee_keys: Vec<PublicKey> =
            self.cohort.trustees.iter().map(|m| m.public_key).collect();
        let client_keys: Vec<PublicKey> =
            self.cohort.clients.iter().map(|m| m.public_key).collect();

        for who in clients.iter().chain(&trustees) {
            self.send(*who, Message::Parameters(self.parameters(who.id)))
                .await?;
        }

        // phase A
        for who in &clients {
            let msg = Message::TrusteeKeys {
                trustees: trustee_keys.clone(),
            };
            self.send(*who, msg).await?;
        }

        // phase C
        let mut ephemerals = vec![None; clients.len()];
        let deadline = Instant::now() + timeout;
        while ephemerals.iter().any(Option::is_none) {
            let missing: Vec<_> = clients
                .iter()
                .filter(|c| ephemerals[c.id as usize].is_none())
                .copied()
                .collect();
            let (from, msg) = self.next_inbound(deadline, &missing).await?;
            match msg {
                Message::ClientKeys {
                    public_key,
                    ephemeral,
                } if from.role == Role::Client => {
                    if public_key != client_keys[from.id as usize] {
                        return Err(Stop::by(
                            from,
                            ProtocolError::MalformedFrame(
                                "announced key differs from the authenticated one".to_string(),
                            ),
                        ));
                    }
                    if ephemerals[from.id as usize].replace(ephemeral).is_some() {
                        return Err(Stop::by(
                            from,
                            ProtocolError::MalformedFrame("ephemeral key sent twice".to_string()),
                        ));
                    }
                }
                other => return Err(Self::unexpected(from, &other, "key collection")),
            }
        }
        let ephemerals: Vec<_> = ephemerals.into_iter().flatten().collect();

        // phase D
        let mut transcript = ShuffleTranscript::new(suite.generator(), ephemerals);
        for trustee in &trustees {
            let request = Message::ShuffleRequest {
                clients: client_keys.clone(),
                ephemerals: transcript.last_keys().to_vec(),
                base: *transcript.last_base(),
            };
            self.send(*trustee, request).await?;
            let deadline = Instant::now() + timeout;
            let (from, msg) = self.next_inbound(deadline, &[*trustee]).await?;
            match msg {
                Message::ShuffleResponse {
                    base,
                    ephemerals,
                    proof,
                } if from == *trustee => {
                    if let Err(e) = transcript.push(base, ephemerals, proof) {
                        tracing::warn!("{} sent an invalid shuffle: {}", trustee, e);
                        return Err(Stop::Failed {
                            error: e.into(),
                            offenders: vec![*trustee],
                            eject: vec![trustee_keys[trustee.id as usize]],
                        });
                    }
                    tracing::debug!("verified shuffle {} of {}", trustee.id + 1, trustees.len());
                }
                other => return Err(Self::unexpected(from, &other, "shuffle")),
            }
        }

        // phase E
        for trustee in &trustees {
            self.send(*trustee, Message::Transcript(transcript.clone()))
                .await?;
        }
        let base = *transcript.last_base();
        let keys = transcript.last_keys().to_vec();
        let payload = ShuffleTranscript::signed_payload(&base, &keys);
        let mut signatures = vec![None; trustees.len()];
        let deadline = Instant::now() + timeout;
        while signatures.iter().any(Option::is_none) {
            let missing: Vec<_> = trustees
                .iter()
                .filter(|t| signatures[t.id as usize].is_none())
                .copied()
                .collect();
            let (from, msg) = self.next_inbound(deadline, &missing).await?;
            match msg {
                Message::ShuffleSignature {
                    trustee_id,
                    signature,
                } if from.role == Role::Trustee && trustee_id == from.id => {
                    let pk = &trustee_keys[from.id as usize];
                    if signature.verify(pk, SCHEDULE_CONTEXT, &payload).is_err() {
                        return Err(Stop::Failed {
                            error: ScheduleError::BadSignature {
                                trustee: from.id as usize,
                            }
                            .into(),
                            offenders: vec![from],
                            eject: vec![*pk],
                        });
                    }
                    signatures[from.id as usize] = Some(signature);
                }
                Message::ShuffleReject {
                    trustee_id,
                    faulty_index,
                } if from.role == Role::Trustee && trustee_id == from.id => {
                    return Err(self.judge_reject(from, faulty_index as usize, &transcript));
                }
                other => return Err(Self::unexpected(from, &other, "signature collection")),
            }
        }
        let signatures: Vec<_> = signatures.into_iter().flatten().collect();
        verify_signatures(&trustee_keys, &base, &keys, &signatures)
            .map_err(ProtocolError::from)?;

        // phase F
        for who in &clients {
            let msg = Message::Schedule {
                base,
                ephemerals: keys.clone(),
                signatures: signatures.clone(),
            };
            self.send(*who, msg).await?;
        }
        Ok(base)
    }

    /// Ejects whoever a shuffle rejection proves wrong: the author of the
    /// named proof if it really fails, otherwise the accuser.
    fn judge_reject(&self, from: ParticipantRef, index: usize, transcript: &ShuffleTranscript) -> Stop {
        let proof_fails = match transcript.proofs.get(index) {
            Some(proof) => proof
                .verify(ShufflePublics {
                    base: &transcript.bases[index],
                    keys: &transcript.keys[index],
                    new_base: &transcript.bases[index + 1],
                    new_keys: &transcript.keys[index + 1],
                })
                .is_err(),
            None => false,
        };
        let culprit = if proof_fails {
            ParticipantRef::trustee(index as u32)
        } else {
            from
        };
        tracing::warn!("{} rejected shuffle {}, ejecting {}", from, index, culprit);
        let eject = self
            .cohort
            .member(culprit)
            .map(|m| vec![m.public_key])
            .unwrap_or_default();
        Stop::Failed {
            error: ScheduleError::BadShuffle { index }.into(),
            offenders: vec![culprit],
            eject,
        }
    }

    async fn rounds(&mut self, coordinator: &mut RoundCoordinator) -> Result<(), Stop> {
        self.open_rounds(coordinator).await?;
        while !coordinator.finished() {
            if coordinator.exhausted() {
                return Err(ProtocolError::ResourceExhausted(
                    "round numbers exhausted".to_string(),
                )
                .into());
            }
            let deadline = coordinator.next_deadline();
            let event = tokio::select! {
                event = self.inbox.recv() => event,
                _ = sleep_until(deadline) => {
                    coordinator.check_timeout(Instant::now())?;
                    continue;
                }
                _ = self.cancel.changed() => return Err(Stop::Cancelled),
            };
            match event {
                None => return Err(Stop::Cancelled),
                Some(SessionEvent::Newcomer(roster_id)) => return Err(Stop::Rejoin(roster_id)),
                Some(SessionEvent::Inbound { from, msg: Err(e) }) => {
                    tracing::warn!("{} dropped out: {}", from, e);
                    return Err(Stop::by(from, e));
                }
                Some(SessionEvent::Inbound { from, msg: Ok(msg) }) => {
                    self.on_round_message(coordinator, from, msg).await?;
                }
            }

            let decoded = coordinator.poll_decoded()?;
            let progressed = !decoded.is_empty();
            for d in decoded {
                self.deliver(d);
            }
            for j in coordinator.resumable() {
                let window = self.ctx.config.relay_window_size;
                self.send(ParticipantRef::trustee(j), Message::RateChange { window })
                    .await?;
            }
            if progressed {
                let pause = self.ctx.config.processing_loop_sleep();
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                self.open_rounds(coordinator).await?;
            }
        }
        Ok(())
    }

    async fn on_round_message(
        &mut self,
        coordinator: &mut RoundCoordinator,
        from: ParticipantRef,
        msg: Message,
    ) -> Result<(), Stop> {
        match msg {
            Message::UpstreamCell {
                round,
                client_id,
                data,
            } if from == ParticipantRef::client(client_id) => coordinator
                .on_client_cell(client_id, round, &data)
                .map_err(|e| Stop::by(from, e)),
            Message::TrusteeCell {
                round,
                trustee_id,
                data,
            } if from == ParticipantRef::trustee(trustee_id) => {
                let change = coordinator
                    .on_trustee_cell(trustee_id, round, &data)
                    .map_err(|e| Stop::by(from, e))?;
                if let Some(window) = change {
                    tracing::debug!("pausing {} at round {}", from, round);
                    self.send(from, Message::RateChange { window }).await?;
                }
                Ok(())
            }
            Message::DownstreamNack { client_id, round }
                if from == ParticipantRef::client(client_id) =>
            {
                match coordinator.downstream(round) {
                    Some(data) => {
                        tracing::debug!("{} missed downstream {}, resending", from, round);
                        let msg = Message::Downstream {
                            round,
                            data,
                            flag_resync: false,
                        };
                        self.send(from, msg).await
                    }
                    None => {
                        tracing::debug!("{} asked for closed round {}", from, round);
                        Ok(())
                    }
                }
            }
            Message::Shutdown => Err(Stop::by(
                from,
                ProtocolError::TransportClosed("participant left".to_string()),
            )),
            other => Err(Self::unexpected(from, &other, "rounds")),
        }
    }

    async fn open_rounds(&mut self, coordinator: &mut RoundCoordinator) -> Result<(), Stop> {
        while coordinator.can_open() {
            let payload = self.next_downstream();
            let opened = match coordinator.open_round(payload, Instant::now()) {
                Some(opened) => opened,
                None => break,
            };
            tracing::trace!("opened round {}", opened.round);

            match &self.ctx.udp {
                Some(udp) => {
                    let datagram = Datagram {
                        run: self.run,
                        round: opened.round,
                        payload: opened.payload.clone(),
                        flag_resync: false,
                    };
                    udp.send(&datagram).await.map_err(ProtocolError::from)?;
                }
                None => {
                    for i in 0..self.cohort.clients.len() as u32 {
                        let msg = Message::Downstream {
                            round: opened.round,
                            data: opened.payload.clone(),
                            flag_resync: false,
                        };
                        self.send(ParticipantRef::client(i), msg).await?;
                    }
                }
            }
            if let Some(digest) = opened.digest {
                for j in 0..self.cohort.trustees.len() as u32 {
                    let msg = Message::DownstreamDigest {
                        round: opened.round,
                        digest,
                    };
                    self.send(ParticipantRef::trustee(j), msg).await?;
                }
            }
        }
        Ok(())
    }

    fn next_downstream(&self) -> Bytes {
        let config = &self.ctx.config;
        if let Some(replies) = &self.ctx.replies {
            while let Ok(chunk) = replies.try_recv() {
                match cell::encode_unpadded(config.cell_size_down, &chunk) {
                    Ok(payload) => return Bytes::from(payload),
                    Err(e) => tracing::warn!("dropping reply on conn {}: {}", chunk.conn_id, e),
                }
            }
        }
        if config.relay_use_dummy_data_down {
            Bytes::from(vec![0u8; config.cell_size_down])
        } else {
            Bytes::new()
        }
    }

    fn deliver(&self, decoded: Decoded) {
        match decoded.plaintext {
            Plaintext::Empty => tracing::trace!("round {} empty", decoded.round),
            Plaintext::Data(chunk) => {
                tracing::debug!(
                    "round {}: {} bytes for conn {}",
                    decoded.round,
                    chunk.data.len(),
                    chunk.conn_id
                );
                match &self.ctx.egress {
                    Some(egress) => {
                        if egress.send(chunk).is_err() {
                            tracing::warn!("egress is gone, dropping round {}", decoded.round);
                        }
                    }
                    None => tracing::debug!("no egress attached, dropping round {}", decoded.round),
                }
            }
            Plaintext::Latency { conn_id, sent_ms } => {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                tracing::info!(
                    "latency probe on conn {}: {} ms",
                    conn_id,
                    now_ms.saturating_sub(sent_ms)
                );
            }
            Plaintext::Garbled(e) => {
                tracing::warn!("round {} decoded to garbage: {}", decoded.round, e)
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
