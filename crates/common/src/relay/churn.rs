//! Churn controller: the waiting set of authenticated participants and the
//! start, teardown and restart of protocol runs around it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use super::round::RelayReport;
use super::session::{Session, SessionEnd, SessionEvent, SessionOutcome};
use super::state::RelayState;
use super::RelayContext;
use crate::crypto::PublicKey;
use crate::error::ProtocolError;
use crate::net::{Authenticated, Connection, Message, Outbound};
use crate::roster::{ParticipantRef, Role};

pub(crate) type ConnId = u64;

/// Capacity of a running session's inbox.
pub(crate) const SESSION_INBOX_SIZE: usize = 256;

/// What connection tasks report to the controller.
#[derive(Debug)]
pub(crate) enum ChurnEvent {
    Joined {
        conn_id: ConnId,
    },
    Inbound {
        conn_id: ConnId,
        msg: Result<Message, ProtocolError>,
    },
}

#[derive(Debug)]
pub(crate) struct Participant {
    pub conn_id: ConnId,
    pub auth: Authenticated,
    pub connection: Connection,
}

/// A participant as seen by one protocol run.
#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub conn_id: ConnId,
    pub roster_id: u32,
    pub public_key: PublicKey,
    pub outbound: Outbound,
}

/// Snapshot of the waiting set, each role sorted by roster id.
#[derive(Debug, Clone, Default)]
pub(crate) struct Cohort {
    pub clients: Vec<Member>,
    pub trustees: Vec<Member>,
}

impl Cohort {
    /// Dense per-run id of every member's connection.
    pub fn refs(&self) -> HashMap<ConnId, ParticipantRef> {
        let clients = self
            .clients
            .iter()
            .enumerate()
            .map(|(i, m)| (m.conn_id, ParticipantRef::client(i as u32)));
        let trustees = self
            .trustees
            .iter()
            .enumerate()
            .map(|(j, m)| (m.conn_id, ParticipantRef::trustee(j as u32)));
        clients.chain(trustees).collect()
    }

    pub fn member(&self, who: ParticipantRef) -> Option<&Member> {
        match who.role {
            Role::Client => self.clients.get(who.id as usize),
            Role::Trustee => self.trustees.get(who.id as usize),
        }
    }
}

/// Authenticated participants keyed by public key hex.
#[derive(Debug, Default)]
pub struct WaitingSet {
    participants: HashMap<String, Participant>,
}

impl WaitingSet {
    /// Inserts `participant`, returning the connection it replaces.
    pub(crate) fn insert(&mut self, participant: Participant) -> Option<Participant> {
        self.participants
            .insert(participant.auth.public_key.to_hex(), participant)
    }

    pub(crate) fn remove_conn(&mut self, conn_id: ConnId) -> Option<Participant> {
        let key = self
            .participants
            .iter()
            .find(|(_, p)| p.conn_id == conn_id)
            .map(|(k, _)| k.clone())?;
        self.participants.remove(&key)
    }

    pub(crate) fn get_conn(&self, conn_id: ConnId) -> Option<&Participant> {
        self.participants.values().find(|p| p.conn_id == conn_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn has_quorum(&self) -> bool {
        let has = |role| self.participants.values().any(|p| p.auth.role == role);
        has(Role::Client) && has(Role::Trustee)
    }

    pub(crate) fn snapshot(&self) -> Cohort {
        let mut cohort = Cohort::default();
        let mut sorted: Vec<&Participant> = self.participants.values().collect();
        sorted.sort_by_key(|p| p.auth.roster_id);
        for p in sorted {
            let member = Member {
                conn_id: p.conn_id,
                roster_id: p.auth.roster_id,
                public_key: p.auth.public_key,
                outbound: p.connection.outbound().clone(),
            };
            match p.auth.role {
                Role::Client => cohort.clients.push(member),
                Role::Trustee => cohort.trustees.push(member),
            }
        }
        cohort
    }

    pub(crate) fn drain(&mut self) -> Vec<Participant> {
        self.participants.drain().map(|(_, p)| p).collect()
    }
}

struct Running {
    handle: JoinHandle<SessionOutcome>,
    inbox: mpsc::Sender<SessionEvent>,
    members: HashMap<ConnId, ParticipantRef>,
    cancel: watch::Sender<()>,
}

pub(crate) struct ChurnController {
    ctx: RelayContext,
    events: flume::Receiver<ChurnEvent>,
    waiting: Arc<Mutex<WaitingSet>>,
    banned: Arc<Mutex<HashSet<PublicKey>>>,
    state: Arc<Mutex<RelayState>>,
    running: Option<Running>,
    settle: Option<Instant>,
    reports: Vec<RelayReport>,
}

impl ChurnController {
    pub(crate) fn new(
        ctx: RelayContext,
        events: flume::Receiver<ChurnEvent>,
        waiting: Arc<Mutex<WaitingSet>>,
        banned: Arc<Mutex<HashSet<PublicKey>>>,
        state: Arc<Mutex<RelayState>>,
    ) -> Self {
        Self {
            ctx,
            events,
            waiting,
            banned,
            state,
            running: None,
            settle: None,
            reports: Vec::new(),
        }
    }

    /// Runs until a protocol run reaches its reporting limit or `shutdown`
    /// fires; returns the report of every run in order.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<()>) -> Vec<RelayReport> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("relay shutting down");
                    if let Some(running) = self.running.take() {
                        let _ = running.cancel.send(());
                        if let Ok(mut outcome) = running.handle.await {
                            outcome.report.resync_reason = Some("shutdown".to_string());
                            self.reports.push(outcome.report);
                        }
                    }
                    self.teardown();
                    return self.reports;
                }
                event = self.events.recv_async() => {
                    match event {
                        Ok(event) => self.on_event(event).await,
                        Err(_) => return self.reports,
                    }
                }
                outcome = wait_outcome(&mut self.running) => {
                    let finished = self.on_outcome(outcome);
                    if finished {
                        return self.reports;
                    }
                }
                _ = wait_settle(self.settle), if self.running.is_none() => {
                    self.settle = None;
                    self.start();
                }
            }
        }
    }

    async fn on_event(&mut self, event: ChurnEvent) {
        match event {
            ChurnEvent::Joined { conn_id } => {
                let roster_id = match self.waiting.lock().get_conn(conn_id) {
                    Some(p) => p.auth.roster_id,
                    // replaced or gone before we saw it
                    None => return,
                };
                if let Some(running) = &self.running {
                    tracing::info!("node {} joined during a run, restarting", roster_id);
                    let _ = running.inbox.send(SessionEvent::Newcomer(roster_id)).await;
                    return;
                }
                {
                    let mut state = self.state.lock();
                    if *state == RelayState::Idle {
                        let _ = state.transition(RelayState::Authenticating);
                    }
                }
                if self.settle.is_none() {
                    self.settle = Some(Instant::now() + self.ctx.config.setup_settle_time());
                }
            }
            ChurnEvent::Inbound { conn_id, msg } => {
                if let Some(running) = &self.running {
                    if let Some(from) = running.members.get(&conn_id) {
                        let _ = running
                            .inbox
                            .send(SessionEvent::Inbound { from: *from, msg })
                            .await;
                        return;
                    }
                }
                match msg {
                    Ok(msg) => {
                        tracing::debug!("ignoring {} from waiting connection {}", msg.name(), conn_id)
                    }
                    Err(e) => {
                        let left = self.waiting.lock().remove_conn(conn_id);
                        if let Some(p) = left {
                            tracing::info!("node {} left while waiting: {}", p.auth.roster_id, e);
                            p.connection.close();
                        }
                        if self.running.is_none() && self.waiting.lock().is_empty() {
                            let mut state = self.state.lock();
                            if *state == RelayState::Authenticating {
                                let _ = state.transition(RelayState::Idle);
                            }
                        }
                    }
                }
            }
        }
    }

    fn start(&mut self) {
        let cohort = {
            let waiting = self.waiting.lock();
            if !waiting.has_quorum() {
                tracing::debug!("{} waiting, no quorum yet", waiting.len());
                return;
            }
            waiting.snapshot()
        };
        if let Err(e) = self.state.lock().transition(RelayState::Setup) {
            tracing::error!("cannot start a run: {}", e);
            return;
        }
        let ids = |members: &[Member]| members.iter().map(|m| m.roster_id).collect::<Vec<_>>();
        tracing::info!(
            "starting protocol run with clients {:?} and trustees {:?}",
            ids(&cohort.clients),
            ids(&cohort.trustees)
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(SESSION_INBOX_SIZE);
        let (cancel_tx, cancel_rx) = watch::channel(());
        let members = cohort.refs();
        let session = Session::new(
            self.ctx.clone(),
            cohort,
            self.state.clone(),
            inbox_rx,
            cancel_rx,
        );
        self.running = Some(Running {
            handle: tokio::spawn(session.run().in_current_span()),
            inbox: inbox_tx,
            members,
            cancel: cancel_tx,
        });
    }

    /// Handles the end of a run; true once the relay should stop.
    fn on_outcome(&mut self, outcome: Result<SessionOutcome, tokio::task::JoinError>) -> bool {
        self.running = None;
        let mut outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("protocol run panicked: {}", e);
                SessionOutcome {
                    report: RelayReport {
                        resync_reason: Some(format!("run aborted: {}", e)),
                        ..Default::default()
                    },
                    end: SessionEnd::Cancelled,
                }
            }
        };

        let finished = matches!(outcome.end, SessionEnd::Finished);
        match &outcome.end {
            SessionEnd::Finished => {
                tracing::info!("reporting limit reached: {:?}", outcome.report);
            }
            SessionEnd::Cancelled => {}
            SessionEnd::Rejoin { roster_id } => {
                outcome.report.resync_reason = Some(format!("node {} joined", roster_id));
            }
            SessionEnd::Failed {
                error,
                offenders,
                eject,
            } => {
                tracing::warn!(
                    "protocol run failed ({}): {}; offenders: {:?}",
                    error.kind(),
                    error,
                    offenders
                );
                let mut banned = self.banned.lock();
                for pk in eject {
                    tracing::warn!("ejecting trustee {}", pk);
                    banned.insert(*pk);
                }
                outcome.report.resync_reason = Some(error.to_string());
            }
        }
        self.reports.push(outcome.report);
        self.teardown();
        finished
    }

    /// Tells every participant to reconnect and forgets all of them.
    fn teardown(&mut self) {
        let drained = self.waiting.lock().drain();
        for p in drained {
            let _ = p.connection.outbound().try_send(Message::Shutdown);
            p.connection.close();
        }
        self.settle = None;

        let mut state = self.state.lock();
        let steps: &[RelayState] = match *state {
            RelayState::Setup => &[RelayState::Resync, RelayState::Idle],
            RelayState::Running | RelayState::Resync | RelayState::Authenticating => {
                &[RelayState::Idle]
            }
            RelayState::Idle => &[],
        };
        for step in steps {
            if let Err(e) = state.transition(*step) {
                tracing::error!("{}", e);
            }
        }
    }
}

async fn wait_outcome(
    running: &mut Option<Running>,
) -> Result<SessionOutcome, tokio::task::JoinError> {
    match running {
        Some(running) => (&mut running.handle).await,
        None => std::future::pending().await,
    }
}

async fn wait_settle(settle: Option<Instant>) {
    match settle {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

