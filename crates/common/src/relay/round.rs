//! Per-round fan-in, decode and window policy.
//!
//! The coordinator is synchronous: the session task feeds it cells and
//! clock readings and performs whatever I/O its return values call for.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::config::DcNetType;
use crate::crypto::Suite;
use crate::dcnet::cell::{self, CellError, Chunk, PACKET_LATENCY};
use crate::dcnet::{Accumulator, History, RelayCodec};
use crate::error::ProtocolError;
use crate::roster::ParticipantRef;

/// Never opened, so `round + 1` always fits.
pub const LAST_ROUND: u32 = u32::MAX;

/// Rounds a trustee may run past `2·W` before its cells are refused; covers
/// what is in flight when a pause reaches it.
pub const TRUSTEE_LEAD_SLACK: u32 = 1024;

#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub n_clients: usize,
    pub n_trustees: usize,
    pub up_cell_size: usize,
    pub window_size: u32,
    pub dcnet_type: DcNetType,
    pub round_timeout: Duration,
    /// 0 runs forever
    pub reporting_limit: u32,
    /// 0 never gives up on garbled plaintexts
    pub max_consecutive_failed_rounds: u32,
}

/// Counters of one protocol run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub rounds_opened: u32,
    pub client_cells: u64,
    pub trustee_cells: u64,
    pub decoded_rounds: u32,
    pub empty_plaintexts: u32,
    pub forwarded_plaintexts: u32,
    pub garbled_plaintexts: u32,
    pub latency_probes: u32,
    pub late_cells: u64,
    pub resync_reason: Option<String>,
}

/// A round the session must now broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub round: u32,
    pub payload: Bytes,
    /// Set for the equivocation codec; trustees fold it into their history
    pub digest: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plaintext {
    Empty,
    Data(Chunk),
    Latency { conn_id: u32, sent_ms: u64 },
    Garbled(CellError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub round: u32,
    pub plaintext: Plaintext,
}

#[derive(Debug)]
struct OpenRound {
    round: u32,
    acc: Accumulator,
    clients: Vec<bool>,
    trustees: Vec<bool>,
    deadline: Instant,
    downstream: Bytes,
}

impl OpenRound {
    fn complete(&self) -> bool {
        self.clients.iter().all(|c| *c) && self.trustees.iter().all(|t| *t)
    }

    fn missing(&self) -> Vec<ParticipantRef> {
        let trustees = self
            .trustees
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(j, _)| ParticipantRef::trustee(j as u32));
        let clients = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(i, _)| ParticipantRef::client(i as u32));
        trustees.chain(clients).collect()
    }
}

#[derive(Debug)]
pub struct RoundCoordinator {
    suite: Suite,
    config: RoundConfig,
    codec: RelayCodec,
    next_open: u32,
    next_decode: u32,
    open: VecDeque<OpenRound>,
    /// Trustee cells for rounds not yet opened
    early: BTreeMap<u32, Vec<Option<Bytes>>>,
    /// Next round each trustee has not sent yet
    trustee_next: Vec<u32>,
    paused: Vec<bool>,
    consecutive_failures: u32,
    report: RelayReport,
}

impl RoundCoordinator {
    pub fn new(suite: Suite, config: RoundConfig) -> Self {
        let codec = RelayCodec::new(suite, config.dcnet_type, config.up_cell_size);
        Self {
            suite,
            codec,
            next_open: 0,
            next_decode: 0,
            open: VecDeque::new(),
            early: BTreeMap::new(),
            trustee_next: vec![0; config.n_trustees],
            paused: vec![false; config.n_trustees],
            consecutive_failures: 0,
            report: RelayReport::default(),
            config,
        }
    }

    pub fn report(&self) -> &RelayReport {
        &self.report
    }

    pub fn into_report(self) -> RelayReport {
        self.report
    }

    /// The oldest round not yet decoded.
    pub fn next_decode(&self) -> u32 {
        self.next_decode
    }

    pub fn next_open(&self) -> u32 {
        self.next_open
    }

    pub fn finished(&self) -> bool {
        self.config.reporting_limit > 0 && self.next_decode >= self.config.reporting_limit
    }

    pub fn can_open(&self) -> bool {
        let within_limit =
            self.config.reporting_limit == 0 || self.next_open < self.config.reporting_limit;
        within_limit
            && self.next_open < LAST_ROUND
            && (self.open.len() as u32) < self.config.window_size
    }

    /// Every round number has been used; only a new run can continue.
    pub fn exhausted(&self) -> bool {
        self.next_decode == LAST_ROUND
    }

    /// Opens the next round with `payload` as its downstream.
    pub fn open_round(&mut self, payload: Bytes, now: Instant) -> Option<Opened> {
        if !self.can_open() {
            return None;
        }
        let round = self.next_open;
        self.next_open += 1;
        self.report.rounds_opened += 1;

        let mut open = OpenRound {
            round,
            acc: self.codec.accumulator(),
            clients: vec![false; self.config.n_clients],
            trustees: vec![false; self.config.n_trustees],
            deadline: now + self.config.round_timeout,
            downstream: payload.clone(),
        };
        if let Some(cells) = self.early.remove(&round) {
            for (j, cell) in cells.into_iter().enumerate() {
                if let Some(cell) = cell {
                    // sizes were checked when the cell was buffered
                    if self.codec.add(&mut open.acc, &cell).is_ok() {
                        open.trustees[j] = true;
                    }
                }
            }
        }
        self.open.push_back(open);

        let digest = match self.config.dcnet_type {
            DcNetType::Plain => None,
            DcNetType::Equivocation => Some(History::digest(&self.suite, &payload)),
        };
        Some(Opened {
            round,
            payload,
            digest,
        })
    }

    /// The downstream of a round still open, for retransmission.
    pub fn downstream(&self, round: u32) -> Option<Bytes> {
        self.find(round).map(|o| o.downstream.clone())
    }

    pub fn on_client_cell(
        &mut self,
        client_id: u32,
        round: u32,
        cell: &[u8],
    ) -> Result<(), ProtocolError> {
        let i = client_id as usize;
        if i >= self.config.n_clients {
            return Err(ProtocolError::MalformedFrame(format!(
                "unknown client id {}",
                client_id
            )));
        }
        if round < self.next_decode {
            self.report.late_cells += 1;
            return Ok(());
        }
        if round >= self.next_open {
            return Err(ProtocolError::MalformedFrame(format!(
                "client {} sent a cell for unopened round {}",
                client_id, round
            )));
        }
        self.check_size(cell)?;
        let codec = &self.codec;
        let open = self
            .open
            .iter_mut()
            .find(|o| o.round == round)
            .ok_or_else(|| ProtocolError::MalformedFrame(format!("round {} not open", round)))?;
        if open.clients[i] {
            return Err(ProtocolError::MalformedFrame(format!(
                "duplicate cell from client {} in round {}",
                client_id, round
            )));
        }
        codec.add(&mut open.acc, cell)?;
        open.clients[i] = true;
        Ok(())
    }

    /// Adds a trustee cell, buffering it when its round is not open yet.
    /// Returns a rate change for that trustee if it ran too far ahead.
    pub fn on_trustee_cell(
        &mut self,
        trustee_id: u32,
        round: u32,
        cell: &[u8],
    ) -> Result<Option<u32>, ProtocolError> {
        let j = trustee_id as usize;
        if j >= self.config.n_trustees {
            return Err(ProtocolError::MalformedFrame(format!(
                "unknown trustee id {}",
                trustee_id
            )));
        }
        if round < self.next_decode {
            self.report.late_cells += 1;
            return Ok(None);
        }
        let lead = round - self.next_decode;
        if lead >= self.max_trustee_lead() {
            return Err(ProtocolError::ResourceExhausted(format!(
                "trustee {} sent round {}, {} rounds past round {}",
                trustee_id, round, lead, self.next_decode
            )));
        }
        self.check_size(cell)?;
        let duplicate = || {
            ProtocolError::MalformedFrame(format!(
                "duplicate cell from trustee {} in round {}",
                trustee_id, round
            ))
        };

        if round >= self.next_open {
            let slots = self
                .early
                .entry(round)
                .or_insert_with(|| vec![None; self.config.n_trustees]);
            if slots[j].is_some() {
                return Err(duplicate());
            }
            slots[j] = Some(Bytes::copy_from_slice(cell));
        } else {
            let codec = &self.codec;
            let open = self
                .open
                .iter_mut()
                .find(|o| o.round == round)
                .ok_or_else(|| {
                    ProtocolError::MalformedFrame(format!("round {} not open", round))
                })?;
            if open.trustees[j] {
                return Err(duplicate());
            }
            codec.add(&mut open.acc, cell)?;
            open.trustees[j] = true;
        }

        self.trustee_next[j] = self.trustee_next[j].max(round.saturating_add(1));
        let lead = self.trustee_next[j].saturating_sub(self.next_decode);
        if !self.paused[j] && lead > self.config.window_size.saturating_mul(2) {
            self.paused[j] = true;
            return Ok(Some(0));
        }
        Ok(None)
    }

    /// Decodes every complete round at the front of the window, in order.
    pub fn poll_decoded(&mut self) -> Result<Vec<Decoded>, ProtocolError> {
        let mut out = Vec::new();
        while self.open.front().map(|o| o.complete()).unwrap_or(false) {
            let open = match self.open.pop_front() {
                Some(open) => open,
                None => break,
            };
            self.next_decode = open.round + 1;
            self.report.decoded_rounds += 1;
            self.report.client_cells += self.config.n_clients as u64;
            self.report.trustee_cells += self.config.n_trustees as u64;

            let plaintext = self.codec.decode(open.acc);
            let plaintext = match cell::decode(self.config.up_cell_size, &plaintext) {
                Ok(None) => {
                    self.report.empty_plaintexts += 1;
                    Plaintext::Empty
                }
                Ok(Some(chunk)) if chunk.packet_type == PACKET_LATENCY => {
                    self.report.latency_probes += 1;
                    let mut ms = [0u8; 8];
                    let n = chunk.data.len().min(8);
                    ms[8 - n..].copy_from_slice(&chunk.data[..n]);
                    Plaintext::Latency {
                        conn_id: chunk.conn_id,
                        sent_ms: u64::from_be_bytes(ms),
                    }
                }
                Ok(Some(chunk)) => {
                    self.report.forwarded_plaintexts += 1;
                    Plaintext::Data(chunk)
                }
                Err(e) => {
                    self.report.garbled_plaintexts += 1;
                    Plaintext::Garbled(e)
                }
            };

            if matches!(plaintext, Plaintext::Garbled(_)) {
                self.consecutive_failures += 1;
                let max = self.config.max_consecutive_failed_rounds;
                if max > 0 && self.consecutive_failures >= max {
                    return Err(ProtocolError::CryptoInvariant(format!(
                        "{} consecutive rounds decoded to garbage, last was round {}",
                        self.consecutive_failures, open.round
                    )));
                }
            } else {
                self.consecutive_failures = 0;
            }
            out.push(Decoded {
                round: open.round,
                plaintext,
            });
        }
        Ok(out)
    }

    /// Trustees that were paused and have fallen back within the window.
    pub fn resumable(&mut self) -> Vec<u32> {
        let window = self.config.window_size;
        let mut out = Vec::new();
        for j in 0..self.paused.len() {
            let lead = self.trustee_next[j].saturating_sub(self.next_decode);
            if self.paused[j] && lead < window {
                self.paused[j] = false;
                out.push(j as u32);
            }
        }
        out
    }

    /// Deadline of the oldest open round.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open.front().map(|o| o.deadline)
    }

    /// Fails the run when the oldest open round is past its deadline.
    pub fn check_timeout(&self, now: Instant) -> Result<(), ProtocolError> {
        match self.open.front() {
            Some(open) if now >= open.deadline => Err(ProtocolError::RoundTimeout {
                round: open.round,
                offenders: open.missing(),
            }),
            _ => Ok(()),
        }
    }

    /// Furthest a trustee cell may be ahead of the oldest undecoded round.
    pub fn max_trustee_lead(&self) -> u32 {
        self.config
            .window_size
            .saturating_mul(2)
            .saturating_add(TRUSTEE_LEAD_SLACK)
    }

    fn find(&self, round: u32) -> Option<&OpenRound> {
        self.open.iter().find(|o| o.round == round)
    }

    fn check_size(&self, cell: &[u8]) -> Result<(), ProtocolError> {
        if cell.len() != self.codec.cipher_size() {
            return Err(ProtocolError::MalformedFrame(format!(
                "cell of {} bytes, expected {}",
                cell.len(),
                self.codec.cipher_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::dcnet::{ClientCodec, TrusteeCodec};
    use crate::error::ErrorKind;

    const CELL: usize = 32;

    struct Net {
        clients: Vec<ClientCodec>,
        trustees: Vec<TrusteeCodec>,
    }

    fn net(kind: DcNetType, n: usize, m: usize) -> Net {
        let suite = Suite;
        let cs: Vec<_> = (0..n).map(|_| SecretKey::generate()).collect();
        let ts: Vec<_> = (0..m).map(|_| SecretKey::generate()).collect();
        let tag = b"test session";
        Net {
            clients: cs
                .iter()
                .map(|c| {
                    let shared: Vec<_> = ts.iter().map(|t| c.shared_point(&t.public())).collect();
                    ClientCodec::new(suite, kind, CELL, &shared, tag)
                })
                .collect(),
            trustees: ts
                .iter()
                .map(|t| {
                    let shared: Vec<_> = cs.iter().map(|c| t.shared_point(&c.public())).collect();
                    TrusteeCodec::new(suite, kind, CELL, &shared, tag)
                })
                .collect(),
        }
    }

    fn config(kind: DcNetType, n: usize, m: usize, window: u32) -> RoundConfig {
        RoundConfig {
            n_clients: n,
            n_trustees: m,
            up_cell_size: CELL,
            window_size: window,
            dcnet_type: kind,
            round_timeout: Duration::from_secs(1),
            reporting_limit: 0,
            max_consecutive_failed_rounds: 3,
        }
    }

    /// Feeds one full round, `owner` sending `payload` when given.
    fn feed_round(
        coord: &mut RoundCoordinator,
        net: &mut Net,
        round: u32,
        owner: Option<(usize, &[u8])>,
    ) {
        for (j, t) in net.trustees.iter_mut().enumerate() {
            coord.on_trustee_cell(j as u32, round, &t.encode()).unwrap();
        }
        for (i, c) in net.clients.iter_mut().enumerate() {
            let payload = owner.filter(|(o, _)| *o == i).map(|(_, p)| p);
            coord
                .on_client_cell(i as u32, round, &c.encode(payload).unwrap())
                .unwrap();
        }
    }

    #[test]
    fn test_empty_rounds_decode_in_order() {
        let mut net = net(DcNetType::Plain, 2, 2);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 2, 2, 2));
        let now = Instant::now();
        assert_eq!(coord.open_round(Bytes::new(), now).unwrap().round, 0);
        assert_eq!(coord.open_round(Bytes::new(), now).unwrap().round, 1);
        assert!(coord.open_round(Bytes::new(), now).is_none());

        feed_round(&mut coord, &mut net, 0, None);
        let decoded = coord.poll_decoded().unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].plaintext, Plaintext::Empty);
        assert_eq!(coord.report().client_cells, 2);
        assert_eq!(coord.report().trustee_cells, 2);
    }

    #[test]
    fn test_later_round_waits_for_earlier() {
        let mut net = net(DcNetType::Plain, 1, 1);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 2));
        let now = Instant::now();
        coord.open_round(Bytes::new(), now);
        coord.open_round(Bytes::new(), now);

        // trustee cells are produced in order, client cells can race
        let t0 = net.trustees[0].encode();
        let t1 = net.trustees[0].encode();
        let c0 = net.clients[0].encode(None).unwrap();
        let chunk = Chunk::data(7, &b"second"[..]);
        let c1 = net.clients[0]
            .encode(Some(&cell::encode(CELL, &chunk).unwrap()))
            .unwrap();

        coord.on_trustee_cell(0, 1, &t1).unwrap();
        coord.on_client_cell(0, 1, &c1).unwrap();
        assert!(coord.poll_decoded().unwrap().is_empty());

        coord.on_trustee_cell(0, 0, &t0).unwrap();
        coord.on_client_cell(0, 0, &c0).unwrap();
        let decoded = coord.poll_decoded().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].round, 0);
        assert_eq!(decoded[1].plaintext, Plaintext::Data(chunk));
    }

    #[test]
    fn test_owner_payload_is_recovered_with_equivocation() {
        let mut net = net(DcNetType::Equivocation, 3, 2);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Equivocation, 3, 2, 1));
        let chunk = Chunk::data(0x42, &b"HELLO PRIFI"[..]);
        let plaintext = cell::encode(CELL, &chunk).unwrap();

        let opened = coord.open_round(Bytes::new(), Instant::now()).unwrap();
        let digest = opened.digest.unwrap();
        for c in net.clients.iter_mut() {
            c.absorb_downstream(&opened.payload);
        }
        for t in net.trustees.iter_mut() {
            t.absorb_digest(&digest);
        }
        feed_round(&mut coord, &mut net, 0, Some((1, &plaintext)));
        let decoded = coord.poll_decoded().unwrap();
        assert_eq!(decoded[0].plaintext, Plaintext::Data(chunk));
        assert_eq!(coord.report().forwarded_plaintexts, 1);
    }

    #[test]
    fn test_late_and_duplicate_cells() {
        let mut net = net(DcNetType::Plain, 1, 1);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        coord.open_round(Bytes::new(), Instant::now());

        let cell = net.clients[0].encode(None).unwrap();
        coord.on_client_cell(0, 0, &cell).unwrap();
        let err = coord.on_client_cell(0, 0, &cell).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFrame);

        coord.on_trustee_cell(0, 0, &net.trustees[0].encode()).unwrap();
        coord.poll_decoded().unwrap();

        // round 0 is decoded: a late cell is dropped, not an error
        coord.on_client_cell(0, 0, &cell).unwrap();
        assert_eq!(coord.report().late_cells, 1);
        assert_eq!(coord.report().decoded_rounds, 1);
    }

    #[test]
    fn test_client_cell_for_unopened_round() {
        let mut net = net(DcNetType::Plain, 1, 1);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        coord.open_round(Bytes::new(), Instant::now());
        let err = coord
            .on_client_cell(0, 3, &net.clients[0].encode(None).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFrame);
    }

    #[test]
    fn test_wrong_cell_size() {
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        coord.open_round(Bytes::new(), Instant::now());
        let err = coord.on_client_cell(0, 0, &[0u8; CELL + 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFrame);
    }

    #[test]
    fn test_trustee_ahead_is_paused_then_resumed() {
        let mut net = net(DcNetType::Plain, 1, 1);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        let now = Instant::now();
        coord.open_round(Bytes::new(), now);

        let mut changes = Vec::new();
        for round in 0..4 {
            if let Some(w) = coord
                .on_trustee_cell(0, round, &net.trustees[0].encode())
                .unwrap()
            {
                changes.push((round, w));
            }
        }
        // lead 3 exceeds 2W = 2 at round 2
        assert_eq!(changes, vec![(2, 0)]);

        for round in 0..4 {
            coord
                .on_client_cell(0, round, &net.clients[0].encode(None).unwrap())
                .unwrap();
            assert_eq!(coord.poll_decoded().unwrap().len(), 1);
            let resumed = coord.resumable();
            if round < 3 {
                assert!(resumed.is_empty());
            } else {
                assert_eq!(resumed, vec![0]);
            }
            coord.open_round(Bytes::new(), now);
        }
    }

    #[test]
    fn test_round_numbers_run_out() {
        let mut net = net(DcNetType::Plain, 1, 1);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 2));
        coord.next_open = LAST_ROUND - 1;
        coord.next_decode = LAST_ROUND - 1;
        let now = Instant::now();
        assert_eq!(
            coord.open_round(Bytes::new(), now).unwrap().round,
            LAST_ROUND - 1
        );
        assert!(!coord.can_open());
        assert!(coord.open_round(Bytes::new(), now).is_none());

        feed_round(&mut coord, &mut net, LAST_ROUND - 1, None);
        assert_eq!(coord.poll_decoded().unwrap().len(), 1);
        assert!(coord.exhausted());
    }

    #[test]
    fn test_trustee_round_far_in_the_future_is_refused() {
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        coord.open_round(Bytes::new(), Instant::now());

        let err = coord.on_trustee_cell(0, u32::MAX, &[0u8; CELL]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(coord.early.is_empty());
        assert_eq!(coord.trustee_next[0], 0);

        // the trustee can still send the round that is due
        assert_eq!(coord.on_trustee_cell(0, 0, &[0u8; CELL]).unwrap(), None);
    }

    #[test]
    fn test_early_buffer_is_bounded_by_the_lead() {
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        let max_lead = coord.max_trustee_lead();
        assert_eq!(max_lead, 2 + TRUSTEE_LEAD_SLACK);

        let mut pauses = 0;
        for round in 0..max_lead {
            if coord.on_trustee_cell(0, round, &[0u8; CELL]).unwrap().is_some() {
                pauses += 1;
            }
        }
        assert_eq!(pauses, 1);
        assert_eq!(coord.early.len(), max_lead as usize);

        let err = coord
            .on_trustee_cell(0, max_lead, &[0u8; CELL])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("trustee 0"));
        assert_eq!(coord.early.len(), max_lead as usize);

        // decoding round 0 moves the bound by one
        coord.open_round(Bytes::new(), Instant::now());
        coord.on_client_cell(0, 0, &[0u8; CELL]).unwrap();
        assert_eq!(coord.poll_decoded().unwrap().len(), 1);
        assert!(coord.on_trustee_cell(0, max_lead, &[0u8; CELL]).is_ok());
    }

    #[test]
    fn test_timeout_names_missing_trustee() {
        let mut net = net(DcNetType::Plain, 2, 2);
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 2, 2, 1));
        let start = Instant::now();
        coord.open_round(Bytes::new(), start);
        coord.on_trustee_cell(1, 0, &net.trustees[1].encode()).unwrap();
        for i in 0..2 {
            coord
                .on_client_cell(i, 0, &net.clients[i as usize].encode(None).unwrap())
                .unwrap();
        }

        assert!(coord.check_timeout(start).is_ok());
        let err = coord
            .check_timeout(start + Duration::from_secs(2))
            .unwrap_err();
        assert_eq!(err.to_string(), "round 0 timed out waiting on trustee 0");
        assert_eq!(err.kind(), ErrorKind::RoundTimeout);
    }

    #[test]
    fn test_reporting_limit_stops_opening() {
        let mut net = net(DcNetType::Plain, 1, 1);
        let mut cfg = config(DcNetType::Plain, 1, 1, 3);
        cfg.reporting_limit = 2;
        let mut coord = RoundCoordinator::new(Suite, cfg);
        let now = Instant::now();
        assert!(coord.open_round(Bytes::new(), now).is_some());
        assert!(coord.open_round(Bytes::new(), now).is_some());
        assert!(coord.open_round(Bytes::new(), now).is_none());
        feed_round(&mut coord, &mut net, 0, None);
        feed_round(&mut coord, &mut net, 1, None);
        coord.poll_decoded().unwrap();
        assert!(coord.finished());
        assert_eq!(coord.report().decoded_rounds, 2);
    }

    #[test]
    fn test_consecutive_garbage_forces_resync() {
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        // id 1, declared length far beyond the cell
        let mut garbage = vec![0u8; CELL];
        garbage[3] = 1;
        garbage[4] = 0xff;
        let now = Instant::now();
        let mut result = Ok(Vec::new());
        for round in 0..3 {
            coord.open_round(Bytes::new(), now);
            coord.on_trustee_cell(0, round, &[0u8; CELL]).unwrap();
            coord.on_client_cell(0, round, &garbage).unwrap();
            result = coord.poll_decoded();
            if round < 2 {
                assert!(matches!(
                    result.as_ref().unwrap()[0].plaintext,
                    Plaintext::Garbled(_)
                ));
            }
        }
        assert_eq!(result.unwrap_err().kind(), ErrorKind::CryptoInvariant);
    }

    #[test]
    fn test_latency_probe_is_not_forwarded() {
        let mut coord = RoundCoordinator::new(Suite, config(DcNetType::Plain, 1, 1, 1));
        let probe = Chunk {
            conn_id: 9,
            packet_type: PACKET_LATENCY,
            data: Bytes::copy_from_slice(&1234u64.to_be_bytes()),
        };
        coord.open_round(Bytes::new(), Instant::now());
        coord.on_trustee_cell(0, 0, &[0u8; CELL]).unwrap();
        coord
            .on_client_cell(0, 0, &cell::encode(CELL, &probe).unwrap())
            .unwrap();
        let decoded = coord.poll_decoded().unwrap();
        assert_eq!(
            decoded[0].plaintext,
            Plaintext::Latency {
                conn_id: 9,
                sent_ms: 1234
            }
        );
        assert_eq!(coord.report().forwarded_plaintexts, 0);
    }
}
