use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::dcnet::cell::Chunk;

/// One downstream as received over TCP or UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downstream {
    pub round: u32,
    pub payload: Bytes,
    pub flag_resync: bool,
}

/// Puts downstreams back in round order and decides when to NACK.
///
/// A round counts as lost when a later one has arrived without it, or when
/// nothing has been delivered for the retry interval.
#[derive(Debug)]
pub struct DownstreamSequencer {
    next: u32,
    buffer: BTreeMap<u32, Downstream>,
    last_progress: Instant,
    last_nack: Option<(u32, Instant)>,
}

impl DownstreamSequencer {
    pub fn new(now: Instant) -> Self {
        Self {
            next: 0,
            buffer: BTreeMap::new(),
            last_progress: now,
            last_nack: None,
        }
    }

    /// The round the node is waiting for.
    pub fn next_round(&self) -> u32 {
        self.next
    }

    /// Buffers `downstream`; false for rounds already seen.
    pub fn push(&mut self, downstream: Downstream) -> bool {
        if downstream.round < self.next || self.buffer.contains_key(&downstream.round) {
            return false;
        }
        self.buffer.insert(downstream.round, downstream);
        true
    }

    /// Takes the next downstream in order, if it has arrived.
    pub fn pop_ready(&mut self, now: Instant) -> Option<Downstream> {
        let downstream = self.buffer.remove(&self.next)?;
        self.next = self.next.saturating_add(1);
        self.last_progress = now;
        Some(downstream)
    }

    /// The round to NACK now, if any. Repeats at most once per `retry`.
    pub fn nack_due(&mut self, now: Instant, retry: Duration) -> Option<u32> {
        let gap = self
            .buffer
            .keys()
            .next()
            .map(|first| *first > self.next)
            .unwrap_or(false);
        let stalled = now.duration_since(self.last_progress) >= retry;
        if !gap && !stalled {
            return None;
        }
        match self.last_nack {
            Some((round, at)) if round == self.next && now.duration_since(at) < retry => None,
            _ => {
                self.last_nack = Some((self.next, now));
                Some(self.next)
            }
        }
    }
}

/// Upstream chunks waiting for an owned slot. Holds at most `capacity`
/// chunks; pushing into a full queue drops the oldest.
#[derive(Debug, Clone)]
pub struct UpstreamQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Debug)]
struct QueueInner {
    chunks: VecDeque<Chunk>,
    capacity: usize,
    dropped: u64,
}

impl UpstreamQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                chunks: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    /// Queues `chunk`, returning the chunk it evicted.
    pub fn push(&self, chunk: Chunk) -> Option<Chunk> {
        let mut inner = self.inner.lock();
        let evicted = if inner.chunks.len() >= inner.capacity {
            inner.dropped += 1;
            inner.chunks.pop_front()
        } else {
            None
        };
        inner.chunks.push_back(chunk);
        evicted
    }

    pub fn pop(&self) -> Option<Chunk> {
        self.inner.lock().chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Applies a run's window; excess chunks are dropped oldest first.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        while inner.chunks.len() > inner.capacity {
            inner.chunks.pop_front();
            inner.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down(round: u32) -> Downstream {
        Downstream {
            round,
            payload: Bytes::from(vec![round as u8; 4]),
            flag_resync: false,
        }
    }

    #[test]
    fn test_reorders_and_dedupes() {
        let now = Instant::now();
        let mut seq = DownstreamSequencer::new(now);
        assert!(seq.push(down(1)));
        assert!(seq.pop_ready(now).is_none());
        assert!(seq.push(down(0)));
        assert!(!seq.push(down(0)));
        assert_eq!(seq.pop_ready(now).unwrap().round, 0);
        assert_eq!(seq.pop_ready(now).unwrap().round, 1);
        assert!(!seq.push(down(1)));
        assert_eq!(seq.next_round(), 2);
    }

    #[test]
    fn test_lost_datagram_is_nacked_once() {
        let start = Instant::now();
        let retry = Duration::from_millis(500);
        let mut seq = DownstreamSequencer::new(start);
        for round in 0..7 {
            seq.push(down(round));
            seq.pop_ready(start).unwrap();
        }
        // round 7 never arrives over UDP
        seq.push(down(8));
        assert_eq!(seq.nack_due(start, retry), Some(7));
        assert_eq!(seq.nack_due(start, retry), None);
        assert_eq!(seq.nack_due(start + retry, retry), Some(7));

        // the TCP resend fills the gap and both rounds come out in order
        seq.push(down(7));
        assert_eq!(seq.pop_ready(start).unwrap().round, 7);
        assert_eq!(seq.pop_ready(start).unwrap().round, 8);
        assert_eq!(seq.nack_due(start, retry), None);
    }

    #[test]
    fn test_stall_triggers_nack() {
        let start = Instant::now();
        let retry = Duration::from_millis(100);
        let mut seq = DownstreamSequencer::new(start);
        assert_eq!(seq.nack_due(start, retry), None);
        assert_eq!(seq.nack_due(start + retry, retry), Some(0));
    }

    #[test]
    fn test_queue_drops_oldest() {
        let queue = UpstreamQueue::new(2);
        assert!(queue.push(Chunk::data(1, &b"a"[..])).is_none());
        assert!(queue.push(Chunk::data(1, &b"b"[..])).is_none());
        let evicted = queue.push(Chunk::data(1, &b"c"[..])).unwrap();
        assert_eq!(evicted.data.as_ref(), b"a");
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().unwrap().data.as_ref(), b"b");
        assert_eq!(queue.pop().unwrap().data.as_ref(), b"c");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shrinking_capacity() {
        let queue = UpstreamQueue::new(4);
        for i in 0..4u8 {
            queue.push(Chunk::data(1, vec![i]));
        }
        queue.set_capacity(1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().data.as_ref(), &[3]);
    }
}
