//! In-memory replica state.
//!
//! Everything mutable lives in one aggregate behind a single mutex; handlers
//! and periodic tasks keep their critical sections short and perform I/O
//! after releasing it. The buffered log is a contiguous window of records:
//! if non-empty, its last timestamp is always `next_ts - 1`.

use crate::raft::framed::FramedFile;
use crate::raft::pb::{LogRecord, Response};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    /// Numeric code exported through metrics.
    pub fn code(&self) -> i64 {
        match self {
            Role::Follower => 0,
            Role::Leader => 1,
            Role::Candidate => 2,
        }
    }
}

/// Reception progress of a chunked recovery snapshot.
pub struct SnapshotReception {
    pub id: (u64, i64),
    pub remaining: u64,
    pub io: FramedFile,
}

pub struct State {
    pub id: u64,
    pub current_term: u64,
    pub role: Role,
    pub leader_id: Option<u64>,

    pub next_ts: i64,
    pub durable_ts: i64,
    pub applied_ts: i64,
    pub read_barrier_ts: i64,

    pub voted_for_me: HashSet<u64>,
    pub next_timestamps: Vec<i64>,
    pub durable_timestamps: Vec<i64>,
    pub follower_heartbeats: Vec<Instant>,
    pub latest_heartbeat: Instant,

    pub buffered_log: Vec<LogRecord>,
    pub flushed_index: usize,
    pub flush_waiters: Vec<oneshot::Sender<bool>>,
    pub commit_subscribers: BTreeMap<i64, oneshot::Sender<bool>>,

    pub fsm: BTreeMap<Vec<u8>, Vec<u8>>,
    pub current_changelog: u64,
    pub reception: Option<SnapshotReception>,
}

impl State {
    pub fn new(id: u64, members: usize) -> Self {
        let now = Instant::now();
        State {
            id,
            current_term: 0,
            role: Role::Candidate,
            leader_id: None,
            next_ts: 0,
            durable_ts: -1,
            applied_ts: -1,
            read_barrier_ts: -1,
            voted_for_me: HashSet::new(),
            next_timestamps: vec![0; members],
            durable_timestamps: vec![-1; members],
            follower_heartbeats: vec![now; members],
            latest_heartbeat: now,
            buffered_log: Vec::new(),
            flushed_index: 0,
            flush_waiters: Vec::new(),
            commit_subscribers: BTreeMap::new(),
            fsm: BTreeMap::new(),
            current_changelog: 0,
            reception: None,
        }
    }

    pub fn create_response(&self, success: bool) -> Response {
        Response {
            term: self.current_term,
            durable_ts: self.durable_ts,
            next_ts: self.next_ts,
            success,
        }
    }

    /// The buffered record with timestamp `ts`, if it is inside the window.
    pub fn buffered_at(&self, ts: i64) -> Option<&LogRecord> {
        let first = self.buffered_log.first()?.ts;
        if ts < first {
            return None;
        }
        self.buffered_log.get((ts - first) as usize)
    }

    /// Apply buffered records with timestamps up to and including `ts`.
    pub fn advance_to(&mut self, ts: i64) {
        let State {
            buffered_log,
            fsm,
            applied_ts,
            ..
        } = self;
        let first = match buffered_log.first() {
            Some(record) => record.ts,
            None => return,
        };
        let old_ts = *applied_ts;
        let mut pos = *applied_ts - first + 1;
        while pos >= 0 && (pos as usize) < buffered_log.len() && buffered_log[pos as usize].ts <= ts
        {
            let record = &buffered_log[pos as usize];
            for op in &record.operations {
                fsm.insert(op.key.clone(), op.value.clone());
            }
            *applied_ts = record.ts;
            pos += 1;
        }
        if old_ts < *applied_ts {
            log::debug!("advanced applied_ts from {} to {}", old_ts, *applied_ts);
        }
    }

    /// Advance the applied timestamp to the majority-durable timestamp:
    /// substitute this node's slot with the local durable_ts, sort, take the
    /// middle element.
    pub fn advance_applied_timestamp(&mut self) {
        self.durable_timestamps[self.id as usize] = self.durable_ts;
        let mut timestamps = self.durable_timestamps.clone();
        timestamps.sort_unstable();
        let ts = timestamps[timestamps.len() / 2];
        self.advance_to(ts);
    }

    /// Drain commit subscribers whose timestamp is now applied, in ts order.
    pub fn pick_subscribers(&mut self) -> Vec<oneshot::Sender<bool>> {
        let mut subscribers = Vec::new();
        while let Some(entry) = self.commit_subscribers.first_entry() {
            if *entry.key() > self.applied_ts {
                break;
            }
            log::debug!("firing commit subscriber for ts={}", entry.key());
            subscribers.push(entry.remove());
        }
        subscribers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::pb::Operation;

    fn record(ts: i64, key: &str, value: &str) -> LogRecord {
        LogRecord {
            ts,
            operations: vec![Operation {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            }],
        }
    }

    #[test]
    fn test_buffered_at_window() {
        let mut state = State::new(0, 3);
        state.buffered_log = vec![record(3, "a", "1"), record(4, "b", "2")];
        state.next_ts = 5;

        assert!(state.buffered_at(2).is_none());
        assert_eq!(state.buffered_at(3).unwrap().ts, 3);
        assert_eq!(state.buffered_at(4).unwrap().ts, 4);
        assert!(state.buffered_at(5).is_none());
    }

    #[test]
    fn test_advance_to_applies_prefix() {
        let mut state = State::new(0, 3);
        state.buffered_log = vec![
            record(0, "a", "1"),
            record(1, "a", "2"),
            record(2, "b", "3"),
        ];
        state.next_ts = 3;

        state.advance_to(1);
        assert_eq!(state.applied_ts, 1);
        assert_eq!(state.fsm.get(b"a".as_slice()), Some(&b"2".to_vec()));
        assert_eq!(state.fsm.get(b"b".as_slice()), None);

        state.advance_to(5);
        assert_eq!(state.applied_ts, 2);
        assert_eq!(state.fsm.get(b"b".as_slice()), Some(&b"3".to_vec()));
    }

    #[test]
    fn test_advance_to_skips_disjoint_window() {
        let mut state = State::new(0, 3);
        state.buffered_log = vec![record(5, "a", "1")];
        state.next_ts = 6;

        // applied_ts is -1; position 5 is unreachable without the gap filled.
        state.advance_to(5);
        assert_eq!(state.applied_ts, -1);
        assert!(state.fsm.is_empty());
    }

    #[test]
    fn test_advance_applied_timestamp_uses_median() {
        let mut state = State::new(0, 3);
        state.buffered_log = vec![record(0, "a", "1"), record(1, "a", "2")];
        state.next_ts = 2;
        state.durable_ts = 1;
        state.durable_timestamps = vec![-1, 0, -1];

        state.advance_applied_timestamp();
        // sorted [-1, 0, 1] -> median 0
        assert_eq!(state.applied_ts, 0);

        state.durable_timestamps[2] = 1;
        state.advance_applied_timestamp();
        // sorted [0 -> replaced by self durable 1, 1, 1] -> median 1
        assert_eq!(state.applied_ts, 1);
    }

    #[test]
    fn test_pick_subscribers_in_order() {
        let mut state = State::new(0, 3);
        let (tx0, mut rx0) = oneshot::channel();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        state.commit_subscribers.insert(0, tx0);
        state.commit_subscribers.insert(1, tx1);
        state.commit_subscribers.insert(2, tx2);

        state.applied_ts = 1;
        let picked = state.pick_subscribers();
        assert_eq!(picked.len(), 2);
        for subscriber in picked {
            subscriber.send(true).unwrap();
        }
        assert_eq!(rx0.try_recv().unwrap(), true);
        assert_eq!(rx1.try_recv().unwrap(), true);
        assert!(rx2.try_recv().is_err());
        assert_eq!(state.commit_subscribers.len(), 1);
    }
}
