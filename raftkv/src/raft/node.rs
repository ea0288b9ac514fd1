//! The replica node: RPC handlers and the five periodic tasks (elector,
//! flusher, rotator, heartbeat sender, stale-peer recovery agent).
//!
//! All mutable state sits behind one mutex; critical sections copy out what
//! the network or the disk needs and release before performing I/O. The
//! changelog file has its own mutex and is always locked before the state.

use crate::kv_service::pb::{client_operation, ClientRequest, ClientResponse, Entry};
use crate::metrics;
use crate::raft::fatal;
use crate::raft::framed::FramedFile;
use crate::raft::pb::{AppendRpcs, LogRecord, Operation, RecoverySnapshot, Response, VoteRpc};
use crate::raft::periodic::Periodic;
use crate::raft::state::{Role, SnapshotReception, State};
use crate::raft::storage::LogStore;
use crate::raft::vote::VoteKeeper;
use crate::raft_client::RaftClient;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// Everything the node needs from the runtime configuration.
#[derive(Clone)]
pub struct Options {
    pub id: u64,
    /// Peer addresses indexed by node id, including this node's own slot.
    pub members: Vec<String>,
    pub dir: PathBuf,
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    pub rotate_interval: Duration,
    pub flush_interval: Duration,
    pub connect_timeout: Duration,
    pub applied_backlog: i64,
    pub rpc_max_batch: usize,
    pub max_message: usize,
    pub buffer_size: usize,
}

pub struct RaftNode {
    id: u64,
    options: Options,
    pub(crate) state: Mutex<State>,
    changelog: Mutex<FramedFile>,
    vote_keeper: Mutex<VoteKeeper>,
    store: LogStore,
    peers: RaftClient,
    elector: Periodic,
    flusher: Periodic,
    rotator: Periodic,
    sender: Periodic,
    stale_agent: Periodic,
    rng: Mutex<StdRng>,
}

impl RaftNode {
    pub fn new(options: Options) -> std::io::Result<Arc<RaftNode>> {
        let store = LogStore::new(&options.dir)?;
        let vote_keeper = VoteKeeper::new(store.vote_path());
        let mut state = State::new(options.id, options.members.len());
        let changelog = Self::recover(&store, &vote_keeper, &mut state)?;
        Ok(Arc::new(RaftNode {
            id: options.id,
            state: Mutex::new(state),
            changelog: Mutex::new(changelog),
            vote_keeper: Mutex::new(vote_keeper),
            store,
            peers: RaftClient::new(&options),
            elector: Periodic::new(options.election_timeout),
            flusher: Periodic::new(options.flush_interval),
            rotator: Periodic::new(options.rotate_interval),
            sender: Periodic::new(options.heartbeat_interval),
            stale_agent: Periodic::new(options.heartbeat_interval),
            rng: Mutex::new(StdRng::seed_from_u64(options.id)),
            options,
        }))
    }

    /// Rebuild state from the newest readable snapshot and the changelog
    /// tails, then open a fresh changelog for appends.
    fn recover(
        store: &LogStore,
        vote_keeper: &VoteKeeper,
        state: &mut State,
    ) -> std::io::Result<FramedFile> {
        let mut snapshots = store.discover_snapshots()?;
        let changelogs = store.discover_changelogs()?;
        if let Some(last) = snapshots.last() {
            state.current_changelog = state.current_changelog.max(last + 1);
        }
        if let Some(last) = changelogs.last() {
            state.current_changelog = state.current_changelog.max(last + 1);
        }

        while let Some(number) = snapshots.pop() {
            if let Some(applied_ts) = store.read_snapshot(number, &mut state.fsm)? {
                state.applied_ts = applied_ts;
                state.durable_ts = applied_ts;
                state.next_ts = applied_ts + 1;
                break;
            }
            state.fsm.clear();
        }

        // Walk segments newest first; a segment whose header is at or below
        // applied_ts already covers everything still needed. A timestamp seen
        // in a newer segment supersedes copies in older ones.
        let mut tail: BTreeMap<i64, LogRecord> = BTreeMap::new();
        for number in changelogs.iter().rev() {
            let mut input = store.open_changelog(*number)?;
            let header = match input.read_i64()? {
                Some(header) => header,
                None => continue,
            };
            log::debug!("opened changelog {} limit ts={}", number, header);
            let mut segment: BTreeMap<i64, LogRecord> = BTreeMap::new();
            while let Some(record) = input.read_record::<LogRecord>()? {
                if record.ts > state.applied_ts {
                    segment.insert(record.ts, record);
                }
            }
            for (ts, record) in segment {
                tail.entry(ts).or_insert(record);
            }
            if header <= state.applied_ts {
                break;
            }
        }

        // Rebuild the buffered window as the longest contiguous run; a gap
        // would make the records behind it unreachable anyway.
        let mut expected = state.applied_ts + 1;
        for (ts, record) in tail {
            if ts != expected {
                break;
            }
            state.buffered_log.push(record);
            expected += 1;
        }
        if let Some(last) = state.buffered_log.last() {
            state.durable_ts = state.durable_ts.max(last.ts);
            state.next_ts = state.next_ts.max(last.ts + 1);
        }

        let mut changelog = store.create_changelog(state.current_changelog)?;
        changelog.write_i64(state.durable_ts)?;

        if let Some(vote) = vote_keeper.recover()? {
            state.current_term = vote.term;
            state.leader_id = Some(vote.vote_for);
        }
        log::info!(
            "recovered term={} durable_ts={} applied_ts={}",
            state.current_term,
            state.durable_ts,
            state.applied_ts
        );
        Ok(changelog)
    }

    /// Spawn the periodic tasks.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let node = Arc::clone(self);
        self.elector.spawn(shutdown.clone(), move || {
            let node = node.clone();
            async move { node.initiate_elections().await }
        });
        let node = Arc::clone(self);
        self.flusher.spawn(shutdown.clone(), move || {
            let node = node.clone();
            async move { node.flush().await }
        });
        let node = Arc::clone(self);
        self.rotator.spawn(shutdown.clone(), move || {
            let node = node.clone();
            async move { node.rotate().await }
        });
        let node = Arc::clone(self);
        self.sender.spawn(shutdown.clone(), move || {
            let node = node.clone();
            async move { node.heartbeat_to_followers().await }
        });
        let node = Arc::clone(self);
        self.stale_agent.spawn(shutdown, move || {
            let node = node.clone();
            async move { node.recover_stale_nodes().await }
        });
    }

    /// Vote request handler.
    pub fn vote(&self, rpc: VoteRpc) -> Response {
        log::info!(
            "received vote request from {} with ts={} term={}",
            rpc.vote_for,
            rpc.ts,
            rpc.term
        );
        let mut state = self.state.lock().unwrap();
        if state.current_term > rpc.term {
            return state.create_response(false);
        }
        if state.current_term < rpc.term {
            state.role = Role::Candidate;
            state.current_term = rpc.term;
            state.voted_for_me.clear();
            state.leader_id = None;
            self.elector.trigger();
        }
        if state.durable_ts > rpc.ts
            || state.leader_id.map_or(false, |leader| leader != rpc.vote_for)
        {
            log::info!(
                "denied vote for {} their ts={} my ts={}",
                rpc.vote_for,
                rpc.ts,
                state.durable_ts
            );
            return state.create_response(false);
        }
        fatal(self.vote_keeper.lock().unwrap().store(&rpc), "vote store failed");
        state.leader_id = Some(rpc.vote_for);
        log::info!("granted vote for {}", rpc.vote_for);
        state.create_response(true)
    }

    /// AppendEntries handler: heartbeat, replication and conflict truncation.
    /// The reply is deferred until the next flush completes so the reported
    /// durable_ts is never ahead of disk.
    pub async fn handle_append_rpcs(&self, msg: AppendRpcs) -> Response {
        let mut has_new_records = false;
        let flushed = {
            let mut state = self.state.lock().unwrap();
            if msg.term < state.current_term {
                return state.create_response(false);
            }
            if msg.term > state.current_term {
                log::info!("stale term, becoming follower");
                state.current_term = msg.term;
                state.role = Role::Follower;
            }
            if state.role == Role::Leader {
                log::error!(
                    "append from node {} while leading term {}",
                    msg.from,
                    state.current_term
                );
                std::process::exit(1);
            }
            state.role = Role::Follower;
            state.latest_heartbeat = Instant::now();
            state.leader_id = Some(msg.from);

            for record in msg.records {
                if record.ts <= state.applied_ts {
                    continue;
                }
                if record.ts < state.next_ts {
                    let matches = state.buffered_at(record.ts).map(|existing| *existing == record);
                    match matches {
                        // Below the buffered window: already durable here.
                        None => continue,
                        Some(true) => continue,
                        Some(false) => {
                            let first = state.buffered_log[0].ts;
                            state.buffered_log.truncate((record.ts - first) as usize);
                            let len = state.buffered_log.len();
                            state.flushed_index = state.flushed_index.min(len);
                            state.next_ts = record.ts;
                            state.durable_ts = state.durable_ts.min(record.ts - 1);
                        }
                    }
                }
                if record.ts == state.next_ts {
                    state.buffered_log.push(record);
                    state.next_ts += 1;
                    has_new_records = true;
                }
            }
            if has_new_records {
                log::debug!("handled heartbeat next_ts={}", state.next_ts);
            }
            let target = msg.applied_ts.min(state.durable_ts);
            state.advance_to(target);
            let (tx, rx) = oneshot::channel();
            state.flush_waiters.push(tx);
            rx
        };
        if has_new_records {
            self.flusher.trigger();
        }
        let _ = flushed.await;
        let state = self.state.lock().unwrap();
        state.create_response(true)
    }

    /// Chunked snapshot reception for a stale follower catching up.
    pub fn handle_recovery_snapshot(&self, msg: RecoverySnapshot) -> Response {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Follower {
            log::info!("not a follower, ignoring snapshot");
            return state.create_response(false);
        }
        if msg.applied_ts <= state.applied_ts || msg.term != state.current_term {
            log::info!(
                "ignoring snapshot ts={} term={}, my ts={} term={}",
                msg.applied_ts,
                msg.term,
                state.applied_ts,
                state.current_term
            );
            return state.create_response(false);
        }

        let id = (msg.term, msg.applied_ts);
        if state.reception.as_ref().map(|r| r.id) != Some(id) {
            if !msg.start {
                log::info!("ignoring snapshot chunk without start attribute");
                return state.create_response(false);
            }
            // A retried transfer overwrites an earlier partial file.
            let mut io = fatal(
                self.store.create_snapshot(msg.applied_ts as u64),
                "snapshot create failed",
            );
            fatal(io.write_i64(msg.size as i64), "snapshot write failed");
            fatal(io.write_i64(msg.applied_ts), "snapshot write failed");
            state.reception = Some(SnapshotReception {
                id,
                remaining: msg.size,
                io,
            });
            log::info!(
                "started writing snapshot for ts={} size={}",
                msg.applied_ts,
                msg.size
            );
        }

        {
            let State { fsm, reception, .. } = &mut *state;
            let reception = reception.as_mut().unwrap();
            for op in msg.operations {
                let record = LogRecord {
                    ts: 0,
                    operations: vec![Operation {
                        key: op.key.clone(),
                        value: op.value.clone(),
                    }],
                };
                fatal(reception.io.write_record(&record), "snapshot write failed");
                fsm.insert(op.key, op.value);
                reception.remaining = reception.remaining.saturating_sub(1);
            }
        }

        if msg.end {
            let mut reception = state.reception.take().unwrap();
            if reception.remaining != 0 {
                log::info!("failed recovery, {} parts remain", reception.remaining);
                return state.create_response(false);
            }
            fatal(reception.io.sync(), "snapshot sync failed");
            state.applied_ts = msg.applied_ts;
            state.durable_ts = state.durable_ts.max(state.applied_ts);
            state.next_ts = state.durable_ts + 1;
            // Anything still buffered predates the snapshot.
            state.buffered_log.clear();
            state.flushed_index = 0;
            log::info!("synced recovery snapshot applied_ts={}", msg.applied_ts);
        }
        state.create_response(true)
    }

    /// Client read/write requests. Followers redirect, candidates fail, and a
    /// fresh leader stays unavailable until the read barrier clears.
    pub async fn handle_client_request(&self, req: ClientRequest) -> ClientResponse {
        let commit = {
            let mut state = self.state.lock().unwrap();
            match state.role {
                Role::Follower => {
                    let mut response = ClientResponse::default();
                    if let Some(leader) = state.leader_id {
                        response.should_retry = true;
                        response.retry_to = leader;
                        log::debug!("redirecting client request to {}", leader);
                    }
                    return response;
                }
                Role::Candidate => {
                    return ClientResponse::default();
                }
                Role::Leader => {}
            }
            if state.applied_ts < state.read_barrier_ts {
                return ClientResponse::default();
            }
            let has_reads = req
                .operations
                .iter()
                .any(|op| op.r#type() == client_operation::Type::Read);
            let has_writes = req
                .operations
                .iter()
                .any(|op| op.r#type() == client_operation::Type::Write);
            if has_reads {
                if has_writes {
                    return ClientResponse::default();
                }
                let entries = req
                    .operations
                    .iter()
                    .map(|op| Entry {
                        key: op.key.clone(),
                        value: state.fsm.get(&op.key).cloned().unwrap_or_default(),
                    })
                    .collect();
                return ClientResponse {
                    success: true,
                    entries,
                    ..Default::default()
                };
            }
            let record = LogRecord {
                ts: state.next_ts,
                operations: req
                    .operations
                    .into_iter()
                    .map(|op| Operation {
                        key: op.key,
                        value: op.value,
                    })
                    .collect(),
            };
            state.next_ts += 1;
            log::debug!("handling client request ts={}", record.ts);
            let (tx, rx) = oneshot::channel();
            state.commit_subscribers.insert(record.ts, tx);
            state.buffered_log.push(record);
            rx
        };
        self.sender.trigger();
        self.flusher.trigger();
        match commit.await {
            Ok(true) => ClientResponse {
                success: true,
                ..Default::default()
            },
            _ => ClientResponse::default(),
        }
    }

    /// Election tick: start a candidacy once the leader has gone quiet.
    pub async fn initiate_elections(self: &Arc<Self>) {
        let members = self.options.members.len();
        let term = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let latest_heartbeat = if state.role == Role::Leader {
                let mut times: Vec<Instant> = (0..members as u64)
                    .filter(|peer| *peer != self.id)
                    .map(|peer| state.follower_heartbeats[peer as usize])
                    .collect();
                times.sort_unstable();
                times.get(members / 2).copied().unwrap_or(now)
            } else {
                state.latest_heartbeat
            };
            if latest_heartbeat + self.options.election_timeout > now {
                return;
            }
            log::info!("starting elections");
            state.current_term += 1;
            state.voted_for_me.clear();
            state.role = Role::Candidate;
            state.leader_id = None;
            state.latest_heartbeat = now;
            state.current_term
        };

        let delay = {
            let mut rng = self.rng.lock().unwrap();
            self.options.election_timeout.mul_f64(rng.gen_range(0.0..=0.5))
        };
        tokio::time::sleep(delay).await;

        let rpc = {
            let mut state = self.state.lock().unwrap();
            if term != state.current_term {
                return;
            }
            // Someone else already got this node's vote for the term.
            if state.leader_id.map_or(false, |leader| leader != self.id) {
                return;
            }
            state.leader_id = Some(self.id);
            let rpc = VoteRpc {
                term: state.current_term,
                ts: state.durable_ts,
                vote_for: self.id,
            };
            fatal(self.vote_keeper.lock().unwrap().store(&rpc), "vote store failed");
            state.voted_for_me.insert(self.id);
            rpc
        };

        for peer in 0..members as u64 {
            if peer == self.id {
                continue;
            }
            let node = Arc::clone(self);
            let rpc = rpc.clone();
            tokio::spawn(async move {
                if let Some(response) = node.peers.vote(peer, rpc).await {
                    node.on_vote_response(peer, response, term);
                }
            });
        }
    }

    /// Tally a vote response; assume leadership on majority.
    pub(crate) fn on_vote_response(&self, peer: u64, response: Response, term: u64) {
        if !response.success {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let slot = peer as usize;
        state.next_timestamps[slot] = state.next_timestamps[slot].max(response.next_ts);
        state.durable_timestamps[slot] = state.durable_timestamps[slot].max(response.durable_ts);
        state.follower_heartbeats[slot] = Instant::now();
        if state.current_term != term {
            return;
        }
        log::info!("granted vote from {} with durable_ts={}", peer, response.durable_ts);
        state.voted_for_me.insert(peer);
        let members = self.options.members.len();
        if state.voted_for_me.len() > members / 2 && state.role != Role::Leader {
            state.role = Role::Leader;
            state.advance_applied_timestamp();
            state.read_barrier_ts = state.durable_ts;
            log::info!(
                "becoming leader, applied up to {} barrier ts {}",
                state.applied_ts,
                state.read_barrier_ts
            );
            // Pending commits belong to a previous epoch; dropping the
            // senders fails the waiting requests.
            state.commit_subscribers.clear();
            let applied_ts = state.applied_ts;
            for ts in &mut state.durable_timestamps {
                *ts = (*ts).min(applied_ts);
            }
            state.next_timestamps = vec![applied_ts + 1; members];
        }
    }

    /// Leader heartbeat: replicate buffered records and keep followers fresh.
    pub async fn heartbeat_to_followers(self: &Arc<Self>) {
        let mut messages = Vec::new();
        {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            for peer in 0..self.options.members.len() as u64 {
                if peer == self.id {
                    continue;
                }
                let mut rpcs = AppendRpcs {
                    term: state.current_term,
                    applied_ts: state.applied_ts,
                    from: self.id,
                    records: Vec::new(),
                };
                let next_ts = state.next_timestamps[peer as usize];
                if let Some(first) = state.buffered_log.first() {
                    if next_ts >= first.ts {
                        let start = (next_ts - first.ts) as usize;
                        let end = state
                            .buffered_log
                            .len()
                            .min(start.saturating_add(self.options.rpc_max_batch));
                        if start < end {
                            rpcs.records.extend_from_slice(&state.buffered_log[start..end]);
                        }
                    }
                }
                if !rpcs.records.is_empty() {
                    log::debug!("sending {} records to {}", rpcs.records.len(), peer);
                }
                messages.push((peer, rpcs));
            }
        }
        for (peer, rpcs) in messages {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                if let Some(response) = node.peers.append_entries(peer, rpcs).await {
                    node.on_append_response(peer, response);
                }
            });
        }
    }

    /// Record follower progress from a heartbeat ack and advance the commit
    /// index. Progress only moves forward; responses may arrive out of order.
    pub(crate) fn on_append_response(&self, peer: u64, response: Response) {
        if !response.success {
            log::debug!("node {} failed heartbeat", peer);
            return;
        }
        let subscribers = {
            let mut state = self.state.lock().unwrap();
            let slot = peer as usize;
            state.next_timestamps[slot] = state.next_timestamps[slot].max(response.next_ts);
            state.durable_timestamps[slot] =
                state.durable_timestamps[slot].max(response.durable_ts);
            state.follower_heartbeats[slot] = Instant::now();
            if state.role != Role::Leader {
                return;
            }
            state.advance_applied_timestamp();
            state.pick_subscribers()
        };
        for subscriber in subscribers {
            let _ = subscriber.send(true);
        }
    }

    /// Persist pending records. A single flush writes everything buffered and
    /// always fires the flush waiters, even when there was nothing to write.
    pub async fn flush(&self) {
        let mut changelog = self.changelog.lock().unwrap();
        let (to_flush, new_durable, waiters) = {
            let mut state = self.state.lock().unwrap();
            let mut gc = 0;
            while gc < state.buffered_log.len()
                && state.buffered_log[gc].ts + self.options.applied_backlog <= state.applied_ts
            {
                gc += 1;
            }
            let to_flush: Vec<LogRecord> = state.buffered_log[state.flushed_index..].to_vec();
            if gc > 0 {
                log::debug!("erased up to ts={} record", state.buffered_log[gc - 1].ts);
            }
            state.buffered_log.drain(..gc);
            state.flushed_index = state.buffered_log.len();
            let waiters = std::mem::take(&mut state.flush_waiters);
            let new_durable = state
                .buffered_log
                .last()
                .map(|record| record.ts)
                .unwrap_or(state.durable_ts);
            (to_flush, new_durable, waiters)
        };

        if let (Some(first), Some(last)) = (to_flush.first(), to_flush.last()) {
            log::debug!("writing ts {}..={} to changelog", first.ts, last.ts);
        }
        for record in &to_flush {
            fatal(changelog.write_record(record), "changelog write failed");
        }
        fatal(changelog.sync(), "changelog sync failed");

        let subscribers = {
            let mut state = self.state.lock().unwrap();
            state.durable_ts = new_durable;
            metrics::observe_replica(
                state.current_term as i64,
                state.role.code(),
                state.durable_ts,
                state.applied_ts,
            );
            if state.role == Role::Leader {
                state.advance_applied_timestamp();
                state.pick_subscribers()
            } else {
                Vec::new()
            }
        };
        for subscriber in subscribers {
            let _ = subscriber.send(true);
        }
        for waiter in waiters {
            let _ = waiter.send(true);
        }
    }

    /// Open a fresh changelog segment, then checkpoint the applied map into a
    /// snapshot named after its applied timestamp.
    pub async fn rotate(&self) {
        let (snapshot_ts, fsm) = {
            let mut changelog = self.changelog.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            if state.applied_ts < 0 {
                return;
            }
            state.current_changelog += 1;
            let mut next = fatal(
                self.store.create_changelog(state.current_changelog),
                "changelog create failed",
            );
            fatal(next.write_i64(state.durable_ts), "changelog write failed");
            *changelog = next;
            (state.applied_ts, state.fsm.clone())
        };
        // The clone above isolates the checkpoint from concurrent writes.
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.write_snapshot(snapshot_ts, &fsm)).await {
            Ok(result) => fatal(result, "snapshot write failed"),
            Err(e) => {
                log::error!("snapshot writer failed: {}", e);
                std::process::exit(1);
            }
        }
        log::info!("wrote snapshot for applied_ts={}", snapshot_ts);
    }

    /// Ship a snapshot plus log replay to followers that fell behind the
    /// buffered window.
    pub async fn recover_stale_nodes(&self) {
        let (targets, term) = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            let horizon = state
                .buffered_log
                .first()
                .map(|record| record.ts)
                .unwrap_or(state.applied_ts);
            let mut targets = Vec::new();
            for peer in 0..self.options.members.len() as u64 {
                if peer != self.id && state.next_timestamps[peer as usize] < horizon {
                    targets.push((peer, state.next_timestamps[peer as usize]));
                }
            }
            (targets, state.current_term)
        };
        for (peer, next) in targets {
            self.recover_node(peer, next, term).await;
        }
    }

    async fn recover_node(&self, peer: u64, mut next: i64, term: u64) {
        log::info!("starting recovery for {} ts={}", peer, next);

        let mut snapshots = fatal(self.store.discover_snapshots(), "data dir listing failed");
        while let Some(number) = snapshots.pop() {
            let mut fsm = BTreeMap::new();
            let ts = match fatal(
                self.store.read_snapshot(number, &mut fsm),
                "snapshot read failed",
            ) {
                Some(ts) => ts,
                None => continue,
            };
            if ts < next {
                // The peer is already past every snapshot on disk.
                break;
            }
            log::info!("sending snapshot for ts={} to {}", ts, peer);
            if !self.send_snapshot(peer, term, ts, &fsm).await {
                return;
            }
            next = ts + 1;
            break;
        }

        log::info!("replaying logs for {} from ts={}", peer, next);
        let changelogs = fatal(self.store.discover_changelogs(), "data dir listing failed");
        let mut tail: BTreeMap<i64, LogRecord> = BTreeMap::new();
        for number in changelogs.iter().rev() {
            let mut input = fatal(self.store.open_changelog(*number), "changelog open failed");
            let header = match fatal(input.read_i64(), "changelog read failed") {
                Some(header) => header,
                None => continue,
            };
            log::debug!("opened changelog {} limit ts={}", number, header);
            let mut segment: BTreeMap<i64, LogRecord> = BTreeMap::new();
            while let Some(record) =
                fatal(input.read_record::<LogRecord>(), "changelog read failed")
            {
                if record.ts >= next {
                    segment.insert(record.ts, record);
                }
            }
            for (ts, record) in segment {
                tail.entry(ts).or_insert(record);
            }
            if header < next {
                break;
            }
        }
        let mut records = Vec::new();
        let mut expected = next;
        for (ts, record) in tail {
            if ts != expected {
                break;
            }
            records.push(record);
            expected += 1;
        }

        let mut new_next = next;
        for batch in records.chunks(self.options.rpc_max_batch.max(1)) {
            {
                let state = self.state.lock().unwrap();
                if state.role != Role::Leader || state.current_term != term {
                    return;
                }
            }
            log::debug!(
                "sending changelog records {}..={}",
                batch[0].ts,
                batch[batch.len() - 1].ts
            );
            let rpcs = AppendRpcs {
                term,
                applied_ts: 0,
                from: self.id,
                records: batch.to_vec(),
            };
            match self.peers.append_entries(peer, rpcs).await {
                Some(response) if response.success => new_next = response.next_ts,
                _ => {
                    log::debug!("failed to send changelog records");
                    return;
                }
            }
        }
        log::info!("recovery acknowledged timestamp {}", new_next);
        let mut state = self.state.lock().unwrap();
        let slot = peer as usize;
        state.next_timestamps[slot] = state.next_timestamps[slot].max(new_next);
    }

    /// Stream one snapshot as chunked RecoverySnapshot messages.
    async fn send_snapshot(
        &self,
        peer: u64,
        term: u64,
        applied_ts: i64,
        fsm: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> bool {
        let size = fsm.len() as u64;
        let mut start = true;
        let mut operations = Vec::new();
        for (key, value) in fsm {
            operations.push(Operation {
                key: key.clone(),
                value: value.clone(),
            });
            if operations.len() >= self.options.rpc_max_batch.max(1) {
                let chunk = RecoverySnapshot {
                    term,
                    applied_ts,
                    size,
                    start,
                    end: false,
                    operations: std::mem::take(&mut operations),
                };
                start = false;
                match self.peers.recover(peer, chunk).await {
                    Some(response) if response.success => {}
                    _ => {
                        log::debug!("failed to send snapshot chunk");
                        return false;
                    }
                }
            }
        }
        let chunk = RecoverySnapshot {
            term,
            applied_ts,
            size,
            start,
            end: true,
            operations,
        };
        match self.peers.recover(peer, chunk).await {
            Some(response) if response.success => true,
            _ => {
                log::debug!("failed to send snapshot chunk");
                false
            }
        }
    }
}
