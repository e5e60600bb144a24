// src/stratum/session.rs
//! Per-pool stratum session
//!
//! Runs the application protocol over a single TCP stream: subscribe,
//! authorize, consume jobs and difficulty notifications, submit shares and
//! correlate their replies. The session never touches the socket directly
//! for policy decisions; it buffers lines in and out and emits
//! [`SessionEvent`]s the supervisor consumes in its tick body.

use crate::config::PoolConfig;
use crate::miner::FoundNonce;
use crate::stratum::job::JobTemplate;
use crate::stratum::messages;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::time::{Duration, Instant};

/// A share older than this without a stratum reply is dropped
pub const SHARE_EXPIRY: Duration = Duration::from_secs(120);

/// How many recent job ids are remembered for staleness classification
const JOB_HISTORY: usize = 4;

/// Worker authorization progress on a pool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// Authorize sent, no reply yet
    Pending,
    /// The pool confirmed the worker
    Accepted,
    /// No authorize reply, but the pool accepts our shares anyway
    Inferred,
    /// No credentials configured, authorize never sent
    NotRequired,
    /// The pool unambiguously rejected the worker
    Failed,
}

/// Protocol phase of the session
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Subscribing,
    Authorizing,
    Working,
}

#[derive(Copy, Clone, Debug)]
enum PendingKind {
    Subscribe,
    Authorize,
    Submit,
}

/// Bookkeeping for one submitted share awaiting its reply
#[derive(Debug, Clone)]
pub struct OutstandingShare {
    pub job_id: String,
    pub nonce2: u32,
    pub nonce: u32,
    pub submitted: Instant,
    pub target_diff: f64,
    pub share_diff: f64,
    pub device_index: usize,
    pub hash_prefix: [u8; 4],
    pub block: bool,
}

/// What happened inside the session since the last drain
#[derive(Debug)]
pub enum SessionEvent {
    /// `mining.subscribe` was answered with extranonce details
    Subscribed,
    /// Worker authorization state changed
    Auth(AuthState),
    /// `mining.set_difficulty` arrived
    DiffChanged(f64),
    /// `mining.notify` produced a new current job
    NewJob,
    ShareAccepted(OutstandingShare),
    ShareRejected(OutstandingShare, String),
    /// A share waited past [`SHARE_EXPIRY`] and was dropped
    ShareExpired(u64),
    /// The pool reported a stratum-level error
    StratumError { code: i64, message: String },
    /// The session is beyond recovery; the supervisor reconnects
    Failed(String),
}

/// Application-level state for one connected pool
pub struct StratumSession {
    config: PoolConfig,
    next_id: u64,
    phase: Phase,
    extranonce1: Vec<u8>,
    extranonce2_size: usize,
    subscribed_ok: bool,
    auth: AuthState,
    current_diff: f64,
    job: Option<JobTemplate>,
    job_history: VecDeque<String>,
    send_buf: Vec<u8>,
    sent: usize,
    recv_buf: Vec<u8>,
    pending: HashMap<u64, PendingKind>,
    outstanding: HashMap<u64, OutstandingShare>,
    events: Vec<SessionEvent>,
    failed: bool,
}

impl StratumSession {
    pub fn new(config: &PoolConfig) -> Self {
        StratumSession {
            config: config.clone(),
            next_id: 0,
            phase: Phase::Subscribing,
            extranonce1: Vec::new(),
            extranonce2_size: 4,
            subscribed_ok: false,
            auth: AuthState::Pending,
            current_diff: 1.0,
            job: None,
            job_history: VecDeque::new(),
            send_buf: Vec::new(),
            sent: 0,
            recv_buf: Vec::new(),
            pending: HashMap::new(),
            outstanding: HashMap::new(),
            events: Vec::new(),
            failed: false,
        }
    }

    /// Kicks the protocol off once the transport finished connecting
    pub fn start(&mut self) {
        let id = self.take_id();
        self.pending.insert(id, PendingKind::Subscribe);
        let line = messages::subscribe(id);
        self.send_buf.extend_from_slice(line.as_bytes());
    }

    pub fn auth(&self) -> AuthState {
        self.auth
    }

    pub fn subscribed(&self) -> bool {
        self.subscribed_ok
    }

    /// Whether the protocol reached the working phase
    pub fn working(&self) -> bool {
        self.phase == Phase::Working
    }

    /// Announced difficulty, before multipliers
    pub fn current_diff(&self) -> f64 {
        self.current_diff
    }

    pub fn current_job(&self) -> Option<&JobTemplate> {
        self.job.as_ref()
    }

    pub fn extranonce1(&self) -> &[u8] {
        &self.extranonce1
    }

    pub fn extranonce2_size(&self) -> usize {
        self.extranonce2_size
    }

    /// Whether a batch for this job id may still be submitted
    pub fn is_current_job(&self, job_id: &str) -> bool {
        self.job.as_ref().is_some_and(|job| job.id == job_id)
    }

    /// Whether the id names a recently replaced job
    pub fn known_job(&self, job_id: &str) -> bool {
        self.job_history.iter().any(|known| known == job_id)
    }

    /// The session hit a protocol failure and must be torn down
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn needs_to_send(&self) -> bool {
        self.sent < self.send_buf.len()
    }

    /// Pushes queued request bytes at the transport, tracking partial writes
    pub fn flush(&mut self, sock: &mut impl Write) -> std::io::Result<()> {
        while self.sent < self.send_buf.len() {
            match sock.write(&self.send_buf[self.sent..]) {
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(put) => self.sent += put,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.sent == self.send_buf.len() {
            self.send_buf.clear();
            self.sent = 0;
        }
        Ok(())
    }

    /// Feeds raw received bytes; complete lines are handled immediately
    pub fn consume(&mut self, bytes: &[u8]) {
        self.recv_buf.extend_from_slice(bytes);
        while let Some(at) = self.recv_buf.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.recv_buf.drain(..=at).collect();
            if self.failed {
                continue;
            }
            self.handle_line(&line[..line.len() - 1]);
        }
    }

    /// Queues a `mining.submit` for one verified nonce
    ///
    /// # Returns
    /// The pool-local share id now tracked in the outstanding table, or
    /// `None` when the session has no job to submit against.
    pub fn submit_share(
        &mut self,
        nonce2: u32,
        found: &FoundNonce,
        device_index: usize,
        target_diff: f64,
    ) -> Option<u64> {
        let (job_id, ntime) = match &self.job {
            Some(job) => (job.id.clone(), job.ntime),
            None => return None,
        };
        let id = self.take_id();
        let nonce2_hex = format!("{:0width$x}", nonce2, width = self.extranonce2_size * 2);
        let line = messages::submit(
            id,
            &self.config.user,
            &job_id,
            &nonce2_hex,
            ntime,
            found.nonce,
        );
        self.send_buf.extend_from_slice(line.as_bytes());
        self.pending.insert(id, PendingKind::Submit);
        self.outstanding.insert(
            id,
            OutstandingShare {
                job_id,
                nonce2,
                nonce: found.nonce,
                submitted: Instant::now(),
                target_diff,
                share_diff: found.diff,
                device_index,
                hash_prefix: found.hash_prefix,
                block: found.block,
            },
        );
        Some(id)
    }

    /// Drops shares that waited past [`SHARE_EXPIRY`] without a reply
    ///
    /// Each share leaves the table exactly once: either here or through its
    /// reply, never both.
    pub fn expire_shares(&mut self) {
        let dead: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, share)| share.submitted.elapsed() > SHARE_EXPIRY)
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            self.outstanding.remove(&id);
            self.pending.remove(&id);
            self.events.push(SessionEvent::ShareExpired(id));
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn take_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fail(&mut self, what: impl Into<String>) {
        self.failed = true;
        self.events.push(SessionEvent::Failed(what.into()));
    }

    fn handle_line(&mut self, line: &[u8]) {
        let trimmed: &[u8] = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if trimmed.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let message: Value = match serde_json::from_slice(trimmed) {
            Ok(message) => message,
            Err(_) => return self.fail("invalid stratum JSON"),
        };

        if let Some(method) = messages::method(&message) {
            return self.handle_notification(method.to_string(), &message);
        }
        let id = match messages::reply_id(&message) {
            Some(id) => id,
            // A late null-id notification; nothing to correlate.
            None => return,
        };
        match self.pending.remove(&id) {
            Some(PendingKind::Subscribe) => self.handle_subscribe_reply(&message),
            Some(PendingKind::Authorize) => self.handle_authorize_reply(&message),
            Some(PendingKind::Submit) => self.handle_submit_reply(id, &message),
            None => log::debug!(
                "pool \"{}\" replied to unknown request {}",
                self.config.name,
                id
            ),
        }
    }

    fn handle_notification(&mut self, method: String, message: &Value) {
        match method.as_str() {
            "mining.notify" => {
                let params = match messages::params(message) {
                    Some(params) => params,
                    None => return self.fail("mining.notify without params"),
                };
                match JobTemplate::from_notify(params) {
                    Ok(job) => {
                        self.job_history.push_front(job.id.clone());
                        self.job_history.truncate(JOB_HISTORY);
                        self.job = Some(job);
                        self.events.push(SessionEvent::NewJob);
                    }
                    Err(e) => self.fail(e.to_string()),
                }
            }
            "mining.set_difficulty" => {
                let diff = messages::params(message)
                    .and_then(|params| params.first())
                    .and_then(Value::as_f64);
                match diff {
                    Some(diff) if diff > 0.0 => {
                        self.current_diff = diff;
                        self.events.push(SessionEvent::DiffChanged(diff));
                    }
                    _ => self.fail("mining.set_difficulty with unusable params"),
                }
            }
            other => log::warn!(
                "pool \"{}\" sent unknown method {}",
                self.config.name,
                other
            ),
        }
    }

    fn handle_subscribe_reply(&mut self, message: &Value) {
        if let Some((code, text)) = messages::error_parts(message) {
            self.events.push(SessionEvent::StratumError {
                code,
                message: text,
            });
            return self.fail("subscribe rejected");
        }
        let result = match message.get("result").and_then(Value::as_array) {
            Some(result) if result.len() >= 3 => result,
            _ => return self.fail("malformed subscribe result"),
        };
        let extranonce1 = match result[1].as_str().map(hex::decode) {
            Some(Ok(bytes)) => bytes,
            _ => return self.fail("subscribe result carries no extraNonce1"),
        };
        let extranonce2_size = match result[2].as_u64() {
            Some(size) if size > 0 && size <= 8 => size as usize,
            _ => return self.fail("subscribe result carries no extraNonce2 size"),
        };
        self.extranonce1 = extranonce1;
        self.extranonce2_size = extranonce2_size;
        self.subscribed_ok = true;
        self.events.push(SessionEvent::Subscribed);

        if self.config.user.is_empty() {
            self.auth = AuthState::NotRequired;
            self.phase = Phase::Working;
            self.events.push(SessionEvent::Auth(self.auth));
            return;
        }
        let id = self.take_id();
        self.pending.insert(id, PendingKind::Authorize);
        let line = messages::authorize(id, &self.config.user, &self.config.pass);
        self.send_buf.extend_from_slice(line.as_bytes());
        self.phase = Phase::Authorizing;
        self.events.push(SessionEvent::Auth(AuthState::Pending));
    }

    fn handle_authorize_reply(&mut self, message: &Value) {
        self.phase = Phase::Working;
        if messages::bool_result(message) {
            self.auth = AuthState::Accepted;
            self.events.push(SessionEvent::Auth(self.auth));
            return;
        }
        if let Some((code, text)) = messages::error_parts(message) {
            self.events.push(SessionEvent::StratumError {
                code,
                message: text,
            });
        }
        self.auth = AuthState::Failed;
        self.events.push(SessionEvent::Auth(self.auth));
    }

    fn handle_submit_reply(&mut self, id: u64, message: &Value) {
        let share = match self.outstanding.remove(&id) {
            Some(share) => share,
            None => {
                // Already expired; the reply is just very late.
                log::warn!(
                    "pool \"{}\" signaled untracked share {}",
                    self.config.name,
                    id
                );
                return;
            }
        };
        if messages::bool_result(message) {
            if self.auth == AuthState::Pending {
                // The pool takes our shares without ever answering the
                // authorize, treat the worker as let in.
                self.auth = AuthState::Inferred;
                self.events.push(SessionEvent::Auth(self.auth));
            }
            self.events.push(SessionEvent::ShareAccepted(share));
        } else {
            let reason = messages::error_parts(message)
                .map(|(_, text)| text)
                .unwrap_or_else(|| "rejected".to_string());
            self.events.push(SessionEvent::ShareRejected(share, reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffMultipliers;
    use crate::types::{DiffMode, MerkleMode};

    fn test_config() -> PoolConfig {
        PoolConfig {
            name: "testpool".into(),
            host: "localhost".into(),
            port: 3333,
            user: "wallet.w1".into(),
            pass: "x".into(),
            algo: "sha256d".into(),
            diff_multipliers: DiffMultipliers {
                one: 1.0,
                share: 1.0,
                stratum: 1.0,
            },
            merkle_mode: MerkleMode::Sha256d,
            diff_mode: DiffMode::Btc,
        }
    }

    fn outgoing(session: &mut StratumSession) -> Vec<Value> {
        let mut wire = Vec::new();
        session.flush(&mut wire).unwrap();
        String::from_utf8(wire)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn subscribe_reply(session: &mut StratumSession) {
        session.consume(b"{\"id\":1,\"result\":[[],\"00000001\",4],\"error\":null}\n");
    }

    const NOTIFY: &[u8] = br#"{"id":null,"method":"mining.notify","params":["jobA","e2b5bc4ed02e8d93b1a7739931c9d0a77c0123456789abcdef0123456789abcd","0100","0200",[],"00000002","1d00ffff","504e86b9",true]}
"#;

    fn found(nonce: u32) -> FoundNonce {
        FoundNonce {
            nonce,
            diff: 2.5,
            hash_prefix: [1, 2, 3, 4],
            block: false,
        }
    }

    #[test]
    fn subscribe_then_authorize_walks_to_accepted() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        let sent = outgoing(&mut session);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], "mining.subscribe");
        assert_eq!(sent[0]["id"], 1);

        subscribe_reply(&mut session);
        assert!(session.subscribed());
        assert_eq!(session.extranonce1(), &[0, 0, 0, 1]);
        assert_eq!(session.extranonce2_size(), 4);
        let sent = outgoing(&mut session);
        assert_eq!(sent[0]["method"], "mining.authorize");
        assert_eq!(sent[0]["params"][0], "wallet.w1");

        session.consume(b"{\"id\":2,\"result\":true,\"error\":null}\n");
        assert_eq!(session.auth(), AuthState::Accepted);
        let events = session.drain_events();
        assert!(
            events
                .iter()
                .any(|event| matches!(event, SessionEvent::Auth(AuthState::Accepted)))
        );
    }

    #[test]
    fn unambiguous_reject_fails_the_worker_but_keeps_the_session() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(
            b"{\"id\":2,\"result\":false,\"error\":[24,\"unauthorized worker\",null]}\n",
        );
        assert_eq!(session.auth(), AuthState::Failed);
        assert!(!session.failed());
        let events = session.drain_events();
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::StratumError { code: 24, .. }
        )));
    }

    #[test]
    fn notify_and_difficulty_update_session_state() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(b"{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[512]}\n");
        assert_eq!(session.current_diff(), 512.0);
        session.consume(NOTIFY);
        assert!(session.is_current_job("jobA"));
        let events = session.drain_events();
        assert!(
            events
                .iter()
                .any(|event| matches!(event, SessionEvent::DiffChanged(diff) if *diff == 512.0))
        );
        assert!(events.iter().any(|event| matches!(event, SessionEvent::NewJob)));
    }

    #[test]
    fn replaced_jobs_stay_in_the_history_window() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(NOTIFY);
        let newer = String::from_utf8(NOTIFY.to_vec())
            .unwrap()
            .replace("jobA", "jobB");
        session.consume(newer.as_bytes());
        assert!(session.is_current_job("jobB"));
        assert!(!session.is_current_job("jobA"));
        assert!(session.known_job("jobA"));
        assert!(!session.known_job("jobZ"));
    }

    #[test]
    fn submit_round_trip_resolves_each_share_exactly_once() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(b"{\"id\":2,\"result\":true,\"error\":null}\n");
        session.consume(NOTIFY);
        session.drain_events();

        let first = session.submit_share(10, &found(0xAABB), 0, 16.0).unwrap();
        let second = session.submit_share(10, &found(0xCCDD), 0, 16.0).unwrap();
        assert_eq!(session.outstanding_count(), 2);
        let sent = outgoing(&mut session);
        let submits: Vec<&Value> = sent
            .iter()
            .filter(|line| line["method"] == "mining.submit")
            .collect();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0]["params"][2], "0000000a");

        session.consume(format!("{{\"id\":{},\"result\":true,\"error\":null}}\n", first).as_bytes());
        session.consume(
            format!(
                "{{\"id\":{},\"result\":false,\"error\":[23,\"low difficulty share\",null]}}\n",
                second
            )
            .as_bytes(),
        );
        assert_eq!(session.outstanding_count(), 0);
        let events = session.drain_events();
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::ShareAccepted(share) if share.nonce == 0xAABB
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::ShareRejected(share, reason)
                if share.nonce == 0xCCDD && reason == "low difficulty share"
        )));
    }

    #[test]
    fn share_accepted_before_authorize_reply_infers_authorization() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(NOTIFY);
        assert_eq!(session.auth(), AuthState::Pending);

        let id = session.submit_share(1, &found(7), 0, 1.0).unwrap();
        session.consume(format!("{{\"id\":{},\"result\":true,\"error\":null}}\n", id).as_bytes());
        assert_eq!(session.auth(), AuthState::Inferred);
    }

    #[test]
    fn stale_shares_expire_and_late_replies_go_untracked() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(NOTIFY);
        let id = session.submit_share(1, &found(9), 0, 1.0).unwrap();

        // Backdate the submission past the expiry window.
        let share = session.outstanding.get_mut(&id).unwrap();
        share.submitted = Instant::now() - (SHARE_EXPIRY + Duration::from_secs(1));
        session.expire_shares();
        assert_eq!(session.outstanding_count(), 0);
        let events = session.drain_events();
        assert!(
            events
                .iter()
                .any(|event| matches!(event, SessionEvent::ShareExpired(expired) if *expired == id))
        );

        // The reply eventually lands; it must not produce a share event.
        session.consume(format!("{{\"id\":{},\"result\":true,\"error\":null}}\n", id).as_bytes());
        let events = session.drain_events();
        assert!(events.is_empty());
    }

    #[test]
    fn a_share_waiting_just_under_the_window_survives() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        subscribe_reply(&mut session);
        session.consume(NOTIFY);
        let id = session.submit_share(1, &found(9), 0, 1.0).unwrap();
        let share = session.outstanding.get_mut(&id).unwrap();
        share.submitted = Instant::now() - (SHARE_EXPIRY - Duration::from_millis(50));
        session.expire_shares();
        assert_eq!(session.outstanding_count(), 1);
    }

    #[test]
    fn garbage_lines_fail_the_session() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        session.consume(b"this is not json\n");
        assert!(session.failed());
        let events = session.drain_events();
        assert!(events.iter().any(|event| matches!(event, SessionEvent::Failed(_))));
    }

    #[test]
    fn partial_lines_wait_for_their_newline() {
        let mut session = StratumSession::new(&test_config());
        session.start();
        session.consume(b"{\"id\":1,\"result\":[[],\"000000");
        assert!(!session.subscribed());
        session.consume(b"01\",4],\"error\":null}\n");
        assert!(session.subscribed());
    }

    #[test]
    fn empty_user_skips_authorization() {
        let mut config = test_config();
        config.user = String::new();
        let mut session = StratumSession::new(&config);
        session.start();
        subscribe_reply(&mut session);
        assert_eq!(session.auth(), AuthState::NotRequired);
        // Only the subscribe went out.
        let sent = outgoing(&mut session);
        assert_eq!(sent.len(), 1);
    }
}
