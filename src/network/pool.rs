// src/network/pool.rs
//! Pool supervisor
//!
//! Owns every pool slot: configuration, transport, stratum session and the
//! reconnect timers. The supervisor loop asks it to fill the readiness sets,
//! refreshes it with the poll results, routes verified-nonce batches into
//! it, and drains the events it collected.

use crate::config::PoolConfig;
use crate::miner::NonceBatch;
use crate::network::poll::ReadinessSet;
use crate::network::tcp::{self, ConnectError};
use crate::stratum::session::{SessionEvent, StratumSession};
use std::io::Read;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

/// Hard connect failures wait this many base delays before retrying
pub const HARD_FAILURE_MULTIPLIER: u32 = 4;

/// Lifecycle state for one configured pool
struct PoolSlot {
    config: PoolConfig,
    transport: Option<TcpStream>,
    /// Transport exists but the connect has not completed yet
    connecting: bool,
    session: Option<StratumSession>,
    /// Set only while disconnected; a connected pool never has a pending
    /// reconnect
    next_reconnect: Option<Instant>,
    /// The pool's algo matches the active algorithm
    enabled: bool,
}

/// What happened across the pool set since the last drain
#[derive(Debug)]
pub enum PoolEvent {
    /// A connect attempt started
    Connecting(usize),
    /// The transport finished connecting and the session started
    Ready(usize),
    /// An active connection died
    Down(usize),
    /// A connect attempt failed outright
    ConnectFailed(usize, ConnectError),
    /// Application-level event from the pool's session
    Session(usize, SessionEvent),
}

/// Outcome of routing one nonce batch
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub sent: usize,
    pub stale: usize,
}

/// The full set of configured pools and their connections
pub struct PoolSet {
    pools: Vec<PoolSlot>,
    reconnect_delay: Duration,
    events: Vec<PoolEvent>,
}

impl PoolSet {
    pub fn new(configs: Vec<PoolConfig>, reconnect_delay: Duration) -> Self {
        let pools = configs
            .into_iter()
            .map(|config| PoolSlot {
                config,
                transport: None,
                connecting: false,
                session: None,
                next_reconnect: None,
                enabled: false,
            })
            .collect();
        PoolSet {
            pools,
            reconnect_delay,
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn config(&self, pool: usize) -> &PoolConfig {
        &self.pools[pool].config
    }

    /// host:port the pool is configured at
    pub fn endpoint(&self, pool: usize) -> String {
        let config = &self.pools[pool].config;
        format!("{}:{}", config.host, config.port)
    }

    pub fn connected(&self, pool: usize) -> bool {
        let slot = &self.pools[pool];
        slot.transport.is_some() && !slot.connecting
    }

    pub fn session(&self, pool: usize) -> Option<&StratumSession> {
        self.pools[pool].session.as_ref()
    }

    /// The pool currently doing useful work, if any
    pub fn current(&self) -> Option<usize> {
        self.pools
            .iter()
            .position(|slot| slot.session.as_ref().is_some_and(|session| session.working()))
    }

    /// Ensures matching pools are connected or backing off and all others
    /// are shut down
    ///
    /// # Returns
    /// How many pools are connecting or connected after the call.
    pub fn activate(&mut self, algo: &str) -> usize {
        let mut activated = 0;
        for index in 0..self.pools.len() {
            let matches = self.pools[index].config.algo.eq_ignore_ascii_case(algo);
            self.pools[index].enabled = matches;
            if !matches {
                if self.pools[index].transport.is_some() {
                    self.drop_connection(index);
                    self.events.push(PoolEvent::Down(index));
                }
                self.pools[index].next_reconnect = None;
                continue;
            }
            if self.pools[index].transport.is_some() {
                // Spurious call; when the connect completes it gets used.
                activated += 1;
            } else if self.pools[index].next_reconnect.is_none() {
                if self.begin_connect(index) {
                    activated += 1;
                }
            }
        }
        activated
    }

    /// Registers every connection interested in I/O for the coming wait
    ///
    /// Sending gets priority over reading, one direction per tick.
    pub fn fill_readiness(&self, read: &mut ReadinessSet, write: &mut ReadinessSet) {
        for slot in &self.pools {
            let transport = match &slot.transport {
                Some(transport) => transport,
                None => continue,
            };
            let wants_write = slot.connecting
                || slot
                    .session
                    .as_ref()
                    .is_some_and(|session| session.needs_to_send());
            if wants_write {
                write.push(transport.as_raw_fd());
            } else {
                read.push(transport.as_raw_fd());
            }
        }
    }

    /// Advances every signalled pool: connect completion, reads, writes and
    /// teardown of dead transports
    pub fn refresh(&mut self, read: &ReadinessSet, write: &ReadinessSet) {
        for index in 0..self.pools.len() {
            let (fd, connecting) = match &self.pools[index].transport {
                Some(transport) => (transport.as_raw_fd(), self.pools[index].connecting),
                None => continue,
            };
            let readable = read.is_ready(fd);
            let writable = write.is_ready(fd);
            if !readable && !writable {
                continue;
            }

            if connecting {
                if !writable {
                    continue;
                }
                let transport = self.pools[index].transport.as_ref().unwrap();
                match tcp::finish_connect(transport) {
                    Ok(()) => {
                        self.pools[index].connecting = false;
                        let mut session = StratumSession::new(&self.pools[index].config);
                        session.start();
                        self.pools[index].session = Some(session);
                        self.events.push(PoolEvent::Ready(index));
                    }
                    Err(_) => {
                        self.drop_connection(index);
                        self.schedule_reconnect(index, true);
                        self.events
                            .push(PoolEvent::ConnectFailed(index, ConnectError::FailedConnect));
                    }
                }
                continue;
            }

            if readable && !self.read_into_session(index) {
                self.pool_went_down(index);
                continue;
            }
            if writable {
                let mut flush_failed = false;
                let slot = &mut self.pools[index];
                if let (Some(session), Some(transport)) =
                    (slot.session.as_mut(), slot.transport.as_mut())
                {
                    flush_failed = session.needs_to_send() && session.flush(transport).is_err();
                }
                if flush_failed {
                    self.pool_went_down(index);
                    continue;
                }
            }
            self.collect_session_events(index);
            if self.pools[index]
                .session
                .as_ref()
                .is_some_and(|session| session.failed())
            {
                self.pool_went_down(index);
            }
        }
    }

    /// Periodic work independent of I/O: share expiry and reconnect timers
    pub fn tick(&mut self) {
        for index in 0..self.pools.len() {
            if let Some(session) = self.pools[index].session.as_mut() {
                session.expire_shares();
            }
            self.collect_session_events(index);
        }
        self.attempt_reconnections();
    }

    /// Routes a verified-nonce batch to its owner session
    ///
    /// The batch's job is checked against the pool's current job; stale
    /// batches are counted without a single `mining.submit` going out.
    pub fn submit(&mut self, batch: &NonceBatch) -> SubmitOutcome {
        let slot = match self.pools.get_mut(batch.origin.pool) {
            Some(slot) => slot,
            None => {
                log::error!("batch from unknown pool {} dropped", batch.origin.pool);
                return SubmitOutcome {
                    sent: 0,
                    stale: batch.nonces.len(),
                };
            }
        };
        let session = match slot.session.as_mut() {
            Some(session) if session.is_current_job(&batch.origin.job_id) => session,
            Some(session) => {
                if !session.known_job(&batch.origin.job_id) {
                    log::debug!(
                        "pool \"{}\" got results for unknown job {}",
                        slot.config.name,
                        batch.origin.job_id
                    );
                }
                return SubmitOutcome {
                    sent: 0,
                    stale: batch.nonces.len(),
                };
            }
            None => {
                return SubmitOutcome {
                    sent: 0,
                    stale: batch.nonces.len(),
                };
            }
        };
        let mut outcome = SubmitOutcome::default();
        for nonce in &batch.nonces {
            match session.submit_share(batch.nonce2, nonce, batch.device_index, batch.target_diff) {
                Some(_) => outcome.sent += 1,
                None => outcome.stale += 1,
            }
        }
        outcome
    }

    /// Closes every connection; used during shutdown
    pub fn shutdown(&mut self) {
        for index in 0..self.pools.len() {
            self.drop_connection(index);
            self.pools[index].next_reconnect = None;
            self.pools[index].enabled = false;
        }
    }

    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.events)
    }

    fn read_into_session(&mut self, index: usize) -> bool {
        let slot = &mut self.pools[index];
        let transport = match slot.transport.as_mut() {
            Some(transport) => transport,
            None => return true,
        };
        let mut chunk = [0u8; 4096];
        loop {
            match transport.read(&mut chunk) {
                Ok(0) => return false,
                Ok(got) => {
                    if let Some(session) = slot.session.as_mut() {
                        session.consume(&chunk[..got]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    fn collect_session_events(&mut self, index: usize) {
        if let Some(session) = self.pools[index].session.as_mut() {
            for event in session.drain_events() {
                self.events.push(PoolEvent::Session(index, event));
            }
        }
    }

    fn pool_went_down(&mut self, index: usize) {
        self.collect_session_events(index);
        self.drop_connection(index);
        self.schedule_reconnect(index, false);
        self.events.push(PoolEvent::Down(index));
    }

    fn drop_connection(&mut self, index: usize) {
        let slot = &mut self.pools[index];
        slot.transport = None;
        slot.connecting = false;
        slot.session = None;
    }

    fn schedule_reconnect(&mut self, index: usize, hard: bool) {
        let slot = &mut self.pools[index];
        if !slot.enabled {
            slot.next_reconnect = None;
            return;
        }
        slot.next_reconnect = Some(Instant::now() + backoff(self.reconnect_delay, hard));
    }

    fn begin_connect(&mut self, index: usize) -> bool {
        let config = self.pools[index].config.clone();
        match tcp::begin_connect(&config.host, config.port) {
            Ok(transport) => {
                let slot = &mut self.pools[index];
                slot.transport = Some(transport);
                slot.connecting = true;
                slot.next_reconnect = None;
                self.events.push(PoolEvent::Connecting(index));
                true
            }
            Err(error) => {
                // A failing connect is a bad sign; give it quite some time
                // to clear out before trying again.
                self.schedule_reconnect(index, true);
                self.events.push(PoolEvent::ConnectFailed(index, error));
                false
            }
        }
    }

    fn attempt_reconnections(&mut self) {
        let now = Instant::now();
        for index in 0..self.pools.len() {
            let due = match self.pools[index].next_reconnect {
                Some(when) => when <= now,
                None => false,
            };
            if !due || !self.pools[index].enabled {
                continue;
            }
            self.pools[index].next_reconnect = None;
            self.begin_connect(index);
        }
    }
}

/// Reconnect delay for a plain drop or a hard failure
pub fn backoff(base: Duration, hard: bool) -> Duration {
    if hard {
        base * HARD_FAILURE_MULTIPLIER
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffMultipliers;
    use crate::miner::{FoundNonce, WorkOrigin};
    use crate::types::{DiffMode, MerkleMode};
    use std::net::TcpListener;

    fn config_for(name: &str, algo: &str, port: u16) -> PoolConfig {
        PoolConfig {
            name: name.into(),
            host: "127.0.0.1".into(),
            port,
            user: "wallet.w".into(),
            pass: "x".into(),
            algo: algo.into(),
            diff_multipliers: DiffMultipliers {
                one: 1.0,
                share: 1.0,
                stratum: 1.0,
            },
            merkle_mode: MerkleMode::Sha256d,
            diff_mode: DiffMode::Btc,
        }
    }

    const NOTIFY: &[u8] = br#"{"id":null,"method":"mining.notify","params":["jobB","e2b5bc4ed02e8d93b1a7739931c9d0a77c0123456789abcdef0123456789abcd","0100","0200",[],"00000002","1d00ffff","504e86b9",true]}
"#;

    fn batch(pool: usize, job: &str, count: usize) -> NonceBatch {
        NonceBatch {
            origin: WorkOrigin {
                pool,
                job_id: job.into(),
            },
            nonce2: 1,
            nonces: (0..count)
                .map(|nonce| FoundNonce {
                    nonce: nonce as u32,
                    diff: 1.0,
                    hash_prefix: [0; 4],
                    block: false,
                })
                .collect(),
            wrong: 0,
            discarded: 0,
            device_index: 0,
            target_diff: 1.0,
            scan_period: Duration::from_millis(1),
            scanned: 1000,
        }
    }

    #[test]
    fn hard_failures_wait_four_base_delays() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, false), Duration::from_secs(30));
        assert_eq!(backoff(base, true), Duration::from_secs(120));
    }

    #[test]
    fn activate_filters_by_algorithm() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut pools = PoolSet::new(
            vec![
                config_for("match", "sha256d", port),
                config_for("other", "scrypt", port),
            ],
            Duration::from_secs(30),
        );
        let activated = pools.activate("sha256d");
        assert_eq!(activated, 1);
        assert!(pools.pools[0].transport.is_some());
        assert!(pools.pools[1].transport.is_none());
        let events = pools.drain_events();
        assert!(events.iter().any(|event| matches!(event, PoolEvent::Connecting(0))));
    }

    #[test]
    fn switching_algorithms_disconnects_the_mismatches() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut pools = PoolSet::new(
            vec![config_for("match", "sha256d", port)],
            Duration::from_secs(30),
        );
        pools.activate("sha256d");
        assert!(pools.pools[0].transport.is_some());
        let activated = pools.activate("scrypt");
        assert_eq!(activated, 0);
        assert!(pools.pools[0].transport.is_none());
        assert!(pools.pools[0].next_reconnect.is_none());
    }

    #[test]
    fn a_connected_pool_never_holds_a_reconnect_timer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut pools = PoolSet::new(
            vec![config_for("p", "sha256d", port)],
            Duration::from_secs(30),
        );
        pools.pools[0].enabled = true;
        pools.pools[0].next_reconnect = Some(Instant::now() - Duration::from_millis(1));
        pools.tick();
        assert!(pools.pools[0].transport.is_some());
        assert!(pools.pools[0].next_reconnect.is_none());
    }

    #[test]
    fn stale_batches_never_reach_the_wire() {
        let mut pools = PoolSet::new(
            vec![config_for("p", "sha256d", 3333)],
            Duration::from_secs(30),
        );
        let mut session = StratumSession::new(&pools.pools[0].config);
        session.consume(NOTIFY);
        session.drain_events();
        pools.pools[0].session = Some(session);

        let outcome = pools.submit(&batch(0, "jobA", 3));
        assert_eq!(outcome, SubmitOutcome { sent: 0, stale: 3 });
        assert!(!pools.pools[0].session.as_ref().unwrap().needs_to_send());

        let outcome = pools.submit(&batch(0, "jobB", 2));
        assert_eq!(outcome, SubmitOutcome { sent: 2, stale: 0 });
        assert!(pools.pools[0].session.as_ref().unwrap().needs_to_send());
    }

    #[test]
    fn batches_for_a_disconnected_pool_count_stale() {
        let mut pools = PoolSet::new(
            vec![config_for("p", "sha256d", 3333)],
            Duration::from_secs(30),
        );
        let outcome = pools.submit(&batch(0, "jobB", 4));
        assert_eq!(outcome, SubmitOutcome { sent: 0, stale: 4 });
    }
}
