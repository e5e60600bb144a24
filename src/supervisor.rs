// src/supervisor.rs
//! The supervisor loop
//!
//! Single-threaded and cooperative: every tick gathers the endpoints that
//! want I/O, blocks in the readiness wait for at most the poll period, then
//! advances the pool supervisor and both web planes, drains the compute
//! backend and routes its batches to the owning pools. The only suspension
//! point of the whole core is that wait.

use crate::config::ConfigTracker;
use crate::miner::{Miner, NonceBatch, WorkAssignment, WorkOrigin};
use crate::network::poll::{self, ReadinessSet};
use crate::network::pool::{PoolEvent, PoolSet};
use crate::stats::Tracking;
use crate::stratum::job::{extranonce2_bytes, target_from_diff};
use crate::stratum::session::{AuthState, SessionEvent};
use crate::utils::error::MinerError;
use crate::ws::commands::{CommandContext, ExtensionRegistry, RuntimeFlags};
use crate::ws::server::WsServer;
use std::time::Duration;

/// Upper bound on one readiness wait, so non-I/O logic keeps ticking
pub const POLL_PERIOD_MS: u32 = 200;

/// With no I/O on any endpoint for this long, the supervisor gives up.
/// Stratum pools notify at least once a minute, so a silent network is a
/// dead network. Debug builds idle much longer to survive breakpoints.
pub fn inactivity_ceiling() -> Duration {
    if cfg!(debug_assertions) {
        Duration::from_secs(60 * 30)
    } else {
        Duration::from_secs(120)
    }
}

fn inactivity_fatal(since: Duration, ceiling: Duration) -> bool {
    since >= ceiling
}

/// The operator-facing notification sink, ticked once per loop iteration
///
/// The real implementation lives outside the core (tray icon, menu, ...);
/// the core only pushes messages at it and asks whether the operator wants
/// out.
pub trait NotifySink {
    /// Pump the sink; returns true when the operator requested exit
    fn tick(&mut self) -> bool {
        false
    }

    /// Show a short operator-facing message
    fn message(&mut self, text: &str);
}

/// Notification sink that just logs
pub struct LogSink;

impl NotifySink for LogSink {
    fn message(&mut self, text: &str) {
        log::info!("{}", text);
    }
}

/// Why the loop ended cleanly
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The operator asked to exit through the notification sink
    OperatorExit,
    /// A local admin client requested a configuration reload
    Reload,
}

/// Owns both protocol engines, the compute backend and the tracked values
pub struct Supervisor {
    pools: PoolSet,
    monitor: WsServer,
    admin: WsServer,
    miner: Box<dyn Miner>,
    tracking: Tracking,
    config_tracker: ConfigTracker,
    extensions: ExtensionRegistry,
    runtime: RuntimeFlags,
    /// Latched once the backend reported its death
    miner_failed: bool,
    first_share_seen: bool,
}

impl Supervisor {
    pub fn new(
        pools: PoolSet,
        monitor: WsServer,
        admin: WsServer,
        miner: Box<dyn Miner>,
        config_tracker: ConfigTracker,
    ) -> Self {
        let tracking = Tracking::new(miner.device_count(), pools.len());
        Supervisor {
            pools,
            monitor,
            admin,
            miner,
            tracking,
            config_tracker,
            extensions: ExtensionRegistry::new(),
            runtime: RuntimeFlags::default(),
            miner_failed: false,
            first_share_seen: false,
        }
    }

    /// Runs until the operator exits, a reload is requested, or something
    /// fatal happens
    pub fn run(&mut self, notify: &mut dyn NotifySink) -> Result<ExitReason, MinerError> {
        self.monitor.listen()?;
        self.admin.listen()?;
        let algo = self.miner.algo().to_string();
        let activated = self.pools.activate(&algo);
        log::info!("{} pool(s) activated for algo \"{}\"", activated, algo);
        self.tracking.note_hashing_started();

        let mut read = ReadinessSet::new();
        let mut write = ReadinessSet::new();
        let mut since_activity = Duration::ZERO;
        let mut shutting_down = false;
        let mut exit_reason = ExitReason::Reload;

        loop {
            if notify.tick() && !shutting_down {
                shutting_down = true;
                exit_reason = ExitReason::OperatorExit;
                self.monitor.begin_close();
                self.admin.begin_close();
            }

            read.clear();
            write.clear();
            self.pools.fill_readiness(&mut read, &mut write);
            self.monitor.fill_readiness(&mut read, &mut write);
            self.admin.fill_readiness(&mut read, &mut write);
            let updated = poll::wait(&mut read, &mut write, POLL_PERIOD_MS)?;

            if updated == 0 {
                since_activity += Duration::from_millis(POLL_PERIOD_MS as u64);
                if !shutting_down && inactivity_fatal(since_activity, inactivity_ceiling()) {
                    return Err(MinerError::Fatal(
                        "No activity from connections in 120 seconds. Fatal network fail? I give up"
                            .into(),
                    ));
                }
            } else {
                since_activity = Duration::ZERO;
                self.pools.refresh(&read, &write);
            }
            if updated != 0 || shutting_down {
                let ctx = &mut CommandContext {
                    pools: &self.pools,
                    miner: self.miner.as_ref(),
                    tracking: &self.tracking,
                    config: &self.config_tracker,
                    extensions: &mut self.extensions,
                    runtime: &mut self.runtime,
                };
                self.monitor.refresh(&read, &write, ctx);
                self.admin.refresh(&read, &write, ctx);
            }

            // Reconnect timers and share expiry run on wall time, not I/O.
            self.pools.tick();
            self.handle_pool_events(notify);
            self.drain_miner(notify);

            if self.runtime.reload_requested && !shutting_down {
                shutting_down = true;
                exit_reason = ExitReason::Reload;
                log::info!("reload requested, closing the web planes");
                self.monitor.begin_close();
                self.admin.begin_close();
            }
            if shutting_down && self.monitor.fully_closed() && self.admin.fully_closed() {
                self.pools.shutdown();
                self.miner.shutdown();
                return Ok(exit_reason);
            }
        }
    }

    fn handle_pool_events(&mut self, notify: &mut dyn NotifySink) {
        let mut share_stats_changed = false;
        for event in self.pools.drain_events() {
            match event {
                PoolEvent::Connecting(pool) => {
                    self.tracking.pool_connecting(pool);
                    log::info!("Pool \"{}\" connecting.", self.pools.config(pool).name);
                }
                PoolEvent::Ready(pool) => {
                    self.tracking.pool_activated(pool);
                    log::info!("Pool \"{}\" connected.", self.pools.config(pool).name);
                }
                PoolEvent::Down(pool) => {
                    self.tracking.pool_down(pool);
                    log::warn!("Pool \"{}\" DISCONNECTED!", self.pools.config(pool).name);
                    if self.pools.current().is_none() {
                        self.miner.halt();
                    }
                }
                PoolEvent::ConnectFailed(pool, error) => {
                    self.tracking.pool_down(pool);
                    log::warn!(
                        "Pool \"{}\" connect error: {}",
                        self.pools.config(pool).name,
                        error
                    );
                }
                PoolEvent::Session(pool, event) => {
                    self.tracking.pool_activity(pool);
                    share_stats_changed |= self.handle_session_event(pool, event, notify);
                }
            }
        }
        if share_stats_changed {
            let names: Vec<String> = (0..self.pools.len())
                .map(|pool| self.pools.config(pool).name.clone())
                .collect();
            self.tracking.log_share_summary(&names);
        }
    }

    fn handle_session_event(
        &mut self,
        pool: usize,
        event: SessionEvent,
        notify: &mut dyn NotifySink,
    ) -> bool {
        let name = self.pools.config(pool).name.clone();
        match event {
            SessionEvent::Subscribed => {
                log::info!("Pool \"{}\" subscribed.", name);
            }
            SessionEvent::Auth(state) => match state {
                AuthState::Pending => log::info!("Pool \"{}\" worker waiting for authorization.", name),
                AuthState::Accepted => log::info!("Pool \"{}\" worker authorized.", name),
                AuthState::Inferred => {
                    log::info!("Pool \"{}\" worker gets accepted shares anyway.", name)
                }
                AuthState::NotRequired => {
                    log::info!("Pool \"{}\" seems to not need authorization.", name)
                }
                AuthState::Failed => {
                    log::error!("Pool \"{}\" worker !! FAILED AUTHORIZATION !!", name);
                    notify.message("A worker failed to authenticate. Check your credentials.");
                }
            },
            SessionEvent::DiffChanged(diff) => {
                log::info!("Pool \"{}\" difficulty now {}", name, diff);
                self.dispatch_work(pool);
            }
            SessionEvent::NewJob => {
                self.dispatch_work(pool);
            }
            SessionEvent::ShareAccepted(share) => {
                self.tracking.pool_reply(pool, true, share.target_diff);
                log::info!(
                    "Accepted {} Diff {:.3}/{:.3}{} device {}",
                    hex::encode(share.hash_prefix),
                    share.share_diff,
                    share.target_diff,
                    if share.block { " BLOCK!" } else { "" },
                    share.device_index
                );
                if !self.first_share_seen {
                    self.first_share_seen = true;
                    notify.message("Found my first share! Numbers are being crunched as expected.");
                }
                return true;
            }
            SessionEvent::ShareRejected(share, reason) => {
                self.tracking.pool_reply(pool, false, share.target_diff);
                log::info!(
                    "Rejected {} Diff {:.3}/{:.3} device {} ({})",
                    hex::encode(share.hash_prefix),
                    share.share_diff,
                    share.target_diff,
                    share.device_index,
                    reason
                );
                return true;
            }
            SessionEvent::ShareExpired(id) => {
                log::info!(
                    "Share {} sent to pool \"{}\" has been dropped. No response from server.",
                    id,
                    name
                );
            }
            SessionEvent::StratumError { code, message } => {
                log::error!(
                    "Pool \"{}\" reported stratum error code {}: \"{}\"",
                    name,
                    code,
                    message
                );
            }
            SessionEvent::Failed(what) => {
                log::warn!("Pool \"{}\" session failed: {}", name, what);
            }
        }
        false
    }

    /// Builds per-device work units from a pool's current job and targets
    fn dispatch_work(&mut self, pool: usize) {
        if self.miner_failed {
            return;
        }
        let config = self.pools.config(pool).clone();
        let session = match self.pools.session(pool) {
            Some(session) => session,
            None => return,
        };
        let job = match session.current_job() {
            Some(job) => job,
            None => return,
        };
        let (share_target, target_diff) = target_from_diff(
            session.current_diff(),
            config.diff_mode,
            &config.diff_multipliers,
        );
        let network_target = job.network_target();
        for device in 0..self.miner.device_count() {
            // One extranonce2 per device; the 32-bit nonce space inside it
            // is more than a scan ever covers between jobs.
            let nonce2 = device as u32;
            let extranonce2 = extranonce2_bytes(nonce2, session.extranonce2_size());
            let root = job.merkle_root(session.extranonce1(), &extranonce2, config.merkle_mode);
            self.miner.dispatch(WorkAssignment {
                origin: WorkOrigin {
                    pool,
                    job_id: job.id.clone(),
                },
                device,
                header_base: job.header_base(&root),
                share_target,
                network_target,
                target_diff,
                nonce2,
                ntime: job.ntime,
            });
        }
    }

    /// Drains finished batches, routes them to their pools and accounts them
    fn drain_miner(&mut self, notify: &mut dyn NotifySink) {
        for batch in self.miner.collect() {
            self.account_batch(&batch);
        }
        if !self.miner_failed {
            if let Some(what) = self.miner.failure() {
                self.miner_failed = true;
                self.miner.halt();
                log::error!("Something caused hashing to fail: \"{}\"", what);
                notify.message(
                    "Something caused hashing to fail. No numbers are being processed; \
                     the monitor stays up so you can check status.",
                );
            }
        }
    }

    fn account_batch(&mut self, batch: &NonceBatch) {
        self.tracking
            .scan_sample(batch.device_index, batch.scan_period);
        if batch.wrong > 0 {
            log::error!(
                "!!!! Device {} produced {} BAD HASH{} !!!!",
                batch.device_index,
                batch.wrong,
                if batch.wrong > 1 { "ES" } else { "" }
            );
        }
        let outcome = self.pools.submit(batch);
        self.tracking.device_result(
            batch.device_index,
            outcome.sent as u64,
            batch.wrong as u64,
            (outcome.stale + batch.discarded) as u64,
        );
        self.tracking.pool_sent(batch.origin.pool, outcome.sent as u64);
        if outcome.sent > 0 {
            log::info!(
                "Sending {} share(s) to pool \"{}\"",
                outcome.sent,
                self.pools.config(batch.origin.pool).name
            );
        }
        if outcome.stale > 0 {
            log::debug!(
                "{} stale result(s) from device {}",
                outcome.stale,
                batch.device_index
            );
        }
    }
}
