// src/stats/tracker.rs
//! Tracked values behind the monitoring commands
//!
//! The supervisor feeds this hub from pool events and miner batches; the
//! command handlers and push streams only ever read it. Times travel as
//! seconds since the epoch with zero meaning "never".

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Per-device share counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceShareStats {
    pub good: u64,
    pub bad: u64,
    pub stale: u64,
    /// When this device last produced a result
    pub last_result: u64,
}

/// Per-pool share counters and activation timers
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolShareStats {
    pub sent: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Cumulated difficulty of accepted shares
    pub accepted_diff: f64,
    /// Difficulty accepted per second, finer grained than per-device rates
    pub daps: f64,
    pub first_reply: u64,
    pub last_submit_reply: u64,
    pub last_activity: u64,
    pub last_activated: u64,
    pub last_conn_down: u64,
    pub num_activations: u32,
    /// Seconds this pool spent connected over the process lifetime
    pub cumulated_time: u64,
}

/// Sliding window over scan durations of one device
pub struct ScanWindow {
    window: Duration,
    samples: VecDeque<(Instant, Duration)>,
    last: Option<Duration>,
}

impl ScanWindow {
    pub fn new(window: Duration) -> Self {
        ScanWindow {
            window,
            samples: VecDeque::new(),
            last: None,
        }
    }

    pub fn push(&mut self, took: Duration) {
        self.push_at(Instant::now(), took);
    }

    fn push_at(&mut self, when: Instant, took: Duration) {
        self.last = Some(took);
        self.samples.push_back((when, took));
        let horizon = when.checked_sub(self.window);
        if let Some(horizon) = horizon {
            while self
                .samples
                .front()
                .is_some_and(|&(stamp, _)| stamp < horizon)
            {
                self.samples.pop_front();
            }
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().map(|&(_, took)| took).min()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().map(|&(_, took)| took).max()
    }

    pub fn avg(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().map(|&(_, took)| took).sum();
        Some(total / self.samples.len() as u32)
    }
}

/// Seconds since the epoch for the three interesting birth events
#[derive(Debug, Clone, Copy, Default)]
pub struct StartTimes {
    pub program: u64,
    pub hashing: u64,
    pub first_nonce: u64,
}

/// All values the monitoring plane serves
pub struct Tracking {
    pub devices: Vec<DeviceShareStats>,
    pub scan: Vec<ScanWindow>,
    pub pools: Vec<PoolShareStats>,
    pub start: StartTimes,
}

/// Scan-time statistics consider samples this recent
const SCAN_WINDOW: Duration = Duration::from_secs(300);

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or(0)
}

impl Tracking {
    pub fn new(devices: usize, pools: usize) -> Self {
        Tracking {
            devices: vec![DeviceShareStats::default(); devices],
            scan: (0..devices).map(|_| ScanWindow::new(SCAN_WINDOW)).collect(),
            pools: vec![PoolShareStats::default(); pools],
            start: StartTimes {
                program: now_secs(),
                ..StartTimes::default()
            },
        }
    }

    pub fn note_hashing_started(&mut self) {
        if self.start.hashing == 0 {
            self.start.hashing = now_secs();
        }
    }

    /// Accounts one finished batch on its device
    pub fn device_result(&mut self, device: usize, good: u64, bad: u64, stale: u64) {
        let Some(entry) = self.devices.get_mut(device) else {
            return;
        };
        entry.good += good;
        entry.bad += bad;
        entry.stale += stale;
        entry.last_result = now_secs();
        if self.start.first_nonce == 0 && good > 0 {
            self.start.first_nonce = entry.last_result;
        }
    }

    pub fn scan_sample(&mut self, device: usize, took: Duration) {
        if let Some(window) = self.scan.get_mut(device) {
            window.push(took);
        }
    }

    pub fn pool_sent(&mut self, pool: usize, count: u64) {
        if let Some(entry) = self.pools.get_mut(pool) {
            entry.sent += count;
        }
    }

    /// Accounts a share reply and refreshes the acceptance rate
    pub fn pool_reply(&mut self, pool: usize, accepted: bool, target_diff: f64) {
        let Some(entry) = self.pools.get_mut(pool) else {
            return;
        };
        let now = now_secs();
        if accepted {
            entry.accepted += 1;
            entry.accepted_diff += target_diff;
        } else {
            entry.rejected += 1;
        }
        if entry.first_reply == 0 {
            entry.first_reply = now;
        }
        entry.last_submit_reply = now;
        let lapse = now.saturating_sub(entry.first_reply);
        if lapse > 0 {
            entry.daps = entry.accepted_diff / lapse as f64;
        }
    }

    /// Any stratum traffic from the pool counts as activity
    pub fn pool_activity(&mut self, pool: usize) {
        if let Some(entry) = self.pools.get_mut(pool) {
            entry.last_activity = now_secs();
        }
    }

    pub fn pool_connecting(&mut self, pool: usize) {
        if let Some(entry) = self.pools.get_mut(pool) {
            entry.num_activations += 1;
        }
    }

    pub fn pool_activated(&mut self, pool: usize) {
        if let Some(entry) = self.pools.get_mut(pool) {
            entry.last_activated = now_secs();
        }
    }

    pub fn pool_down(&mut self, pool: usize) {
        let Some(entry) = self.pools.get_mut(pool) else {
            return;
        };
        let now = now_secs();
        if entry.last_activated != 0 {
            entry.cumulated_time += now.saturating_sub(entry.last_activated);
            entry.last_activated = 0;
        }
        entry.last_conn_down = now;
    }

    /// Per-pool share summary lines for the operator log
    pub fn log_share_summary(&self, names: &[String]) {
        for (index, entry) in self.pools.iter().enumerate() {
            let name = names.get(index).map(String::as_str).unwrap_or("?");
            log::info!(
                "pool \"{}\" sent/accepted/rejected {}/{}/{}",
                name,
                entry.sent,
                entry.accepted,
                entry.rejected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_nonce_is_latched_once() {
        let mut tracking = Tracking::new(2, 1);
        tracking.device_result(0, 0, 1, 0);
        assert_eq!(tracking.start.first_nonce, 0);
        tracking.device_result(0, 2, 0, 0);
        let first = tracking.start.first_nonce;
        assert_ne!(first, 0);
        tracking.device_result(1, 5, 0, 0);
        assert_eq!(tracking.start.first_nonce, first);
        assert_eq!(tracking.devices[0].good, 2);
        assert_eq!(tracking.devices[1].good, 5);
    }

    #[test]
    fn pool_replies_split_into_accept_and_reject() {
        let mut tracking = Tracking::new(1, 1);
        tracking.pool_sent(0, 3);
        tracking.pool_reply(0, true, 16.0);
        tracking.pool_reply(0, true, 16.0);
        tracking.pool_reply(0, false, 16.0);
        let entry = &tracking.pools[0];
        assert_eq!(entry.sent, 3);
        assert_eq!(entry.accepted, 2);
        assert_eq!(entry.rejected, 1);
        assert_eq!(entry.accepted_diff, 32.0);
        assert_ne!(entry.last_submit_reply, 0);
    }

    #[test]
    fn connection_lifecycle_accumulates_active_time() {
        let mut tracking = Tracking::new(1, 1);
        tracking.pool_connecting(0);
        tracking.pool_activated(0);
        // Pretend the pool has been up for a while.
        tracking.pools[0].last_activated = now_secs() - 90;
        tracking.pool_down(0);
        let entry = &tracking.pools[0];
        assert_eq!(entry.num_activations, 1);
        assert!(entry.cumulated_time >= 90);
        assert_eq!(entry.last_activated, 0);
        assert_ne!(entry.last_conn_down, 0);

        // A second drop without activation must not double count.
        let cumulated = entry.cumulated_time;
        tracking.pool_down(0);
        assert_eq!(tracking.pools[0].cumulated_time, cumulated);
    }

    #[test]
    fn scan_window_tracks_min_max_avg_and_evicts() {
        let mut window = ScanWindow::new(Duration::from_secs(60));
        let now = Instant::now();
        window.push_at(now - Duration::from_secs(120), Duration::from_millis(900));
        window.push_at(now - Duration::from_secs(10), Duration::from_millis(200));
        window.push_at(now, Duration::from_millis(400));
        // The two-minute-old sample fell out of the window.
        assert_eq!(window.min(), Some(Duration::from_millis(200)));
        assert_eq!(window.max(), Some(Duration::from_millis(400)));
        assert_eq!(window.avg(), Some(Duration::from_millis(300)));
        assert_eq!(window.last(), Some(Duration::from_millis(400)));
    }
}
