// src/miner/worker.rs
//! Worker thread implementation
//!
//! Each worker owns one device slot: it scans nonce batches against the
//! published work unit for its device and reports verified nonces back to
//! the scheduler. A worker that cannot hash reports the failure and dies;
//! the supervisor latches that into the quiescent state.

use crate::miner::algorithm::Algorithm;
use crate::miner::{FoundNonce, NonceBatch, WorkAssignment, WorkOrigin};
use crate::stratum::job::scaled_hash_diff;
use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Worker thread that performs the hash scans for one device slot
pub struct Worker {
    device: usize,
    algorithm: Arc<dyn Algorithm>,
    assignments: Arc<ArcSwap<Vec<Option<WorkAssignment>>>>,
    batch_sender: Sender<NonceBatch>,
    failure_sender: Sender<String>,
    active: Arc<AtomicBool>,
    batch_size: u64,
}

impl Worker {
    pub fn new(
        device: usize,
        algorithm: Arc<dyn Algorithm>,
        assignments: Arc<ArcSwap<Vec<Option<WorkAssignment>>>>,
        batch_sender: Sender<NonceBatch>,
        failure_sender: Sender<String>,
        active: Arc<AtomicBool>,
        batch_size: u64,
    ) -> Self {
        Worker {
            device,
            algorithm,
            assignments,
            batch_sender,
            failure_sender,
            active,
            batch_size: batch_size.max(1),
        }
    }

    /// Scans until deactivated
    ///
    /// Work units are keyed by (origin, nonce2); whenever the published unit
    /// changes key the nonce space restarts from zero. An exhausted 32-bit
    /// space leaves the worker idle until new work arrives.
    pub fn run(&mut self) {
        let mut current_key: Option<(WorkOrigin, u32)> = None;
        let mut next_nonce: u64 = 0;

        while self.active.load(Ordering::Relaxed) {
            let slots = self.assignments.load();
            let work = match slots.get(self.device).and_then(|slot| slot.clone()) {
                Some(work) => work,
                None => {
                    current_key = None;
                    std::thread::sleep(std::time::Duration::from_millis(100));
                    continue;
                }
            };
            drop(slots);

            let key = (work.origin.clone(), work.nonce2);
            if current_key.as_ref() != Some(&key) {
                current_key = Some(key);
                next_nonce = 0;
            }
            if next_nonce > u32::MAX as u64 {
                std::thread::sleep(std::time::Duration::from_millis(100));
                continue;
            }
            let start = next_nonce;
            let end = (start + self.batch_size).min(u32::MAX as u64 + 1);
            next_nonce = end;

            let begun = Instant::now();
            let found: Vec<FoundNonce> = (start..end)
                .into_par_iter()
                .filter_map(|nonce| self.check_nonce(&work, nonce as u32))
                .collect();
            if found.is_empty() {
                continue;
            }
            let batch = NonceBatch {
                origin: work.origin.clone(),
                nonce2: work.nonce2,
                nonces: found,
                wrong: 0,
                discarded: 0,
                device_index: self.device,
                target_diff: work.target_diff,
                scan_period: begun.elapsed(),
                scanned: end - start,
            };
            if self.batch_sender.send(batch).is_err() {
                return; // scheduler is gone
            }
        }
    }

    fn check_nonce(&self, work: &WorkAssignment, nonce: u32) -> Option<FoundNonce> {
        let hash = match self.algorithm.hash(&work.header_base, nonce) {
            Ok(hash) => hash,
            Err(e) => {
                let _ = self.failure_sender.send(format!("hashing failed: {}", e));
                self.active.store(false, Ordering::SeqCst);
                return None;
            }
        };
        // Targets compare numerically with the digest read back to front.
        let mut value = hash;
        value.reverse();
        if value > work.share_target {
            return None;
        }
        Some(FoundNonce {
            nonce,
            diff: scaled_hash_diff(&value, &work.share_target, work.target_diff),
            hash_prefix: [hash[0], hash[1], hash[2], hash[3]],
            block: value <= work.network_target,
        })
    }
}
