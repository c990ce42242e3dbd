use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use super::hasher::{hash_meets_target, PowHasher, HEADER_SIZE};
use super::partition::{split_index, NonceRange};
use super::solution::Candidate;
use crate::chain::template::set_header_nonce;
use crate::chain::{BlockHash, WorkTemplate};

/// How many hashes a worker does between checks of the round signals.
pub const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Flags shared by every worker of one round.
#[derive(Debug, Default)]
pub struct RoundSignals {
    cancelled: AtomicBool,
    solved: AtomicBool,
}

impl RoundSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask all workers to stop without a result.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns true for exactly one caller per round.
    pub fn claim_solution(&self) -> bool {
        self.solved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_solved(&self) -> bool {
        self.solved.load(Ordering::Acquire)
    }

    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.is_solved()
    }
}

/// How a worker's search ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Found { candidate: Candidate, hashes: u64 },
    Exhausted { hashes: u64 },
    /// Cancelled, or another worker won the round
    Interrupted { hashes: u64 },
    /// The worker panicked
    Failed,
}

impl WorkerOutcome {
    pub fn hashes(&self) -> u64 {
        match self {
            WorkerOutcome::Found { hashes, .. }
            | WorkerOutcome::Exhausted { hashes }
            | WorkerOutcome::Interrupted { hashes } => *hashes,
            WorkerOutcome::Failed => 0,
        }
    }
}

pub struct MiningWorker<'a> {
    pub id: usize,
    pub range: NonceRange,
    signals: &'a RoundSignals,
}

impl<'a> MiningWorker<'a> {
    pub fn new(range: NonceRange, signals: &'a RoundSignals) -> Self {
        Self {
            id: range.worker,
            range,
            signals,
        }
    }

    pub fn mine<H: PowHasher + ?Sized>(&self, template: &WorkTemplate, hasher: &H) -> WorkerOutcome {
        let start_time = Instant::now();
        let mut hashes = 0u64;
        let mut header = [0u8; HEADER_SIZE];
        let mut extra_nonce_in_header = None;

        debug!(
            "Worker {} starting on template {}. Range: {} to {}",
            self.id, template.id, self.range.start, self.range.end
        );

        for index in self.range.start..self.range.end {
            if hashes % CANCEL_CHECK_INTERVAL == 0 && self.signals.should_stop() {
                debug!("Worker {} interrupted after {} hashes", self.id, hashes);
                return WorkerOutcome::Interrupted { hashes };
            }

            let (extra_nonce, nonce) = split_index(index);
            if extra_nonce_in_header == Some(extra_nonce) {
                set_header_nonce(&mut header, nonce);
            } else {
                header = template.header(&template.merkle_root(extra_nonce), nonce);
                extra_nonce_in_header = Some(extra_nonce);
            }

            let hash = hasher.hash_header(&header);
            hashes += 1;

            if hash_meets_target(&hash, &template.target) {
                if !self.signals.claim_solution() {
                    return WorkerOutcome::Interrupted { hashes };
                }

                let candidate = Candidate {
                    template_id: template.id,
                    worker: self.id,
                    extra_nonce,
                    nonce,
                    hash: BlockHash::from_internal_bytes(hash),
                    hash_attempts: hashes,
                };
                info!(
                    "Worker {} found candidate {} in {:?}",
                    self.id,
                    candidate,
                    start_time.elapsed()
                );
                return WorkerOutcome::Found { candidate, hashes };
            }
        }

        debug!("Worker {} exhausted its range after {} hashes", self.id, hashes);
        WorkerOutcome::Exhausted { hashes }
    }
}
