//! Mining statistics collection and reporting
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Mining statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningStatistics {
    // Performance metrics
    pub current_hashrate: f64,
    pub average_hashrate: f64,
    pub total_hashes: u64,
    pub mining_duration: Duration,

    // Current work
    pub current_height: u64,
    pub rounds: u64,
    pub stale_rounds: u64,

    // Results
    pub blocks_found: u64,
    pub blocks_submitted: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,

    // Errors
    pub rpc_errors: u64,
    pub worker_failures: u64,
    pub last_error: Option<String>,
}

/// Statistics collector for mining operations
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: MiningStatistics,
    start_time: Option<Instant>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start mining session
    pub fn start_mining(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Record a round that ran to completion
    pub fn record_round(&mut self, height: u64, hashes: u64, search_time: Duration) {
        self.stats.rounds += 1;
        self.stats.current_height = height;
        self.stats.current_hashrate = rate(hashes, search_time);
        self.add_hashes(hashes);

        info!(
            "Round {} at height {}: {} hashes in {:.2}s ({:.2} H/s)",
            self.stats.rounds,
            height,
            hashes,
            search_time.as_secs_f64(),
            self.stats.current_hashrate
        );
    }

    /// Record a round abandoned because the tip moved
    pub fn record_stale(&mut self, hashes: u64) {
        self.stats.rounds += 1;
        self.stats.stale_rounds += 1;
        self.add_hashes(hashes);
    }

    fn add_hashes(&mut self, hashes: u64) {
        self.stats.total_hashes += hashes;
        if let Some(start) = self.start_time {
            self.stats.mining_duration = start.elapsed();
            self.stats.average_hashrate = rate(self.stats.total_hashes, self.stats.mining_duration);
        }
    }

    pub fn worker_failed(&mut self, count: usize) {
        self.stats.worker_failures += count as u64;
    }

    pub fn block_found(&mut self) {
        self.stats.blocks_found += 1;
    }

    pub fn block_submitted(&mut self) {
        self.stats.blocks_submitted += 1;
    }

    pub fn block_accepted(&mut self) {
        self.stats.blocks_accepted += 1;
    }

    pub fn block_rejected(&mut self, reason: &str) {
        self.stats.blocks_rejected += 1;
        self.stats.last_error = Some(format!("block rejected: {reason}"));
    }

    pub fn record_error(&mut self, message: String) {
        self.stats.rpc_errors += 1;
        self.stats.last_error = Some(message);
    }

    /// Get current statistics snapshot
    pub fn get_stats(&self) -> MiningStatistics {
        self.stats.clone()
    }

    pub fn log_summary(&self) {
        let s = &self.stats;
        info!(
            "Totals: {} hashes over {:.0}s ({:.2} H/s avg), rounds {} ({} stale), blocks found {} / submitted {} / accepted {} / rejected {}, RPC errors {}",
            s.total_hashes,
            s.mining_duration.as_secs_f64(),
            s.average_hashrate,
            s.rounds,
            s.stale_rounds,
            s.blocks_found,
            s.blocks_submitted,
            s.blocks_accepted,
            s.blocks_rejected,
            s.rpc_errors
        );
    }
}

fn rate(hashes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        hashes as f64 / secs
    }
}
