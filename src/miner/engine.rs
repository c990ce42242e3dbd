use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::hasher::PowHasher;
use super::partition::{partition_from, NonceRange};
use super::solution::Candidate;
use super::worker::{MiningWorker, RoundSignals, WorkerOutcome};
use crate::chain::WorkTemplate;
use crate::error::MinerError;

/// Per-thread range used by the benchmark; large enough that only the timer ends it.
const BENCHMARK_RANGE: u64 = 1 << 40;

/// Aggregate of every worker's outcome for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub candidate: Option<Candidate>,
    pub hashes: u64,
    pub elapsed: Duration,
    pub failed_workers: usize,
}

impl RoundReport {
    fn from_outcomes(outcomes: Vec<WorkerOutcome>, elapsed: Duration) -> Self {
        let mut report = RoundReport {
            elapsed,
            ..RoundReport::default()
        };
        for outcome in outcomes {
            report.hashes += outcome.hashes();
            match outcome {
                WorkerOutcome::Found { candidate, .. } if report.candidate.is_none() => {
                    report.candidate = Some(candidate);
                }
                WorkerOutcome::Failed => report.failed_workers += 1,
                _ => {}
            }
        }
        report
    }

    pub fn hashrate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.hashes as f64 / secs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub threads: usize,
    pub hashes: u64,
    pub elapsed: Duration,
}

impl BenchmarkReport {
    pub fn hashrate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.hashes as f64 / secs
    }

    pub fn per_thread_hashrate(&self) -> f64 {
        self.hashrate() / self.threads.max(1) as f64
    }
}

/// Fixed-size pool of search threads.
pub struct MiningEngine<H> {
    threads: usize,
    pool: ThreadPool,
    hasher: H,
}

impl<H: PowHasher> MiningEngine<H> {
    pub fn new(threads: usize, hasher: H) -> Result<Self, MinerError> {
        if threads == 0 {
            return Err(MinerError::WorkerPool("thread count must be at least 1".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("veco-worker-{i}"))
            .build()
            .map_err(|e| MinerError::WorkerPool(e.to_string()))?;

        info!("Mining engine ready with {} worker threads", threads);
        Ok(Self {
            threads,
            pool,
            hasher,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run one worker per range and wait for all of them.
    ///
    /// Blocks the calling thread until every worker has finished, been
    /// cancelled, or yielded to a winner.
    pub fn search(
        &self,
        template: &WorkTemplate,
        ranges: Vec<NonceRange>,
        signals: &RoundSignals,
    ) -> RoundReport {
        let start_time = Instant::now();
        let hasher = &self.hasher;

        debug!(
            "Dispatching {} ranges on template {}",
            ranges.len(),
            template.id
        );

        let outcomes: Vec<WorkerOutcome> = self.pool.install(|| {
            ranges
                .into_par_iter()
                .map(|range| {
                    let worker = MiningWorker::new(range, signals);
                    match panic::catch_unwind(AssertUnwindSafe(|| worker.mine(template, hasher))) {
                        Ok(outcome) => outcome,
                        Err(payload) => {
                            error!("Worker {} panicked: {}", range.worker, panic_message(&*payload));
                            WorkerOutcome::Failed
                        }
                    }
                })
                .collect()
        });

        RoundReport::from_outcomes(outcomes, start_time.elapsed())
    }

    /// Hash synthetic work on every thread for `duration`.
    pub fn benchmark(&self, duration: Duration) -> Result<BenchmarkReport, MinerError> {
        let template = WorkTemplate::benchmark()?;
        let ranges = partition_from(0, self.threads, BENCHMARK_RANGE).ok_or(
            MinerError::SearchSpaceExhausted {
                template: template.id,
            },
        )?;
        let signals = RoundSignals::new();

        info!(
            "Benchmarking {} threads for {:?}",
            self.threads, duration
        );

        let report = std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(duration);
                signals.cancel();
            });
            self.search(&template, ranges, &signals)
        });

        let report = BenchmarkReport {
            threads: self.threads,
            hashes: report.hashes,
            elapsed: report.elapsed,
        };
        info!(
            "Benchmark: {:.2} H/s total, {:.2} H/s per thread",
            report.hashrate(),
            report.per_thread_hashrate()
        );
        Ok(report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
