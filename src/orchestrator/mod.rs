//! Mining Orchestrator - Runs the fetch, search, submit duty cycle against a node
//!
//! Each round fetches work, hands disjoint ranges to the worker pool, watches
//! the chain tip while the workers run, submits any candidate and resizes the
//! next round so the whole cycle stays near its target duration.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{BlockHash, NodeRpc, RpcError, SubmitOutcome, TemplateId, WorkTemplate};
use crate::error::MinerError;
use crate::miner::{
    Candidate, MiningEngine, NonceRange, NoncePartitioner, PowHasher, RoundReport, RoundSignals,
};

pub mod calibration;
pub mod retry;
mod stats;
pub mod template_cache;

pub use self::calibration::{CalibrationController, CalibrationState, IterationMode};
pub use self::retry::{Backoff, RetryPolicy};
pub use self::stats::{MiningStatistics, StatsCollector};
pub use self::template_cache::{RefreshOutcome, TemplateCache};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of worker threads for mining
    pub threads: usize,
    pub iterations: IterationMode,
    /// Wall-clock length of one full round
    pub target_round_duration: Duration,
    /// How often to poll the chain tip during a search
    pub stale_check_interval: Duration,
    /// Benchmark run before the first round to seed calibration; `None` skips it
    pub benchmark_duration: Option<Duration>,
    /// How often to log running totals
    pub stats_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            iterations: IterationMode::Auto,
            target_round_duration: Duration::from_secs(30),
            stale_check_interval: Duration::from_secs(2),
            benchmark_duration: Some(Duration::from_secs(2)),
            stats_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Where the scheduler is within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Fetch,
    Dispatch,
    Search,
    Collect,
    Submit,
    Calibrate,
    /// The round was abandoned; the next one starts from `Fetch`
    Stale,
    Shutdown,
}

/// Summary of a round that ran to the end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    pub template_id: TemplateId,
    pub candidate: Option<Candidate>,
    /// Node verdict, if a candidate was submitted and the node answered
    pub submitted: Option<SubmitOutcome>,
    pub iterations_completed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed(RoundResult),
    /// Work was abandoned because the tip moved or the template ran dry
    Stale {
        template: TemplateId,
        discarded_hashes: u64,
    },
    Shutdown,
}

enum SearchOutcome {
    Finished(RoundReport),
    Stale { tip: BlockHash, discarded_hashes: u64 },
    Fatal(RpcError),
    Shutdown,
}

/// Main orchestrator coordinating all mining operations
pub struct MiningOrchestrator<R: ?Sized, H> {
    config: OrchestratorConfig,
    /// Node gateway, only ever called from the control task
    rpc: Arc<R>,
    engine: Arc<MiningEngine<H>>,
    cache: TemplateCache,
    partitioner: NoncePartitioner,
    calibration: CalibrationController,
    stats_collector: StatsCollector,
    /// Paces re-fetches while templates keep running out of work indices
    exhaustion_backoff: Backoff,
    shutdown: CancellationToken,
    phase: SchedulerPhase,
    last_summary: Instant,
}

impl<R, H> MiningOrchestrator<R, H>
where
    R: NodeRpc + ?Sized,
    H: PowHasher + 'static,
{
    pub fn new(
        config: OrchestratorConfig,
        rpc: Arc<R>,
        hasher: H,
        shutdown: CancellationToken,
    ) -> Result<Self, MinerError> {
        let engine = MiningEngine::new(config.threads, hasher)?;
        let calibration = CalibrationController::new(config.iterations, config.target_round_duration);
        let exhaustion_backoff = Backoff::new(&config.retry);

        Ok(Self {
            config,
            rpc,
            engine: Arc::new(engine),
            cache: TemplateCache::new(),
            partitioner: NoncePartitioner::new(),
            calibration,
            stats_collector: StatsCollector::new(),
            exhaustion_backoff,
            shutdown,
            phase: SchedulerPhase::Fetch,
            last_summary: Instant::now(),
        })
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn stats(&self) -> MiningStatistics {
        self.stats_collector.get_stats()
    }

    pub fn calibration(&self) -> &CalibrationState {
        self.calibration.state()
    }

    pub fn template_cache(&self) -> &TemplateCache {
        &self.cache
    }

    /// Mine until the shutdown token fires or the node returns a fatal error.
    pub async fn run(&mut self) -> Result<(), MinerError> {
        info!(
            "Starting mining orchestrator: {} threads, {:?} round target",
            self.engine.threads(),
            self.config.target_round_duration
        );
        self.stats_collector.start_mining();
        self.last_summary = Instant::now();
        self.seed_calibration().await;

        let result = loop {
            match self.run_round().await {
                Ok(RoundOutcome::Shutdown) => break Ok(()),
                Ok(_) => {}
                Err(e) => {
                    error!("Mining stopped: {}", e);
                    break Err(e);
                }
            }

            if self.last_summary.elapsed() >= self.config.stats_interval {
                self.stats_collector.log_summary();
                self.last_summary = Instant::now();
            }
        };

        self.phase = SchedulerPhase::Shutdown;
        self.stats_collector.log_summary();
        info!("Mining orchestrator stopped");
        result
    }

    /// Run a single fetch, search, submit, calibrate pass.
    ///
    /// The round is timed from the start of the fetch attempt that succeeded;
    /// waits between failed attempts are not counted.
    pub async fn run_round(&mut self) -> Result<RoundOutcome, MinerError> {
        self.phase = SchedulerPhase::Fetch;
        let (refresh, round_start) = match self.fetch().await? {
            Some(fetched) => fetched,
            None => return Ok(self.shut_down()),
        };
        if let RefreshOutcome::Updated {
            replaced: Some(old), ..
        } = &refresh
        {
            info!("Chain tip moved, abandoning template {}", old);
        }
        let template = Arc::clone(refresh.template());

        self.phase = SchedulerPhase::Dispatch;
        let iterations = self.calibration.iterations_per_thread();
        let ranges = match self
            .partitioner
            .partition(&template, self.engine.threads(), iterations)
        {
            Ok(ranges) => {
                self.exhaustion_backoff.reset();
                ranges
            }
            Err(MinerError::SearchSpaceExhausted { template: id }) => {
                self.cache.invalidate();
                self.phase = SchedulerPhase::Stale;
                let delay = self.exhaustion_backoff.next_delay();
                warn!(
                    "Search space of template {} exhausted, requesting new work in {:?}",
                    id, delay
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(self.shut_down()),
                    _ = sleep(delay) => {}
                }
                return Ok(RoundOutcome::Stale {
                    template: id,
                    discarded_hashes: 0,
                });
            }
            Err(e) => return Err(e),
        };
        debug!(
            "Round on template {}: {} threads x {} iterations",
            template.id,
            ranges.len(),
            iterations
        );

        self.phase = SchedulerPhase::Search;
        let report = match self.search(&template, ranges).await {
            SearchOutcome::Finished(report) => report,
            SearchOutcome::Stale {
                tip,
                discarded_hashes,
            } => {
                info!(
                    "Chain tip moved to {}, discarding round on template {}",
                    tip, template.id
                );
                self.cache.invalidate();
                self.stats_collector.record_stale(discarded_hashes);
                self.phase = SchedulerPhase::Stale;
                return Ok(RoundOutcome::Stale {
                    template: template.id,
                    discarded_hashes,
                });
            }
            SearchOutcome::Fatal(e) => {
                self.stats_collector.record_error(e.to_string());
                return Err(e.into());
            }
            SearchOutcome::Shutdown => return Ok(self.shut_down()),
        };

        self.phase = SchedulerPhase::Collect;
        if report.failed_workers > 0 {
            self.stats_collector.worker_failed(report.failed_workers);
        }

        self.phase = SchedulerPhase::Submit;
        let submitted = match &report.candidate {
            Some(candidate) => {
                self.stats_collector.block_found();
                self.submit(&template, candidate).await?
            }
            None => None,
        };

        self.phase = SchedulerPhase::Calibrate;
        let elapsed = round_start.elapsed();
        self.stats_collector
            .record_round(template.height, report.hashes, report.elapsed);
        if report.candidate.is_none() {
            self.calibration.observe(elapsed);
        }

        Ok(RoundOutcome::Completed(RoundResult {
            template_id: template.id,
            candidate: report.candidate,
            submitted,
            iterations_completed: report.hashes,
            elapsed,
        }))
    }

    fn shut_down(&mut self) -> RoundOutcome {
        self.phase = SchedulerPhase::Shutdown;
        RoundOutcome::Shutdown
    }

    async fn seed_calibration(&mut self) {
        if self.calibration.is_fixed() {
            return;
        }
        let Some(duration) = self.config.benchmark_duration else {
            return;
        };

        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || engine.benchmark(duration)).await {
            Ok(Ok(report)) => {
                self.calibration.seed_from_hashrate(report.per_thread_hashrate());
            }
            Ok(Err(e)) => warn!("Benchmark failed, keeping default iterations: {}", e),
            Err(e) => warn!("Benchmark task failed, keeping default iterations: {}", e),
        }
    }

    /// Refresh the template, retrying transient failures until shutdown.
    ///
    /// Returns the refresh along with the start time of the attempt that
    /// succeeded.
    async fn fetch(&mut self) -> Result<Option<(RefreshOutcome, Instant)>, MinerError> {
        let mut backoff = Backoff::new(&self.config.retry);
        let shutdown = self.shutdown.clone();

        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            let attempt_start = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                result = self.cache.refresh(&*self.rpc) => result,
            };

            match result {
                Ok(outcome) => {
                    if backoff.attempts() > 0 {
                        info!("Template fetched after {} failed attempts", backoff.attempts());
                    }
                    return Ok(Some((outcome, attempt_start)));
                }
                Err(e) if e.is_fatal() => {
                    self.stats_collector.record_error(e.to_string());
                    return Err(e.into());
                }
                Err(e) => {
                    self.stats_collector.record_error(e.to_string());
                    let delay = backoff.next_delay();
                    warn!(
                        "Template fetch failed (attempt {}): {}. Retrying in {:?}",
                        backoff.attempts(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run the workers off the async runtime while watching the tip.
    async fn search(&self, template: &Arc<WorkTemplate>, ranges: Vec<NonceRange>) -> SearchOutcome {
        let signals = Arc::new(RoundSignals::new());
        let mut handle = {
            let engine = Arc::clone(&self.engine);
            let template = Arc::clone(template);
            let signals = Arc::clone(&signals);
            tokio::task::spawn_blocking(move || engine.search(&template, ranges, &signals))
        };

        let mut tip_check = tokio::time::interval(self.config.stale_check_interval);
        tip_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tip_check.tick().await;

        loop {
            let polled = tokio::select! {
                joined = &mut handle => return SearchOutcome::Finished(join_report(joined)),
                _ = self.shutdown.cancelled() => break,
                _ = tip_check.tick() => {
                    // A slow node must not hold up shutdown or a finished round
                    tokio::select! {
                        joined = &mut handle => return SearchOutcome::Finished(join_report(joined)),
                        _ = self.shutdown.cancelled() => break,
                        polled = self.rpc.get_tip_hash() => polled,
                    }
                }
            };

            match polled {
                Ok(tip) if self.cache.is_stale(&tip) => {
                    signals.cancel();
                    let report = join_report(handle.await);
                    return SearchOutcome::Stale {
                        tip,
                        discarded_hashes: report.hashes,
                    };
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    signals.cancel();
                    join_report(handle.await);
                    return SearchOutcome::Fatal(e);
                }
                Err(e) => debug!("Tip check failed, workers continue: {}", e),
            }
        }

        info!("Shutdown requested, stopping workers");
        signals.cancel();
        join_report(handle.await);
        SearchOutcome::Shutdown
    }

    /// Hand a candidate to the node; `None` if every attempt failed.
    async fn submit(
        &mut self,
        template: &WorkTemplate,
        candidate: &Candidate,
    ) -> Result<Option<SubmitOutcome>, MinerError> {
        let mut backoff = Backoff::new(&self.config.retry);
        let shutdown = self.shutdown.clone();
        self.stats_collector.block_submitted();

        loop {
            match self.rpc.submit_block(template, candidate).await {
                Ok(SubmitOutcome::Accepted) => {
                    info!(
                        "Block {} accepted at height {}",
                        candidate.hash, template.height
                    );
                    self.stats_collector.block_accepted();
                    // The tip is about to move past this template
                    self.cache.invalidate();
                    return Ok(Some(SubmitOutcome::Accepted));
                }
                Ok(SubmitOutcome::Rejected(reason)) => {
                    warn!("Block {} rejected by node: {}", candidate.hash, reason);
                    self.stats_collector.block_rejected(&reason);
                    return Ok(Some(SubmitOutcome::Rejected(reason)));
                }
                Err(e) if e.is_fatal() => {
                    self.stats_collector.record_error(e.to_string());
                    return Err(e.into());
                }
                Err(e) => {
                    self.stats_collector.record_error(e.to_string());
                    if backoff.attempts() + 1 >= self.config.retry.submit_attempts {
                        error!(
                            "Giving up on block {} after {} attempts: {}",
                            candidate.hash,
                            backoff.attempts() + 1,
                            e
                        );
                        return Ok(None);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "Block submission failed (attempt {}/{}): {}. Retrying in {:?}",
                        backoff.attempts(),
                        self.config.retry.submit_attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn join_report(joined: Result<RoundReport, JoinError>) -> RoundReport {
    match joined {
        Ok(report) => report,
        Err(e) => {
            error!("Search task failed: {}", e);
            RoundReport::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::calibration::MIN_SEED_ITERATIONS;
    use super::*;
    use crate::testing::{hash, MockNode, ScriptedHasher};

    fn config(iterations: IterationMode) -> OrchestratorConfig {
        OrchestratorConfig {
            threads: 2,
            iterations,
            target_round_duration: Duration::from_secs(30),
            stale_check_interval: Duration::from_millis(20),
            benchmark_duration: None,
            stats_interval: Duration::from_secs(60),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                submit_attempts: 3,
            },
        }
    }

    fn orchestrator(
        node: &Arc<MockNode>,
        iterations: IterationMode,
        hasher: ScriptedHasher,
    ) -> MiningOrchestrator<MockNode, ScriptedHasher> {
        orchestrator_with(node, config(iterations), hasher, CancellationToken::new())
    }

    fn orchestrator_with(
        node: &Arc<MockNode>,
        config: OrchestratorConfig,
        hasher: ScriptedHasher,
        shutdown: CancellationToken,
    ) -> MiningOrchestrator<MockNode, ScriptedHasher> {
        MiningOrchestrator::new(config, Arc::clone(node), hasher, shutdown).unwrap()
    }

    fn completed(outcome: RoundOutcome) -> RoundResult {
        match outcome {
            RoundOutcome::Completed(result) => result,
            other => panic!("expected a completed round, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_without_candidate_does_not_submit() {
        let node = Arc::new(MockNode::new(hash(1)));
        let mut orch = orchestrator(&node, IterationMode::Fixed(1000), ScriptedHasher::never());

        let result = completed(orch.run_round().await.unwrap());
        assert_eq!(result.candidate, None);
        assert_eq!(result.submitted, None);
        assert_eq!(result.iterations_completed, 2000);
        assert_eq!(node.submit_calls(), 0);
        assert_eq!(orch.phase(), SchedulerPhase::Calibrate);
    }

    #[tokio::test]
    async fn test_candidate_submitted_once() {
        let node = Arc::new(MockNode::new(hash(1)));
        let mut orch = orchestrator(&node, IterationMode::Fixed(1000), ScriptedHasher::winning_at(500));

        let result = completed(orch.run_round().await.unwrap());
        let candidate = result.candidate.unwrap();
        assert_eq!(candidate.nonce, 500);
        assert_eq!(result.submitted, Some(SubmitOutcome::Accepted));

        let submissions = node.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].0, result.template_id);
        assert_eq!(submissions[0].1.nonce, 500);
        assert_eq!(node.submit_calls(), 1);

        // Accepted block retires the template
        assert!(orch.template_cache().current().is_none());
        assert_eq!(orch.stats().blocks_accepted, 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_network_errors() {
        let node = Arc::new(MockNode::new(hash(1)));
        for _ in 0..3 {
            node.push_template_result(Err(RpcError::Network("connection refused".into())));
        }
        let mut orch = orchestrator(&node, IterationMode::Fixed(10), ScriptedHasher::never());

        let result = completed(orch.run_round().await.unwrap());
        assert_eq!(node.template_calls(), 4);
        assert_eq!(result.template_id.prev_hash, hash(1));
        assert_eq!(orch.stats().rpc_errors, 3);
        assert_ne!(orch.phase(), SchedulerPhase::Shutdown);
    }

    #[tokio::test]
    async fn test_auth_error_is_fatal() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_template_result(Err(RpcError::Auth { status: 401 }));
        let mut orch = orchestrator(&node, IterationMode::Fixed(10), ScriptedHasher::never());

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, MinerError::Rpc(RpcError::Auth { status: 401 })));
        assert_eq!(node.template_calls(), 1);
        assert_eq!(orch.phase(), SchedulerPhase::Shutdown);
    }

    #[tokio::test]
    async fn test_tip_change_discards_round() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_tip_result(Ok(hash(2)));
        let hasher = ScriptedHasher::winning_at(900_000).with_delay(Duration::from_micros(50));
        let mut orch = orchestrator(&node, IterationMode::Fixed(1_000_000), hasher);

        match orch.run_round().await.unwrap() {
            RoundOutcome::Stale { template, .. } => assert_eq!(template.prev_hash, hash(1)),
            other => panic!("expected a stale round, got {other:?}"),
        }
        assert_eq!(node.submit_calls(), 0);
        assert_eq!(orch.phase(), SchedulerPhase::Stale);
        assert!(orch.template_cache().current().is_none());
        assert_eq!(orch.stats().stale_rounds, 1);
    }

    #[tokio::test]
    async fn test_rejected_block_keeps_mining() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_submit_result(Ok(SubmitOutcome::Rejected("high-hash".into())));
        let mut orch = orchestrator(&node, IterationMode::Fixed(1000), ScriptedHasher::winning_at(500));

        let result = completed(orch.run_round().await.unwrap());
        assert_eq!(result.submitted, Some(SubmitOutcome::Rejected("high-hash".into())));
        assert_eq!(orch.stats().blocks_rejected, 1);

        // Same template is kept and the next round continues past the searched ranges
        let next = completed(orch.run_round().await.unwrap());
        assert_eq!(next.template_id, result.template_id);
        assert_eq!(next.candidate, None);
    }

    #[tokio::test]
    async fn test_submit_retries_transient_errors() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_submit_result(Err(RpcError::Timeout));
        node.push_submit_result(Err(RpcError::Network("reset".into())));
        let mut orch = orchestrator(&node, IterationMode::Fixed(1000), ScriptedHasher::winning_at(10));

        let result = completed(orch.run_round().await.unwrap());
        assert_eq!(result.submitted, Some(SubmitOutcome::Accepted));
        assert_eq!(node.submit_calls(), 3);
    }

    #[tokio::test]
    async fn test_submit_gives_up_after_attempts() {
        let node = Arc::new(MockNode::new(hash(1)));
        for _ in 0..3 {
            node.push_submit_result(Err(RpcError::Timeout));
        }
        let mut orch = orchestrator(&node, IterationMode::Fixed(1000), ScriptedHasher::winning_at(10));

        let result = completed(orch.run_round().await.unwrap());
        assert!(result.candidate.is_some());
        assert_eq!(result.submitted, None);
        assert_eq!(node.submit_calls(), 3);
    }

    #[tokio::test]
    async fn test_auto_calibration_grows_fast_rounds() {
        let node = Arc::new(MockNode::new(hash(1)));
        let mut orch = orchestrator(&node, IterationMode::Auto, ScriptedHasher::never());
        let before = orch.calibration().iterations_per_thread;

        completed(orch.run_round().await.unwrap());
        assert_eq!(orch.calibration().iterations_per_thread, before * 2);
        assert!(orch.calibration().last_round_duration.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_template_is_invalidated() {
        let node = Arc::new(MockNode::new(hash(1)));
        let mut orch = orchestrator(&node, IterationMode::Fixed(u64::MAX / 2 + 1), ScriptedHasher::never());

        let outcome = orch.run_round().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Stale { discarded_hashes: 0, .. }));
        assert!(orch.template_cache().current().is_none());
    }

    #[tokio::test]
    async fn test_repeated_exhaustion_backs_off() {
        let node = Arc::new(MockNode::new(hash(1)));
        let mut config = config(IterationMode::Fixed(u64::MAX));
        config.retry.initial_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(40);
        let mut orch = orchestrator_with(&node, config, ScriptedHasher::never(), CancellationToken::new());

        let start = Instant::now();
        for _ in 0..3 {
            let outcome = orch.run_round().await.unwrap();
            assert!(matches!(outcome, RoundOutcome::Stale { discarded_hashes: 0, .. }));
        }

        // 10ms + 20ms + 40ms between the three fetches
        assert!(start.elapsed() >= Duration::from_millis(70));
        assert_eq!(node.template_calls(), 3);
        assert_eq!(orch.stats().total_hashes, 0);
    }

    #[tokio::test]
    async fn test_fatal_tip_poll_stops_search() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_tip_result(Err(RpcError::Auth { status: 403 }));
        let hasher = ScriptedHasher::never().with_delay(Duration::from_micros(50));
        let mut orch = orchestrator(&node, IterationMode::Fixed(1_000_000), hasher);

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, MinerError::Rpc(RpcError::Auth { status: 403 })));
        assert_eq!(orch.phase(), SchedulerPhase::Shutdown);
        assert_eq!(node.tip_calls(), 1);
        assert_eq!(node.submit_calls(), 0);
        assert_eq!(orch.stats().rpc_errors, 1);
    }

    #[tokio::test]
    async fn test_transient_tip_poll_error_keeps_searching() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_tip_result(Err(RpcError::Timeout));
        let hasher = ScriptedHasher::never().with_delay(Duration::from_micros(50));
        let mut orch = orchestrator(&node, IterationMode::Fixed(3000), hasher);

        let result = completed(orch.run_round().await.unwrap());
        assert_eq!(result.iterations_completed, 6000);
        assert!(node.tip_calls() >= 2);
        assert_eq!(orch.stats().stale_rounds, 0);
    }

    #[tokio::test]
    async fn test_hung_tip_poll_does_not_hold_finished_round() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.set_tip_delay(Duration::from_secs(30));
        let hasher = ScriptedHasher::never().with_delay(Duration::from_micros(50));
        let mut orch = orchestrator(&node, IterationMode::Fixed(2000), hasher);

        let outcome = tokio::time::timeout(Duration::from_secs(10), orch.run_round())
            .await
            .expect("round waited on the tip poll")
            .unwrap();
        assert_eq!(completed(outcome).iterations_completed, 4000);
        assert!(node.tip_calls() >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_hung_tip_poll() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.set_tip_delay(Duration::from_secs(30));
        let token = CancellationToken::new();
        let hasher = ScriptedHasher::never().with_delay(Duration::from_micros(50));
        let mut orch = orchestrator_with(
            &node,
            config(IterationMode::Fixed(1_000_000)),
            hasher,
            token.clone(),
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        tokio::time::timeout(Duration::from_secs(10), orch.run())
            .await
            .expect("shutdown waited on the tip poll")
            .unwrap();
        assert_eq!(orch.phase(), SchedulerPhase::Shutdown);
        assert!(node.tip_calls() >= 1);
    }

    #[tokio::test]
    async fn test_fetch_retry_wait_not_counted_in_round() {
        let node = Arc::new(MockNode::new(hash(1)));
        node.push_template_result(Err(RpcError::Network("connection refused".into())));
        let mut config = config(IterationMode::Auto);
        config.target_round_duration = Duration::from_secs(1);
        config.retry.initial_delay = Duration::from_millis(1200);
        config.retry.max_delay = Duration::from_millis(1200);
        let mut orch = orchestrator_with(&node, config, ScriptedHasher::never(), CancellationToken::new());
        let before = orch.calibration().iterations_per_thread;

        let result = completed(orch.run_round().await.unwrap());
        assert_eq!(node.template_calls(), 2);
        assert!(result.elapsed < Duration::from_millis(1200));
        assert!(orch.calibration().iterations_per_thread >= before);
    }

    #[tokio::test]
    async fn test_startup_benchmark_seeds_calibration() {
        let node = Arc::new(MockNode::new(hash(1)));
        let mut config = config(IterationMode::Auto);
        config.target_round_duration = Duration::from_secs(1);
        config.benchmark_duration = Some(Duration::from_millis(30));
        let token = CancellationToken::new();
        // At most 20k hashes per second per thread
        let hasher = ScriptedHasher::never().with_delay(Duration::from_micros(50));
        let mut orch = orchestrator_with(&node, config, hasher, token.clone());

        token.cancel();
        orch.run().await.unwrap();

        let seeded = orch.calibration().iterations_per_thread;
        assert!((MIN_SEED_ITERATIONS..=20_000).contains(&seeded), "seeded {seeded}");
        assert_eq!(orch.calibration().last_round_duration, None);
        assert_eq!(node.template_calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_search() {
        let node = Arc::new(MockNode::new(hash(1)));
        let token = CancellationToken::new();
        let hasher = ScriptedHasher::never().with_delay(Duration::from_micros(50));
        let mut orch = orchestrator_with(
            &node,
            config(IterationMode::Fixed(1_000_000)),
            hasher,
            token.clone(),
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        orch.run().await.unwrap();
        assert_eq!(orch.phase(), SchedulerPhase::Shutdown);
        assert_eq!(node.submit_calls(), 0);
    }
}
