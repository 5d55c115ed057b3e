//! Stage scheduler: turns the ramp profile into running virtual users.
//!
//! Every `tick` the scheduler reads the target VU count for the elapsed run
//! time from the [`StageProfile`] and reconciles the live VU set with it:
//!
//! - below target: spawn new VU tasks, each with a fresh, never reused id
//! - above target: mark the newest VUs for retirement
//!
//! Retirement is cooperative. A marked VU finishes its in-flight request and
//! its pause, then exits; nothing is aborted mid-request. Once the profile's
//! total duration has elapsed every VU is marked and the scheduler waits for
//! all of them to exit.
//!
//! ```text
//! Idle -> Ramping(0) -> Ramping(1) -> ... -> Draining -> Terminated
//! ```
//!
//! Periodic threshold evaluation snapshots and sorts the aggregator on the
//! blocking pool, so the tick loop and VU tasks never wait on it.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::MetricsAggregator;
use crate::config::RunConfig;
use crate::executor::RequestExecutor;
use crate::metrics::{ACTIVE_VUS, ITERATIONS_TOTAL, TARGET_VUS};
use crate::stages::StageProfile;
use crate::thresholds::{evaluate, RunResult, ThresholdRule};
use crate::workload::WorkloadGenerator;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("No stages configured; nothing to schedule")]
    NoStages,

    #[error("Virtual user {vu_id} panicked: {message}")]
    VuPanicked { vu_id: u64, message: String },
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Ramping(usize),
    Draining,
    Terminated,
}

/// What the scheduler did during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub vus_spawned: u64,
    pub peak_vus: usize,
    pub iterations: u64,
    /// True when a periodic evaluation stopped the run early
    pub aborted: bool,
}

/// Everything a VU task needs, shared by all VUs.
struct VuContext<E> {
    executor: Arc<E>,
    generator: Arc<WorkloadGenerator>,
    aggregator: Arc<MetricsAggregator>,
    think_time: Duration,
}

impl<E> Clone for VuContext<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            generator: self.generator.clone(),
            aggregator: self.aggregator.clone(),
            think_time: self.think_time,
        }
    }
}

struct VuHandle {
    vu_id: u64,
    retire: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl VuHandle {
    fn mark_for_retirement(&self) {
        // The VU may already have exited; that is fine.
        let _ = self.retire.send(true);
    }
}

/// Drives VU tasks along a stage profile.
pub struct StageScheduler {
    profile: StageProfile,
    generator: Arc<WorkloadGenerator>,
    think_time: Duration,
    tick: Duration,
    seed: Option<u64>,
    thresholds: Arc<[ThresholdRule]>,
    evaluation_interval: Option<Duration>,
    state: SchedulerState,
    transitions: Vec<SchedulerState>,
}

impl StageScheduler {
    /// Scheduler for `config`, generating keys tagged with the current time.
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config, WorkloadGenerator::new(config.workload_config()))
    }

    pub fn new(config: &RunConfig, generator: WorkloadGenerator) -> Self {
        Self {
            profile: config.stage_profile(),
            generator: Arc::new(generator),
            think_time: config.think_time,
            tick: config.scheduler_tick,
            seed: config.seed,
            thresholds: config.thresholds.clone().into(),
            evaluation_interval: config.evaluation_interval,
            state: SchedulerState::Idle,
            transitions: vec![SchedulerState::Idle],
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Every state entered so far, oldest first, starting with `Idle`.
    pub fn transitions(&self) -> &[SchedulerState] {
        &self.transitions
    }

    fn enter(&mut self, state: SchedulerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Scheduler state change");
            self.state = state;
            self.transitions.push(state);
        }
    }

    pub fn profile(&self) -> &StageProfile {
        &self.profile
    }

    /// Runs the whole profile, then drains. Returns once every VU has exited.
    pub async fn run<E>(
        &mut self,
        executor: Arc<E>,
        aggregator: Arc<MetricsAggregator>,
    ) -> Result<RunSummary, SchedulerError>
    where
        E: RequestExecutor + 'static,
    {
        if self.profile.stages().is_empty() {
            return Err(SchedulerError::NoStages);
        }
        if self.profile.peak_target() == 0 {
            warn!("No stage has a positive VU target; the run will send no requests");
        }

        let ctx = VuContext {
            executor,
            generator: self.generator.clone(),
            aggregator: aggregator.clone(),
            think_time: self.think_time,
        };
        let total = self.profile.total_duration();

        let mut active: Vec<VuHandle> = Vec::new();
        let mut retiring: Vec<VuHandle> = Vec::new();
        let mut next_vu_id: u64 = 0;
        let mut peak_vus = 0usize;
        let mut iterations = 0u64;
        let mut aborted = false;

        let start = Instant::now();
        let mut next_evaluation = self.evaluation_interval.and_then(|i| start.checked_add(i));
        let mut pending_evaluation: Option<JoinHandle<RunResult>> = None;
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            stages = self.profile.stages().len(),
            total_duration_secs = total.as_secs_f64(),
            tick_ms = self.tick.as_millis() as u64,
            "Scheduler starting"
        );

        let outcome = async {
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let elapsed = now.duration_since(start);

                if elapsed > total || aborted {
                    break;
                }

                if let Some(index) = self.profile.stage_index_at(elapsed) {
                    if self.state != SchedulerState::Ramping(index) {
                        info!(
                            stage = index,
                            target = self.profile.stages()[index].target,
                            elapsed_secs = elapsed.as_secs_f64(),
                            "Entering stage"
                        );
                    }
                    self.enter(SchedulerState::Ramping(index));
                }

                let target = self.profile.target_vus_at(elapsed);
                TARGET_VUS.set(target as i64);

                while active.len() < target {
                    active.push(spawn_vu(&ctx, next_vu_id, self.seed));
                    next_vu_id += 1;
                }
                while active.len() > target {
                    if let Some(vu) = active.pop() {
                        debug!(vu_id = vu.vu_id, "Retiring VU");
                        vu.mark_for_retirement();
                        retiring.push(vu);
                    }
                }
                peak_vus = peak_vus.max(active.len());
                ACTIVE_VUS.set((active.len() + retiring.len()) as i64);

                iterations += reap_finished(&mut retiring).await?;
                iterations += reap_finished(&mut active).await?;

                if pending_evaluation.as_ref().map_or(false, |task| task.is_finished()) {
                    if let Some(task) = pending_evaluation.take() {
                        match task.await {
                            Ok(result) => {
                                for failed in result.failed_outcomes() {
                                    warn!(
                                        threshold = %failed.rule,
                                        observed = failed.observed,
                                        elapsed_secs = elapsed.as_secs_f64(),
                                        "Threshold failing during run"
                                    );
                                }
                                if result.should_abort() {
                                    warn!("Aborting run: a threshold marked abortOnFail failed");
                                    aborted = true;
                                }
                            }
                            Err(e) => warn!(error = %e, "Periodic threshold evaluation failed"),
                        }
                    }
                }

                if let (Some(due), Some(every)) = (next_evaluation, self.evaluation_interval) {
                    if now >= due && pending_evaluation.is_none() {
                        let aggregator = aggregator.clone();
                        let rules = self.thresholds.clone();
                        pending_evaluation = Some(tokio::task::spawn_blocking(move || {
                            evaluate(&aggregator.snapshot(), &rules)
                        }));
                        next_evaluation = due.checked_add(every);
                    }
                }
            }
            Ok::<(), SchedulerError>(())
        }
        .await;

        self.enter(SchedulerState::Draining);
        TARGET_VUS.set(0);
        info!(
            live_vus = active.len() + retiring.len(),
            aborted = aborted,
            "Draining virtual users"
        );
        for vu in active.drain(..) {
            vu.mark_for_retirement();
            retiring.push(vu);
        }

        // Join everything even after a fault so no VU outlives the run
        let mut first_error = outcome.err();
        for vu in retiring.drain(..) {
            match join_vu(vu).await {
                Ok(n) => iterations += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        ACTIVE_VUS.set(0);
        self.enter(SchedulerState::Terminated);

        if let Some(e) = first_error {
            return Err(e);
        }

        let summary = RunSummary {
            elapsed: start.elapsed(),
            vus_spawned: next_vu_id,
            peak_vus,
            iterations,
            aborted,
        };
        info!(
            elapsed_secs = summary.elapsed.as_secs_f64(),
            vus_spawned = summary.vus_spawned,
            peak_vus = summary.peak_vus,
            iterations = summary.iterations,
            "Scheduler terminated"
        );
        Ok(summary)
    }
}

/// Per-VU random source. Seeded runs give every VU its own reproducible stream.
fn vu_rng(seed: Option<u64>, vu_id: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ vu_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        None => StdRng::from_entropy(),
    }
}

fn spawn_vu<E>(ctx: &VuContext<E>, vu_id: u64, seed: Option<u64>) -> VuHandle
where
    E: RequestExecutor + 'static,
{
    let (retire_tx, retire_rx) = watch::channel(false);
    let rng = vu_rng(seed, vu_id);
    debug!(vu_id = vu_id, "Spawning VU");
    let handle = tokio::spawn(run_vu(ctx.clone(), vu_id, rng, retire_rx));
    VuHandle {
        vu_id,
        retire: retire_tx,
        handle,
    }
}

/// One VU: generate, execute, record, pause, until retired.
///
/// Returns the number of completed iterations.
async fn run_vu<E>(
    ctx: VuContext<E>,
    vu_id: u64,
    mut rng: StdRng,
    retire: watch::Receiver<bool>,
) -> u64
where
    E: RequestExecutor + 'static,
{
    let mut iteration: u64 = 0;

    // A dropped sender counts as retirement
    while !*retire.borrow() && retire.has_changed().is_ok() {
        let request = ctx.generator.generate(vu_id, iteration, &mut rng);
        let sample = ctx.executor.execute(&request).await;
        ctx.aggregator.record(sample);
        ITERATIONS_TOTAL.inc();
        iteration += 1;

        if !ctx.think_time.is_zero() {
            time::sleep(ctx.think_time).await;
        }
    }

    debug!(vu_id = vu_id, iterations = iteration, "VU exiting");
    iteration
}

/// Joins every VU in `vus` that has already exited; returns their iterations.
async fn reap_finished(vus: &mut Vec<VuHandle>) -> Result<u64, SchedulerError> {
    let mut iterations = 0;
    let mut index = 0;
    while index < vus.len() {
        if vus[index].handle.is_finished() {
            let vu = vus.swap_remove(index);
            iterations += join_vu(vu).await?;
        } else {
            index += 1;
        }
    }
    Ok(iterations)
}

async fn join_vu(vu: VuHandle) -> Result<u64, SchedulerError> {
    let vu_id = vu.vu_id;
    vu.handle.await.map_err(|e| {
        error!(vu_id = vu_id, error = %e, "VU task failed");
        SchedulerError::VuPanicked {
            vu_id,
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MetricSample, RequestKind};
    use crate::stages::Stage;
    use crate::workload::WorkloadRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that answers instantly and tracks concurrency.
    struct StubExecutor {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: AtomicUsize,
    }

    impl StubExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RequestExecutor for StubExecutor {
        async fn execute(&self, request: &WorkloadRequest) -> MetricSample {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            MetricSample::from_status(RequestKind::from(request), 200, self.delay)
        }
    }

    fn config(stages: Vec<Stage>) -> RunConfig {
        let mut config = RunConfig::new("http://ledger.test", "debit", "credit");
        config.stages = stages;
        config.think_time = Duration::from_millis(5);
        config.scheduler_tick = Duration::from_millis(10);
        config.seed = Some(1);
        config.write_ratio = 0.0;
        config
    }

    #[tokio::test]
    async fn runs_profile_to_termination() {
        let config = config(vec![Stage::new(Duration::from_millis(300), 3)]);
        let mut scheduler = StageScheduler::from_config(&config);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let executor = Arc::new(StubExecutor::new(Duration::from_millis(2)));
        let aggregator = Arc::new(MetricsAggregator::new());
        let summary = scheduler
            .run(executor.clone(), aggregator.clone())
            .await
            .unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Terminated);
        assert!(summary.peak_vus <= 3);
        assert!(summary.vus_spawned >= 1);
        assert!(!summary.aborted);
        assert!(summary.elapsed >= Duration::from_millis(300));
        // every completed request was recorded
        let stats = aggregator.snapshot();
        assert_eq!(stats.count(), executor.completed.load(Ordering::SeqCst) as u64);
        assert_eq!(stats.count(), summary.iterations);
        assert_eq!(executor.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn never_exceeds_peak_concurrency() {
        let config = config(vec![
            Stage::new(Duration::from_millis(100), 4),
            Stage::new(Duration::from_millis(100), 4),
            Stage::new(Duration::from_millis(100), 0),
        ]);
        let mut scheduler = StageScheduler::from_config(&config);
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(5)));
        let summary = scheduler
            .run(executor.clone(), Arc::new(MetricsAggregator::new()))
            .await
            .unwrap();

        assert_eq!(summary.peak_vus, 4);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn retirement_waits_for_in_flight_requests() {
        // requests outlive the whole profile; they must still complete
        let config = config(vec![Stage::new(Duration::from_millis(50), 2)]);
        let mut scheduler = StageScheduler::from_config(&config);
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(200)));
        let aggregator = Arc::new(MetricsAggregator::new());

        let summary = scheduler
            .run(executor.clone(), aggregator.clone())
            .await
            .unwrap();

        assert_eq!(executor.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(
            aggregator.snapshot().count(),
            executor.completed.load(Ordering::SeqCst) as u64
        );
        assert!(summary.elapsed >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn walks_every_stage_then_drains() {
        let config = config(vec![
            Stage::new(Duration::from_millis(150), 2),
            Stage::new(Duration::from_millis(150), 2),
            Stage::new(Duration::from_millis(150), 0),
        ]);
        let mut scheduler = StageScheduler::from_config(&config);
        assert_eq!(scheduler.transitions(), &[SchedulerState::Idle]);

        scheduler
            .run(
                Arc::new(StubExecutor::new(Duration::from_millis(2))),
                Arc::new(MetricsAggregator::new()),
            )
            .await
            .unwrap();

        assert_eq!(
            scheduler.transitions(),
            &[
                SchedulerState::Idle,
                SchedulerState::Ramping(0),
                SchedulerState::Ramping(1),
                SchedulerState::Ramping(2),
                SchedulerState::Draining,
                SchedulerState::Terminated,
            ]
        );
    }

    #[tokio::test]
    async fn zero_length_stages_are_never_entered() {
        let config = config(vec![
            Stage::new(Duration::ZERO, 2),
            Stage::new(Duration::from_millis(100), 2),
        ]);
        let mut scheduler = StageScheduler::from_config(&config);
        scheduler
            .run(
                Arc::new(StubExecutor::new(Duration::ZERO)),
                Arc::new(MetricsAggregator::new()),
            )
            .await
            .unwrap();

        assert_eq!(
            scheduler.transitions(),
            &[
                SchedulerState::Idle,
                SchedulerState::Ramping(1),
                SchedulerState::Draining,
                SchedulerState::Terminated,
            ]
        );
    }

    #[tokio::test]
    async fn periodic_evaluation_does_not_stall_virtual_users() {
        let mut config = config(vec![
            Stage::new(Duration::ZERO, 1),
            Stage::new(Duration::from_millis(300), 1),
        ]);
        config.think_time = Duration::from_millis(1);
        config.evaluation_interval = Some(Duration::from_millis(10));

        // a large series makes every snapshot sort expensive
        let aggregator = Arc::new(MetricsAggregator::new());
        for i in (0..500_000u64).rev() {
            aggregator.record(MetricSample::from_status(
                RequestKind::Transfer,
                201,
                Duration::from_micros(i),
            ));
        }

        let executor = Arc::new(StubExecutor::new(Duration::ZERO));
        let mut scheduler = StageScheduler::from_config(&config);
        let summary = scheduler
            .run(executor.clone(), aggregator.clone())
            .await
            .unwrap();

        assert!(
            summary.iterations >= 50,
            "only {} iterations in 300ms",
            summary.iterations
        );
        assert!(!summary.aborted);
        assert_eq!(aggregator.snapshot().count(), 500_000 + summary.iterations);
    }

    #[tokio::test]
    async fn empty_profile_is_rejected() {
        let config = config(vec![]);
        let mut scheduler = StageScheduler::from_config(&config);
        let result = scheduler
            .run(
                Arc::new(StubExecutor::new(Duration::ZERO)),
                Arc::new(MetricsAggregator::new()),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::NoStages)));
    }

    #[tokio::test]
    async fn zero_target_profile_sends_nothing() {
        let config = config(vec![Stage::new(Duration::from_millis(50), 0)]);
        let mut scheduler = StageScheduler::from_config(&config);
        let aggregator = Arc::new(MetricsAggregator::new());
        let summary = scheduler
            .run(Arc::new(StubExecutor::new(Duration::ZERO)), aggregator.clone())
            .await
            .unwrap();

        assert_eq!(summary.vus_spawned, 0);
        assert_eq!(aggregator.snapshot().count(), 0);
    }

    #[test]
    fn seeded_vu_streams_are_reproducible_and_distinct() {
        use rand::Rng;
        let a: u64 = vu_rng(Some(9), 3).gen();
        let b: u64 = vu_rng(Some(9), 3).gen();
        let c: u64 = vu_rng(Some(9), 4).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
