//! One complete run: schedule, aggregate, judge.

use serde_json::json;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::aggregator::{AggregatedStats, MetricsAggregator};
use crate::config::RunConfig;
use crate::executor::RequestExecutor;
use crate::scheduler::{RunSummary, SchedulerError, StageScheduler};
use crate::thresholds::{evaluate, RunResult};
use crate::workload::WorkloadGenerator;

/// Process exit code when every threshold passed.
pub const EXIT_PASS: i32 = 0;
/// Process exit code for configuration or scheduler errors.
pub const EXIT_ERROR: i32 = 1;
/// Process exit code when at least one threshold failed (matches k6).
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;

/// Everything known at the end of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub stats: AggregatedStats,
    pub result: RunResult,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.result.pass {
            EXIT_PASS
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    /// Machine-readable summary of the run.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "pass": self.result.pass,
            "aborted": self.summary.aborted,
            "elapsed_secs": self.summary.elapsed.as_secs_f64(),
            "vus_spawned": self.summary.vus_spawned,
            "peak_vus": self.summary.peak_vus,
            "iterations": self.summary.iterations,
            "metrics": self.stats.summary(),
            "thresholds": self.result.outcomes,
        })
    }

    /// Writes [`RunReport::to_json`] to `path`, pretty-printed.
    pub fn export<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let body = serde_json::to_string_pretty(&self.to_json())?;
        fs::write(path.as_ref(), body)?;
        info!(path = %path.as_ref().display(), "Summary exported");
        Ok(())
    }
}

/// Runs `config` against `executor` and evaluates the final snapshot.
pub async fn run_load_test<E>(
    config: &RunConfig,
    executor: Arc<E>,
) -> Result<RunReport, SchedulerError>
where
    E: RequestExecutor + 'static,
{
    let generator = WorkloadGenerator::new(config.workload_config());
    run_with_generator(config, generator, executor).await
}

/// Same as [`run_load_test`] with an explicit generator (fixed run tag).
pub async fn run_with_generator<E>(
    config: &RunConfig,
    generator: WorkloadGenerator,
    executor: Arc<E>,
) -> Result<RunReport, SchedulerError>
where
    E: RequestExecutor + 'static,
{
    info!(run_tag = generator.run_tag(), "Run starting");
    let aggregator = Arc::new(MetricsAggregator::with_max_exact_samples(
        config.max_exact_samples,
    ));
    let mut scheduler = StageScheduler::new(config, generator);
    let summary = scheduler.run(executor, aggregator.clone()).await?;

    let stats = aggregator.snapshot();
    let result = evaluate(&stats, &config.thresholds);

    Ok(RunReport {
        summary,
        stats,
        result,
    })
}
