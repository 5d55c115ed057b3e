//! Scheduler behaviour observed through a recording executor.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use ledger_loadtest::aggregator::MetricsAggregator;
use ledger_loadtest::config::RunConfig;
use ledger_loadtest::executor::{MetricSample, RequestExecutor, RequestKind};
use ledger_loadtest::scheduler::{SchedulerState, StageScheduler};
use ledger_loadtest::stages::Stage;
use ledger_loadtest::workload::{WorkloadGenerator, WorkloadRequest};

#[derive(Default)]
struct RecordingExecutor {
    requests: Mutex<Vec<WorkloadRequest>>,
}

#[async_trait]
impl RequestExecutor for RecordingExecutor {
    async fn execute(&self, request: &WorkloadRequest) -> MetricSample {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.requests.lock().unwrap().push(request.clone());
        MetricSample::from_status(RequestKind::from(request), 201, Duration::from_millis(2))
    }
}

fn config() -> RunConfig {
    let mut config = RunConfig::new("http://ledger.test", "acc-1", "acc-2");
    config.stages = vec![
        Stage::new(Duration::from_millis(200), 4),
        Stage::new(Duration::from_millis(200), 4),
        Stage::new(Duration::from_millis(200), 1),
    ];
    config.write_ratio = 1.0;
    config.retry_ratio = 0.2;
    config.think_time = Duration::from_millis(5);
    config.scheduler_tick = Duration::from_millis(10);
    config.seed = Some(3);
    config
}

#[tokio::test]
async fn unique_keys_except_shared_retry_key() {
    let config = config();
    let generator = WorkloadGenerator::with_run_tag(config.workload_config(), "t1");
    let mut scheduler = StageScheduler::new(&config, generator);
    let executor = Arc::new(RecordingExecutor::default());
    let aggregator = Arc::new(MetricsAggregator::new());

    let summary = scheduler
        .run(executor.clone(), aggregator.clone())
        .await
        .unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Terminated);

    let requests = executor.requests.lock().unwrap();
    assert_eq!(requests.len() as u64, summary.iterations);
    assert_eq!(aggregator.snapshot().count(), summary.iterations);

    let mut unique = HashSet::new();
    let mut retries = 0;
    for request in requests.iter() {
        match request {
            WorkloadRequest::Transfer {
                idempotency_key,
                is_retry: true,
                ..
            } => {
                assert_eq!(idempotency_key, "retry-key-1");
                retries += 1;
            }
            WorkloadRequest::Transfer {
                idempotency_key, ..
            } => {
                assert!(idempotency_key.starts_with("k-t1-"));
                assert!(
                    unique.insert(idempotency_key.clone()),
                    "duplicate key {}",
                    idempotency_key
                );
            }
            WorkloadRequest::AccountRead { .. } => panic!("write_ratio is 1.0"),
        }
    }
    assert!(retries > 0);

    println!(
        "✅ {} unique keys, {} shared retries",
        unique.len(),
        retries
    );
}

#[tokio::test]
async fn ramp_up_and_down_follows_profile() {
    let config = config();
    let mut scheduler = StageScheduler::from_config(&config);
    let summary = scheduler
        .run(
            Arc::new(RecordingExecutor::default()),
            Arc::new(MetricsAggregator::new()),
        )
        .await
        .unwrap();

    assert_eq!(summary.peak_vus, 4);
    // ids are never reused: ramping down and finishing spawns no replacements
    assert_eq!(summary.vus_spawned, 4);
    assert!(!summary.aborted);
    assert!(summary.elapsed >= Duration::from_millis(600));

    println!("✅ Ramp reached 4 VUs and drained");
}
