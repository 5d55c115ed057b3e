//! Run-wide aggregation of request samples.
//!
//! All VU tasks feed one [`MetricsAggregator`]. Every sample updates the
//! overall series and the series of its request kind; the series are exposed
//! through k6-style metric names:
//!
//! - `http_req_duration`, `http_req_failed`, `http_reqs`
//! - sub-metrics such as `http_req_duration{kind:transfer}`
//! - aliases `request_duration`, `request_failed` and `failure_rate`
//!
//! # Percentiles
//!
//! Latencies are kept exactly (microsecond resolution) until a series holds
//! `max_exact_samples` samples. Percentiles of an exact series use linear
//! interpolation between the closest ranks. Past the cap, a series answers
//! from an HDR histogram that has recorded every sample from the start. Its
//! values carry at most 0.1% relative error (3 significant digits) and use the
//! histogram's nearest-rank definition. The histogram grows its range as
//! needed, so no latency is clamped, however long the request timeout.
//!
//! Snapshots copy the raw series under the lock and sort them after
//! releasing it; VU tasks keep recording while a large series is sorted.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use hdrhistogram::Histogram;
use serde::Serialize;
use tokio::time::Duration;
use tracing::warn;

use crate::executor::{MetricSample, RequestKind};

pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const HTTP_REQS: &str = "http_reqs";

/// Default cap on exactly-stored latencies per series.
pub const DEFAULT_MAX_EXACT_SAMPLES: usize = 1_000_000;

/// Histogram precision; the range starts at 1µs and auto-resizes upward.
const HISTOGRAM_SIGFIG: u8 = 3;

/// Mutable per-series state, only touched under the aggregator lock.
#[derive(Clone)]
struct Series {
    count: u64,
    failures: u64,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
    exact_us: Vec<u64>,
    overflowed: bool,
    histogram: Histogram<u64>,
}

impl Series {
    fn new() -> Self {
        let histogram =
            Histogram::new(HISTOGRAM_SIGFIG).expect("constant histogram precision is valid");
        Self {
            count: 0,
            failures: 0,
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
            exact_us: Vec::new(),
            overflowed: false,
            histogram,
        }
    }

    fn record(&mut self, latency_us: u64, failed: bool, max_exact: usize) {
        self.count += 1;
        if failed {
            self.failures += 1;
        }
        self.sum_us += latency_us as u128;
        self.min_us = self.min_us.min(latency_us);
        self.max_us = self.max_us.max(latency_us);

        if !self.overflowed {
            if self.exact_us.len() < max_exact {
                self.exact_us.push(latency_us);
            } else {
                self.overflowed = true;
                // exact samples are no longer consulted
                self.exact_us = Vec::new();
                warn!(
                    max_exact_samples = max_exact,
                    "Exact latency cap reached, percentiles now come from the HDR histogram"
                );
            }
        }

        if let Err(e) = self.histogram.record(latency_us) {
            warn!(latency_us = latency_us, error = %e, "Failed to record latency in histogram");
        }
    }

    /// Copy of the series; exact latencies are left unsorted.
    fn snapshot(&self) -> MetricStats {
        let distribution = if self.overflowed {
            LatencyDistribution::Approximate(self.histogram.clone())
        } else {
            LatencyDistribution::Exact(self.exact_us.clone())
        };

        MetricStats {
            count: self.count,
            failures: self.failures,
            sum_us: self.sum_us,
            min_us: if self.count == 0 { 0 } else { self.min_us },
            max_us: self.max_us,
            distribution,
        }
    }
}

struct AggregatorState {
    total: Series,
    by_kind: BTreeMap<&'static str, Series>,
}

/// Thread-safe accumulator shared by all VU tasks.
pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
    max_exact_samples: usize,
    started: Instant,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_max_exact_samples(DEFAULT_MAX_EXACT_SAMPLES)
    }

    pub fn with_max_exact_samples(max_exact_samples: usize) -> Self {
        Self {
            state: Mutex::new(AggregatorState {
                total: Series::new(),
                by_kind: BTreeMap::new(),
            }),
            max_exact_samples,
            started: Instant::now(),
        }
    }

    /// Folds one sample into the overall and per-kind series.
    pub fn record(&self, sample: MetricSample) {
        let latency_us = sample.latency.as_micros().min(u64::MAX as u128) as u64;
        let failed = sample.is_failure();
        let max_exact = self.max_exact_samples;

        let mut state = self.lock();
        state.total.record(latency_us, failed, max_exact);
        state
            .by_kind
            .entry(sample.kind.label())
            .or_insert_with(Series::new)
            .record(latency_us, failed, max_exact);
    }

    /// Consistent copy of everything recorded so far.
    pub fn snapshot(&self) -> AggregatedStats {
        let (total, by_kind, elapsed) = {
            let state = self.lock();
            let by_kind: Vec<(&'static str, MetricStats)> = state
                .by_kind
                .iter()
                .map(|(kind, series)| (*kind, series.snapshot()))
                .collect();
            (state.total.snapshot(), by_kind, self.started.elapsed())
        };

        AggregatedStats {
            total: total.sorted(),
            by_kind: by_kind
                .into_iter()
                .map(|(kind, stats)| (kind.to_string(), stats.sorted()))
                .collect(),
            elapsed,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        // A panicking VU cannot leave a series half-updated in a way that
        // matters, so keep aggregating after poisoning.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// How a series answers percentile queries.
#[derive(Debug, Clone)]
pub enum LatencyDistribution {
    /// Every latency in microseconds, sorted ascending.
    Exact(Vec<u64>),
    /// Bounded-memory histogram in microseconds.
    Approximate(Histogram<u64>),
}

/// Point-in-time statistics for one series.
#[derive(Debug, Clone)]
pub struct MetricStats {
    pub count: u64,
    pub failures: u64,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
    distribution: LatencyDistribution,
}

impl MetricStats {
    fn sorted(mut self) -> Self {
        if let LatencyDistribution::Exact(latencies) = &mut self.distribution {
            latencies.sort_unstable();
        }
        self
    }

    /// Failures divided by count; 0 when nothing was recorded.
    pub fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failures as f64 / self.count as f64
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.distribution, LatencyDistribution::Exact(_))
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_us as f64 / self.count as f64 / 1000.0
        }
    }

    pub fn min_ms(&self) -> f64 {
        self.min_us as f64 / 1000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max_us as f64 / 1000.0
    }

    /// Latency at percentile `p` (0-100) in milliseconds; 0 for an empty series.
    pub fn percentile_ms(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 100.0);
        let us = match &self.distribution {
            LatencyDistribution::Exact(sorted) => interpolated_percentile(sorted, p),
            LatencyDistribution::Approximate(histogram) => {
                if histogram.is_empty() {
                    0.0
                } else {
                    histogram.value_at_quantile(p / 100.0) as f64
                }
            }
        };
        us / 1000.0
    }

    fn summary(&self, elapsed: Duration) -> MetricSummary {
        let secs = elapsed.as_secs_f64();
        MetricSummary {
            count: self.count,
            failures: self.failures,
            failure_rate: self.failure_rate(),
            throughput_per_sec: if secs > 0.0 {
                self.count as f64 / secs
            } else {
                0.0
            },
            avg_ms: self.avg_ms(),
            min_ms: self.min_ms(),
            med_ms: self.percentile_ms(50.0),
            max_ms: self.max_ms(),
            p90_ms: self.percentile_ms(90.0),
            p95_ms: self.percentile_ms(95.0),
            p99_ms: self.percentile_ms(99.0),
            exact: self.is_exact(),
        }
    }
}

/// Linear interpolation between closest ranks over a sorted slice.
fn interpolated_percentile(sorted: &[u64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0] as f64,
        n => {
            let rank = p / 100.0 * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = (lower + 1).min(n - 1);
            let fraction = rank - lower as f64;
            let low = sorted[lower] as f64;
            let high = sorted[upper] as f64;
            low + (high - low) * fraction
        }
    }
}

/// Serializable digest of one series, used by the JSON summary export.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub count: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub throughput_per_sec: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub med_ms: f64,
    pub max_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub exact: bool,
}

/// Consistent read of the aggregator at one point in time.
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    pub total: MetricStats,
    pub by_kind: BTreeMap<String, MetricStats>,
    /// Time since the aggregator was created
    pub elapsed: Duration,
}

impl AggregatedStats {
    /// Total number of samples recorded.
    pub fn count(&self) -> u64 {
        self.total.count
    }

    pub fn failures(&self) -> u64 {
        self.total.failures
    }

    /// Resolves a metric name (optionally with a `{kind:...}` tag) to its series.
    ///
    /// Returns None for unknown base names and for any tag other than a known
    /// request kind. A known kind that has not been seen yet resolves to an
    /// empty series.
    pub fn metric(&self, name: &str) -> Option<MetricStats> {
        let (base, tag) = split_metric_name(name);
        if !is_known_metric(base) {
            return None;
        }

        match tag {
            None => Some(self.total.clone()),
            Some(tag) => {
                let kind = tag_kind(tag)?;
                Some(
                    self.by_kind
                        .get(kind.label())
                        .cloned()
                        .unwrap_or_else(|| Series::new().snapshot()),
                )
            }
        }
    }

    pub fn kind(&self, kind: RequestKind) -> Option<&MetricStats> {
        self.by_kind.get(kind.label())
    }

    /// Digest of the overall series and every kind sub-series.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        let mut out = BTreeMap::new();
        out.insert(HTTP_REQ_DURATION.to_string(), self.total.summary(self.elapsed));
        for (kind, stats) in &self.by_kind {
            out.insert(
                format!("{}{{kind:{}}}", HTTP_REQ_DURATION, kind),
                stats.summary(self.elapsed),
            );
        }
        out
    }
}

/// Splits `http_req_duration{kind:transfer}` into (`http_req_duration`, Some(`kind:transfer`)).
pub fn split_metric_name(name: &str) -> (&str, Option<&str>) {
    let name = name.trim();
    match name.split_once('{') {
        Some((base, rest)) => {
            let tag = match rest.strip_suffix('}') {
                Some(tag) => tag.trim(),
                // unterminated: keep the brace so it never names a kind
                None => &name[base.len()..],
            };
            (base.trim(), Some(tag))
        }
        None => (name, None),
    }
}

/// Request kind selected by a `kind:<label>` (or `kind=<label>`) tag.
pub fn tag_kind(tag: &str) -> Option<RequestKind> {
    let (key, value) = tag.split_once(':').or_else(|| tag.split_once('='))?;
    if key.trim() != "kind" {
        return None;
    }
    RequestKind::from_label(value.trim())
}

/// Base metric names the aggregator can answer for.
pub fn is_known_metric(base: &str) -> bool {
    matches!(
        base,
        HTTP_REQ_DURATION
            | HTTP_REQ_FAILED
            | HTTP_REQS
            | "request_duration"
            | "request_failed"
            | "failure_rate"
    )
}
