//! Threshold rules and the pass/fail verdict.
//!
//! Threshold expressions use the k6 syntax and are parsed once, when the run
//! configuration is built:
//!
//! ```text
//! http_req_failed: rate<0.01
//! http_req_duration: p(95)<800
//! http_req_duration{kind:transfer}: avg<=250
//! http_reqs: count>100
//! ```
//!
//! Durations are compared in milliseconds. [`evaluate`] is pure: it can run
//! against periodic snapshots during the run without affecting the final
//! verdict, which is computed from the end-of-run snapshot.

use std::fmt;

use regex::Regex;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregator::{
    is_known_metric, split_metric_name, tag_kind, AggregatedStats, HTTP_REQS,
    HTTP_REQ_DURATION, HTTP_REQ_FAILED,
};

lazy_static::lazy_static! {
    static ref EXPRESSION: Regex = Regex::new(
        r"^\s*(rate|count|avg|min|max|med|p\(\s*(\d+(?:\.\d+)?)\s*\))\s*(<=|>=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$"
    ).unwrap();
}

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdParseError {
    #[error("Cannot parse threshold expression '{0}'. Expected e.g. 'rate<0.01' or 'p(95)<800'")]
    InvalidExpression(String),

    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("Unknown tag '{tag}' in metric '{metric}'. Supported tags: kind:transfer, kind:account_read")]
    UnknownTag { metric: String, tag: String },

    #[error("Aggregation '{aggregation}' is not supported for metric '{metric}'")]
    UnsupportedAggregation { metric: String, aggregation: String },

    #[error("Threshold entry '{0}' is not in the format 'metric:expression'")]
    MissingMetric(String),

    #[error("Percentile {0} is outside 0-100")]
    PercentileOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Comparator {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Le),
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Ge),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }

    /// Whether `observed <op> threshold` holds.
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => observed < threshold,
            Comparator::Le => observed <= threshold,
            Comparator::Gt => observed > threshold,
            Comparator::Ge => observed >= threshold,
        }
    }
}

/// Which statistic of a metric a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Failure rate for failure metrics, requests per second for `http_reqs`
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

/// Kind of series a metric name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricClass {
    Duration,
    Failed,
    Requests,
}

fn classify(base: &str) -> Option<MetricClass> {
    if !is_known_metric(base) {
        return None;
    }
    match base {
        HTTP_REQ_DURATION | "request_duration" => Some(MetricClass::Duration),
        HTTP_REQ_FAILED | "request_failed" | "failure_rate" => Some(MetricClass::Failed),
        HTTP_REQS => Some(MetricClass::Requests),
        _ => None,
    }
}

fn supports(class: MetricClass, aggregation: Aggregation) -> bool {
    match class {
        MetricClass::Duration => !matches!(aggregation, Aggregation::Rate),
        MetricClass::Failed => matches!(aggregation, Aggregation::Rate),
        MetricClass::Requests => matches!(aggregation, Aggregation::Rate | Aggregation::Count),
    }
}

/// A parsed pass/fail rule over one aggregated metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: String,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub value: f64,
    /// Stop the run as soon as a periodic evaluation fails this rule.
    pub abort_on_fail: bool,
}

impl ThresholdRule {
    pub fn new(
        metric: impl Into<String>,
        aggregation: Aggregation,
        comparator: Comparator,
        value: f64,
    ) -> Result<Self, ThresholdParseError> {
        let metric = metric.into();
        let (base, tag) = split_metric_name(&metric);
        let class = classify(base).ok_or_else(|| ThresholdParseError::UnknownMetric(metric.clone()))?;
        if let Some(tag) = tag {
            if tag_kind(tag).is_none() {
                return Err(ThresholdParseError::UnknownTag {
                    tag: tag.to_string(),
                    metric,
                });
            }
        }

        if !supports(class, aggregation) {
            return Err(ThresholdParseError::UnsupportedAggregation {
                metric,
                aggregation: aggregation.to_string(),
            });
        }
        if let Aggregation::Percentile(p) = aggregation {
            if !(0.0..=100.0).contains(&p) {
                return Err(ThresholdParseError::PercentileOutOfRange(p));
            }
        }

        Ok(Self {
            metric: metric.trim().to_string(),
            aggregation,
            comparator,
            value,
            abort_on_fail: false,
        })
    }

    /// Parses one expression such as `p(95)<800` for `metric`.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ThresholdParseError> {
        let caps = EXPRESSION
            .captures(expression)
            .ok_or_else(|| ThresholdParseError::InvalidExpression(expression.to_string()))?;

        let aggregation = match &caps[1] {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            _ => {
                let p = caps[2]
                    .parse::<f64>()
                    .map_err(|_| ThresholdParseError::InvalidExpression(expression.to_string()))?;
                Aggregation::Percentile(p)
            }
        };
        let comparator = Comparator::parse(&caps[3])
            .ok_or_else(|| ThresholdParseError::InvalidExpression(expression.to_string()))?;
        let value = caps[4]
            .parse::<f64>()
            .map_err(|_| ThresholdParseError::InvalidExpression(expression.to_string()))?;

        Self::new(metric, aggregation, comparator, value)
    }

    pub fn with_abort_on_fail(mut self, abort_on_fail: bool) -> Self {
        self.abort_on_fail = abort_on_fail;
        self
    }

    /// `failure_rate < value`, i.e. `http_req_failed: rate<value`.
    pub fn failure_rate(comparator: Comparator, value: f64) -> Self {
        Self {
            metric: HTTP_REQ_FAILED.to_string(),
            aggregation: Aggregation::Rate,
            comparator,
            value,
            abort_on_fail: false,
        }
    }

    /// `http_req_duration: p(percentile) <op> value_ms`.
    pub fn duration_percentile(percentile: f64, comparator: Comparator, value_ms: f64) -> Self {
        Self {
            metric: HTTP_REQ_DURATION.to_string(),
            aggregation: Aggregation::Percentile(percentile),
            comparator,
            value: value_ms,
            abort_on_fail: false,
        }
    }

    /// Expression part only, e.g. `p(95)<800`.
    pub fn expression(&self) -> String {
        format!("{}{}{}", self.aggregation, self.comparator.symbol(), self.value)
    }

    /// Value of this rule's statistic in `stats`.
    pub fn observe(&self, stats: &AggregatedStats) -> f64 {
        let Some(series) = stats.metric(&self.metric) else {
            return 0.0;
        };
        let (base, _) = split_metric_name(&self.metric);

        match (classify(base), self.aggregation) {
            (Some(MetricClass::Requests), Aggregation::Rate) => {
                let secs = stats.elapsed.as_secs_f64();
                if secs > 0.0 {
                    series.count as f64 / secs
                } else {
                    0.0
                }
            }
            (_, Aggregation::Rate) => series.failure_rate(),
            (_, Aggregation::Count) => series.count as f64,
            (_, Aggregation::Avg) => series.avg_ms(),
            (_, Aggregation::Min) => series.min_ms(),
            (_, Aggregation::Max) => series.max_ms(),
            (_, Aggregation::Med) => series.percentile_ms(50.0),
            (_, Aggregation::Percentile(p)) => series.percentile_ms(p),
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expression())
    }
}

impl Serialize for ThresholdRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ThresholdRule", 3)?;
        s.serialize_field("metric", &self.metric)?;
        s.serialize_field("expression", &self.expression())?;
        s.serialize_field("abort_on_fail", &self.abort_on_fail)?;
        s.end()
    }
}

/// Parses `metric:expr;metric:expr` lists, e.g. the `THRESHOLDS` variable.
///
/// Entries are separated by `;`. The metric is everything before the last `:`
/// so tagged names like `http_req_duration{kind:transfer}:p(95)<500` work.
pub fn parse_threshold_list(s: &str) -> Result<Vec<ThresholdRule>, ThresholdParseError> {
    s.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (metric, expression) = entry
                .rsplit_once(':')
                .ok_or_else(|| ThresholdParseError::MissingMetric(entry.to_string()))?;
            ThresholdRule::parse(metric, expression)
        })
        .collect()
}

/// The thresholds used when none are configured.
pub fn default_thresholds() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule::failure_rate(Comparator::Lt, 0.01),
        ThresholdRule::duration_percentile(95.0, Comparator::Lt, 800.0),
    ]
}

/// Result of checking one rule.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdOutcome {
    pub rule: ThresholdRule,
    pub observed: f64,
    pub passed: bool,
}

/// The run's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub pass: bool,
    pub outcomes: Vec<ThresholdOutcome>,
}

impl RunResult {
    pub fn failed_outcomes(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    /// True when a failed rule asks for the run to stop early.
    pub fn should_abort(&self) -> bool {
        self.failed_outcomes().any(|o| o.rule.abort_on_fail)
    }

    /// Observed value of the first outcome for `metric`.
    pub fn observed(&self, metric: &str) -> Option<f64> {
        self.outcomes
            .iter()
            .find(|o| o.rule.metric == metric)
            .map(|o| o.observed)
    }
}

/// Checks every rule against `stats`. Passes iff every rule passes.
pub fn evaluate(stats: &AggregatedStats, rules: &[ThresholdRule]) -> RunResult {
    let outcomes: Vec<ThresholdOutcome> = rules
        .iter()
        .map(|rule| {
            let observed = rule.observe(stats);
            let passed = rule.comparator.holds(observed, rule.value);
            ThresholdOutcome {
                rule: rule.clone(),
                observed,
                passed,
            }
        })
        .collect();

    RunResult {
        pass: outcomes.iter().all(|o| o.passed),
        outcomes,
    }
}

/// Logs every outcome of a final evaluation.
pub fn log_run_result(result: &RunResult) {
    for outcome in &result.outcomes {
        if outcome.passed {
            info!(
                threshold = %outcome.rule,
                observed = outcome.observed,
                "Threshold passed"
            );
        } else {
            warn!(
                threshold = %outcome.rule,
                observed = outcome.observed,
                "Threshold failed"
            );
        }
    }
    info!(pass = result.pass, "Run verdict");
}
