use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::time::Duration;
use tracing::info;

use crate::aggregator::DEFAULT_MAX_EXACT_SAMPLES;
use crate::client::ClientConfig;
use crate::errors::ConfigError;
use crate::stages::{default_stages, Stage, StageProfile};
use crate::thresholds::{default_thresholds, parse_threshold_list, ThresholdRule};
use crate::utils::parse_duration_string;
use crate::workload::{WorkloadConfig, DEFAULT_RETRY_KEY, DEFAULT_TRANSFER_AMOUNT};
use crate::yaml_config::YamlConfig;

pub const DEFAULT_WRITE_RATIO: f64 = 0.8;
pub const DEFAULT_RETRY_RATIO: f64 = 0.05;
pub const DEFAULT_THINK_TIME: Duration = Duration::from_millis(50);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// Every environment variable the run configuration reads.
pub const ENV_VARS: &[&str] = &[
    "BASE_URL",
    "DEBIT_ACCOUNT_ID",
    "CREDIT_ACCOUNT_ID",
    "WRITE_RATIO",
    "RETRY_RATIO",
    "RETRY_KEY",
    "TRANSFER_AMOUNT",
    "THINK_TIME",
    "REQUEST_TIMEOUT",
    "STAGES",
    "THRESHOLDS",
    "SEED",
    "SCHEDULER_TICK",
    "EVALUATION_INTERVAL",
    "MAX_EXACT_SAMPLES",
    "METRICS_PORT",
    "SUMMARY_EXPORT",
    "CUSTOM_HEADERS",
    "SKIP_TLS_VERIFY",
    "RESOLVE_TARGET_ADDR",
];

/// Immutable configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub debit_account_id: String,
    pub credit_account_id: String,
    pub write_ratio: f64,
    pub retry_ratio: f64,
    pub retry_key: String,
    pub transfer_amount: u64,
    /// Pause between two iterations of one VU
    pub think_time: Duration,
    pub request_timeout: Duration,
    pub stages: Vec<Stage>,
    pub thresholds: Vec<ThresholdRule>,
    /// Seed for the per-VU random sources; entropy when unset
    pub seed: Option<u64>,
    pub scheduler_tick: Duration,
    /// Periodic threshold evaluation during the run; off when unset
    pub evaluation_interval: Option<Duration>,
    pub max_exact_samples: usize,
    pub metrics_port: Option<u16>,
    pub summary_export: Option<PathBuf>,
    pub custom_headers: Option<String>,
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
}

impl RunConfig {
    /// Config with the given target and defaults for everything else.
    pub fn new(
        base_url: impl Into<String>,
        debit_account_id: impl Into<String>,
        credit_account_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            debit_account_id: debit_account_id.into(),
            credit_account_id: credit_account_id.into(),
            write_ratio: DEFAULT_WRITE_RATIO,
            retry_ratio: DEFAULT_RETRY_RATIO,
            retry_key: DEFAULT_RETRY_KEY.to_string(),
            transfer_amount: DEFAULT_TRANSFER_AMOUNT,
            think_time: DEFAULT_THINK_TIME,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stages: default_stages(),
            thresholds: default_thresholds(),
            seed: None,
            scheduler_tick: DEFAULT_SCHEDULER_TICK,
            evaluation_interval: None,
            max_exact_samples: DEFAULT_MAX_EXACT_SAMPLES,
            metrics_port: None,
            summary_export: None,
            custom_headers: None,
            skip_tls_verify: false,
            resolve_target_addr: None,
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(None)
    }

    /// Loads a YAML plan, then lets environment variables override it.
    ///
    /// Precedence: env > yaml > defaults.
    pub fn from_yaml_with_env_overrides(yaml: &YamlConfig) -> Result<Self, ConfigError> {
        Self::build(Some(yaml))
    }

    fn build(yaml: Option<&YamlConfig>) -> Result<Self, ConfigError> {
        let target = yaml.map(|y| y.target.clone()).unwrap_or_default();
        let workload = yaml.map(|y| y.workload.clone()).unwrap_or_default();
        let options = yaml.map(|y| y.options.clone()).unwrap_or_default();

        let base_url = env_string("BASE_URL")
            .or(target.base_url)
            .ok_or(ConfigError::Missing("BASE_URL"))?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "BASE_URL",
                base_url,
                "Must start with http:// or https://",
            ));
        }

        let debit_account_id = env_string("DEBIT_ACCOUNT_ID")
            .or(target.debit_account_id)
            .ok_or(ConfigError::Missing("DEBIT_ACCOUNT_ID"))?;
        let credit_account_id = env_string("CREDIT_ACCOUNT_ID")
            .or(target.credit_account_id)
            .ok_or(ConfigError::Missing("CREDIT_ACCOUNT_ID"))?;

        let mut config = RunConfig::new(base_url, debit_account_id, credit_account_id);

        if let Some(ratio) = env_parse::<f64>("WRITE_RATIO")?.or(workload.write_ratio) {
            config.write_ratio = check_ratio("WRITE_RATIO", ratio)?;
        }
        if let Some(ratio) = env_parse::<f64>("RETRY_RATIO")?.or(workload.retry_ratio) {
            config.retry_ratio = check_ratio("RETRY_RATIO", ratio)?;
        }
        if let Some(key) = env_string("RETRY_KEY").or(workload.retry_key) {
            config.retry_key = key;
        }
        if let Some(amount) = env_parse::<u64>("TRANSFER_AMOUNT")?.or(workload.amount) {
            config.transfer_amount = amount;
        }
        config.seed = env_parse::<u64>("SEED")?.or(workload.seed);

        if let Some(d) = duration_setting("THINK_TIME", workload.think_time.as_ref())? {
            config.think_time = d;
        }
        if let Some(d) = duration_setting("REQUEST_TIMEOUT", target.timeout.as_ref())? {
            if d.is_zero() {
                return Err(ConfigError::invalid("REQUEST_TIMEOUT", "0", "Must be positive"));
            }
            config.request_timeout = d;
        }
        if let Some(d) = duration_setting("SCHEDULER_TICK", options.scheduler_tick.as_ref())? {
            if d.is_zero() {
                return Err(ConfigError::invalid("SCHEDULER_TICK", "0", "Must be positive"));
            }
            config.scheduler_tick = d;
        }
        config.evaluation_interval =
            duration_setting("EVALUATION_INTERVAL", options.evaluation_interval.as_ref())?
                .filter(|d| !d.is_zero());

        if let Some(stages_str) = env_string("STAGES") {
            config.stages = Stage::parse_list(&stages_str)
                .map_err(|e| ConfigError::invalid("STAGES", stages_str.clone(), e))?;
        } else if let Some(stages) = yaml.map(|y| y.to_stages()).transpose()?.flatten() {
            config.stages = stages;
        }

        if let Some(thresholds_str) = env_string("THRESHOLDS") {
            config.thresholds = parse_threshold_list(&thresholds_str)?;
        } else if let Some(rules) = yaml.map(|y| y.to_thresholds()).transpose()?.flatten() {
            config.thresholds = rules;
        }

        if let Some(max) = env_parse::<usize>("MAX_EXACT_SAMPLES")?.or(options.max_exact_samples) {
            if max == 0 {
                return Err(ConfigError::invalid("MAX_EXACT_SAMPLES", "0", "Must be positive"));
            }
            config.max_exact_samples = max;
        }
        config.metrics_port = env_parse::<u16>("METRICS_PORT")?.or(options.metrics_port);
        config.summary_export = env_string("SUMMARY_EXPORT")
            .or(options.summary_export)
            .map(PathBuf::from);

        config.custom_headers = env_string("CUSTOM_HEADERS").or(target.custom_headers);
        config.resolve_target_addr =
            env_string("RESOLVE_TARGET_ADDR").or(target.resolve_target_addr);
        config.skip_tls_verify = match env_string("SKIP_TLS_VERIFY") {
            Some(v) => v.to_lowercase() == "true",
            None => target.skip_tls_verify.unwrap_or(false),
        };

        Ok(config)
    }

    /// Projection consumed by the workload generator.
    pub fn workload_config(&self) -> WorkloadConfig {
        WorkloadConfig {
            debit_account_id: self.debit_account_id.clone(),
            credit_account_id: self.credit_account_id.clone(),
            write_ratio: self.write_ratio,
            retry_ratio: self.retry_ratio,
            retry_key: self.retry_key.clone(),
            transfer_amount: self.transfer_amount,
        }
    }

    /// Creates a ClientConfig from this config.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: self.request_timeout,
            skip_tls_verify: self.skip_tls_verify,
            resolve_target_addr: self.resolve_target_addr.clone(),
            custom_headers: self.custom_headers.clone(),
        }
    }

    pub fn stage_profile(&self) -> StageProfile {
        StageProfile::new(self.stages.clone())
    }

    /// Logs the configuration summary.
    pub fn log_summary(&self) {
        let profile = self.stage_profile();
        info!(
            base_url = %self.base_url,
            debit_account_id = %self.debit_account_id,
            credit_account_id = %self.credit_account_id,
            write_ratio = self.write_ratio,
            retry_ratio = self.retry_ratio,
            retry_key = %self.retry_key,
            transfer_amount = self.transfer_amount,
            think_time_ms = self.think_time.as_millis() as u64,
            request_timeout_ms = self.request_timeout.as_millis() as u64,
            "Starting ledger load test"
        );
        info!(
            stages = self.stages.len(),
            total_duration_secs = profile.total_duration().as_secs_f64(),
            peak_vus = profile.peak_target(),
            seed = ?self.seed,
            "Ramp profile"
        );
        for rule in &self.thresholds {
            info!(threshold = %rule, abort_on_fail = rule.abort_on_fail, "Threshold configured");
        }
    }
}

/// Non-empty environment variable, trimmed.
fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(name, raw.clone(), e.to_string())),
        None => Ok(None),
    }
}

fn duration_setting(
    name: &'static str,
    yaml_value: Option<&crate::yaml_config::YamlDuration>,
) -> Result<Option<Duration>, ConfigError> {
    if let Some(raw) = env_string(name) {
        return parse_duration_string(&raw)
            .map(Some)
            .map_err(|e| ConfigError::invalid(name, raw.clone(), e));
    }
    yaml_value
        .map(|d| d.to_std_duration())
        .transpose()
        .map_err(ConfigError::from)
}

fn check_ratio(name: &'static str, ratio: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(ConfigError::invalid(
            name,
            ratio.to_string(),
            "Must be between 0 and 1",
        ))
    }
}
