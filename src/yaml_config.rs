//! YAML run plan support.
//!
//! A plan file describes a run as an alternative to environment variables, so
//! ramp profiles and thresholds can be version-controlled. Every field is
//! optional; environment variables override whatever the plan sets (see
//! [`crate::config::RunConfig::from_yaml_with_env_overrides`]).
//!
//! ```yaml
//! version: "1.0"
//! target:
//!   baseUrl: "http://localhost:5000"
//!   debitAccountId: "acc-1"
//!   creditAccountId: "acc-2"
//! workload:
//!   writeRatio: 0.8
//!   retryRatio: 0.05
//!   thinkTime: "50ms"
//! stages:
//!   - duration: "30s"
//!     target: 5
//!   - duration: "2m"
//!     target: 20
//! thresholds:
//!   http_req_failed: ["rate<0.01"]
//!   http_req_duration:
//!     - "p(95)<800"
//!     - threshold: "p(99)<1500"
//!       abortOnFail: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::stages::Stage;
use crate::thresholds::{ThresholdParseError, ThresholdRule};

/// Plan format versions this build understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Errors that can occur when loading or parsing a YAML plan.
#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Invalid threshold for '{metric}': {source}")]
    Threshold {
        metric: String,
        #[source]
        source: ThresholdParseError,
    },
}

/// Duration format for YAML (e.g., 30, "50ms", "2m").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_std_duration(&self) -> Result<StdDuration, YamlConfigError> {
        match self {
            YamlDuration::Seconds(s) => Ok(StdDuration::from_secs(*s)),
            YamlDuration::String(s) => crate::utils::parse_duration_string(s).map_err(|e| {
                YamlConfigError::Validation(format!("Invalid duration '{}': {}", s, e))
            }),
        }
    }
}

/// Metadata about the plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// The system under test.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct YamlTarget {
    pub base_url: Option<String>,
    pub debit_account_id: Option<String>,
    pub credit_account_id: Option<String>,
    pub timeout: Option<YamlDuration>,
    pub custom_headers: Option<String>,
    pub skip_tls_verify: Option<bool>,
    pub resolve_target_addr: Option<String>,
}

/// Request mix settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct YamlWorkload {
    pub write_ratio: Option<f64>,
    pub retry_ratio: Option<f64>,
    pub retry_key: Option<String>,
    pub amount: Option<u64>,
    pub think_time: Option<YamlDuration>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlStage {
    pub duration: YamlDuration,
    pub target: u32,
}

/// A threshold given either as a bare expression or with options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlThreshold {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(rename = "abortOnFail", default)]
        abort_on_fail: bool,
    },
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct YamlOptions {
    pub scheduler_tick: Option<YamlDuration>,
    pub evaluation_interval: Option<YamlDuration>,
    pub max_exact_samples: Option<usize>,
    pub metrics_port: Option<u16>,
    pub summary_export: Option<String>,
}

/// Root of a YAML run plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub metadata: YamlMetadata,

    #[serde(default)]
    pub target: YamlTarget,

    #[serde(default)]
    pub workload: YamlWorkload,

    #[serde(default)]
    pub stages: Vec<YamlStage>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<YamlThreshold>>,

    #[serde(default)]
    pub options: YamlOptions,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl YamlConfig {
    /// Load a plan from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, YamlConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a plan from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, YamlConfigError> {
        let config: YamlConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), YamlConfigError> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(YamlConfigError::Validation(format!(
                "Unsupported plan version '{}'. Supported: {}",
                self.version,
                SUPPORTED_VERSIONS.join(", ")
            )));
        }

        if let Some(ref url) = self.target.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(YamlConfigError::Validation(format!(
                    "target.baseUrl '{}' must start with http:// or https://",
                    url
                )));
            }
        }

        for (name, ratio) in [
            ("workload.writeRatio", self.workload.write_ratio),
            ("workload.retryRatio", self.workload.retry_ratio),
        ] {
            if let Some(r) = ratio {
                if !(0.0..=1.0).contains(&r) {
                    return Err(YamlConfigError::Validation(format!(
                        "{} must be between 0 and 1, got {}",
                        name, r
                    )));
                }
            }
        }

        // Surface bad durations and thresholds at load time
        self.to_stages()?;
        self.to_thresholds()?;

        Ok(())
    }

    /// Stage list, or None when the plan does not define one.
    pub fn to_stages(&self) -> Result<Option<Vec<Stage>>, YamlConfigError> {
        if self.stages.is_empty() {
            return Ok(None);
        }
        self.stages
            .iter()
            .map(|s| Ok(Stage::new(s.duration.to_std_duration()?, s.target)))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Parsed threshold rules, or None when the plan does not define any.
    pub fn to_thresholds(&self) -> Result<Option<Vec<ThresholdRule>>, YamlConfigError> {
        if self.thresholds.is_empty() {
            return Ok(None);
        }

        let mut rules = Vec::new();
        for (metric, entries) in &self.thresholds {
            for entry in entries {
                let (expression, abort_on_fail) = match entry {
                    YamlThreshold::Expression(e) => (e.as_str(), false),
                    YamlThreshold::Detailed {
                        threshold,
                        abort_on_fail,
                    } => (threshold.as_str(), *abort_on_fail),
                };
                let rule = ThresholdRule::parse(metric, expression).map_err(|source| {
                    YamlConfigError::Threshold {
                        metric: metric.clone(),
                        source,
                    }
                })?;
                rules.push(rule.with_abort_on_fail(abort_on_fail));
            }
        }
        Ok(Some(rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_yaml() {
        let config = YamlConfig::from_str("version: \"1.0\"\n").unwrap();
        assert!(config.target.base_url.is_none());
        assert!(config.to_stages().unwrap().is_none());
        assert!(config.to_thresholds().unwrap().is_none());
    }

    #[test]
    fn test_yaml_duration_parsing() {
        assert_eq!(
            YamlDuration::Seconds(30).to_std_duration().unwrap(),
            StdDuration::from_secs(30)
        );
        assert_eq!(
            YamlDuration::String("50ms".to_string())
                .to_std_duration()
                .unwrap(),
            StdDuration::from_millis(50)
        );
        assert!(YamlDuration::String("soon".to_string())
            .to_std_duration()
            .is_err());
    }

    #[test]
    fn test_validation_invalid_version() {
        let err = YamlConfig::from_str("version: \"9.9\"\n").unwrap_err();
        assert!(err.to_string().contains("Unsupported plan version"));
    }

    #[test]
    fn test_validation_invalid_ratio() {
        let yaml = "workload:\n  writeRatio: 1.5\n";
        let err = YamlConfig::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("writeRatio"));
    }

    #[test]
    fn test_detailed_thresholds() {
        let yaml = r#"
thresholds:
  http_req_duration:
    - "p(95)<800"
    - threshold: "p(99)<1500"
      abortOnFail: true
"#;
        let rules = YamlConfig::from_str(yaml)
            .unwrap()
            .to_thresholds()
            .unwrap()
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(!rules[0].abort_on_fail);
        assert!(rules[1].abort_on_fail);
    }
}
