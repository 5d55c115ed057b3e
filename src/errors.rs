//! Error types and failure classification.
//!
//! Configuration problems are fatal and surface as [`ConfigError`] before any
//! virtual user starts. Per-request problems never abort a run; they are folded
//! into failure samples tagged with an [`ErrorCategory`] for diagnostics.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Fatal configuration errors raised before the run starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: '{value}'. {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid threshold: {0}")]
    Threshold(#[from] crate::thresholds::ThresholdParseError),

    #[error("Run plan error: {0}")]
    Plan(#[from] crate::yaml_config::YamlConfigError),
}

impl ConfigError {
    pub fn invalid(name: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Categories of per-request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// Other/unknown errors, including unexpected non-error statuses
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns None for 2xx/3xx. Whether such a status counts as success for a
    /// given request kind is decided by the executor, not here.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() {
            ErrorCategory::NetworkError
        } else if error.is_body() || error.is_decode() {
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            let error_msg = error.to_string().to_lowercase();

            if error_msg.contains("certificate")
                || error_msg.contains("tls")
                || error_msg.contains("ssl")
            {
                ErrorCategory::TlsError
            } else if error_msg.contains("timeout") {
                ErrorCategory::TimeoutError
            } else if error_msg.contains("dns")
                || error_msg.contains("resolve")
                || error_msg.contains("connect")
            {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_have_no_category() {
        assert_eq!(ErrorCategory::from_status_code(200), None);
        assert_eq!(ErrorCategory::from_status_code(201), None);
        assert_eq!(ErrorCategory::from_status_code(304), None);
    }

    #[test]
    fn error_statuses_are_categorized() {
        assert_eq!(
            ErrorCategory::from_status_code(409),
            Some(ErrorCategory::ClientError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(500),
            Some(ErrorCategory::ServerError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(999),
            Some(ErrorCategory::OtherError)
        );
    }

    #[test]
    fn labels_are_snake_case() {
        assert_eq!(ErrorCategory::TimeoutError.label(), "timeout_error");
        assert_eq!(ErrorCategory::ServerError.label(), "server_error");
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::Missing("DEBIT_ACCOUNT_ID").to_string(),
            "Missing required configuration: DEBIT_ACCOUNT_ID"
        );
        let err = ConfigError::invalid("WRITE_RATIO", "1.5", "Must be between 0 and 1");
        assert_eq!(
            err.to_string(),
            "Invalid value for WRITE_RATIO: '1.5'. Must be between 0 and 1"
        );
    }
}
