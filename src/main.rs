use std::env;
use std::process;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use ledger_loadtest::client::build_client;
use ledger_loadtest::config::RunConfig;
use ledger_loadtest::errors::ConfigError;
use ledger_loadtest::executor::HttpExecutor;
use ledger_loadtest::logging::{self, LogFormat};
use ledger_loadtest::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use ledger_loadtest::runner::{run_load_test, EXIT_ERROR};
use ledger_loadtest::thresholds::log_run_result;
use ledger_loadtest::yaml_config::YamlConfig;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Required environment variables:");
    eprintln!("  BASE_URL                - Ledger base URL (must start with http:// or https://)");
    eprintln!("  DEBIT_ACCOUNT_ID        - Account debited by transfers and read by account reads");
    eprintln!("  CREDIT_ACCOUNT_ID       - Account credited by transfers");
    eprintln!();
    eprintln!("Workload:");
    eprintln!("  WRITE_RATIO             - Share of iterations that are transfers (default: 0.8)");
    eprintln!("  RETRY_RATIO             - Share of transfers reusing RETRY_KEY (default: 0.05)");
    eprintln!("  RETRY_KEY               - Shared idempotency key for retries (default: retry-key-1)");
    eprintln!("  TRANSFER_AMOUNT         - Amount per entry (default: 100)");
    eprintln!("  THINK_TIME              - Pause between iterations: 50ms, 1s (default: 50ms)");
    eprintln!("  SEED                    - Seed for reproducible request mixes");
    eprintln!();
    eprintln!("Profile and thresholds:");
    eprintln!("  STAGES                  - duration:target list (default: 30s:5,2m:20,2m:50,30s:0)");
    eprintln!("  THRESHOLDS              - metric:expr list separated by ';'");
    eprintln!("                            (default: http_req_failed:rate<0.01;http_req_duration:p(95)<800)");
    eprintln!("  EVALUATION_INTERVAL     - Evaluate thresholds during the run, e.g. 10s (default: off)");
    eprintln!("  SCHEDULER_TICK          - VU reconciliation interval (default: 100ms)");
    eprintln!("  MAX_EXACT_SAMPLES       - Samples kept for exact percentiles (default: 1000000)");
    eprintln!();
    eprintln!("Client:");
    eprintln!("  REQUEST_TIMEOUT         - Per-request timeout (default: 30s)");
    eprintln!("  CUSTOM_HEADERS          - Comma-separated headers (use \\, for literal commas)");
    eprintln!("  SKIP_TLS_VERIFY         - Skip TLS certificate verification (default: false)");
    eprintln!("  RESOLVE_TARGET_ADDR     - DNS override: hostname:ip:port");
    eprintln!();
    eprintln!("Output:");
    eprintln!("  METRICS_PORT            - Serve Prometheus metrics on this port (default: off)");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric namespace (default: ledger_loadtest)");
    eprintln!("  SUMMARY_EXPORT          - Write a JSON summary to this path (default: off)");
    eprintln!("  LOG_FORMAT              - text or json (default: text); filter with RUST_LOG");
    eprintln!();
    eprintln!("  CONFIG_FILE             - YAML plan; environment variables override it");
}

fn load_config() -> Result<RunConfig, ConfigError> {
    match env::var("CONFIG_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            info!(path = %path, "Loading YAML plan");
            let yaml = YamlConfig::from_file(path.trim())?;
            RunConfig::from_yaml_with_env_overrides(&yaml)
        }
        _ => RunConfig::from_env(),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init(LogFormat::from_env()) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            process::exit(EXIT_ERROR);
        }
    };

    if let Err(e) = register_metrics() {
        error!(error = %e, "Failed to register Prometheus metrics");
        process::exit(EXIT_ERROR);
    }

    let client_result = match build_client(&config.to_client_config()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}\n", e);
            print_config_help();
            process::exit(EXIT_ERROR);
        }
    };
    config.log_summary();

    let registry_arc = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    if let Some(port) = config.metrics_port {
        let registry = registry_arc.clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let executor = Arc::new(HttpExecutor::new(
        client_result.client,
        config.base_url.clone(),
    ));

    let report = match run_load_test(&config, executor).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Run failed");
            process::exit(EXIT_ERROR);
        }
    };

    log_run_result(&report.result);
    if report.summary.aborted {
        warn!("Run was aborted early by a failing threshold");
    }

    if let Some(ref path) = config.summary_export {
        if let Err(e) = report.export(path) {
            error!(path = %path.display(), error = %e, "Failed to write summary export");
        }
    }

    if config.metrics_port.is_some() {
        info!(
            metrics = %gather_metrics_string(&registry_arc),
            "Final Prometheus metrics"
        );
    }

    process::exit(report.exit_code());
}
