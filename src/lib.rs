//! Staged load generation against a ledger/transaction service.
//!
//! A run ramps virtual users (VUs) up and down along a list of stages. Each VU
//! loops: generate a request (a transfer or an account read), send it, record
//! the sample, pause. At the end the aggregated latencies and failure rates are
//! checked against k6-style thresholds to give a single pass/fail verdict.
//!
//! Transfers carry an `Idempotency-Key`. A configurable share of them reuse
//! one fixed key on purpose, so the service sees concurrent duplicate
//! submissions and its idempotency handling is exercised under load.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod stages;
pub mod thresholds;
pub mod utils;
pub mod workload;
pub mod yaml_config;
