//! Per-iteration workload generation.
//!
//! Every VU iteration asks the [`WorkloadGenerator`] for exactly one
//! [`WorkloadRequest`]. The generator is a pure function of its fixed settings,
//! the VU id, the iteration index and the random draws taken from the caller's
//! rng; nothing is read from the clock or from shared state once it is built.
//!
//! A fraction of transfers deliberately reuse one shared idempotency key across
//! all VUs. Concurrent VUs may therefore submit the very same key and payload at
//! the same time, which is how the ledger's duplicate detection gets exercised.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use serde_json::json;

/// Default amount moved by each transfer.
pub const DEFAULT_TRANSFER_AMOUNT: u64 = 100;

/// Default idempotency key shared by all retry traffic.
pub const DEFAULT_RETRY_KEY: &str = "retry-key-1";

/// One request to send to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadRequest {
    Transfer {
        debit_account: String,
        credit_account: String,
        amount: u64,
        idempotency_key: String,
        /// True when `idempotency_key` is the shared retry key.
        is_retry: bool,
    },
    AccountRead {
        account_id: String,
    },
}

impl WorkloadRequest {
    /// JSON body for `POST /transactions`, or None for reads.
    pub fn transaction_body(&self) -> Option<serde_json::Value> {
        match self {
            WorkloadRequest::Transfer {
                debit_account,
                credit_account,
                amount,
                ..
            } => Some(json!({
                "name": "transfer",
                "entries": [
                    { "direction": "debit", "account_id": debit_account, "amount": amount },
                    { "direction": "credit", "account_id": credit_account, "amount": amount },
                ],
            })),
            WorkloadRequest::AccountRead { .. } => None,
        }
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self, WorkloadRequest::Transfer { .. })
    }
}

/// Settings the generator needs; a projection of the run configuration.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub debit_account_id: String,
    pub credit_account_id: String,
    /// Probability that an iteration is a transfer rather than a read.
    pub write_ratio: f64,
    /// Probability that a transfer reuses the shared retry key.
    pub retry_ratio: f64,
    pub retry_key: String,
    pub transfer_amount: u64,
}

/// Produces the request for each VU iteration.
#[derive(Debug, Clone)]
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    run_tag: String,
}

impl WorkloadGenerator {
    /// Creates a generator tagged with the current wall-clock time, so keys
    /// never collide with keys sent by earlier runs against the same ledger.
    pub fn new(config: WorkloadConfig) -> Self {
        let run_tag = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self::with_run_tag(config, run_tag.to_string())
    }

    /// Creates a generator with an explicit run tag.
    pub fn with_run_tag(config: WorkloadConfig, run_tag: impl Into<String>) -> Self {
        Self {
            config,
            run_tag: run_tag.into(),
        }
    }

    pub fn run_tag(&self) -> &str {
        &self.run_tag
    }

    /// Generates the request for iteration `iteration` of VU `vu_id`.
    ///
    /// Consumes one draw for reads and two for transfers.
    pub fn generate<R: Rng>(
        &self,
        vu_id: u64,
        iteration: u64,
        rng: &mut R,
    ) -> WorkloadRequest {
        if rng.gen::<f64>() >= self.config.write_ratio {
            return WorkloadRequest::AccountRead {
                account_id: self.config.debit_account_id.clone(),
            };
        }

        let is_retry = rng.gen::<f64>() < self.config.retry_ratio;
        let idempotency_key = if is_retry {
            self.config.retry_key.clone()
        } else {
            self.unique_key(vu_id, iteration)
        };

        WorkloadRequest::Transfer {
            debit_account: self.config.debit_account_id.clone(),
            credit_account: self.config.credit_account_id.clone(),
            amount: self.config.transfer_amount,
            idempotency_key,
            is_retry,
        }
    }

    /// Key unique per (run, VU, iteration). VU ids are never reused within a run.
    fn unique_key(&self, vu_id: u64, iteration: u64) -> String {
        format!("k-{}-{}-{}", self.run_tag, vu_id, iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn config(write_ratio: f64, retry_ratio: f64) -> WorkloadConfig {
        WorkloadConfig {
            debit_account_id: "acc-debit".to_string(),
            credit_account_id: "acc-credit".to_string(),
            write_ratio,
            retry_ratio,
            retry_key: DEFAULT_RETRY_KEY.to_string(),
            transfer_amount: DEFAULT_TRANSFER_AMOUNT,
        }
    }

    #[test]
    fn write_ratio_controls_the_mix() {
        let generator = WorkloadGenerator::with_run_tag(config(0.8, 0.05), "t");
        let mut rng = StdRng::seed_from_u64(42);
        let n = 10_000;

        let transfers = (0..n)
            .filter(|i| generator.generate(1, *i, &mut rng).is_transfer())
            .count();

        let fraction = transfers as f64 / n as f64;
        assert!(
            (fraction - 0.8).abs() <= 0.02,
            "transfer fraction {} outside 0.8 ± 0.02",
            fraction
        );
    }

    #[test]
    fn retry_ratio_controls_key_reuse() {
        let generator = WorkloadGenerator::with_run_tag(config(1.0, 0.05), "t");
        let mut rng = StdRng::seed_from_u64(7);
        let n = 10_000;

        let retries = (0..n)
            .filter(|i| match generator.generate(3, *i, &mut rng) {
                WorkloadRequest::Transfer {
                    idempotency_key, ..
                } => idempotency_key == DEFAULT_RETRY_KEY,
                WorkloadRequest::AccountRead { .. } => panic!("write_ratio=1.0 produced a read"),
            })
            .count();

        let fraction = retries as f64 / n as f64;
        assert!(
            (fraction - 0.05).abs() <= 0.02,
            "retry fraction {} outside 0.05 ± 0.02",
            fraction
        );
    }

    #[test]
    fn same_inputs_produce_identical_requests() {
        let generator = WorkloadGenerator::with_run_tag(config(1.0, 0.0), "run");

        let a = generator.generate(4, 17, &mut StdRng::seed_from_u64(99));
        let b = generator.generate(4, 17, &mut StdRng::seed_from_u64(99));

        assert_eq!(a, b);
        assert!(a.is_transfer());
    }

    #[test]
    fn unique_keys_never_collide() {
        let generator = WorkloadGenerator::with_run_tag(config(1.0, 0.05), "run");
        let mut seen = HashSet::new();

        for vu_id in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(vu_id);
            for iteration in 0..2_000u64 {
                if let WorkloadRequest::Transfer {
                    idempotency_key,
                    is_retry: false,
                    ..
                } = generator.generate(vu_id, iteration, &mut rng)
                {
                    assert_ne!(idempotency_key, DEFAULT_RETRY_KEY);
                    assert!(
                        seen.insert(idempotency_key.clone()),
                        "duplicate key {}",
                        idempotency_key
                    );
                }
            }
        }
        assert!(seen.len() > 90_000);
    }

    #[test]
    fn reads_target_the_debit_account() {
        let generator = WorkloadGenerator::with_run_tag(config(0.0, 0.0), "t");
        let request = generator.generate(0, 0, &mut StdRng::seed_from_u64(1));

        assert_eq!(
            request,
            WorkloadRequest::AccountRead {
                account_id: "acc-debit".to_string()
            }
        );
        assert!(request.transaction_body().is_none());
    }

    #[test]
    fn transfer_body_has_balanced_entries() {
        let generator = WorkloadGenerator::with_run_tag(config(1.0, 0.0), "t");
        let request = generator.generate(0, 0, &mut StdRng::seed_from_u64(1));
        let body = request.transaction_body().unwrap();

        assert_eq!(body["name"], "transfer");
        assert_eq!(body["entries"][0]["direction"], "debit");
        assert_eq!(body["entries"][0]["account_id"], "acc-debit");
        assert_eq!(body["entries"][0]["amount"], 100);
        assert_eq!(body["entries"][1]["direction"], "credit");
        assert_eq!(body["entries"][1]["account_id"], "acc-credit");
        assert_eq!(body["entries"][1]["amount"], 100);
    }
}
