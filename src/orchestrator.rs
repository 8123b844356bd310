//! Analysis orchestration across providers.
//!
//! Walks the configured provider priority order. Per provider: a bounded
//! per-attempt timeout, up to `retry.max_attempts` attempts with exponential
//! backoff on retryable errors, immediate fall-through on non-retryable
//! errors. The first success wins and later providers are never consulted.
//!
//! Every attempt, success or failure, is returned as an [`AttemptRecord`] so
//! the caller can persist the full audit trail even when a later step fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::{ProviderConfig, RetryConfig};
use crate::providers::{AnalysisProvider, ProviderError};
use crate::types::SelectedAnalysis;

/// One provider in priority order, with its concurrency gate.
pub struct ProviderSlot {
    pub provider: Arc<dyn AnalysisProvider>,
    /// Global in-flight cap for this provider, shared across workers.
    pub semaphore: Arc<Semaphore>,
    pub attempt_timeout: Duration,
}

impl ProviderSlot {
    pub fn new(provider: Arc<dyn AnalysisProvider>, config: &ProviderConfig) -> Self {
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Audit record for a single provider attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider_name: String,
    pub attempt_number: u32,
    pub succeeded: bool,
    pub latency_ms: u64,
    /// Canonical analysis JSON, present on success.
    pub normalized_payload: Option<String>,
    /// Raw vendor response JSON, present on success.
    pub raw_payload: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum AnalysisFailure {
    /// Every configured provider was exhausted. Reasons are in priority
    /// order, one per provider.
    #[error("all providers failed: {}", failures.join("; "))]
    AllProvidersFailed { failures: Vec<String> },

    /// Operator cancelled between attempts.
    #[error("cancelled by operator")]
    Cancelled,
}

/// The attempts made for one transcript plus the outcome.
pub struct AnalysisRun {
    pub attempts: Vec<AttemptRecord>,
    pub outcome: Result<SelectedAnalysis, AnalysisFailure>,
}

pub struct Orchestrator {
    slots: Vec<ProviderSlot>,
    retry: RetryConfig,
}

impl Orchestrator {
    pub fn new(slots: Vec<ProviderSlot>, retry: RetryConfig) -> Self {
        Self { slots, retry }
    }

    pub fn provider_count(&self) -> usize {
        self.slots.len()
    }

    /// Analyze one transcript. `cancelled` is polled between attempts; an
    /// in-flight attempt always runs to completion before cancellation takes
    /// effect.
    pub async fn analyze(
        &self,
        text: &str,
        client_name: &str,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> AnalysisRun {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        if self.slots.is_empty() {
            return AnalysisRun {
                attempts,
                outcome: Err(AnalysisFailure::AllProvidersFailed {
                    failures: vec!["no providers configured".to_string()],
                }),
            };
        }

        for slot in &self.slots {
            let name = slot.provider.name().to_string();
            let max_attempts = self.retry.max_attempts.max(1);
            let mut last_error: Option<ProviderError> = None;

            for attempt in 1..=max_attempts {
                if cancelled() {
                    return AnalysisRun {
                        attempts,
                        outcome: Err(AnalysisFailure::Cancelled),
                    };
                }

                let started = Instant::now();
                let result = self.run_attempt(slot, text, client_name).await;
                let latency_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(analysis) => {
                        let normalized_payload =
                            serde_json::to_string(&analysis.normalized).ok();
                        attempts.push(AttemptRecord {
                            provider_name: name.clone(),
                            attempt_number: attempt,
                            succeeded: true,
                            latency_ms,
                            normalized_payload,
                            raw_payload: serde_json::to_string(&analysis.raw).ok(),
                            error_detail: None,
                        });
                        log::info!(
                            "analysis succeeded via {} on attempt {} ({} ms)",
                            name,
                            attempt,
                            latency_ms
                        );
                        return AnalysisRun {
                            attempts,
                            outcome: Ok(SelectedAnalysis {
                                provider_name: name,
                                normalized: analysis.normalized,
                                latency_ms,
                            }),
                        };
                    }
                    Err(err) => {
                        let retryable = err.is_retryable();
                        attempts.push(AttemptRecord {
                            provider_name: name.clone(),
                            attempt_number: attempt,
                            succeeded: false,
                            latency_ms,
                            normalized_payload: None,
                            raw_payload: None,
                            error_detail: Some(format!("{}: {}", err.kind(), err)),
                        });
                        log::warn!(
                            "provider {} attempt {}/{} failed: {}",
                            name,
                            attempt,
                            max_attempts,
                            err
                        );
                        let exhausted = attempt >= max_attempts;
                        last_error = Some(err);
                        if !retryable || exhausted {
                            break;
                        }
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }

            if let Some(err) = last_error {
                failures.push(format!("{}: {}", name, err.kind()));
            }
        }

        AnalysisRun {
            attempts,
            outcome: Err(AnalysisFailure::AllProvidersFailed { failures }),
        }
    }

    async fn run_attempt(
        &self,
        slot: &ProviderSlot,
        text: &str,
        client_name: &str,
    ) -> Result<crate::providers::ProviderAnalysis, ProviderError> {
        // The concurrency permit covers the whole attempt, timeout included.
        let _permit = slot
            .semaphore
            .acquire()
            .await
            .map_err(|_| ProviderError::Transport("semaphore closed".to_string()))?;

        match tokio::time::timeout(
            slot.attempt_timeout,
            slot.provider.analyze(text, client_name),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .retry
            .initial_backoff_ms
            .saturating_mul(exponent)
            .min(self.retry.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
