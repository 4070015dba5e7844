use std::{collections::HashMap, future::Future, time::Duration};

use rand::Rng;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::error::RetryError;

const STALE_FACTOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub attempts: u32,
    pub last_attempt_time: Instant,
}

#[derive(Default)]
struct RetryState {
    records: HashMap<String, OperationRecord>,
    resets: HashMap<String, u64>,
    global_resets: u64,
}

impl RetryState {
    fn generation(&self, operation_id: &str) -> (u64, u64) {
        (
            self.global_resets,
            self.resets.get(operation_id).copied().unwrap_or_default(),
        )
    }
}

pub struct RetryManager {
    config: RetryConfig,
    state: Mutex<RetryState>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RetryState::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// A `reset`/`clear_all` issued while an attempt is in flight does not
    /// interrupt that attempt; it stops any retry scheduled after it.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_id: &str,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let generation = self.state.lock().await.generation(operation_id);
        let mut first_pass = true;

        loop {
            let attempts = {
                let mut state = self.state.lock().await;
                if state.generation(operation_id) != generation {
                    debug!(operation_id, "retry: state reset, dropping pending retry");
                    return Err(RetryError::Cancelled {
                        operation_id: operation_id.to_string(),
                    });
                }

                let now = Instant::now();
                let stale_after = self.config.base_delay * STALE_FACTOR;
                let record = state
                    .records
                    .entry(operation_id.to_string())
                    .or_insert_with(|| OperationRecord {
                        attempts: 0,
                        last_attempt_time: now,
                    });

                // Only a record left behind by another execution can be stale;
                // our own backoff sleeps never reset the budget.
                if first_pass && now.duration_since(record.last_attempt_time) > stale_after {
                    debug!(
                        operation_id,
                        previous_attempts = record.attempts,
                        "retry: stale record, resetting attempts"
                    );
                    record.attempts = 0;
                }
                first_pass = false;

                if record.attempts >= self.config.max_retries {
                    let attempts = record.attempts;
                    return Err(RetryError::Exhausted {
                        operation_id: operation_id.to_string(),
                        attempts,
                        source: anyhow::anyhow!("retry budget already spent"),
                    });
                }

                record.attempts += 1;
                record.last_attempt_time = now;
                record.attempts
            };

            match operation().await {
                Ok(value) => {
                    self.state.lock().await.records.remove(operation_id);
                    return Ok(value);
                }
                Err(err) if attempts >= self.config.max_retries => {
                    self.state.lock().await.records.remove(operation_id);
                    warn!(operation_id, attempts, "retry: giving up: {err:#}");
                    return Err(RetryError::Exhausted {
                        operation_id: operation_id.to_string(),
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.backoff_delay(attempts);
                    warn!(
                        operation_id,
                        attempt = attempts,
                        max_attempts = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retry: attempt failed: {err:#}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.config.base_delay.as_millis() as u64;
        let jitter_cap = self.config.max_jitter.as_millis() as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        let delay_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .saturating_add(jitter);
        Duration::from_millis(delay_ms).min(self.config.max_delay)
    }

    pub async fn record(&self, operation_id: &str) -> Option<OperationRecord> {
        self.state.lock().await.records.get(operation_id).cloned()
    }

    pub async fn reset(&self, operation_id: &str) {
        let mut state = self.state.lock().await;
        if state.records.remove(operation_id).is_some() {
            *state.resets.entry(operation_id.to_string()).or_default() += 1;
        }
    }

    pub async fn clear_all(&self) {
        let mut state = self.state.lock().await;
        state.records.clear();
        state.resets.clear();
        state.global_resets += 1;
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
