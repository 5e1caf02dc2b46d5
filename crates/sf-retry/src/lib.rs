// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policy and exponential backoff for step execution (spec.md §4.I).
//!
//! Defaults: `max_retries = 0` for deterministic skills (planners,
//! validators, bundlers), `max_retries = 2` for provider-backed skills
//! (image/video/audio/3D). Backoff starts at 1s, doubles, caps at 8s, with
//! ±20% jitter. Only error codes whose [`sf_error::ErrorCode::is_retryable`]
//! returns `true` trigger a retry.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use sf_error::{ErrorCode, SfError};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

/// Exponential backoff policy with jitter, plus the retry ceiling for one
/// step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial one. `0` disables retry.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`; `0.2` means up to 20% is shaved off
    /// the nominal delay.
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// `max_retries = 0`, for deterministic skills (planners, validators,
    /// bundlers) per spec.md §4.I.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            max_retries: 0,
            ..Self::base()
        }
    }

    /// `max_retries = 2`, for provider-backed skills (image/video/audio/3D)
    /// per spec.md §4.I.
    #[must_use]
    pub fn provider_backed() -> Self {
        Self {
            max_retries: 2,
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
        }
    }

    /// Override the retry ceiling, keeping the standard backoff shape.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The backoff delay before the given zero-indexed retry attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let nominal_ms = (self.base_delay.as_millis() as u64).saturating_mul(exp);
        let capped_ms = nominal_ms.min(self.max_delay.as_millis() as u64);

        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        if jitter_factor <= 0.0 || capped_ms == 0 {
            return Duration::from_millis(capped_ms);
        }

        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 { pseudo % jitter_range } else { 0 };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    }

    /// Whether `code` is eligible for retry under this policy.
    ///
    /// Delegates to [`ErrorCode::is_retryable`]; spec.md §4.I names the same
    /// four transient codes that categorization already encodes.
    #[must_use]
    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        code.is_retryable()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Record of one failed attempt.
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// The error returned by that attempt.
    pub error: SfError,
    /// Backoff delay applied before the next attempt.
    pub delay: Duration,
}

/// Outcome of a retry-driven operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Total attempts made, including the successful one.
    pub total_attempts: u32,
    /// Every failed attempt, in order.
    pub failed_attempts: Vec<FailedAttempt>,
}

/// Run `op` up to `policy.max_retries + 1` times, backing off between
/// retryable failures and stopping immediately on a non-retryable one.
///
/// Returns the last error once attempts are exhausted or a non-retryable
/// error is hit.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<RetryOutcome<T>, SfError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SfError>>,
{
    let start = Instant::now();
    let max_attempts = policy.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        match op(attempt).await {
            Ok(value) => {
                tracing::debug!(
                    attempt,
                    total_duration_ms = start.elapsed().as_millis() as u64,
                    "step attempt succeeded"
                );
                return Ok(RetryOutcome {
                    value,
                    total_attempts: attempt + 1,
                    failed_attempts,
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;
                if !policy.is_retryable(err.code) || is_last {
                    tracing::warn!(
                        attempt,
                        code = %err.code,
                        retryable = policy.is_retryable(err.code),
                        "step attempt failed, not retrying"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    code = %err.code,
                    delay_ms = delay.as_millis() as u64,
                    "step attempt failed, backing off before retry"
                );
                failed_attempts.push(FailedAttempt {
                    attempt,
                    error: err,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("loop always returns on its final iteration")
}
