//! Send-and-classify loop shared by every provider adapter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_types::{Provider, Result, SwitchboardError};
use tokio_util::sync::CancellationToken;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Retry budget and wait schedule.
///
/// Before retry `n` (0-indexed) the loop sleeps
/// `rate_limit_wait + initial_backoff * 2^n + jitter`, where jitter is drawn
/// uniformly from `[0, max_jitter]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(with = "crate::config::millis")]
    pub initial_backoff: Duration,
    #[serde(with = "crate::config::millis")]
    pub max_jitter: Duration,
    /// Extra wait applied to every rate-limited or overloaded reply.
    #[serde(with = "crate::config::millis")]
    pub rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
            rate_limit_wait: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting at all, for tests and local mocks.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_jitter: Duration::ZERO,
            rate_limit_wait: Duration::ZERO,
        }
    }

    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.rate_limit_wait + self.backoff_for_retry(retry) + self.jitter()
    }
}

/// How a provider classified one HTTP reply.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    /// Rate limited, overloaded or a transient server fault.
    Retry { reason: String },
    Fatal(SwitchboardError),
}

/// POST `request` until `classify` accepts or rejects the reply, or the
/// attempt budget runs out. Transport failures end the loop at once.
/// Cancellation interrupts both the in-flight request and the backoff sleep.
pub async fn send_with_retry<T, F>(
    transport: &dyn HttpTransport,
    request: &HttpRequest,
    policy: &RetryPolicy,
    provider: Provider,
    cancel: &CancellationToken,
    classify: F,
) -> Result<T>
where
    F: Fn(&HttpResponse) -> Attempt<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_body = String::new();

    for attempt in 1..=attempts {
        tracing::info!(%provider, attempt, url = %request.redacted_url(), "Sending request");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchboardError::Cancelled { provider }),
            result = transport.post(request) => {
                result.map_err(|e| e.into_switchboard(provider))?
            }
        };

        tracing::info!(%provider, status = response.status, "Completed request");
        tracing::debug!(%provider, body = %response.body, "Response body");

        match classify(&response) {
            Attempt::Success(value) => return Ok(value),
            Attempt::Fatal(err) => {
                tracing::error!(%provider, error = %err, "Provider returned a fatal error");
                return Err(err);
            }
            Attempt::Retry { reason } => {
                last_body = response.body;
                if attempt == attempts {
                    tracing::warn!(%provider, attempt, reason = %reason, "Retry budget exhausted");
                    break;
                }
                let delay = policy.delay_before_retry(attempt - 1);
                tracing::warn!(
                    %provider,
                    attempt,
                    reason = %reason,
                    delay_ms = %delay.as_millis(),
                    "Retryable error, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SwitchboardError::Cancelled { provider }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(SwitchboardError::RetriesExhausted {
        provider,
        attempts,
        body: last_body,
    })
}
