use crate::error::{OrchestrateError, ProviderResultExt, Result};
use devbox_common::ProviderResult;
use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry bound for consistency-lag errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    /// 6 attempts, 10 s apart.
    fn default() -> Self {
        RetryPolicy::new(6, Duration::from_secs(10))
    }
}

/// Run a control-plane mutation, retrying only while the provider reports consistency lag.
///
/// Any other error, and the last lag error once attempts are exhausted, is returned as-is.
pub async fn with_consistency_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_consistency_lag() => {
                if attempt >= policy.max_attempts {
                    return Err(OrchestrateError::Transient {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                tracing::warn!(
                    "⏳ [retry] {} hit consistency lag ({}), retrying in {:?} ({}/{})",
                    operation,
                    e,
                    policy.delay,
                    attempt,
                    policy.max_attempts
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e).during(operation),
        }
    }
}
