//! Fixed-interval polling of AWS resources.
//!
//! Every wait in this crate is bounded: a check is attempted at most
//! `max_attempts` times, `interval` apart, and running out of attempts is an
//! error.

use std::{future::Future, time::Duration};

use anyhow::Result;

/// Configuration for bounded, fixed-interval waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Delay between checks
    pub interval: Duration,
    /// Number of checks before giving up
    pub max_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 60,
        }
    }
}

impl WaitConfig {
    /// The longest a wait with this config can take.
    pub fn timeout(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Wait for a condition to hold.
///
/// `check` returns `Ok(true)` when ready and `Ok(false)` to retry. An error
/// from `check` ends the wait immediately.
///
/// ## Errors
/// Errs when the condition does not hold after `max_attempts` checks.
pub async fn wait_until<F, Fut>(config: WaitConfig, resource_name: &str, check: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=config.max_attempts {
        if check().await? {
            log::debug!("{resource_name} ready after {attempt} attempt(s)");
            return Ok(());
        }
        log::debug!(
            "{resource_name} not ready (attempt {attempt}/{}), retrying in {:?}",
            config.max_attempts,
            config.interval
        );
        if attempt < config.max_attempts {
            tokio::time::sleep(config.interval).await;
        }
    }
    anyhow::bail!(
        "Timeout waiting for {resource_name} after {:?} ({} attempts)",
        config.timeout(),
        config.max_attempts
    )
}

/// Run `op`, retrying at a fixed interval while its error is retryable.
///
/// Used for operations that fail transiently right after a dependency was
/// created or deleted, such as assuming a fresh IAM role or deleting a
/// security group whose network interfaces are still draining.
pub async fn retry_while<T, F, Fut>(
    config: WaitConfig,
    resource_name: &str,
    op: F,
    is_retryable: impl Fn(&anyhow::Error) -> bool,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_attempts && is_retryable(&e) => {
                log::warn!(
                    "{resource_name}: {e} (attempt {attempt}/{}), retrying in {:?}",
                    config.max_attempts,
                    config.interval
                );
                attempt += 1;
                tokio::time::sleep(config.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
