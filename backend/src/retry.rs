use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::PipelineError;

/// Capped exponential backoff with up to 25% jitter for the given retry
/// (1-based).
pub fn backoff_delay(settings: &RetrySettings, retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(16);
    let raw = settings.base_delay_ms.saturating_mul(1u64 << exp);
    let capped = raw.min(settings.max_delay_ms);
    let jitter = if capped >= 4 {
        rand::thread_rng().gen_range(0..=capped / 4)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_sub(jitter))
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent.
pub async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    operation: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < settings.max_retries => {
                retry += 1;
                let delay = backoff_delay(settings, retry);
                warn!(operation, retry, error = %e, "Transient failure, retrying");
                debug!(operation, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
