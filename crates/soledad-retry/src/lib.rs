//! Classified-exception retry loop used to drive blob uploads/downloads
//! through transient failures (spec §4.6).
//!
//! Only [`SoledadError::RetriableTransfer`] is treated as transient; every
//! other error is fatal and returned immediately. This loop never gives up
//! on its own — it is not where the per-blob decrypt-retry budget lives.
//! Back-off starts at one second, grows by ten seconds per failed attempt,
//! and is capped at sixty seconds, matching the teacher's
//! `orchestrator::retry` shape.

#![deny(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use soledad_core::SoledadError;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const DELAY_STEP: Duration = Duration::from_secs(10);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Run `f` until it succeeds or returns a non-retriable error.
///
/// Retriable failures are retried indefinitely with capped back-off; this
/// loop never synthesizes a terminal error of its own. The separate,
/// bounded decrypt-retry budget (tracked in the local store and enforced by
/// `BlobManager::get`) is what eventually turns a corrupted download into
/// [`SoledadError::MaximumRetries`] — that budget is unrelated to this loop.
#[tracing::instrument(skip(f), fields(blob_id))]
pub async fn retry<F, Fut, T>(blob_id: &str, mut f: F) -> Result<T, SoledadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SoledadError>>,
{
    let mut attempt = 0u32;
    let mut delay = INITIAL_DELAY;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => {
                attempt += 1;
                tracing::warn!(
                    blob_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                delay = (delay + DELAY_STEP).min(MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_retriable_failures() {
        let calls = AtomicU32::new(0);
        let result = retry("blob1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SoledadError::RetriableTransfer(Box::new(SoledadError::Server("boom".into()))))
                } else {
                    Ok::<_, SoledadError>(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_past_what_used_to_be_a_retry_cap() {
        let calls = AtomicU32::new(0);
        let result = retry("blob1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 5 {
                    Err(SoledadError::RetriableTransfer(Box::new(SoledadError::Server("boom".into()))))
                } else {
                    Ok::<_, SoledadError>(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_error_is_fatal_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SoledadError> = retry("blob1", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SoledadError::BlobNotFound("blob1".into())) }
        })
        .await;
        assert!(matches!(result.unwrap_err(), SoledadError::BlobNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
