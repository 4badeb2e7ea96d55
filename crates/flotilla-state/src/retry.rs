//! Bounded retries for transient store failures.

use std::time::Duration;

use tracing::warn;

use crate::error::{StateError, StateResult};

/// Run `op` until it succeeds, fails permanently, or `attempts` runs
/// out. Waits between tries with exponential backoff starting at
/// `base_delay` and doubling each time.
pub async fn with_retries<T, F>(attempts: u32, base_delay: Duration, mut op: F) -> StateResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    let mut delay = base_delay;
    let mut tries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tries + 1 < attempts => {
                tries += 1;
                warn!(error = %e, attempt = tries, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StateError>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StateError::Timeout("busy".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: StateResult<()> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StateError::Unavailable("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: StateResult<()> = with_retries(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StateError::NotFound("nope".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
