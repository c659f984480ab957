//! Reusable retry policy with exponential backoff and jitter.
//!
//! Both the embedding and completion clients apply the same policy: transient
//! failures are retried with a doubling delay (plus up to 50% random jitter)
//! until `max_attempts` is reached; permanent failures abort immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected to succeed on retry (timeout, rate limit, server error).
    Transient,
    /// Will not succeed on retry (bad input, auth error).
    Permanent,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
            multiplier: 2.0,
            max_delay: Duration::from_secs(32),
            jitter: true,
        }
    }

    /// Backoff delay before attempt `attempt` (attempts are 1-based; the
    /// first attempt has no delay).
    fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2);
        let base = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let with_jitter = if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(1.0..1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(with_jitter as u64)
    }
}

/// Outcome of a retried operation, carrying how many attempts were spent.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` under `policy`.
///
/// `classify` decides whether an error is worth retrying. On success returns
/// the value and the number of attempts used; on failure returns the last
/// error and the attempt count so callers can surface both.
pub async fn run_with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<Attempted<T>, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if attempt > 1 {
            tokio::time::sleep(policy.delay_before(attempt)).await;
        }

        match op().await {
            Ok(value) => return Ok(Attempted { value, attempts: attempt }),
            Err(e) => {
                if classify(&e) == ErrorClass::Permanent || attempt >= policy.max_attempts {
                    return Err((e, attempt));
                }
                log::debug!("transient failure on attempt {}, retrying", attempt);
            }
        }
    }
}
