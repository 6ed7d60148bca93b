//! Backoff and the per-call retry controller.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::duration::format_duration;

const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Maps a retry attempt count to a randomised delay.
pub(crate) type BackoffCalculator = Box<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff with full jitter: a uniform sample of
/// `[0, min * factor^attempt]`, clamped into `[min, max]` after the
/// scaling. Non-positive arguments fall back to the defaults
/// (1 ms, 500 ms, factor 2).
pub(crate) fn exponential_backoff_with_jitter(min: Duration, max: Duration, factor: f64) -> BackoffCalculator {
    let min = if min > Duration::ZERO { min } else { DEFAULT_MIN_BACKOFF };
    let max = if max > Duration::ZERO { max } else { DEFAULT_MAX_BACKOFF };
    let factor = if factor > 0.0 { factor } else { DEFAULT_BACKOFF_FACTOR };

    Box::new(move |attempt: u32| {
        let scaled = min.as_secs_f64() * factor.powi(attempt as i32);
        let sampled = rand::thread_rng().gen::<f64>() * scaled;

        Duration::from_secs_f64(sampled.clamp(min.as_secs_f64(), max.as_secs_f64()))
    })
}

/// Why the controller refused to schedule another attempt.
#[derive(Debug)]
pub(crate) enum RetryRefusal {
    /// The configured retry cap was reached; surface the last classified
    /// error unchanged.
    RetriesExhausted,
    /// The caller's deadline leaves no room for another round trip.
    DeadlineWouldBeExceeded,
    /// The negotiated server timeout has no budget left.
    ServerTimedOut,
    /// The rewritten payload could not be serialised.
    Marshal(serde_json::Error),
}

/// Owns the deadline arithmetic between attempts.
///
/// At each decision point it checks the retry cap, computes the backoff,
/// verifies both deadlines leave room for the delay plus another attempt,
/// rewrites the payload `timeout` field to the remaining server budget,
/// and finally sleeps. Everything except the sleep happens before any
/// waiting, so a refusal is immediate.
pub(crate) struct RetryController {
    caller_deadline: Option<Instant>,
    server_deadline: Option<Instant>,
    max_retries: Option<u32>,
    backoff: BackoffCalculator,
    retries: u32,
}

impl RetryController {
    pub(crate) fn new(
        caller_deadline: Option<Instant>,
        server_deadline: Option<Instant>,
        max_retries: Option<u32>,
        backoff: BackoffCalculator,
    ) -> RetryController {
        RetryController {
            caller_deadline,
            server_deadline,
            max_retries,
            backoff,
            retries: 0,
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    /// Decides whether another attempt may be scheduled, and prepares it.
    ///
    /// On success the attempt counter is advanced and, when a server
    /// deadline is negotiated, the payload has been rewritten with the
    /// remaining budget; the returned bytes are the new request body.
    pub(crate) async fn before_retry(
        &mut self,
        payload: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Vec<u8>>, RetryRefusal> {
        if let Some(max) = self.max_retries {
            if self.retries >= max {
                return Err(RetryRefusal::RetriesExhausted);
            }
        }

        let delay = (self.backoff)(self.retries);
        let now = Instant::now();

        if let Some(deadline) = self.caller_deadline {
            // Needs room for the sleep and for one more round trip of at
            // least the same length.
            if now + delay > deadline - delay {
                return Err(RetryRefusal::DeadlineWouldBeExceeded);
            }
        }

        let mut new_body = None;

        if let Some(deadline) = self.server_deadline {
            let Some(remaining) = deadline.checked_duration_since(now + delay) else {
                return Err(RetryRefusal::ServerTimedOut);
            };
            if remaining.is_zero() {
                return Err(RetryRefusal::ServerTimedOut);
            }

            payload.insert(
                "timeout".to_string(),
                serde_json::Value::String(format_duration(remaining)),
            );

            new_body = Some(serde_json::to_vec(payload).map_err(RetryRefusal::Marshal)?);
        }

        tracing::debug!(
            attempt = self.retries + 1,
            delay_ms = delay.as_millis() as u64,
            "waiting before retrying query"
        );

        tokio::time::sleep(delay).await;
        self.retries += 1;

        Ok(new_body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        let calc = exponential_backoff_with_jitter(min, max, 2.0);

        for attempt in 0..16 {
            for _ in 0..50 {
                let delay = calc(attempt);
                assert!(delay >= min, "attempt {attempt}: {delay:?} below min");
                assert!(delay <= max, "attempt {attempt}: {delay:?} above max");
            }
        }
    }

    #[test]
    fn test_backoff_defaults_on_zero_arguments() {
        let calc = exponential_backoff_with_jitter(Duration::ZERO, Duration::ZERO, 0.0);

        for _ in 0..50 {
            let delay = calc(0);
            assert!(delay >= DEFAULT_MIN_BACKOFF);
            assert!(delay <= DEFAULT_MAX_BACKOFF);
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let calc = exponential_backoff_with_jitter(Duration::from_millis(100), Duration::from_millis(200), 2.0);

        // By attempt 10 the scaled range is far past the cap.
        for _ in 0..50 {
            assert!(calc(10) <= Duration::from_millis(200));
        }
    }

    fn fixed_backoff(delay: Duration) -> BackoffCalculator {
        Box::new(move |_| delay)
    }

    #[tokio::test]
    async fn test_caller_deadline_refuses_late_attempt() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let mut controller = RetryController::new(Some(deadline), None, None, fixed_backoff(Duration::from_millis(40)));

        let mut payload = serde_json::Map::new();
        let refusal = controller.before_retry(&mut payload).await.unwrap_err();

        assert!(matches!(refusal, RetryRefusal::DeadlineWouldBeExceeded));
    }

    #[tokio::test]
    async fn test_server_deadline_refuses_when_spent() {
        let deadline = Instant::now() + Duration::from_millis(5);
        let mut controller = RetryController::new(None, Some(deadline), None, fixed_backoff(Duration::from_millis(10)));

        let mut payload = serde_json::Map::new();
        let refusal = controller.before_retry(&mut payload).await.unwrap_err();

        assert!(matches!(refusal, RetryRefusal::ServerTimedOut));
    }

    #[tokio::test]
    async fn test_server_deadline_rewrites_timeout() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut controller = RetryController::new(None, Some(deadline), None, fixed_backoff(Duration::from_millis(1)));

        let mut payload = serde_json::Map::new();
        payload.insert("timeout".to_string(), serde_json::Value::String("10s".to_string()));

        let body = controller.before_retry(&mut payload).await.unwrap();

        let body = body.expect("rewritten body");
        let rewritten: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let timeout = rewritten["timeout"].as_str().unwrap();
        let remaining = crate::duration::parse_duration(timeout).unwrap();

        assert!(remaining < Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
        assert_eq!(controller.retries(), 1);
    }

    #[tokio::test]
    async fn test_no_server_deadline_keeps_body() {
        let mut controller = RetryController::new(None, None, None, fixed_backoff(Duration::from_millis(1)));

        let mut payload = serde_json::Map::new();
        let body = controller.before_retry(&mut payload).await.unwrap();

        assert!(body.is_none());
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_max_retries_is_a_hard_cap() {
        let mut controller = RetryController::new(None, None, Some(1), fixed_backoff(Duration::from_millis(1)));

        let mut payload = serde_json::Map::new();
        assert!(controller.before_retry(&mut payload).await.is_ok());

        let refusal = controller.before_retry(&mut payload).await.unwrap_err();
        assert!(matches!(refusal, RetryRefusal::RetriesExhausted));
    }

    #[tokio::test]
    async fn test_zero_max_retries_refuses_immediately() {
        let mut controller = RetryController::new(None, None, Some(0), fixed_backoff(Duration::from_millis(1)));

        let mut payload = serde_json::Map::new();
        let refusal = controller.before_retry(&mut payload).await.unwrap_err();

        assert!(matches!(refusal, RetryRefusal::RetriesExhausted));
    }
}
