use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use super::Connect;
use super::ConnectError;
use super::Transport;

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 6,
        }
    }
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial.mul_f64(self.multiplier.powi(exponent).min(1e6));
        delay.min(self.max_delay)
    }
}

/// Re-attempts connections that failed for transient reasons.
///
/// See [`ConnectError::is_transient`]. Any other failure is returned right
/// away.
#[derive(Debug, Clone)]
pub struct Retry<C> {
    inner: C,
    backoff: Backoff,
}

impl<C> Retry<C> {
    pub fn new(inner: C, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }
}

#[async_trait]
impl<C> Connect for Retry<C>
where
    C: Connect,
{
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        let mut attempt = 1;
        loop {
            match self.inner.connect().await {
                Ok(transport) => return Ok(transport),
                Err(error) if error.is_transient() && attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(%error, attempt, ?delay, "transient connect failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    debug!(%error, attempt, "giving up on connect");
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use rstest::rstest;

    use super::*;
    use crate::testing::CountingConnector;

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }

    #[rstest]
    #[case(1, Duration::from_millis(500))]
    #[case(2, Duration::from_secs(1))]
    #[case(3, Duration::from_secs(2))]
    #[case(10, Duration::from_secs(10))]
    fn delay_grows_and_caps(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(Backoff::default().delay(attempt), expected);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let inner = CountingConnector::failing_then_ok(2, CountingConnector::refused);
        let retry = Retry::new(inner.clone(), fast());

        retry.connect().await.unwrap();
        assert_eq!(inner.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let inner = CountingConnector::failing_then_ok(100, CountingConnector::refused);
        let retry = Retry::new(inner.clone(), fast());

        let Err(error) = retry.connect().await else {
            panic!("connect should give up");
        };
        assert!(matches!(error, ConnectError::Dial { .. }));
        assert_eq!(inner.dials.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failures() {
        let inner = CountingConnector::failing_then_ok(100, CountingConnector::denied);
        let retry = Retry::new(inner.clone(), fast());

        let Err(error) = retry.connect().await else {
            panic!("auth failure should propagate");
        };
        assert!(matches!(error, ConnectError::Auth { .. }));
        assert_eq!(inner.dials.load(Ordering::SeqCst), 1);
    }
}
