use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use tracing::error;

use super::Connect;
use super::ConnectError;
use super::Transport;

/// Remembers the first failure of the wrapped connector and returns it to
/// every later caller without attempting to connect again.
#[derive(Debug)]
pub struct CircuitBreaker<C> {
    inner: C,
    tripped: Mutex<Option<ConnectError>>,
}

impl<C> CircuitBreaker<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            tripped: Mutex::new(None),
        }
    }

    /// The cached failure, if the breaker has tripped.
    #[must_use]
    pub fn tripped(&self) -> Option<ConnectError> {
        self.tripped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<C> Connect for CircuitBreaker<C>
where
    C: Connect,
{
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        if let Some(error) = self.tripped() {
            debug!(%error, "circuit open, not connecting");
            return Err(error);
        }

        match self.inner.connect().await {
            Ok(transport) => Ok(transport),
            Err(error) => {
                error!(%error, "connect failed, opening circuit");
                let mut tripped = self
                    .tripped
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                // a concurrent caller may have tripped it first
                Err(tripped.get_or_insert(error).clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::CountingConnector;

    #[tokio::test]
    async fn caches_first_failure() {
        let inner = CountingConnector::failing_then_ok(1, CountingConnector::refused);
        let breaker = CircuitBreaker::new(inner.clone());

        let Err(first) = breaker.connect().await else {
            panic!("first connect should fail");
        };
        for _ in 0..5 {
            let Err(again) = breaker.connect().await else {
                panic!("breaker should stay open");
            };
            assert_eq!(again.to_string(), first.to_string());
        }
        assert_eq!(inner.dials.load(Ordering::SeqCst), 1);
        assert!(breaker.tripped().is_some());
    }

    #[tokio::test]
    async fn passes_success_through() {
        let inner = CountingConnector::failing_then_ok(0, CountingConnector::refused);
        let breaker = CircuitBreaker::new(inner.clone());

        breaker.connect().await.unwrap();
        breaker.connect().await.unwrap();
        assert_eq!(inner.dials.load(Ordering::SeqCst), 2);
        assert!(breaker.tripped().is_none());
    }
}
