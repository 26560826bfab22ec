//! Circuit breaker in front of a generation backend
//!
//! After too many consecutive failures the breaker opens and every call
//! fails fast with [`ProviderError::Unavailable`] until the cooldown elapses.
//! Then one call is let through to test recovery.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::provider::{GenerationProvider, ProviderError, TextStream};
use crate::types::GenerationRequest;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - reject requests immediately
    Open,
    /// Testing recovery - allow one request
    HalfOpen,
}

/// Consecutive-failure counter with a cooldown
///
/// ```
/// use std::time::Duration;
/// use tribunal_provider::CircuitBreaker;
///
/// let cb = CircuitBreaker::new(2, Duration::from_secs(30));
/// cb.record_failure();
/// cb.record_failure();
/// assert!(!cb.can_execute());
/// ```
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure_ms: AtomicU64, // millis since `epoch`
    epoch: Instant,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn elapsed_since_failure(&self) -> u64 {
        self.now_ms()
            .saturating_sub(self.last_failure_ms.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            return CircuitState::Closed;
        }
        if self.elapsed_since_failure() >= self.cooldown.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Record a successful operation (resets failure count)
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Milliseconds until a half-open probe is allowed, 0 if not open
    pub fn time_until_retry(&self) -> u64 {
        match self.state() {
            CircuitState::Open => {
                (self.cooldown.as_millis() as u64).saturating_sub(self.elapsed_since_failure())
            }
            _ => 0,
        }
    }

    fn observe<T>(&self, result: &Result<T, ProviderError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_error(e),
        }
    }

    fn record_error(&self, err: &ProviderError) {
        if err.counts_against_breaker() {
            self.record_failure();
            tracing::warn!(
                failures = self.failure_count(),
                kind = %err.kind(),
                "Circuit breaker: recorded failure"
            );
        }
    }

    fn reject(&self) -> ProviderError {
        ProviderError::Unavailable(format!(
            "circuit open after {} failures, retry in {}s",
            self.failure_count(),
            self.time_until_retry().div_ceil(1000)
        ))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// A provider that consults a [`CircuitBreaker`] before every call
pub struct BreakerProvider<P> {
    inner: P,
    breaker: Arc<CircuitBreaker>,
}

impl<P: GenerationProvider> BreakerProvider<P> {
    pub fn new(inner: P, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            breaker: Arc::new(breaker),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl<P: GenerationProvider> GenerationProvider for BreakerProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn health(&self) -> bool {
        if !self.breaker.can_execute() {
            return false;
        }
        self.inner.health().await
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        if !self.breaker.can_execute() {
            return Err(self.breaker.reject());
        }
        let result = self.inner.generate(request).await;
        self.breaker.observe(&result);
        result
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, ProviderError> {
        if !self.breaker.can_execute() {
            return Err(self.breaker.reject());
        }
        let mut stream = match self.inner.generate_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.breaker.record_error(&e);
                return Err(e);
            }
        };

        // Success is only known once the stream ends cleanly
        let breaker = Arc::clone(&self.breaker);
        let guarded = async_stream::stream! {
            let mut failed = false;
            while let Some(item) = stream.next().await {
                if let Err(e) = &item {
                    breaker.record_error(e);
                    failed = true;
                }
                yield item;
                if failed {
                    break;
                }
            }
            if !failed {
                breaker.record_success();
            }
        };
        Ok(guarded.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Script, ScriptedProvider};
    use std::thread::sleep;

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.time_until_retry() > 0);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(50));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_provider_fails_fast_when_open() {
        let inner = ScriptedProvider::new()
            .with_default(Script::Fail(ProviderError::Connect("refused".into())));
        let provider = BreakerProvider::new(inner.clone(), CircuitBreaker::new(2, Duration::from_secs(60)));
        let request = GenerationRequest::new("m", "p");

        for _ in 0..2 {
            let err = provider.generate(&request).await.unwrap_err();
            assert!(matches!(err, ProviderError::Connect(_)));
        }

        let err = provider.generate(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(!provider.health().await);
        assert_eq!(inner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_content_does_not_trip_breaker() {
        let inner = ScriptedProvider::new().with_default(Script::Reply(String::new()));
        let provider = BreakerProvider::new(inner, CircuitBreaker::new(1, Duration::from_secs(60)));
        let request = GenerationRequest::new("m", "p");

        assert_eq!(
            provider.generate(&request).await.unwrap_err(),
            ProviderError::EmptyContent
        );
        assert_eq!(provider.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stream_failure_is_observed() {
        let inner = ScriptedProvider::new().with_default(Script::FailMidStream(
            vec!["partial".into()],
            ProviderError::Timeout("read".into()),
        ));
        let provider = BreakerProvider::new(inner, CircuitBreaker::new(1, Duration::from_secs(60)));

        let stream = provider
            .generate_stream(&GenerationRequest::new("m", "p"))
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert!(items.iter().any(|i| i.is_err()));
        assert_eq!(provider.breaker().state(), CircuitState::Open);
    }
}
