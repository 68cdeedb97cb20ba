//! The composed call pipeline: cache, then retry, then circuit breaker.
//!
//! Ordering is a contract, not an accident of wrapping: the cache is
//! consulted before anything else (a hit never invokes the dependency and
//! never moves breaker state), and the breaker gates each individual retry
//! attempt (so a breaker that opens mid-retry fails the remaining attempts
//! fast).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use cp_types::errors::ResilienceError;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::ResponseCache;

/// Retry behavior for one call pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each attempt after that.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Routing and caching parameters for a single call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Breaker name; one breaker per dependency.
    pub dependency: String,
    pub cache_key: String,
    pub ttl: Duration,
    /// Per-attempt deadline. A hung dependency costs at most this much.
    pub timeout: Duration,
}

impl CallSpec {
    pub fn new(dependency: &str, cache_key: String, ttl: Duration, timeout: Duration) -> Self {
        Self {
            dependency: dependency.to_string(),
            cache_key,
            ttl,
            timeout,
        }
    }
}

/// Shared wrapper every upstream fetch goes through.
#[derive(Debug)]
pub struct ResilienceLayer {
    cache: Arc<ResponseCache>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
}

impl ResilienceLayer {
    pub fn new(retry: RetryPolicy, breakers: BreakerRegistry) -> Self {
        Self {
            cache: Arc::new(ResponseCache::new()),
            breakers,
            retry,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetryPolicy::default(), BreakerRegistry::new())
    }

    /// Handle to the shared response cache (also probed by the health
    /// monitor).
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Register a dependency with its own breaker thresholds.
    pub fn register_dependency(&self, name: &str, config: BreakerConfig) {
        self.breakers.register(name, config);
    }

    /// Drop every cached response, returning the number cleared.
    pub fn flush_cache(&self) -> usize {
        self.cache.flush()
    }

    /// Execute `op` under the cache / retry / breaker pipeline.
    ///
    /// All dependency faults come back as a typed [`ResilienceError`];
    /// nothing escapes as a raw upstream error.
    pub async fn call<T, F, Fut>(&self, spec: &CallSpec, op: F) -> Result<T, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Cache first: a live entry short-circuits everything.
        if let Some(value) = self.cache.get(&spec.cache_key) {
            if let Ok(typed) = serde_json::from_value(value) {
                debug!(dependency = %spec.dependency, key = %spec.cache_key, "cache hit");
                return Ok(typed);
            }
            // A cached value that no longer deserializes is dropped and
            // recomputed.
            self.cache.remove(&spec.cache_key);
        }

        let breaker = self.breakers.breaker(&spec.dependency);
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            // Admission is a read-check-mutate sequence; hold the lock for
            // the whole decision.
            if let Err(retry_in) = breaker.lock().try_admit() {
                return Err(ResilienceError::DependencyUnavailable {
                    dependency: spec.dependency.clone(),
                    retry_in_ms: retry_in.as_millis() as u64,
                });
            }

            let outcome = match tokio::time::timeout(spec.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "timed out after {} ms",
                    spec.timeout.as_millis()
                )),
            };

            match outcome {
                Ok(value) => {
                    breaker.lock().record_success();
                    match serde_json::to_value(&value) {
                        Ok(serialized) => {
                            self.cache.insert(&spec.cache_key, serialized, spec.ttl)
                        }
                        Err(e) => {
                            warn!(dependency = %spec.dependency, error = %e, "result not cacheable")
                        }
                    }
                    return Ok(value);
                }
                Err(e) => {
                    breaker.lock().record_failure();
                    last_error = e.to_string();
                    warn!(
                        dependency = %spec.dependency,
                        attempt = attempt + 1,
                        error = %last_error,
                        "dependency call failed"
                    );

                    if attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.base_delay * 2u32.saturating_pow(attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(ResilienceError::DependencyFailed {
            dependency: spec.dependency.clone(),
            attempts: self.retry.max_attempts,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_layer(max_attempts: u32) -> ResilienceLayer {
        ResilienceLayer::new(
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
            },
            BreakerRegistry::new(),
        )
    }

    fn spec(dependency: &str, key: &str) -> CallSpec {
        CallSpec::new(
            dependency,
            key.to_string(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn cache_hit_skips_operation_and_breaker() {
        let layer = fast_layer(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let spec = spec("coingecko", "prices");

        for _ in 0..3 {
            let calls = calls.clone();
            let result: u64 = layer
                .call(&spec, move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(42u64)
                    }
                })
                .await
                .unwrap();
            assert_eq!(result, 42);
        }

        // First call populated the cache; the other two never ran the op.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            layer.breakers().breaker("coingecko").lock().state(),
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn exhausted_retries_return_dependency_failed() {
        let layer = fast_layer(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let spec = spec("coingecko", "prices");

        let calls_in = calls.clone();
        let result: Result<u64, _> = layer
            .call(&spec, move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("upstream 503"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ResilienceError::DependencyFailed {
                dependency,
                attempts,
                message,
            }) => {
                assert_eq!(dependency, "coingecko");
                assert_eq!(attempts, 3);
                assert!(message.contains("503"));
            }
            other => panic!("expected DependencyFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking() {
        let layer = fast_layer(1);
        layer.register_dependency(
            "twitter",
            BreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            },
        );

        let spec = CallSpec::new(
            "twitter",
            "sentiment".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        // Two failures trip the breaker.
        for _ in 0..2 {
            let _: Result<u64, _> = layer
                .call(&spec, || async { Err(anyhow::anyhow!("down")) })
                .await;
        }
        assert_eq!(
            layer.breakers().breaker("twitter").lock().state(),
            BreakerState::Open
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let result: Result<u64, _> = layer
            .call(&spec, move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u64)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            result,
            Err(ResilienceError::DependencyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn breaker_recovers_through_half_open() {
        let layer = fast_layer(1);
        layer.register_dependency(
            "defillama",
            BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_millis(40),
            },
        );

        let spec = CallSpec::new(
            "defillama",
            "tvl".to_string(),
            // Zero-ish TTL so the cached success doesn't mask later calls.
            Duration::from_millis(1),
            Duration::from_secs(1),
        );

        // Three failing calls -> open.
        for _ in 0..3 {
            let _: Result<u64, _> = layer
                .call(&spec, || async { Err(anyhow::anyhow!("down")) })
                .await;
        }
        assert_eq!(
            layer.breakers().breaker("defillama").lock().state(),
            BreakerState::Open
        );

        // Inside the recovery window: rejected without invocation.
        let result: Result<u64, _> = layer.call(&spec, || async { Ok(7u64) }).await;
        assert!(matches!(
            result,
            Err(ResilienceError::DependencyUnavailable { .. })
        ));

        // After the window: trial call runs and closes the breaker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result: u64 = layer.call(&spec, || async { Ok(7u64) }).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(
            layer.breakers().breaker("defillama").lock().state(),
            BreakerState::Closed
        );
        assert_eq!(
            layer.breakers().breaker("defillama").lock().failure_count(),
            0
        );
    }

    #[tokio::test]
    async fn per_attempt_timeout_counts_as_failure() {
        let layer = ResilienceLayer::new(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
            BreakerRegistry::new(),
        );
        let spec = CallSpec::new(
            "slow",
            "op".to_string(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );

        let result: Result<u64, _> = layer
            .call(&spec, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1u64)
            })
            .await;

        match result {
            Err(ResilienceError::DependencyFailed { message, .. }) => {
                assert!(message.contains("timed out"));
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert_eq!(layer.breakers().breaker("slow").lock().failure_count(), 2);
    }
}
