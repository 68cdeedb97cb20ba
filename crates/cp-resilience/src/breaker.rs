//! Per-dependency circuit breakers.
//!
//! Each named upstream dependency gets its own breaker so one failing
//! service never gates calls to another. State transitions:
//!
//! ```text
//! Closed    → Open:      failure_count >= failure_threshold
//! Open      → HalfOpen:  recovery_timeout elapsed since last failure
//! HalfOpen  → Closed:    one successful call
//! HalfOpen  → Open:      the trial call failed
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; calls pass through.
    Closed,
    /// Failing fast; no calls attempted until the recovery window elapses.
    Open,
    /// Cooldown elapsed; a single trial call decides the next state.
    HalfOpen,
}

/// Configuration for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker for a single named dependency.
///
/// Callers must hold the surrounding mutex across the admit / record
/// sequence; the struct itself carries no interior locking.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// Open breakers whose recovery window has elapsed move to half-open and
    /// admit the call as the trial; open breakers inside the window reject
    /// with the remaining cooldown.
    pub fn try_admit(&mut self) -> Result<(), Duration> {
        if self.state != BreakerState::Open {
            return Ok(());
        }

        let elapsed = self
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(self.config.recovery_timeout);

        if elapsed >= self.config.recovery_timeout {
            self.state = BreakerState::HalfOpen;
            info!(dependency = %self.name, "circuit breaker half-open");
            Ok(())
        } else {
            Err(self.config.recovery_timeout - elapsed)
        }
    }

    /// Record a successful call: reset the failure counter and close the
    /// breaker if it was probing.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        if self.state != BreakerState::Closed {
            info!(dependency = %self.name, "circuit breaker closed");
        }
        self.state = BreakerState::Closed;
    }

    /// Record a failed call: bump the counter and open the breaker when the
    /// threshold is reached. A failed half-open trial reopens immediately.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        let should_open = self.state == BreakerState::HalfOpen
            || self.failure_count >= self.config.failure_threshold;

        if should_open && self.state != BreakerState::Open {
            self.state = BreakerState::Open;
            warn!(
                dependency = %self.name,
                failures = self.failure_count,
                "circuit breaker open"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry holding one independently synchronized breaker per dependency.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_default_config(BreakerConfig::default())
    }

    pub fn with_default_config(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Pre-register a dependency with its own thresholds.
    pub fn register(&self, name: &str, config: BreakerConfig) {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(name, config))));
    }

    /// Fetch the breaker for a dependency, creating one with the default
    /// config on first use.
    pub fn breaker(&self, name: &str) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(name, self.default_config)))
            })
            .clone()
    }

    /// Current (state, consecutive failures) per dependency, for diagnostics.
    pub fn snapshot(&self) -> Vec<(String, BreakerState, u32)> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value().lock();
                (entry.key().clone(), breaker.state(), breaker.failure_count())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut b = breaker(3, 1000);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_admit().is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut b = breaker(3, 1000);

        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);

        // Two more failures should not open it after the reset.
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_recovery_then_closed_on_success() {
        let mut b = breaker(1, 20);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(b.try_admit().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = breaker(1, 20);

        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        b.try_admit().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_admit().is_err());
    }

    #[test]
    fn rejection_reports_remaining_cooldown() {
        let mut b = breaker(1, 500);
        b.record_failure();

        let remaining = b.try_admit().unwrap_err();
        assert!(remaining <= Duration::from_millis(500));
        assert!(remaining > Duration::from_millis(100));
    }

    #[test]
    fn registry_isolates_dependencies() {
        let registry = BreakerRegistry::new();
        registry.register(
            "coingecko",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );

        registry.breaker("coingecko").lock().record_failure();

        assert_eq!(
            registry.breaker("coingecko").lock().state(),
            BreakerState::Open
        );
        assert_eq!(
            registry.breaker("defillama").lock().state(),
            BreakerState::Closed
        );
    }
}
