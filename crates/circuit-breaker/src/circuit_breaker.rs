// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! CircuitBreaker - Fault tolerance and resilience pattern
//!
//! Core implementation of circuit breaker for preventing cascading failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Error types for CircuitBreaker operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, request rejected
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of a failed [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker refused the call without running it
    #[error("{0}")]
    Rejected(CircuitBreakerError),

    /// The call exceeded `call_timeout` and was dropped
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The call ran and returned an error
    #[error("Call failed: {0}")]
    Failed(E),
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Name used in logs and metric labels
    pub name: String,

    /// Consecutive failures (including timeouts) that trip the breaker
    pub max_failures: u32,

    /// Upper bound for a single guarded call
    pub call_timeout: Duration,

    /// Time spent open before a trial call is allowed
    pub reset_timeout: Duration,

    /// Successful trial calls needed to close again
    pub success_threshold: u32,

    /// Concurrent trial calls allowed while half-open
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_failures: 5,
            call_timeout: Duration::from_secs(20),
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            max_half_open_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate thresholds and timeouts
    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.max_failures == 0 {
            return Err(CircuitBreakerError::InvalidConfig(
                "max_failures must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidConfig(
                "call_timeout must be greater than zero".to_string(),
            ));
        }
        if self.success_threshold == 0 || self.max_half_open_requests == 0 {
            return Err(CircuitBreakerError::InvalidConfig(
                "half-open thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Tripped, calls fail immediately
    Open,
    /// Testing recovery with a limited number of trial calls
    HalfOpen,
}

/// Point-in-time counters for a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Calls that ran (successful + failed)
    pub total_requests: u64,
    /// Calls that succeeded
    pub successful_requests: u64,
    /// Calls that failed or timed out
    pub failed_requests: u64,
    /// Calls refused without running
    pub rejected_requests: u64,
    /// Current run of consecutive failures
    pub consecutive_failures: u32,
    /// Current run of consecutive successes
    pub consecutive_successes: u32,
    /// Times the breaker has opened
    pub trip_count: u64,
    /// Failed / total, 0.0 when nothing ran yet
    pub error_rate: f64,
    /// Time spent in the current state
    pub time_in_state: Duration,
}

/// Circuit breaker state data
struct CircuitBreakerState {
    config: Arc<CircuitBreakerConfig>,
    state: CircuitState,
    state_since: Instant,

    // Counters
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trip_count: u64,

    last_opened: Option<Instant>,

    // Half-open tracking
    half_open_requests: u32,
}

impl CircuitBreakerState {
    fn new(config: Arc<CircuitBreakerConfig>) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            state_since: Instant::now(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            trip_count: 0,
            last_opened: None,
            half_open_requests: 0,
        }
    }

    /// Check if request should be allowed
    fn is_request_allowed(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let reset_elapsed = self
                    .last_opened
                    .map(|opened_at| opened_at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(false);
                if reset_elapsed {
                    self.transition_to_half_open();
                    self.half_open_requests += 1;
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                if self.half_open_requests < self.config.max_half_open_requests {
                    self.half_open_requests += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record successful request
    fn record_success(&mut self) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        if self.state == CircuitState::HalfOpen {
            self.half_open_requests = self.half_open_requests.saturating_sub(1);
            if self.consecutive_successes >= self.config.success_threshold {
                self.transition_to_closed();
            }
        }
    }

    /// Record failed request
    fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.max_failures {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // Any failed trial → back to open
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open;
        self.state_since = Instant::now();
        self.last_opened = Some(Instant::now());
        self.trip_count += 1;
        self.half_open_requests = 0;
        metrics::counter!("plexspaces_circuit_breaker_trips_total", "name" => self.config.name.clone())
            .increment(1);
        warn!(
            name = %self.config.name,
            consecutive_failures = self.consecutive_failures,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.state_since = Instant::now();
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        self.half_open_requests = 0;
        debug!(name = %self.config.name, "Circuit breaker half-open");
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.state_since = Instant::now();
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_requests = 0;
        info!(name = %self.config.name, "Circuit breaker closed");
    }

    fn calculate_error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.failed_requests as f64) / (self.total_requests as f64)
    }

    fn get_metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            name: self.config.name.clone(),
            state: self.state,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            rejected_requests: self.rejected_requests,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            trip_count: self.trip_count,
            error_rate: self.calculate_error_rate(),
            time_in_state: self.state_since.elapsed(),
        }
    }
}

/// Circuit breaker for fault tolerance
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with given configuration
    ///
    /// ## Examples
    /// ```rust
    /// # use plexspaces_circuit_breaker::*;
    /// let circuit = CircuitBreaker::new(CircuitBreakerConfig {
    ///     name: "test".to_string(),
    ///     max_failures: 5,
    ///     ..Default::default()
    /// });
    /// ```
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let config = Arc::new(config);
        Self {
            state: Arc::new(RwLock::new(CircuitBreakerState::new(config.clone()))),
            config,
        }
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker
    ///
    /// ## Semantics
    /// - Open: returns [`CallError::Rejected`] without polling `operation`
    /// - Closed/Half-Open: polls `operation` for at most `call_timeout`
    /// - `Err` results and timeouts count as failures, `Ok` as success
    ///
    /// ## Examples
    /// ```rust
    /// # use plexspaces_circuit_breaker::*;
    /// # async fn example(circuit: &CircuitBreaker) {
    /// let result = circuit.call(async { Ok::<u32, String>(7) }).await;
    /// assert!(matches!(result, Ok(7)));
    /// # }
    /// ```
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_request_allowed().await {
            return Err(CallError::Rejected(CircuitBreakerError::CircuitOpen(
                self.config.name.clone(),
            )));
        }

        match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure().await;
                Err(CallError::Failed(e))
            }
            Err(_) => {
                self.record_failure().await;
                Err(CallError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Check if request should be allowed
    ///
    /// ## Returns
    /// `true` if request should be allowed, `false` if circuit is open
    pub async fn is_request_allowed(&self) -> bool {
        let mut state = self.state.write().await;
        let allowed = state.is_request_allowed();

        if !allowed {
            state.rejected_requests += 1;
            metrics::counter!("plexspaces_circuit_breaker_rejected_total", "name" => self.config.name.clone())
                .increment(1);
        }

        allowed
    }

    /// Record successful request
    pub async fn record_success(&self) {
        self.state.write().await.record_success();
    }

    /// Record failed request
    pub async fn record_failure(&self) {
        self.state.write().await.record_failure();
    }

    /// Get current state
    pub async fn get_state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Get circuit breaker metrics
    ///
    /// ## Examples
    /// ```rust
    /// # use plexspaces_circuit_breaker::*;
    /// # async fn example(circuit: &CircuitBreaker) {
    /// let metrics = circuit.get_metrics().await;
    /// println!("State: {:?}", metrics.state);
    /// println!("Error rate: {:.2}%", metrics.error_rate * 100.0);
    /// # }
    /// ```
    pub async fn get_metrics(&self) -> CircuitBreakerMetrics {
        self.state.read().await.get_metrics()
    }

    /// Manually trip the circuit (for testing/maintenance)
    pub async fn trip(&self) {
        self.state.write().await.transition_to_open();
    }

    /// Manually reset the circuit
    pub async fn reset(&self) {
        self.state.write().await.transition_to_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: "test-circuit".to_string(),
            max_failures: 3,
            call_timeout: Duration::from_millis(200),
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            max_half_open_requests: 1,
        }
    }

    #[tokio::test]
    async fn test_create_circuit_breaker() {
        let circuit = CircuitBreaker::new(create_test_config());
        assert_eq!(circuit.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_consecutive_failures_trip() {
        let circuit = CircuitBreaker::new(create_test_config());

        // Record 2 failures - should stay closed
        circuit.record_failure().await;
        circuit.record_failure().await;
        assert_eq!(circuit.get_state().await, CircuitState::Closed);

        // 3rd failure - should trip to open
        circuit.record_failure().await;
        assert_eq!(circuit.get_state().await, CircuitState::Open);

        // Requests should be rejected
        assert!(!circuit.is_request_allowed().await);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let circuit = CircuitBreaker::new(create_test_config());

        circuit.record_failure().await;
        circuit.record_failure().await;
        circuit.record_success().await;

        // Should need 3 more failures to trip
        circuit.record_failure().await;
        circuit.record_failure().await;
        assert_eq!(circuit.get_state().await, CircuitState::Closed);

        circuit.record_failure().await;
        assert_eq!(circuit.get_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_run_call() {
        let circuit = CircuitBreaker::new(create_test_config());
        circuit.trip().await;

        let mut ran = false;
        let result = circuit
            .call(async {
                ran = true;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Rejected(CircuitBreakerError::CircuitOpen(_)))));
        assert!(!ran);
        assert_eq!(circuit.get_metrics().await.rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let mut config = create_test_config();
        config.max_failures = 1;
        let circuit = CircuitBreaker::new(config);

        let result = circuit
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Timeout(_))));
        assert_eq!(circuit.get_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failed_call_is_reported() {
        let circuit = CircuitBreaker::new(create_test_config());
        let result = circuit.call(async { Err::<(), _>("boom".to_string()) }).await;

        match result {
            Err(CallError::Failed(e)) => assert_eq!(e, "boom"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(circuit.get_metrics().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_half_open_allows_single_trial_after_reset_timeout() {
        let mut config = create_test_config();
        config.reset_timeout = Duration::from_millis(20);
        let circuit = CircuitBreaker::new(config);

        circuit.trip().await;
        assert!(!circuit.is_request_allowed().await);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // First request after reset_timeout is the trial, the second is refused
        assert!(circuit.is_request_allowed().await);
        assert_eq!(circuit.get_state().await, CircuitState::HalfOpen);
        assert!(!circuit.is_request_allowed().await);

        circuit.record_success().await;
        assert_eq!(circuit.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let circuit = CircuitBreaker::new(create_test_config());

        circuit.trip().await;
        circuit.state.write().await.transition_to_half_open();
        assert_eq!(circuit.get_state().await, CircuitState::HalfOpen);

        circuit.record_failure().await;
        assert_eq!(circuit.get_state().await, CircuitState::Open);
        assert_eq!(circuit.get_metrics().await.trip_count, 2);
    }

    #[tokio::test]
    async fn test_manual_trip_and_reset() {
        let circuit = CircuitBreaker::new(create_test_config());

        circuit.trip().await;
        assert_eq!(circuit.get_state().await, CircuitState::Open);

        circuit.reset().await;
        assert_eq!(circuit.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_metrics() {
        let circuit = CircuitBreaker::new(create_test_config());

        circuit.record_success().await;
        circuit.record_success().await;
        circuit.record_failure().await;

        let metrics = circuit.get_metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.consecutive_failures, 1);

        // Error rate should be 1/3 ≈ 0.33
        assert!((metrics.error_rate - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let mut config = create_test_config();
        config.max_failures = 0;
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.call_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        assert!(create_test_config().validate().is_ok());
    }
}
