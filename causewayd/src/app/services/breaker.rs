// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before the circuit closes again.
    pub success_threshold: u32,
    /// How long to stay OPEN before letting a probe call through.
    pub recovery_timeout: Duration,
    /// Overall deadline for every guarded call; exceeding it counts as a
    /// failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Failure isolation for a flaky remote dependency.
///
/// CLOSED passes calls through and counts consecutive failures; OPEN fails
/// fast with a `circuit_open` error until the recovery timeout elapses;
/// HALF_OPEN lets calls through and closes after enough consecutive
/// successes, reopening on any failure.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Runs `fut` under the breaker and the call timeout.
    pub async fn call<T, F>(&self, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        self.check_gate().await?;

        let result = match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::with_message(
                AppErrorKind::Aborted,
                codes::TIMEOUT,
                format!(
                    "{} call exceeded {}s",
                    self.name,
                    self.config.call_timeout.as_secs()
                ),
            )),
        };

        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    /// True while calls would fail fast. Lets callers show a degraded-mode
    /// indicator instead of an error.
    pub async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, State::Open { .. })
    }

    async fn check_gate(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let State::Open { since } = *state {
            if since.elapsed() < self.config.recovery_timeout {
                return Err(AppError::with_message(
                    AppErrorKind::Unavailable,
                    codes::CIRCUIT_OPEN,
                    format!("{} circuit is open", self.name),
                ));
            }
            tracing::info!("{} circuit half-open, probing", self.name);
            *state = State::HalfOpen { successes: 0 };
        }
        Ok(())
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        match *state {
            State::Closed { .. } => *state = State::Closed { failures: 0 },
            State::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    tracing::info!("{} circuit closed", self.name);
                    *state = State::Closed { failures: 0 };
                } else {
                    *state = State::HalfOpen { successes };
                }
            }
            State::Open { .. } => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        "{} circuit opened after {failures} consecutive failures",
                        self.name
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen { .. } => {
                tracing::warn!("{} circuit reopened by half-open failure", self.name);
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }
}
