// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A three-state circuit breaker shared across send attempts to one target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Returned by [`CircuitBreaker::check`] while the circuit refuses calls.
#[derive(Debug, Clone, Copy, Error)]
#[error("circuit open")]
pub struct CircuitOpen;

/// Breaker tuning. The open timeout doubles on every failed half-open probe
/// up to `max_open_timeout`.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_probes: u32,
    pub max_open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_probes: 1,
            max_open_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_timeout: Duration,
    probes_in_flight: u32,
}

/// The per-target failure detector.
///
/// Callers invoke [`check`](CircuitBreaker::check) before every network
/// attempt and report the outcome with
/// [`record_success`](CircuitBreaker::record_success) /
/// [`record_failure`](CircuitBreaker::record_failure). While open, `check`
/// fails immediately; after the open timeout it admits a bounded number of
/// probes.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    opens: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> CircuitBreaker {
        let current_timeout = config.open_timeout;
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                current_timeout,
                probes_in_flight: 0,
            }),
            opens: AtomicU64::new(0),
        }
    }

    /// Admits or refuses a call. Transitions `Open → HalfOpen` when the
    /// open timeout has elapsed.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.expect("open state has a start time");
                if opened_at.elapsed() >= inner.current_timeout {
                    info!("circuit half-open; admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_probes {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
        }
    }

    /// Reports a successful call: closes the circuit and resets the open
    /// timeout to its base value.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != CircuitState::Closed {
            info!("circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probes_in_flight = 0;
        inner.opened_at = None;
        inner.current_timeout = self.config.open_timeout;
    }

    /// Reports a failed call. In `Closed`, opens once the consecutive
    /// failure count reaches the threshold; in `HalfOpen`, reopens with a
    /// doubled timeout.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.current_timeout =
                    (inner.current_timeout * 2).min(self.config.max_open_timeout);
                warn!(
                    timeout_secs = inner.current_timeout.as_secs(),
                    "probe failed; circuit reopened with doubled timeout"
                );
                self.open(&mut inner);
            }
            // Failures reported while already open (racing callers) change
            // nothing.
            CircuitState::Open => {}
        }
    }

    /// Opens the circuit immediately, bypassing the failure count. Used for
    /// failures that no amount of retrying will fix, such as rejected
    /// client credentials.
    pub fn trip(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != CircuitState::Open {
            warn!("circuit tripped open");
            self.open(&mut inner);
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_in_flight = 0;
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// How many times the circuit has opened over its lifetime.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_millis(open_ms),
            half_open_probes: 1,
            max_open_timeout: Duration::from_millis(open_ms * 8),
        })
    }

    #[test]
    fn five_consecutive_failures_open_the_circuit() {
        let breaker = breaker(50);
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opens(), 1);

        // While open, calls are refused without touching the network.
        assert!(breaker.check().is_err());
    }

    #[test]
    fn success_resets_the_consecutive_count() {
        let breaker = breaker(50);
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_admits_one_probe_after_the_timeout() {
        let breaker = breaker(20);
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(30));
        // First caller becomes the probe; the next one is still refused.
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn failed_probe_doubles_the_open_timeout_up_to_the_cap() {
        let breaker = breaker(20);
        for _ in 0..5 {
            breaker.record_failure();
        }
        // Fail probes repeatedly; the timeout doubles each round.
        let mut expected = 20u64;
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(expected + 15));
            assert!(breaker.check().is_ok(), "probe admitted");
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Open);
            expected = (expected * 2).min(160);
        }
        // At the cap the timeout stops growing.
        assert_eq!(
            breaker.inner.lock().unwrap().current_timeout,
            Duration::from_millis(160)
        );
    }
}
