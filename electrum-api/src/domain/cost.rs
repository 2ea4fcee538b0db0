// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! The session cost model: a continuously decaying per-session cost drives a
//! concurrency target between the soft and hard limits, an optional
//! per-request throttle sleep, and eventual disconnection.

use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A session's accumulated cost with exponential-style linear decay applied
/// lazily whenever the cost is read or bumped.
#[derive(Debug, Clone)]
pub struct CostTracker {
    cost: f64,
    last_decay: Instant,
}

impl CostTracker {
    pub fn new(initial_cost: f64) -> Self {
        Self {
            cost: initial_cost,
            last_decay: Instant::now(),
        }
    }

    /// Apply decay at the given rate and return the current cost.
    pub fn decay(&mut self, decay_per_sec: f64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_decay).as_secs_f64();
        self.last_decay = now;
        self.cost = (self.cost - elapsed * decay_per_sec).max(0.0);
        self.cost
    }

    pub fn bump(&mut self, delta: f64) {
        self.cost += delta;
    }

    /// The cost as of the last decay.
    pub fn get(&self) -> f64 {
        self.cost
    }
}

/// The concurrency target for a session cost: the initial concurrency below
/// the soft limit, a linear ramp down to one approaching the hard limit, and
/// `None` at or above the hard limit, meaning the session is to be
/// disconnected.
pub fn concurrency_target(cost: f64, soft_limit: f64, hard_limit: f64, initial: u32) -> Option<u32> {
    if cost < soft_limit {
        return Some(initial);
    }
    if cost >= hard_limit {
        return None;
    }

    let fraction = (hard_limit - cost) / (hard_limit - soft_limit);
    let target = (f64::from(initial) * fraction).round() as u32;
    Some(target.max(1))
}

/// The per-request throttle sleep, scaling from zero at the soft limit to the
/// full configured sleep at the hard limit.
pub fn throttle_sleep(
    cost: f64,
    soft_limit: f64,
    hard_limit: f64,
    cost_sleep: Duration,
) -> Duration {
    if cost <= soft_limit {
        return Duration::ZERO;
    }

    let fraction = ((cost - soft_limit) / (hard_limit - soft_limit)).min(1.0);
    cost_sleep.mul_f64(fraction)
}

/// An adjustable concurrency gate. Requests acquire a permit before being
/// handled; lowering the target takes effect as in-flight requests complete.
#[derive(Debug, Clone)]
pub struct Concurrency {
    inner: std::sync::Arc<ConcurrencyInner>,
}

#[derive(Debug)]
struct ConcurrencyInner {
    state: parking_lot::Mutex<ConcurrencyState>,
    notify: Notify,
}

#[derive(Debug)]
struct ConcurrencyState {
    target: u32,
    in_flight: u32,
}

impl Concurrency {
    pub fn new(target: u32) -> Self {
        Self {
            inner: std::sync::Arc::new(ConcurrencyInner {
                state: parking_lot::Mutex::new(ConcurrencyState {
                    target,
                    in_flight: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn target(&self) -> u32 {
        self.inner.state.lock().target
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.state.lock().in_flight
    }

    pub fn set_target(&self, target: u32) {
        self.inner.state.lock().target = target;
        self.inner.notify.notify_waiters();
    }

    pub async fn acquire(&self) -> ConcurrencyPermit {
        loop {
            let notified = self.inner.notify.notified();

            {
                let mut state = self.inner.state.lock();
                if state.in_flight < state.target {
                    state.in_flight += 1;
                    return ConcurrencyPermit {
                        inner: self.inner.clone(),
                    };
                }
            }

            notified.await;
        }
    }
}

/// An owned permit, released on drop.
pub struct ConcurrencyPermit {
    inner: std::sync::Arc<ConcurrencyInner>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.inner.state.lock().in_flight -= 1;
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_target_below_soft() {
        assert_eq!(concurrency_target(0.0, 1000.0, 10000.0, 10), Some(10));
        assert_eq!(concurrency_target(999.9, 1000.0, 10000.0, 10), Some(10));
    }

    #[test]
    fn test_concurrency_target_ramps_to_one() {
        let target = |cost| concurrency_target(cost, 1000.0, 10000.0, 10);

        // Monotone non-increasing between the limits, one just below hard.
        let mut previous = target(1000.0).unwrap();
        for cost in (1000..10000).step_by(100) {
            let current = target(cost as f64).unwrap();
            assert!(current <= previous);
            assert!(current >= 1);
            previous = current;
        }
        assert_eq!(target(9999.0), Some(1));
    }

    #[test]
    fn test_concurrency_target_hard_limit_disconnects() {
        assert_eq!(concurrency_target(10000.0, 1000.0, 10000.0, 10), None);
        assert_eq!(concurrency_target(20000.0, 1000.0, 10000.0, 10), None);
    }

    #[test]
    fn test_throttle_sleep() {
        let sleep = Duration::from_millis(100);
        assert_eq!(throttle_sleep(500.0, 1000.0, 10000.0, sleep), Duration::ZERO);
        assert_eq!(
            throttle_sleep(5500.0, 1000.0, 10000.0, sleep),
            Duration::from_millis(50)
        );
        assert_eq!(throttle_sleep(20000.0, 1000.0, 10000.0, sleep), sleep);
    }

    #[test]
    fn test_cost_tracker_decays_toward_zero() {
        let mut tracker = CostTracker::new(10.0);
        tracker.bump(5.0);
        assert_eq!(tracker.get(), 15.0);

        // A huge decay rate empties the tracker but never goes negative.
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tracker.decay(1_000_000.0), 0.0);
    }

    #[tokio::test]
    async fn test_concurrency_gate() {
        let gate = Concurrency::new(2);

        let first = gate.acquire().await;
        let _second = gate.acquire().await;

        // The gate is full now.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), gate.acquire())
                .await
                .is_err()
        );

        drop(first);
        let _third = gate.acquire().await;
    }

    #[tokio::test]
    async fn test_concurrency_gate_raised_target_wakes_waiters() {
        let gate = Concurrency::new(0);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
            })
        };

        gate.set_target(1);
        waiter.await.unwrap();
    }
}
