//! Retry policies for lock acquisition
//!
//! A strategy is consulted after every failed acquisition attempt. It either
//! returns the interval to wait before the next attempt or `None` once the
//! attempt budget is spent. Strategies are plain counters with no clock, so
//! the same sequence of calls always produces the same intervals.

use std::time::Duration;

/// Backoff policy consulted by [`LockClient::acquire`](crate::LockClient::acquire).
pub trait RetryStrategy {
    /// Interval to wait before the next attempt, or `None` when exhausted.
    fn next(&mut self) -> Option<Duration>;
}

impl<R: RetryStrategy + ?Sized> RetryStrategy for Box<R> {
    fn next(&mut self) -> Option<Duration> {
        (**self).next()
    }
}

/// Retry at a constant interval.
#[derive(Debug, Clone)]
pub struct FixedIntervalRetry {
    interval: Duration,
    /// Total store attempts allowed, including the first
    max_attempts: u32,
    attempts: u32,
}

impl FixedIntervalRetry {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
        }
    }
}

impl RetryStrategy for FixedIntervalRetry {
    fn next(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < self.max_attempts {
            Some(self.interval)
        } else {
            None
        }
    }
}

/// Exponential backoff, capped at `max_interval`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    initial: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ExponentialBackoffRetry {
    pub fn new(initial: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max_interval,
            max_attempts,
            attempts: 0,
        }
    }

    /// Growth factor between consecutive intervals. Values below 1.0 are
    /// clamped to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    fn interval_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let nanos = self.initial.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_interval.as_nanos() as f64 {
            self.max_interval
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }
}

impl RetryStrategy for ExponentialBackoffRetry {
    fn next(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < self.max_attempts {
            Some(self.interval_for(self.attempts - 1))
        } else {
            None
        }
    }
}

/// Single attempt, never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next(&mut self) -> Option<Duration> {
        None
    }
}
