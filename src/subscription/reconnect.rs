//! Reconnection strategy: a factory producing per-connection handlers
//! that decide whether/when to reconnect after a close.
//!
//! A builder-style config struct plus an executor holding mutable
//! attempt state, generalized from HTTP-retry semantics (retry this
//! request) to connection-reconnect semantics (reconnect this socket),
//! with delay computed as the closed form
//! `delay(n) = min(max, initial * multiplier^(n-1))`.

use crate::error::{CoreError, Result};
use crate::subscription::CloseReason;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// What a [`ReconnectionHandler`] decides to do after a reconnectable
/// close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Give up; the caller should surface a terminal error.
    GiveUp,
    /// Reconnect immediately.
    Immediate,
    /// Wait this long, then reconnect.
    After(std::time::Duration),
}

/// A per-connection instance produced by a [`ReconnectionStrategy`].
pub trait ReconnectionHandler: Send + Sync {
    fn on_reconnection_attempt(&self, reason: CloseReason) -> ReconnectDecision;
    fn on_connected(&self);
    fn on_close(&self);
}

/// Factory for [`ReconnectionHandler`]s.
pub trait ReconnectionStrategy: Send + Sync {
    fn create_handler(&self) -> Arc<dyn ReconnectionHandler>;
}

/// Exponential backoff with optional jitter.
///
/// `delay(n) = min(max_ms, initial_ms * multiplier^(n-1))`, `n` 1-indexed.
/// With jitter enabled the delay is scaled by a uniform factor in
/// `[0.75, 1.25]`, clamped to `>= 0`, before rounding to whole
/// milliseconds.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    max_attempts: u32,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Validated at construction: bad parameters fail immediately
    /// rather than surfacing once the first reconnect attempt happens.
    pub fn new(
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
        max_attempts: u32,
        jitter: bool,
    ) -> Result<Arc<ExponentialBackoff>> {
        if max_ms < initial_ms {
            return Err(CoreError::InvalidConfiguration(
                "max_ms must be >= initial_ms".to_string(),
            ));
        }
        if multiplier <= 1.0 {
            return Err(CoreError::InvalidConfiguration(
                "multiplier must be > 1".to_string(),
            ));
        }
        Ok(Arc::new(ExponentialBackoff {
            initial_ms,
            max_ms,
            multiplier,
            max_attempts,
            jitter,
        }))
    }

    /// Delay for 1-indexed attempt `n`, before jitter.
    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let raw = self.initial_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        raw.min(self.max_ms as f64)
    }

    fn delay_for(&self, attempt: u32) -> u64 {
        let base = self.base_delay_ms(attempt);
        let scaled = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            (base * factor).max(0.0)
        } else {
            base
        };
        scaled.round() as u64
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn create_handler(&self) -> Arc<dyn ReconnectionHandler> {
        Arc::new(ExponentialBackoffHandler {
            strategy: self.clone(),
            attempt_count: AtomicU32::new(0),
        })
    }
}

struct ExponentialBackoffHandler {
    strategy: ExponentialBackoff,
    attempt_count: AtomicU32,
}

impl ReconnectionHandler for ExponentialBackoffHandler {
    fn on_reconnection_attempt(&self, reason: CloseReason) -> ReconnectDecision {
        if !reason.is_reconnectable() {
            return ReconnectDecision::GiveUp;
        }

        let attempt = self.attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.strategy.max_attempts != 0 && attempt > self.strategy.max_attempts {
            return ReconnectDecision::GiveUp;
        }

        let delay_ms = self.strategy.delay_for(attempt);
        if delay_ms == 0 {
            ReconnectDecision::Immediate
        } else {
            ReconnectDecision::After(std::time::Duration::from_millis(delay_ms))
        }
    }

    fn on_connected(&self) {
        self.attempt_count.store(0, Ordering::SeqCst);
    }

    fn on_close(&self) {
        self.attempt_count.store(0, Ordering::SeqCst);
    }
}
