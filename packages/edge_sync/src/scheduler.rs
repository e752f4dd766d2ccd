//! Timing policy for reconnects, identity rotation and the stale-connection
//! check.
//!
//! The loops here only decide *when* something happens; what happens is a
//! closure supplied by the client, which keeps every replacement of the
//! current connection behind the client's slot lock.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{HealthCheckConfig, ReconnectConfig};
use crate::error::SyncError;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: config.delay,
            max: config.max_delay,
        }
    }

    /// `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(1 << attempt.min(6))
            .min(self.max)
    }
}

/// Bounds for the proactive rotation timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationWindow {
    pub min: Duration,
    pub max: Duration,
}

impl RotationWindow {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            min: config.rotation_min,
            max: config.rotation_max.max(config.rotation_min),
        }
    }

    /// Uniform draw from `[min, max]` at millisecond resolution.
    pub fn draw(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = (self.max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub fn contains(&self, delay: Duration) -> bool {
        delay >= self.min && delay <= self.max
    }
}

/// Keep calling `attempt` with growing delays until it succeeds, fails with a
/// non-retryable error, or `cancel` fires.
///
/// Returns the error that ended the loop, `None` on success or cancellation.
pub async fn retry_with_backoff<F, Fut>(
    backoff: Backoff,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Option<SyncError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), SyncError>>,
{
    let mut n: u32 = 0;
    loop {
        let delay = backoff.delay(n);
        info!(attempt = n + 1, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        if cancel.is_cancelled() {
            return None;
        }

        match attempt(n).await {
            Ok(()) => return None,
            Err(e) if e.is_retryable() => {
                warn!(attempt = n + 1, error = %e, "Reconnect attempt failed");
                n = n.saturating_add(1);
            }
            Err(e) => return Some(e),
        }
    }
}

/// Self-rescheduling rotation timer: draw, sleep, rotate, repeat.
///
/// `rotate` receives the delay that elapsed before it fired. An all-zero
/// window disables rotation instead of spinning.
pub async fn run_rotation<F, Fut>(window: RotationWindow, cancel: CancellationToken, mut rotate: F)
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = ()>,
{
    if window.max.is_zero() {
        warn!("Rotation window is empty, identity rotation disabled");
        return;
    }
    loop {
        let delay = window.draw();
        info!(
            minutes = delay.as_secs() / 60,
            "Next identity rotation scheduled"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        rotate(delay).await;
    }
}

/// Periodically look for a connection that has gone silent.
///
/// `idle` reports how long the current connection has been quiet, or `None`
/// when there is no live connection to judge.
pub async fn run_health_check<I, F, Fut>(
    config: HealthCheckConfig,
    cancel: CancellationToken,
    idle: I,
    mut on_stale: F,
) where
    I: Fn() -> Option<Duration>,
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = ()>,
{
    let start = tokio::time::Instant::now() + config.interval;
    let mut ticker = tokio::time::interval_at(start, config.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(quiet) = idle() {
            if quiet >= config.stale_after {
                warn!(
                    idle_secs = quiet.as_secs(),
                    "No traffic from edge, forcing reconnect"
                );
                on_stale(quiet).await;
            }
        }
    }
}
