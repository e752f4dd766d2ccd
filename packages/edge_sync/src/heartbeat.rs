//! Best-effort presence broadcast.
//!
//! Presence doubles as a liveness signal: a run of failed publishes means the
//! connection is no longer usable and the caller is asked to replace it.

use std::future::Future;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SyncError;

/// Consecutive "not connected" beats, after the first successful one, that
/// trigger a reconnect.
pub const MAX_MISSED_BEATS: u32 = 5;

/// Consecutive publish errors that trigger a reconnect.
pub const MAX_FAILED_BEATS: u32 = 10;

/// Result of one presence attempt.
#[derive(Debug)]
pub enum Beat {
    Sent,
    /// No live connection to publish on.
    NotConnected,
    Failed(SyncError),
}

pub fn presence_payload(now_ms: i64) -> Value {
    json!({
        "p": {
            "make_user_available_at_ms": now_ms,
            "last_active_at_ms": now_ms,
        }
    })
}

/// Call `publish` every `interval` until cancelled.
///
/// A single failure is only logged. [`MAX_MISSED_BEATS`] beats without a
/// connection (counted once a beat has gone out) or [`MAX_FAILED_BEATS`]
/// publish errors in a row call `reconnect`, after which counting restarts.
pub async fn run_heartbeat<F, Fut, R, RFut>(
    interval: Duration,
    cancel: CancellationToken,
    mut publish: F,
    mut reconnect: R,
) where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = Beat>,
    R: FnMut(u32) -> RFut,
    RFut: Future<Output = ()>,
{
    if interval.is_zero() {
        warn!("Presence interval is zero, heartbeat disabled");
        return;
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent_any = false;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let payload = presence_payload(chrono::Utc::now().timestamp_millis());
        let limit = match publish(payload).await {
            Beat::Sent => {
                sent_any = true;
                failures = 0;
                continue;
            }
            Beat::NotConnected if !sent_any => continue,
            Beat::NotConnected => {
                failures += 1;
                debug!(failures, "Presence skipped, not connected");
                MAX_MISSED_BEATS
            }
            Beat::Failed(e) => {
                failures += 1;
                debug!(failures, error = %e, "Presence publish failed");
                MAX_FAILED_BEATS
            }
        };

        if failures >= limit {
            warn!(failures, "Presence keeps failing, forcing reconnect");
            let n = std::mem::take(&mut failures);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reconnect(n) => {}
            }
        }
    }
}
