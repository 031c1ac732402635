//! One-second countdown loop for a loaded runtime.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{ExamRuntime, TickOutcome};

/// Why [`run_countdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownExit {
    /// Time ran out; auto-submit has been spawned.
    Expired,
    /// The runtime stopped ticking (submitted, left, or never loaded).
    Stopped,
    /// The shutdown signal fired or its sender was dropped.
    Shutdown,
}

/// Tick `runtime` every `tick` until it expires, stops, or shutdown.
///
/// Missed ticks are delayed rather than bursted, so a stalled executor
/// never drains several seconds at once.
pub async fn run_countdown(
    runtime: ExamRuntime,
    tick: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> CountdownExit {
    let session_id = runtime.session_id().to_owned();
    let tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);
    debug!(session_id = %session_id, tick_ms, "countdown started");

    let mut interval = tokio::time::interval(tick.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    interval.tick().await;

    let exit = loop {
        tokio::select! {
            _ = interval.tick() => {
                match runtime.tick() {
                    TickOutcome::Expired => break CountdownExit::Expired,
                    TickOutcome::Idle => break CountdownExit::Stopped,
                    TickOutcome::Counted(_) | TickOutcome::Persist(_) => {}
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break CountdownExit::Shutdown;
                }
            }
        }
    };

    info!(session_id = %session_id, ?exit, remaining = runtime.time_remaining(), "countdown stopped");
    exit
}
