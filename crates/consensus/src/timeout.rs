//! The timeout ticker.
//!
//! A single-slot timer: scheduling a new timeout supersedes any pending one,
//! so only the most recently scheduled tock is ever delivered. Tocks carry
//! `(height, round, step)` and the driver drops any that are stale by the
//! time they arrive.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::round_state::Step;

/// A scheduled (or fired) timeout for one `(height, round, step)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    /// How long the timer ran
    pub duration_ms: u64,
    /// Height the timeout was armed at
    pub height: u64,
    /// Round the timeout was armed at
    pub round: i32,
    /// Step the timeout was armed for
    pub step: Step,
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ms ; {}/{} {}",
            self.duration_ms, self.height, self.round, self.step
        )
    }
}

/// Handle for scheduling timeouts on the ticker task.
#[derive(Debug, Clone)]
pub struct TimeoutTicker {
    schedule_tx: mpsc::UnboundedSender<TimeoutInfo>,
}

impl TimeoutTicker {
    /// Spawn the ticker task. Fired tocks arrive on the returned receiver.
    pub fn spawn() -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (tock_tx, tock_rx) = mpsc::channel(16);
        tokio::spawn(run_ticker(schedule_rx, tock_tx));
        (Self { schedule_tx }, tock_rx)
    }

    /// Arm the timer. Any pending timeout is superseded.
    pub fn schedule(&self, info: TimeoutInfo) {
        trace!(timeout = %info, "scheduling timeout");
        // The ticker task only dies when the driver drops the tock receiver.
        let _ = self.schedule_tx.send(info);
    }
}

async fn run_ticker(
    mut schedule_rx: mpsc::UnboundedReceiver<TimeoutInfo>,
    tock_tx: mpsc::Sender<TimeoutInfo>,
) {
    let mut pending: Option<(TimeoutInfo, Instant)> = None;

    loop {
        match pending.take() {
            None => match schedule_rx.recv().await {
                Some(info) => {
                    let deadline = Instant::now() + Duration::from_millis(info.duration_ms);
                    pending = Some((info, deadline));
                }
                None => return,
            },
            Some((info, deadline)) => {
                tokio::select! {
                    maybe_new = schedule_rx.recv() => match maybe_new {
                        Some(new_info) => {
                            debug!(old = %info, new = %new_info, "superseding pending timeout");
                            let deadline =
                                Instant::now() + Duration::from_millis(new_info.duration_ms);
                            pending = Some((new_info, deadline));
                        }
                        None => return,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!(timeout = %info, "timeout fired");
                        if tock_tx.send(info).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tock_carries_schedule_info() {
        let (ticker, mut tock_rx) = TimeoutTicker::spawn();
        ticker.schedule(TimeoutInfo {
            duration_ms: 10,
            height: 5,
            round: 2,
            step: Step::Propose,
        });

        let tock = tock_rx.recv().await.unwrap();
        assert_eq!(tock.height, 5);
        assert_eq!(tock.round, 2);
        assert_eq!(tock.step, Step::Propose);
    }

    #[tokio::test]
    async fn test_newer_schedule_supersedes_pending() {
        let (ticker, mut tock_rx) = TimeoutTicker::spawn();
        ticker.schedule(TimeoutInfo {
            duration_ms: 5_000,
            height: 1,
            round: 0,
            step: Step::Propose,
        });
        // Give the ticker a moment to arm the first timer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        ticker.schedule(TimeoutInfo {
            duration_ms: 10,
            height: 1,
            round: 1,
            step: Step::PrevoteWait,
        });

        let tock = tock_rx.recv().await.unwrap();
        assert_eq!(tock.round, 1);
        assert_eq!(tock.step, Step::PrevoteWait);

        // The superseded 5s timer must never fire.
        let extra =
            tokio::time::timeout(Duration::from_millis(100), tock_rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_sequential_timeouts_fire_in_order() {
        let (ticker, mut tock_rx) = TimeoutTicker::spawn();

        ticker.schedule(TimeoutInfo {
            duration_ms: 10,
            height: 1,
            round: 0,
            step: Step::Propose,
        });
        let first = tock_rx.recv().await.unwrap();
        assert_eq!(first.step, Step::Propose);

        ticker.schedule(TimeoutInfo {
            duration_ms: 10,
            height: 1,
            round: 0,
            step: Step::PrevoteWait,
        });
        let second = tock_rx.recv().await.unwrap();
        assert_eq!(second.step, Step::PrevoteWait);
    }
}
