//! Interval scheduler for the aggregation job.
//!
//! Drives [`RollupRunner`](crate::rollup::RollupRunner) on a fixed tick and
//! stops cleanly when the shutdown signal flips. The day gate and the
//! single-flight guard live in the runner, so the scheduler stays a dumb
//! timer: it fires, the runner decides.

use crate::notion::Workspace;
use crate::rollup::{JobOutcome, RollupRunner};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Periodically invokes the rollup runner until shutdown.
pub struct Scheduler<W> {
    runner: Arc<RollupRunner<W>>,
    interval: std::time::Duration,
    shutdown: watch::Receiver<bool>,
}

impl<W: Workspace> Scheduler<W> {
    /// Creates a scheduler firing every `interval`.
    ///
    /// The `shutdown` receiver ends the loop when its value becomes `true`.
    pub fn new(
        runner: Arc<RollupRunner<W>>,
        interval: std::time::Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runner,
            interval,
            shutdown,
        }
    }

    /// Runs the tick loop until shutdown is signaled.
    ///
    /// A tick that lands while a previous run is still executing is delayed
    /// rather than bursted. A failed run is logged by the runner and the
    /// loop carries on; the next tick starts fresh.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it
        // so startup does not trigger a run.
        ticker.tick().await;

        tracing::info!(interval_secs = self.interval.as_secs(), "rollup scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.runner.run(chrono::Utc::now()).await;
                    if let JobOutcome::Failed { attempts, error } = outcome {
                        tracing::error!(attempts, error = %error, "scheduled rollup failed");
                    }
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::info!("rollup scheduler stopping");
                        return;
                    }
                },
            }
        }
    }
}
