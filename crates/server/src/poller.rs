//! Outbox polling loop.
//!
//! A single task leases and processes outbox batches on a fixed
//! interval. Cycle errors are logged and the loop keeps polling; the
//! events themselves carry the retry state, so a crashed cycle loses
//! nothing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use skipper_agent::{AutopilotRunner, ExecuteOptions};

pub fn spawn(autopilot: Arc<AutopilotRunner>, batch_size: u32, poll_interval_secs: u64) {
    let interval = Duration::from_secs(poll_interval_secs.max(1));

    info!(
        event_name = "system.poller.start",
        batch_size,
        poll_interval_secs = interval.as_secs(),
        "outbox poller started"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match autopilot.execute(ExecuteOptions::batch(batch_size)).await {
                Ok(report) => {
                    if report.leased > 0 {
                        info!(
                            event_name = "system.poller.cycle",
                            leased = report.leased,
                            processed = report.processed,
                            deduplicated = report.deduplicated,
                            failed = report.failed,
                            dead_lettered = report.dead_lettered,
                            "outbox cycle completed"
                        );
                    }
                }
                Err(error) => {
                    warn!(
                        event_name = "system.poller.cycle_failed",
                        error = %error,
                        "outbox cycle failed, will retry on next tick"
                    );
                }
            }
        }
    });
}
