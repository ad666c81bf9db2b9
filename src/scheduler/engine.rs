use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;

/// Main scheduler execution loop.
///
/// Sleeps until the next cron fire, then recomputes the closed days due at
/// that time. Runs never overlap: the next fire is computed after the
/// previous recompute returns.
pub async fn run_scheduler_loop(scheduler: Scheduler, pipeline: Pipeline) {
    info!("Scheduler engine started");

    loop {
        let now = Utc::now();
        let Some(at) = scheduler.next_fire(now) else {
            warn!("cron schedule has no future fire times, scheduler stopping");
            return;
        };
        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %at.to_rfc3339(), "Next scheduled recompute");
        tokio::time::sleep(wait).await;

        let range = scheduler.due_range(at);
        match pipeline.recompute(range).await {
            Ok(summary) if summary.is_success() => {
                info!(run_id = %summary.run_id, start = %range.start, end = %range.end, "Scheduled recompute complete");
            }
            Ok(summary) => {
                let failed = summary.first_failure().map(|b| b.bucket.to_string());
                warn!(
                    run_id = %summary.run_id,
                    failed_bucket = ?failed,
                    "Scheduled recompute halted on a failed bucket"
                );
            }
            Err(e) => {
                error!("Scheduled recompute failed: {:#}", e);
            }
        }
    }
}
