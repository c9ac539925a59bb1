//! Timer sweeper
//!
//! Re-enqueues suspended executions whose timers are due. Claiming is a
//! compare-and-set on the timer row, so concurrent sweepers never double
//! enqueue; a failed enqueue pushes the timer out and retries.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{ExecutionOrchestrator, ResumeRequest};

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Timers claimed per sweep.
const SWEEP_BATCH: usize = 32;

/// Floor for the enqueue-failure retry push-out.
const MIN_TIMER_RETRY: Duration = Duration::from_secs(5);

impl ExecutionOrchestrator {
    pub(crate) async fn timer_sweeper_loop(&self) {
        let mut shutdown = self.subscribe_shutdown();
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_timers_once().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One sweep: claim due timers and enqueue their resume jobs. Returns
    /// how many timers were handled.
    pub async fn sweep_timers_once(&self) -> usize {
        let now = Utc::now();
        let due = match self
            .run_manager
            .store()
            .claim_due_timers(now, SWEEP_BATCH)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "timer claim failed");
                return 0;
            }
        };

        let count = due.len();
        for timer in due {
            let request = ResumeRequest {
                execution_id: timer.execution_id,
                resume_state: timer.payload.resume_state.clone(),
                initial_data: None,
                timer_id: Some(timer.id),
                token_id: None,
            };
            match self.enqueue_resume(request).await {
                Ok(()) => {
                    debug!(timer_id = %timer.id, execution_id = %timer.execution_id, "timer fired");
                    if let Err(e) = self.run_manager.store().complete_timer(timer.id).await {
                        warn!(timer_id = %timer.id, error = %e, "timer completion failed");
                    }
                }
                Err(e) => {
                    // Push the timer out and let the next sweep retry it.
                    let retry_at = now
                        + chrono::Duration::from_std(
                            self.config.retry_delay.max(MIN_TIMER_RETRY),
                        )
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                    warn!(
                        timer_id = %timer.id,
                        execution_id = %timer.execution_id,
                        error = %e,
                        "resume enqueue failed, pushing timer out"
                    );
                    if let Err(store_err) = self
                        .run_manager
                        .store()
                        .fail_timer(timer.id, &e.to_string(), retry_at)
                        .await
                    {
                        warn!(timer_id = %timer.id, error = %store_err, "timer failure record failed");
                    }
                }
            }
        }
        count
    }
}
