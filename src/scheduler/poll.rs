//! Polling loop driving the completion detector.
//!
//! The timer is an explicit handle owned by the scheduler: absent at
//! construction, spawned on the first running task, and the loop exits on
//! its own once no running tasks remain. The loop holds only a weak
//! reference, so dropping the scheduler also stops it.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::detector::{self, Verdict};
use super::Scheduler;
use crate::extract::extract_latest_assistant_text;
use crate::task::TaskStatus;

impl Scheduler {
    /// Arm the polling loop if it is not already running.
    pub(crate) async fn start_polling(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let weak = Arc::downgrade(self);
        let period = self.config().poll_interval;
        debug!(interval = ?period, "Starting polling loop");

        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so ticks
            // land one period after arming.
            tick.tick().await;

            loop {
                tick.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                scheduler.poll_running_tasks().await;
                // The exit decision is made under the slot lock so it is
                // ordered against `start_polling`: either this check sees
                // a newly running task, or the slot is already empty when
                // the launcher arrives and it re-arms.
                let mut slot = scheduler.poll_task.lock().await;
                if !scheduler.has_running_tasks().await {
                    slot.take();
                    debug!("No running tasks remain; polling loop stopping");
                    return;
                }
                drop(slot);
            }
        }));
    }

    /// One detector pass over every running task. Re-entrancy is handled
    /// structurally: if a previous tick is still in flight the whole pass
    /// is skipped.
    pub(crate) async fn poll_running_tasks(self: &Arc<Self>) {
        let Ok(_gate) = self.tick_gate.try_lock() else {
            debug!("Poll tick overlapped; skipping");
            return;
        };

        // A failed status query is no signal, not an error.
        let status_map = match self.client().status().await {
            Ok(map) => Some(map),
            Err(e) => {
                warn!(error = %e, "Session status query failed");
                None
            }
        };

        let now = Utc::now();
        for id in self.running_task_ids().await {
            // Assess under a short-lived write guard; counter mutation and
            // the verdict must come from the same registry state.
            let assessment = {
                let mut tasks = self.tasks.write().await;
                let Some(task) = tasks.get_mut(&id) else {
                    continue;
                };
                if task.status != TaskStatus::Running {
                    continue;
                }
                let Some(session_id) = task.session_id.clone() else {
                    drop(tasks);
                    self.fail_task(&id, "Missing child session ID".to_string())
                        .await;
                    continue;
                };
                let status = status_map
                    .as_ref()
                    .and_then(|map| map.get(&session_id))
                    .copied();
                let verdict = detector::assess(task, status, now, self.config());
                debug!(
                    task = %id,
                    session = %session_id,
                    status = ?status,
                    verdict = ?verdict,
                    unknown_polls = task.unknown_status_polls,
                    stable_polls = task.stable_polls,
                    "Poll tick"
                );
                (session_id, verdict)
            };
            let (session_id, verdict) = assessment;

            match verdict {
                Verdict::Wait | Verdict::Active => {}
                Verdict::Fail(reason) => {
                    self.fail_task(&id, reason).await;
                }
                Verdict::Probe(mode) => {
                    // A failed message query is likewise no signal: skip
                    // this task until the next tick.
                    let messages = match self.client().messages(&session_id).await {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(task = %id, error = %e, "Message query failed");
                            continue;
                        }
                    };
                    let count = messages.len();

                    let stable = {
                        let mut tasks = self.tasks.write().await;
                        match tasks.get_mut(&id) {
                            Some(task) if task.status == TaskStatus::Running => {
                                detector::record_probe(task, count, mode, now, self.config())
                            }
                            _ => false,
                        }
                    };

                    if stable {
                        let result = extract_latest_assistant_text(&messages);
                        self.complete_task(&id, result).await;
                    }
                }
            }
        }
    }
}
