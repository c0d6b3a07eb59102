//! Per-tick completion/staleness detection for one running task.
//!
//! There is no reliable completion callback from the session runtime, so
//! two weak signals are triangulated with wall-clock timers: the
//! best-effort status map and message count convergence. `assess` applies
//! the rules in strict order (absolute TTL, direct status, unknown status,
//! idle handling), mutating the task's counters as it goes and telling the
//! poll loop what to do next. Message fetching happens outside, in the
//! loop; `record_probe` folds the observed count back into the stability
//! state.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::session::SessionStatus;
use crate::task::Task;

/// What the poll loop should do for a task after assessment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// No usable signal this tick.
    Wait,
    /// Session reported busy; activity refreshed, counters reset.
    Active,
    /// Terminal failure with a human-readable reason.
    Fail(String),
    /// Fetch the message list and run a stability check.
    Probe(ProbeMode),
}

/// Which rule requested the message probe. The two paths fold counts into
/// the stability state differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeMode {
    /// Runtime explicitly reported idle.
    Idle,
    /// Session has been absent from the status map past the threshold.
    UnknownStatus,
}

fn rounded_minutes(duration: std::time::Duration) -> u64 {
    (duration.as_secs_f64() / 60.0).round() as u64
}

/// Evaluate one running task against the status signal for this tick.
pub(crate) fn assess(
    task: &mut Task,
    status: Option<SessionStatus>,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Verdict {
    let runtime = task.runtime(now);

    // Absolute TTL. The only rule immune to every other signal.
    if runtime > config.task_ttl {
        return Verdict::Fail(format!(
            "Task exceeded absolute time limit ({}min)",
            rounded_minutes(runtime)
        ));
    }

    // A busy session is immune from staleness. Reset everything.
    if status == Some(SessionStatus::Working) {
        task.touch(now);
        task.stable_polls = 0;
        task.unknown_status_polls = 0;
        task.had_progress = true;
        return Verdict::Active;
    }

    // Session absent from the status map. Wait out a grace window, then
    // fall back to message-count inspection.
    let Some(SessionStatus::Idle) = status else {
        task.unknown_status_polls += 1;
        if task.unknown_status_polls > config.max_unknown_status_polls {
            debug!(
                task = %task.id,
                polls = task.unknown_status_polls,
                "Unknown status past threshold; probing messages"
            );
            return Verdict::Probe(ProbeMode::UnknownStatus);
        }
        return Verdict::Wait;
    };

    // Idle. A known status, so the unknown counter restarts.
    task.unknown_status_polls = 0;

    if runtime < config.minimum_runtime {
        return Verdict::Wait; // still warming up
    }

    let since_activity = task.time_since_activity(now);
    if since_activity < config.quiet_period {
        return Verdict::Wait; // debounce a momentary idle blip
    }

    // Two-tier staleness: a session that never got going gets a shorter
    // grace period than one that went idle after real work.
    let stale_timeout = if task.had_progress {
        config.stale_timeout
    } else {
        config.no_progress_timeout
    };
    if since_activity > stale_timeout && runtime > config.min_runtime_before_stale {
        return Verdict::Fail(format!(
            "Task timed out due to inactivity (idle for {}min)",
            rounded_minutes(since_activity)
        ));
    }

    Verdict::Probe(ProbeMode::Idle)
}

/// Fold an observed message count into the task's stability state.
/// Returns true once the count has held steady for the configured number
/// of consecutive polls and the task should complete.
pub(crate) fn record_probe(
    task: &mut Task,
    count: usize,
    mode: ProbeMode,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> bool {
    match mode {
        ProbeMode::Idle => {
            if task.last_message_count == Some(count) {
                task.stable_polls += 1;
            } else {
                task.stable_polls = 0;
                task.last_message_count = Some(count);
            }
            task.stable_polls >= config.stable_poll_threshold
        }
        ProbeMode::UnknownStatus => {
            if count > 0 && task.last_message_count == Some(count) {
                task.stable_polls += 1;
                task.stable_polls >= config.stable_poll_threshold
            } else {
                // A changing count is evidence of life: restart the
                // unknown-status clock instead of completing.
                task.stable_polls = 0;
                task.last_message_count = Some(count);
                task.unknown_status_polls = 0;
                task.touch(now);
                false
            }
        }
    }
}
