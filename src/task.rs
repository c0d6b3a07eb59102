//! Task records and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for a concurrency slot.
    Pending,
    /// Dispatched into a child session.
    Running,
    /// Finished; result extracted from the child session.
    Completed,
    /// Failed (launch error, session error, staleness, or TTL).
    Failed,
    /// Cancelled by the caller or by session deletion.
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Model selection for a task's child session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
    pub variant: Option<String>,
}

impl ModelRef {
    /// `provider/model`, the form used as a concurrency key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{} ({v})", self.provider_id, self.model_id),
            None => write!(f, "{}/{}", self.provider_id, self.model_id),
        }
    }
}

/// A delegated unit of work with its own lifecycle and child session.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Short unique ID, `bg_`-prefixed.
    pub id: String,
    pub description: String,
    pub prompt: String,
    /// Target agent identifier.
    pub agent: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    /// Child session carrying out the work. Absent until launched.
    pub session_id: Option<String>,
    pub model: Option<ModelRef>,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Anchors every staleness computation; monotonically non-decreasing.
    pub last_activity_at: DateTime<Utc>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Where the persisted transcript landed, once terminal.
    pub output_file: Option<PathBuf>,
    /// Whether the initial prompt blocks until the session responds.
    pub run_in_background: bool,

    // Detector bookkeeping. Internal to the scheduler.
    #[serde(skip)]
    pub(crate) last_message_count: Option<usize>,
    #[serde(skip)]
    pub(crate) stable_polls: u32,
    #[serde(skip)]
    pub(crate) unknown_status_polls: u32,
    /// Latches once the session has ever been observed doing work.
    #[serde(skip)]
    pub(crate) had_progress: bool,
    /// Guards slot release so it happens at most once per acquire.
    #[serde(skip)]
    pub(crate) slot_acquired: bool,
}

impl Task {
    /// Create a pending task from launch input.
    pub(crate) fn new(input: LaunchInput) -> Self {
        let now = Utc::now();
        Self {
            id: new_task_id(),
            description: input.description,
            prompt: input.prompt,
            agent: input.agent,
            parent_session_id: input.parent_session_id,
            parent_message_id: input.parent_message_id,
            parent_agent: input.parent_agent,
            session_id: None,
            model: input.model,
            status: TaskStatus::Pending,
            queued_at: now,
            started_at: None,
            completed_at: None,
            last_activity_at: now,
            result: None,
            error: None,
            output_file: None,
            run_in_background: input.run_in_background,
            last_message_count: None,
            stable_polls: 0,
            unknown_status_polls: 0,
            had_progress: false,
            slot_acquired: false,
        }
    }

    /// The grouping under which running-task limits are enforced:
    /// the model selector when present, else the agent identifier.
    pub fn concurrency_key(&self) -> String {
        match &self.model {
            Some(model) => model.key(),
            None => self.agent.clone(),
        }
    }

    /// Wall-clock runtime since the task started.
    pub fn runtime(&self, now: DateTime<Utc>) -> Duration {
        match self.started_at {
            Some(started) => signed_to_duration(now.signed_duration_since(started)),
            None => Duration::ZERO,
        }
    }

    /// Time since the last observed activity.
    pub fn time_since_activity(&self, now: DateTime<Utc>) -> Duration {
        signed_to_duration(now.signed_duration_since(self.last_activity_at))
    }

    /// Refresh the activity anchor, keeping it non-decreasing.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }
}

fn signed_to_duration(delta: chrono::TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

fn new_task_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("bg_{}", &uuid[..8])
}

/// Input to `Scheduler::launch`.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchInput {
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub model: Option<ModelRef>,
    pub run_in_background: bool,
}

/// Input to `Scheduler::continue_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContinueInput {
    /// Existing child session to resume.
    pub session_id: String,
    pub prompt: String,
    pub description: String,
    pub agent: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub model: Option<ModelRef>,
    pub run_in_background: bool,
}

/// Options for caller-side waiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitOptions {
    /// Overrides the configured default wait timeout.
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_input() -> LaunchInput {
        LaunchInput {
            description: "Audit deps".to_string(),
            prompt: "Check for unused dependencies".to_string(),
            agent: "researcher".to_string(),
            parent_session_id: "ses_parent".to_string(),
            parent_message_id: "msg_1".to_string(),
            parent_agent: None,
            model: None,
            run_in_background: true,
        }
    }

    #[test]
    fn new_task_is_pending() {
        let task = Task::new(launch_input());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.id.starts_with("bg_"));
        assert!(task.session_id.is_none());
        assert!(!task.slot_acquired);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn concurrency_key_prefers_model() {
        let mut task = Task::new(launch_input());
        assert_eq!(task.concurrency_key(), "researcher");

        task.model = Some(ModelRef {
            provider_id: "anthropic".to_string(),
            model_id: "claude-sonnet".to_string(),
            variant: None,
        });
        assert_eq!(task.concurrency_key(), "anthropic/claude-sonnet");
    }

    #[test]
    fn touch_is_monotonic() {
        let mut task = Task::new(launch_input());
        let anchor = task.last_activity_at;
        task.touch(anchor - chrono::TimeDelta::seconds(10));
        assert_eq!(task.last_activity_at, anchor);
        let later = anchor + chrono::TimeDelta::seconds(10);
        task.touch(later);
        assert_eq!(task.last_activity_at, later);
    }

    #[test]
    fn runtime_before_start_is_zero() {
        let task = Task::new(launch_input());
        assert_eq!(task.runtime(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskStatus::Cancelled);
    }
}
