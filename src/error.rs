//! Error types for the background task scheduler.

use std::time::Duration;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Errors surfaced by the scheduler API.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Concurrent continuation blocked for session {session_id}")]
    ContinuationInFlight { session_id: String },

    #[error(
        "Cannot continue terminal task {id} ({status}). Start a new task without a session ID."
    )]
    TaskAlreadyTerminal { id: String, status: TaskStatus },

    #[error("Timed out waiting for task {id} after {timeout:?}")]
    WaitTimeout { id: String, timeout: Duration },
}

/// Errors from the session-lifecycle client.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to create child session: {reason}")]
    CreateFailed { reason: String },

    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Session request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Prompt dispatch failed for session {id}: {reason}")]
    PromptFailed { id: String, reason: String },
}

/// Errors while persisting task output.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
