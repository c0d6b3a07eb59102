//! Session-lifecycle contract consumed by the scheduler.
//!
//! The scheduler never talks to an execution runtime directly; it drives
//! child sessions through the [`SessionClient`] trait and consumes runtime
//! push notifications as [`SessionEvent`] values. Production wires this to
//! the host's session API; tests stub it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::task::ModelRef;

/// Best-effort runtime status for a session. Sessions absent from the
/// status map have unknown status, which the detector handles separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is not currently doing anything.
    Idle,
    /// Session is actively working (streaming, tool calls, etc).
    Working,
}

/// Metadata for an existing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub title: Option<String>,
    /// Working directory the session operates in.
    pub directory: Option<String>,
}

/// Request to create a child session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub parent_id: String,
    pub title: String,
    /// Directory the child session should operate in.
    pub directory: String,
}

/// Request to dispatch a prompt into a session.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub agent: String,
    pub model: Option<ModelRef>,
    pub text: String,
}

/// One part of a session message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    ToolResult { output: String },
    /// Anything the scheduler does not render.
    #[serde(other)]
    Other,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Envelope metadata for a session message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub role: Role,
}

/// A message in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub info: MessageInfo,
    pub parts: Vec<MessagePart>,
}

/// Client for the external session runtime, keyed by session ID.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Create a child session under `parent_id`.
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, SessionError>;

    /// Look up an existing session.
    async fn get_session(&self, id: &str) -> Result<SessionInfo, SessionError>;

    /// Full message list for a session.
    async fn messages(&self, id: &str) -> Result<Vec<SessionMessage>, SessionError>;

    /// Best-effort status map over all live sessions.
    async fn status(&self) -> Result<HashMap<String, SessionStatus>, SessionError>;

    /// Abort a session. Cancellation paths swallow errors from this.
    async fn abort(&self, id: &str) -> Result<(), SessionError>;

    /// Dispatch a prompt without waiting for the session to respond.
    async fn prompt(&self, id: &str, request: PromptRequest) -> Result<(), SessionError>;

    /// Dispatch a prompt and wait for the session's response to finish.
    async fn prompt_sync(&self, id: &str, request: PromptRequest) -> Result<(), SessionError>;
}

/// Push notifications the scheduler consumes. A closed set: hosts convert
/// their own event stream into these and map everything else to `Ignored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Message created or updated in a session.
    Activity { session_id: String },
    /// The runtime reported a session-level error.
    Errored {
        session_id: String,
        message: Option<String>,
    },
    /// The session was deleted out from under us.
    Deleted { session_id: String },
    /// Any host event this core does not consume.
    Ignored,
}
