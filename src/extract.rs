//! Result extraction and transcript formatting for session messages.

use crate::session::{MessagePart, Role, SessionMessage};

/// Options for rendering a session transcript.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    pub include_thinking: bool,
    pub include_tool_results: bool,
    /// Render only the last `limit` messages when set.
    pub limit: Option<usize>,
}

fn part_text(part: &MessagePart, options: FormatOptions) -> Option<String> {
    match part {
        MessagePart::Text { text } if !text.trim().is_empty() => Some(text.clone()),
        MessagePart::Reasoning { text }
            if options.include_thinking && !text.trim().is_empty() =>
        {
            Some(format!("[thinking]\n{text}"))
        }
        MessagePart::ToolResult { output }
            if options.include_tool_results && !output.trim().is_empty() =>
        {
            Some(format!("[tool_result]\n{output}"))
        }
        _ => None,
    }
}

/// Text of the most recent assistant message, used as a completed task's
/// result. Empty string when no assistant message exists.
pub fn extract_latest_assistant_text(messages: &[SessionMessage]) -> String {
    let Some(latest) = messages
        .iter()
        .rev()
        .find(|message| message.info.role == Role::Assistant)
    else {
        return String::new();
    };

    latest
        .parts
        .iter()
        .filter_map(|part| part_text(part, FormatOptions::default()))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Render a transcript as plain text, one `[role] id` header per message.
pub fn format_session_messages(messages: &[SessionMessage], options: FormatOptions) -> String {
    if messages.is_empty() {
        return "No messages".to_string();
    }

    let skip = match options.limit {
        Some(limit) if limit > 0 => messages.len().saturating_sub(limit),
        _ => 0,
    };

    let mut lines: Vec<String> = Vec::new();
    for message in &messages[skip..] {
        let role = match message.info.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        lines.push(format!("[{role}] {}", message.info.id).trim().to_string());

        let content: Vec<String> = message
            .parts
            .iter()
            .filter_map(|part| part_text(part, options))
            .collect();
        if !content.is_empty() {
            lines.push(content.join("\n"));
        }
        lines.push(String::new());
    }

    lines.join("\n").trim().to_string()
}
