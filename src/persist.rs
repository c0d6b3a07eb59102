//! Durable task output: Markdown reports with time-based retention.
//!
//! Every terminal transition hands the task record to an
//! [`OutputPersister`]. The file implementation writes one report per task
//! under `<root>/<parent-session>/<task-id>.md` and sweeps reports older
//! than the retention window.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::warn;

use crate::error::PersistError;
use crate::task::Task;

/// Durably records terminal task state. Returns where the record landed.
pub trait OutputPersister: Send + Sync {
    fn persist(&self, task: &Task) -> Result<PathBuf, PersistError>;

    /// Drop expired records. Default: nothing to sweep.
    fn sweep(&self, _retention: Duration) {}
}

/// Writes Markdown reports to a directory tree keyed by parent session.
#[derive(Debug, Clone)]
pub struct FileOutputPersister {
    root: PathBuf,
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9._-]+").unwrap())
}

fn safe_filename(value: &str) -> String {
    unsafe_chars().replace_all(value, "-").into_owned()
}

impl FileOutputPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Delete persisted reports older than `retention`. Best-effort: any
    /// error aborts the sweep silently.
    pub fn cleanup_old_outputs(&self, retention: Duration) {
        let now = SystemTime::now();
        let _ = self.sweep_dir(&self.root, now, retention);
    }

    fn sweep_dir(
        &self,
        dir: &Path,
        now: SystemTime,
        retention: Duration,
    ) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.sweep_dir(&path, now, retention)?;
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > retention {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }
}

impl OutputPersister for FileOutputPersister {
    fn persist(&self, task: &Task) -> Result<PathBuf, PersistError> {
        let parent = if task.parent_session_id.is_empty() {
            "unknown-parent".to_string()
        } else {
            safe_filename(&task.parent_session_id)
        };
        let dir = self.root.join(parent);
        fs::create_dir_all(&dir)?;

        let file = dir.join(format!("{}.md", safe_filename(&task.id)));
        fs::write(&file, render_report(task))?;
        Ok(file)
    }

    fn sweep(&self, retention: Duration) {
        self.cleanup_old_outputs(retention);
    }
}

fn render_report(task: &Task) -> String {
    let model = task
        .model
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "(default)".to_string());
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "(none)".to_string())
    };

    let lines = [
        "# Background Task Output".to_string(),
        String::new(),
        format!("- Task ID: {}", task.id),
        format!("- Agent: {}", task.agent),
        format!("- Model: {model}"),
        format!("- Parent Session: {}", task.parent_session_id),
        format!(
            "- Child Session: {}",
            task.session_id.as_deref().unwrap_or("(none)")
        ),
        format!("- Status: {}", task.status),
        format!("- Queued At: {}", task.queued_at.to_rfc3339()),
        format!("- Started At: {}", fmt_time(task.started_at)),
        format!("- Completed At: {}", fmt_time(task.completed_at)),
        String::new(),
        "## Prompt".to_string(),
        String::new(),
        task.prompt.clone(),
        String::new(),
        "## Result".to_string(),
        String::new(),
        task.result.clone().unwrap_or_default(),
        String::new(),
        "## Error".to_string(),
        String::new(),
        task.error.clone().unwrap_or_default(),
        String::new(),
    ];

    lines.join("\n")
}

/// Read back a previously persisted report.
pub fn read_persisted_output(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read persisted output");
            None
        }
    }
}
