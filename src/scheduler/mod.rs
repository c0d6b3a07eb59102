//! Background task scheduler.
//!
//! Owns the task registry and concurrency ledger, dispatches queued tasks
//! into child sessions as capacity frees up, and drives the polling
//! completion detector over everything running. This module holds the
//! registry, launch/continue, dispatcher, launcher, terminal transitions,
//! cancellation, waiting, and the event bridge; `detector` holds the
//! per-tick heuristics and `poll` the lazily started polling loop.

mod detector;
mod poll;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, SchedulerError};
use crate::extract::{format_session_messages, FormatOptions};
use crate::ledger::ConcurrencyLedger;
use crate::persist::OutputPersister;
use crate::session::{
    CreateSessionRequest, PromptRequest, SessionClient, SessionEvent,
};
use crate::task::{ContinueInput, LaunchInput, Task, TaskStatus, WaitOptions};
use crate::tracked::TrackedSessions;

/// Poll cadence for caller-side waiting. Waiting only observes registry
/// state; it never drives detection.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(300);
const WAIT_ALL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a task leaves the running/pending states.
enum Outcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Concurrency-limited scheduler for delegated background tasks.
///
/// All mutation of the registry and ledger happens through this instance.
/// Guards are held only across synchronous sections, never across session
/// client calls, so invariants are maintained by idempotent terminal
/// transitions and the `slot_acquired` flag rather than by atomicity.
pub struct Scheduler {
    config: SchedulerConfig,
    client: Arc<dyn SessionClient>,
    persister: Arc<dyn OutputPersister>,
    tracked: TrackedSessions,
    /// Fallback working directory when the parent session lookup fails.
    directory: String,
    tasks: RwLock<HashMap<String, Task>>,
    ledger: Mutex<ConcurrencyLedger>,
    /// Session IDs with a continuation currently in flight.
    continuing: StdMutex<HashSet<String>>,
    /// The polling loop handle; absent until the first running task.
    pub(crate) poll_task: Mutex<Option<JoinHandle<()>>>,
    /// Single-admission gate for poll ticks; an overlapping tick is
    /// skipped, not queued.
    pub(crate) tick_gate: Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler. Sweeps expired persisted outputs on the way in.
    pub fn new(
        client: Arc<dyn SessionClient>,
        persister: Arc<dyn OutputPersister>,
        tracked: TrackedSessions,
        directory: impl Into<String>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        persister.sweep(config.output_retention);
        Arc::new(Self {
            config,
            client,
            persister,
            tracked,
            directory: directory.into(),
            tasks: RwLock::new(HashMap::new()),
            ledger: Mutex::new(ConcurrencyLedger::new()),
            continuing: StdMutex::new(HashSet::new()),
            poll_task: Mutex::new(None),
            tick_gate: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn SessionClient> {
        &self.client
    }

    /// Queue a new task and start it immediately if its key has capacity.
    pub async fn launch(self: &Arc<Self>, input: LaunchInput) -> Task {
        let task = Task::new(input);
        let id = task.id.clone();
        let key = task.concurrency_key();
        info!(task = %id, agent = %task.agent, key = %key, "Queued background task");

        self.tasks.write().await.insert(id.clone(), task.clone());
        self.ledger.lock().await.enqueue(&key, id.clone());
        self.pump(&key).await;

        self.get_task(&id).await.unwrap_or(task)
    }

    /// Resume an existing task's child session with a new prompt, or adopt
    /// an unknown session as a new running task.
    ///
    /// A second continuation for the same session while one is in flight is
    /// rejected outright; continuing a terminal task is rejected.
    pub async fn continue_session(self: &Arc<Self>, input: ContinueInput) -> Result<Task, Error> {
        {
            let mut continuing = self.continuing.lock().unwrap();
            if !continuing.insert(input.session_id.clone()) {
                return Err(SchedulerError::ContinuationInFlight {
                    session_id: input.session_id,
                }
                .into());
            }
        }

        let session_id = input.session_id.clone();
        let result = self.continue_inner(input).await;
        self.continuing.lock().unwrap().remove(&session_id);
        result
    }

    async fn continue_inner(self: &Arc<Self>, input: ContinueInput) -> Result<Task, Error> {
        let now = Utc::now();
        let existing_id = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .find(|task| task.session_id.as_deref() == Some(&input.session_id))
                .map(|task| task.id.clone())
        };

        let id = match existing_id {
            Some(id) => {
                let acquire_key = {
                    let mut tasks = self.tasks.write().await;
                    let task = tasks.get_mut(&id).ok_or_else(|| {
                        SchedulerError::TaskNotFound { id: id.clone() }
                    })?;
                    if task.status.is_terminal() {
                        return Err(SchedulerError::TaskAlreadyTerminal {
                            id: task.id.clone(),
                            status: task.status,
                        }
                        .into());
                    }
                    let acquire = if task.slot_acquired {
                        None
                    } else {
                        task.slot_acquired = true;
                        Some(task.concurrency_key())
                    };
                    task.status = TaskStatus::Running;
                    task.error = None;
                    task.result = None;
                    task.completed_at = None;
                    task.prompt = input.prompt.clone();
                    task.parent_session_id = input.parent_session_id.clone();
                    task.parent_message_id = input.parent_message_id.clone();
                    task.parent_agent = input.parent_agent.clone();
                    task.touch(now);
                    task.stable_polls = 0;
                    task.last_message_count = None;
                    acquire
                };
                if let Some(key) = acquire_key {
                    self.ledger.lock().await.acquire(&key);
                }
                id
            }
            None => {
                // Adopt the session as a fresh running task. The slot is
                // taken unconditionally; continuations bypass the queue.
                let mut task = Task::new(LaunchInput {
                    description: input.description.clone(),
                    prompt: input.prompt.clone(),
                    agent: input.agent.clone(),
                    parent_session_id: input.parent_session_id.clone(),
                    parent_message_id: input.parent_message_id.clone(),
                    parent_agent: input.parent_agent.clone(),
                    model: input.model.clone(),
                    run_in_background: input.run_in_background,
                });
                task.session_id = Some(input.session_id.clone());
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.slot_acquired = true;
                let id = task.id.clone();
                let key = task.concurrency_key();

                self.tasks.write().await.insert(id.clone(), task);
                self.ledger.lock().await.acquire(&key);
                id
            }
        };

        let (agent, model, run_in_background) = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(&id)
                .ok_or_else(|| SchedulerError::TaskNotFound { id: id.clone() })?;
            (task.agent.clone(), task.model.clone(), task.run_in_background)
        };

        let request = PromptRequest {
            agent,
            model,
            text: input.prompt.clone(),
        };
        let dispatch = if run_in_background {
            self.client.prompt(&input.session_id, request).await
        } else {
            self.client.prompt_sync(&input.session_id, request).await
        };
        if let Err(e) = dispatch {
            self.finish(&id, Outcome::Failed(e.to_string())).await;
            return Err(e.into());
        }

        info!(task = %id, session = %input.session_id, "Continued background task");
        self.start_polling().await;
        self.get_task(&id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound { id }.into())
    }

    /// Snapshot of a task record.
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Snapshots of every task record, newest queued last.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|task| task.queued_at);
        tasks
    }

    /// Cancel a task. Pending tasks leave their queue without ever taking a
    /// slot; running tasks get a best-effort session abort. Returns false
    /// for unknown or already-terminal tasks.
    pub async fn cancel_task(self: &Arc<Self>, id: &str) -> bool {
        let Some(task) = self.get_task(id).await else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        if task.status == TaskStatus::Pending {
            self.ledger
                .lock()
                .await
                .remove(&task.concurrency_key(), id);
        }

        let cancelled = self.finish(id, Outcome::Cancelled).await;
        if cancelled {
            info!(task = %id, "Cancelled background task");
        }
        cancelled
    }

    /// Cancel every pending or running task. Returns how many were
    /// actually cancelled.
    pub async fn cancel_all(self: &Arc<Self>) -> usize {
        let targets: Vec<String> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|task| !task.status.is_terminal())
                .map(|task| task.id.clone())
                .collect()
        };

        let mut count = 0;
        for id in targets {
            if self.cancel_task(&id).await {
                count += 1;
            }
        }
        count
    }

    /// Block until the task reaches a terminal state or the timeout lapses.
    /// A wait timeout is an error distinct from task failure.
    pub async fn wait_for(&self, id: &str, options: WaitOptions) -> Result<Task, Error> {
        let timeout = options.timeout.unwrap_or(self.config.default_wait_timeout);
        let started = Instant::now();

        loop {
            let task = self
                .get_task(id)
                .await
                .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if started.elapsed() > timeout {
                return Err(SchedulerError::WaitTimeout {
                    id: id.to_string(),
                    timeout,
                }
                .into());
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Wait for several tasks. On timeout, unfinished tasks are returned in
    /// their current (non-terminal) state rather than erroring.
    pub async fn wait_all(
        &self,
        ids: &[String],
        options: WaitOptions,
    ) -> Result<Vec<Task>, Error> {
        let timeout = options.timeout.unwrap_or(self.config.default_wait_timeout);
        let started = Instant::now();
        let mut settled: HashMap<String, Task> = HashMap::new();

        loop {
            let mut all_done = true;
            for id in ids {
                if settled.contains_key(id) {
                    continue;
                }
                let task = self
                    .get_task(id)
                    .await
                    .ok_or_else(|| SchedulerError::TaskNotFound { id: id.clone() })?;
                if task.status.is_terminal() {
                    settled.insert(id.clone(), task);
                } else {
                    all_done = false;
                }
            }

            if all_done {
                return Ok(ids
                    .iter()
                    .filter_map(|id| settled.remove(id))
                    .collect());
            }

            if started.elapsed() > timeout {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    match settled.remove(id) {
                        Some(task) => out.push(task),
                        None => {
                            let task = self.get_task(id).await.ok_or_else(|| {
                                SchedulerError::TaskNotFound { id: id.clone() }
                            })?;
                            out.push(task);
                        }
                    }
                }
                return Ok(out);
            }

            tokio::time::sleep(WAIT_ALL_POLL_INTERVAL).await;
        }
    }

    /// Render a task's child-session transcript.
    pub async fn formatted_session(
        &self,
        id: &str,
        options: FormatOptions,
    ) -> Result<String, Error> {
        let task = self
            .get_task(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        let Some(session_id) = task.session_id else {
            return Ok("No child session".to_string());
        };
        let messages = self.client.messages(&session_id).await?;
        Ok(format_session_messages(&messages, options))
    }

    /// Consume a push notification from the host event bus.
    pub async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Activity { session_id } => {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.values_mut().find(|task| {
                    task.session_id.as_deref() == Some(session_id.as_str())
                        && task.status == TaskStatus::Running
                }) {
                    task.touch(Utc::now());
                    task.stable_polls = 0;
                    task.last_message_count = None;
                }
            }
            SessionEvent::Errored {
                session_id,
                message,
            } => {
                let id = {
                    let tasks = self.tasks.read().await;
                    tasks
                        .values()
                        .find(|task| task.session_id.as_deref() == Some(session_id.as_str()))
                        .map(|task| task.id.clone())
                };
                if let Some(id) = id {
                    let reason = message.unwrap_or_else(|| "Session error".to_string());
                    self.finish(&id, Outcome::Failed(reason)).await;
                }
            }
            SessionEvent::Deleted { session_id } => {
                let ids: Vec<String> = {
                    let tasks = self.tasks.read().await;
                    tasks
                        .values()
                        .filter(|task| {
                            task.session_id.as_deref() == Some(session_id.as_str())
                        })
                        .map(|task| task.id.clone())
                        .collect()
                };
                for id in ids {
                    self.finish(&id, Outcome::Cancelled).await;
                }
            }
            SessionEvent::Ignored => {}
        }
    }

    /// Dispatcher: while `key` has spare capacity, pop the next queued task
    /// and hand it to the launcher. Slots are taken under the ledger lock
    /// so the per-key limit holds across interleavings.
    pub(crate) async fn pump(self: &Arc<Self>, key: &str) {
        let limit = self.config.limit(key);
        let mut to_start: Vec<String> = Vec::new();
        {
            let mut ledger = self.ledger.lock().await;
            while ledger.running_count(key) < limit {
                let Some(id) = ledger.dequeue_next(key) else {
                    break;
                };
                ledger.acquire(key);
                to_start.push(id);
            }
        }

        for id in to_start {
            {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&id) {
                    task.slot_acquired = true;
                }
            }
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.start_task(&id).await;
            });
        }
    }

    /// Launcher: transition a pending task into a running child session.
    /// Any failure fails the task and frees its slot so nothing sticks.
    ///
    /// Returns a boxed future to break the `pump` -> `start_task` ->
    /// `pump` recursion cycle in auto-trait (`Send`) inference.
    pub(crate) fn start_task(
        self: &Arc<Self>,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let scheduler = Arc::clone(self);
        let id = id.to_string();
        Box::pin(async move {
            let Some(task) = scheduler.get_task(&id).await else {
                return;
            };
            if task.status != TaskStatus::Pending {
                // Cancelled between dispatch and start. Give the slot back.
                scheduler.release_slot(&id).await;
                scheduler.pump(&task.concurrency_key()).await;
                return;
            }

            if let Err(e) = scheduler.launch_into_session(&id, &task).await {
                warn!(task = %id, error = %e, "Background task launch failed");
                scheduler.finish(&id, Outcome::Failed(e.to_string())).await;
            }
        })
    }

    async fn launch_into_session(self: &Arc<Self>, id: &str, task: &Task) -> Result<(), Error> {
        let parent_dir = match self.client.get_session(&task.parent_session_id).await {
            Ok(info) => info.directory.unwrap_or_else(|| self.directory.clone()),
            Err(_) => self.directory.clone(),
        };

        let info = self
            .client
            .create_session(CreateSessionRequest {
                parent_id: task.parent_session_id.clone(),
                title: format!("{} (@{})", task.description, task.agent),
                directory: parent_dir,
            })
            .await?;
        let session_id = info.id;

        let now = Utc::now();
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(id) {
                task.session_id = Some(session_id.clone());
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.last_activity_at = now;
                task.last_message_count = Some(0);
                task.stable_polls = 0;
                task.unknown_status_polls = 0;
                task.had_progress = false;
            }
        }
        self.tracked.mark(&session_id);

        let request = PromptRequest {
            agent: task.agent.clone(),
            model: task.model.clone(),
            text: task.prompt.clone(),
        };
        if task.run_in_background {
            self.client.prompt(&session_id, request).await?;
        } else {
            self.client.prompt_sync(&session_id, request).await?;
        }

        self.start_polling().await;
        info!(
            task = %id,
            session = %session_id,
            agent = %task.agent,
            "Started background task"
        );
        Ok(())
    }

    pub(crate) async fn complete_task(self: &Arc<Self>, id: &str, result: String) {
        if self.finish(id, Outcome::Completed(result)).await {
            info!(task = %id, "Background task completed");
        }
    }

    pub(crate) async fn fail_task(self: &Arc<Self>, id: &str, reason: String) {
        if self.finish(id, Outcome::Failed(reason)).await {
            info!(task = %id, "Background task failed");
        }
    }

    /// Apply a terminal transition. Idempotent: a late-arriving signal on
    /// an already-terminal task is a no-op. Returns whether the transition
    /// fired.
    async fn finish(self: &Arc<Self>, id: &str, outcome: Outcome) -> bool {
        let now = Utc::now();
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(id) else {
                return false;
            };
            let allowed = match &outcome {
                // Completion only makes sense for a running session.
                Outcome::Completed(_) => task.status == TaskStatus::Running,
                Outcome::Failed(_) | Outcome::Cancelled => !task.status.is_terminal(),
            };
            if !allowed {
                debug!(task = %id, status = %task.status, "Terminal transition skipped");
                return false;
            }
            match outcome {
                Outcome::Completed(result) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                }
                Outcome::Failed(reason) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(reason);
                }
                Outcome::Cancelled => {
                    task.status = TaskStatus::Cancelled;
                }
            }
            task.completed_at = Some(now);
            task.clone()
        };

        match self.persister.persist(&snapshot) {
            Ok(path) => {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(id) {
                    task.output_file = Some(path);
                }
            }
            Err(e) => warn!(task = %id, error = %e, "Failed to persist task output"),
        }

        if let Some(session_id) = &snapshot.session_id {
            self.tracked.unmark(session_id);
            if matches!(snapshot.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                // Best-effort abort; the session may already be gone.
                let _ = self.client.abort(session_id).await;
            }
        }

        self.release_slot(id).await;
        self.pump(&snapshot.concurrency_key()).await;
        true
    }

    /// Release the task's ledger slot, at most once per acquire.
    async fn release_slot(&self, id: &str) {
        let key = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(id) {
                Some(task) if task.slot_acquired => {
                    task.slot_acquired = false;
                    Some(task.concurrency_key())
                }
                _ => None,
            }
        };
        if let Some(key) = key {
            self.ledger.lock().await.release(&key);
        }
    }

    /// Running-count snapshot for a key, for observability and tests.
    pub async fn running_count(&self, key: &str) -> usize {
        self.ledger.lock().await.running_count(key)
    }

    /// Queued-count snapshot for a key.
    pub async fn queued_count(&self, key: &str) -> usize {
        self.ledger.lock().await.queued_count(key)
    }

    pub(crate) async fn has_running_tasks(&self) -> bool {
        self.tasks
            .read()
            .await
            .values()
            .any(|task| task.status == TaskStatus::Running)
    }

    pub(crate) async fn running_task_ids(&self) -> Vec<String> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .map(|task| task.id.clone())
            .collect()
    }
}
