//! Concurrency-limited scheduler for delegated background agent sessions,
//! with polling-based completion and staleness detection.

pub mod config;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod persist;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod tracked;

pub use config::SchedulerConfig;
pub use error::{Error, PersistError, SchedulerError, SessionError};
pub use extract::FormatOptions;
pub use ledger::ConcurrencyLedger;
pub use persist::{FileOutputPersister, OutputPersister};
pub use scheduler::Scheduler;
pub use session::{SessionClient, SessionEvent, SessionStatus};
pub use task::{ContinueInput, LaunchInput, ModelRef, Task, TaskStatus, WaitOptions};
pub use tracked::TrackedSessions;
