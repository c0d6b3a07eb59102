//! Shared registry of session IDs that belong to delegated work.
//!
//! Other parts of the host (hooks, UI filtering) need to know which
//! sessions were spawned by the scheduler. This is a cheap clonable handle
//! over that set; the scheduler marks IDs at launch and unmarks them on
//! every terminal transition.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct TrackedSessions {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl TrackedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, session_id: &str) {
        self.inner.lock().unwrap().insert(session_id.to_string());
    }

    pub fn unmark(&self, session_id: &str) {
        self.inner.lock().unwrap().remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
