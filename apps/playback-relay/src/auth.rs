use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(600);

/// Outstanding anti-replay state tokens, one per issued authorization redirect.
pub struct PendingStates {
    states: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl PendingStates {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Mints a fresh token and records it as pending. Tokens older than the
    /// ttl are dropped on the way.
    pub fn issue(&self) -> String {
        let state = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, issued| now.duration_since(*issued) < self.ttl);
        if states.len() < before {
            debug!(expired = before - states.len(), "pruned stale auth states");
        }
        states.insert(state.clone(), now);
        state
    }

    /// Removes `state` if it is pending. Only one caller ever sees `true`
    /// for a given token.
    pub fn consume(&self, state: &str) -> bool {
        let mut states = self.states.lock();
        match states.remove(state) {
            Some(issued) => issued.elapsed() < self.ttl,
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.states.lock().len()
    }
}

impl Default for PendingStates {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_TTL)
    }
}
