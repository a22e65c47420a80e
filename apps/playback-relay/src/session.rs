use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use spotify_client::Credential;
use tokio::task::AbortHandle;

/// Handle of the one-shot task that will refresh a session's credential.
struct RefreshTimer {
    seq: u64,
    handle: AbortHandle,
}

impl RefreshTimer {
    fn cancel(self) {
        self.handle.abort();
    }
}

struct Session {
    credential: Credential,
    issued_at: DateTime<Utc>,
    /// Bumped whenever the session is (re)created by an upsert.
    epoch: u64,
    poll_failures: u32,
    timer: Option<RefreshTimer>,
}

/// Read-only copy of a session record.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub credential: Credential,
    pub issued_at: DateTime<Utc>,
    pub epoch: u64,
    pub poll_failures: u32,
}

#[cfg(test)]
impl SessionSnapshot {
    /// Rehydrated sessions carry a zeroed lifetime until their first refresh.
    pub fn refresh_pending(&self) -> bool {
        self.credential.expires_in == 0
    }
}

/// Durable form of a session: the credential plus the time it was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    #[serde(flatten)]
    pub credential: Credential,
    pub timestamp: DateTime<Utc>,
}

/// In-memory table of live sessions keyed by upstream user id.
///
/// Every mutation happens under the map's per-key lock, so readers only ever
/// see a whole credential. At most one refresh timer is attached per session.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    next_epoch: Arc<AtomicU64>,
    next_timer_seq: Arc<AtomicU64>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the session for `id`, cancelling any timer the
    /// previous record held. Returns the new record's epoch.
    pub fn upsert(&self, id: &str, credential: Credential, issued_at: DateTime<Utc>) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.sessions.insert(
            id.to_string(),
            Session {
                credential,
                issued_at,
                epoch,
                poll_failures: 0,
                timer: None,
            },
        );
        if let Some(timer) = previous.and_then(|session| session.timer) {
            timer.cancel();
        }
        epoch
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|entry| SessionSnapshot {
            id: entry.key().clone(),
            credential: entry.credential.clone(),
            issued_at: entry.issued_at,
            epoch: entry.epoch,
            poll_failures: entry.poll_failures,
        })
    }

    /// Current credential, read at call time.
    pub fn credential(&self, id: &str) -> Option<Credential> {
        self.sessions.get(id).map(|entry| entry.credential.clone())
    }

    /// Credential to poll with, or `None` when the session is gone or still
    /// waiting for its first refresh.
    pub fn poll_credential(&self, id: &str) -> Option<Credential> {
        self.sessions
            .get(id)
            .filter(|entry| entry.credential.expires_in > 0)
            .map(|entry| entry.credential.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stored(&self, id: &str) -> Option<StoredSession> {
        self.sessions.get(id).map(|entry| StoredSession {
            credential: entry.credential.clone(),
            timestamp: entry.issued_at,
        })
    }

    /// Removes the session and cancels its refresh timer.
    #[cfg(test)]
    pub fn remove(&self, id: &str) -> bool {
        self.remove_except(id, None)
    }

    /// Like [`remove`](Self::remove), but leaves the timer with sequence
    /// `keep` running. A firing timer uses this to remove its own session
    /// without cancelling itself. Returns whether a session was removed.
    pub fn remove_except(&self, id: &str, keep: Option<u64>) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        if let Some(timer) = session.timer {
            if Some(timer.seq) != keep {
                timer.cancel();
            }
        }
        true
    }

    /// Replaces the refresh timer of session `id` if it still has `epoch`.
    ///
    /// `spawn` receives the new timer's sequence number and must return the
    /// handle of the task it started. The previous timer is cancelled unless
    /// it is `caller`, the timer doing the rescheduling.
    pub fn install_timer<F>(&self, id: &str, epoch: u64, caller: Option<u64>, spawn: F) -> Option<u64>
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        let mut entry = self.sessions.get_mut(id)?;
        if entry.epoch != epoch {
            return None;
        }
        let seq = self.next_timer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = spawn(seq);
        if let Some(previous) = entry.timer.replace(RefreshTimer { seq, handle }) {
            if Some(previous.seq) != caller {
                previous.cancel();
            }
        }
        Some(seq)
    }

    /// What a firing timer needs to refresh: the session's epoch and refresh
    /// token. `None` if the timer has been superseded or the session is gone.
    pub fn refresh_target(&self, id: &str, seq: u64) -> Option<(u64, Option<String>)> {
        let entry = self.sessions.get(id)?;
        match &entry.timer {
            Some(timer) if timer.seq == seq => {
                Some((entry.epoch, entry.credential.refresh_token.clone()))
            }
            _ => None,
        }
    }

    /// Folds a refreshed grant into the session if it still has `epoch`.
    pub fn replace_credential(
        &self,
        id: &str,
        epoch: u64,
        refreshed: Credential,
        issued_at: DateTime<Utc>,
    ) -> Option<Credential> {
        let mut entry = self.sessions.get_mut(id)?;
        if entry.epoch != epoch {
            return None;
        }
        entry.credential.merge_refresh(refreshed);
        entry.issued_at = issued_at;
        Some(entry.credential.clone())
    }

    /// Number of refresh timers attached to `id` (zero or one).
    #[cfg(test)]
    pub fn timer_count(&self, id: &str) -> usize {
        self.sessions
            .get(id)
            .map(|entry| usize::from(entry.timer.is_some()))
            .unwrap_or(0)
    }

    /// Resets the consecutive failure counter; returns its previous value.
    pub fn record_poll_success(&self, id: &str) -> Option<u32> {
        let mut entry = self.sessions.get_mut(id)?;
        Some(std::mem::take(&mut entry.poll_failures))
    }

    /// Bumps the consecutive failure counter, saturating at `cap`.
    pub fn record_poll_failure(&self, id: &str, cap: u32) -> Option<u32> {
        let mut entry = self.sessions.get_mut(id)?;
        entry.poll_failures = (entry.poll_failures + 1).min(cap);
        Some(entry.poll_failures)
    }

    pub fn cancel_all_timers(&self) {
        for mut entry in self.sessions.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn credential(token: &str) -> Credential {
        Credential::bearer(token, Some(format!("refresh-{token}")), 3600)
    }

    fn sleeper() -> tokio::task::JoinHandle<()> {
        tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn upsert_replaces_and_cancels_previous_timer() {
        let store = SessionStore::new();
        let epoch = store.upsert("alice", credential("a1"), Utc::now());
        let timer = sleeper();
        store
            .install_timer("alice", epoch, None, |_| timer.abort_handle())
            .unwrap();

        let next = store.upsert("alice", credential("a2"), Utc::now());
        assert!(next > epoch);
        assert!(timer.await.unwrap_err().is_cancelled());
        assert_eq!(store.timer_count("alice"), 0);
        assert_eq!(store.credential("alice").unwrap().access_token, "a2");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn install_timer_keeps_exactly_one() {
        let store = SessionStore::new();
        let epoch = store.upsert("alice", credential("a1"), Utc::now());
        let first = sleeper();
        let seq = store
            .install_timer("alice", epoch, None, |_| first.abort_handle())
            .unwrap();

        let second = sleeper();
        store
            .install_timer("alice", epoch, None, |_| second.abort_handle())
            .unwrap();
        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(store.timer_count("alice"), 1);
        assert!(store.refresh_target("alice", seq).is_none());
    }

    #[tokio::test]
    async fn caller_timer_is_not_cancelled_on_reschedule() {
        let store = SessionStore::new();
        let epoch = store.upsert("alice", credential("a1"), Utc::now());
        let own = sleeper();
        let seq = store
            .install_timer("alice", epoch, None, |_| own.abort_handle())
            .unwrap();

        let next = sleeper();
        store
            .install_timer("alice", epoch, Some(seq), |_| next.abort_handle())
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!own.is_finished());
        own.abort();
        store.cancel_all_timers();
        assert!(next.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn stale_epoch_cannot_install_or_replace() {
        let store = SessionStore::new();
        let old = store.upsert("alice", credential("a1"), Utc::now());
        store.upsert("alice", credential("a2"), Utc::now());

        let timer = sleeper();
        assert!(store
            .install_timer("alice", old, None, |_| timer.abort_handle())
            .is_none());
        timer.abort();
        assert!(store
            .replace_credential("alice", old, credential("stale"), Utc::now())
            .is_none());
        assert_eq!(store.credential("alice").unwrap().access_token, "a2");
    }

    #[tokio::test]
    async fn remove_cancels_timer() {
        let store = SessionStore::new();
        let epoch = store.upsert("alice", credential("a1"), Utc::now());
        let timer = sleeper();
        store
            .install_timer("alice", epoch, None, |_| timer.abort_handle())
            .unwrap();

        assert!(store.remove("alice"));
        assert!(timer.await.unwrap_err().is_cancelled());
        assert!(!store.contains("alice"));
        assert!(!store.remove("alice"));
    }

    #[test]
    fn failure_counter_saturates_and_resets() {
        let store = SessionStore::new();
        store.upsert("alice", credential("a1"), Utc::now());
        for expected in 1..=6 {
            assert_eq!(store.record_poll_failure("alice", 6), Some(expected));
        }
        assert_eq!(store.record_poll_failure("alice", 6), Some(6));
        assert_eq!(store.record_poll_success("alice"), Some(6));
        assert_eq!(store.get("alice").unwrap().poll_failures, 0);
        assert_eq!(store.record_poll_failure("bob", 6), None);
    }

    #[test]
    fn refresh_pending_sessions_are_not_polled() {
        let store = SessionStore::new();
        let mut cred = credential("a1");
        cred.expires_in = 0;
        store.upsert("alice", cred, Utc::now());
        assert!(store.get("alice").unwrap().refresh_pending());
        assert!(store.poll_credential("alice").is_none());
        assert!(store.credential("alice").is_some());
    }

    #[test]
    fn stored_session_flattens_credential() {
        let store = SessionStore::new();
        store.upsert("alice", credential("a1"), Utc::now());
        let stored = store.stored("alice").unwrap();
        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["access_token"], "a1");
        assert!(value.get("timestamp").is_some());
        let back: StoredSession = serde_json::from_value(value).unwrap();
        assert_eq!(back, stored);
    }
}
