use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use spotify_client::{Credential, Operation, RequestParams};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    auth::{PendingStates, DEFAULT_STATE_TTL},
    error::AuthError,
    hub::BroadcastHub,
    persistence::SessionPersistence,
    poller::{PollSettings, PollState},
    protocol::RelayEvent,
    session::SessionStore,
    upstream::Upstream,
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll: PollSettings,
    /// How long before expiry a credential is refreshed.
    pub refresh_lead: Duration,
    pub state_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            refresh_lead: Duration::from_secs(360),
            state_ttl: DEFAULT_STATE_TTL,
        }
    }
}

/// Redirect target and the state token bound to it.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    pub state: String,
}

/// Owns the session table, the viewer set and the background tasks that
/// keep both fed. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) upstream: Arc<dyn Upstream>,
    pub(crate) sessions: SessionStore,
    pub(crate) hub: BroadcastHub,
    pub(crate) pending: PendingStates,
    pub(crate) persistence: Option<Arc<dyn SessionPersistence>>,
    pub(crate) settings: EngineSettings,
    pub(crate) shutdown: CancellationToken,
    pub(crate) polling: PollState,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        persistence: Option<Arc<dyn SessionPersistence>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                upstream,
                sessions: SessionStore::new(),
                hub: BroadcastHub::new(),
                pending: PendingStates::new(settings.state_ttl),
                persistence,
                settings,
                shutdown: CancellationToken::new(),
                polling: PollState::default(),
                poll_task: Mutex::new(None),
            }),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Rehydrates persisted sessions, then starts the shared polling loop.
    pub async fn start(&self) {
        self.rehydrate().await;
        let handle = self.spawn_poll_loop();
        if let Some(previous) = self.inner.poll_task.lock().replace(handle) {
            previous.abort();
        }
        info!(sessions = self.inner.sessions.len(), "engine started");
    }

    /// Stops polling and cancels every refresh timer.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.poll_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.sessions.cancel_all_timers();
        info!("engine stopped");
    }

    pub fn begin_authorization(&self) -> Result<Authorization, AuthError> {
        let state = self.inner.pending.issue();
        let url = match self.inner.upstream.authorization_url(&state) {
            Ok(url) => url,
            Err(err) => {
                self.inner.pending.consume(&state);
                return Err(AuthError::AuthorizationUrl(err));
            }
        };
        self.inner.hub.broadcast(&RelayEvent::InitAuthentication.into());
        Ok(Authorization { url, state })
    }

    /// Validates the callback's state, exchanges the code and creates the
    /// session. Returns the new session id.
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<String, AuthError> {
        if !self.inner.pending.consume(state) {
            error!("auth state not matched");
            return Err(AuthError::Forbidden);
        }

        let credential = self
            .inner
            .upstream
            .exchange_code(code)
            .await
            .map_err(|err| {
                error!(event = "auth_token", error = %err, "authorization code exchange failed");
                AuthError::TokenExchangeFailed(err)
            })?;

        let profile = self
            .inner
            .upstream
            .execute(Operation::Profile, RequestParams::default(), &credential)
            .await
            .map_err(|err| {
                error!(event = "user_profile", error = %err, "profile lookup failed");
                AuthError::ProfileLookupFailed(err.to_string())
            })?;
        let id = profile_id(&profile.body)
            .ok_or_else(|| AuthError::ProfileLookupFailed("profile has no uri or id".into()))?;

        self.create_session(&id, credential).await;
        Ok(id)
    }

    pub(crate) async fn create_session(&self, id: &str, credential: Credential) {
        let expires_in = credential.expires_in;
        let epoch = self.inner.sessions.upsert(id, credential, Utc::now());
        self.persist(id).await;
        self.inner
            .hub
            .broadcast(&RelayEvent::Authenticated { id: id.to_string() }.into());
        self.schedule_refresh(id, epoch, None, self.refresh_delay(expires_in));
        info!(id, "session authenticated");
    }

    /// Drops the session, its refresh timer and its durable copy.
    pub async fn remove_session(&self, id: &str) {
        self.remove_session_except(id, None).await;
    }

    pub(crate) async fn remove_session_except(&self, id: &str, keep_timer: Option<u64>) {
        if !self.inner.sessions.remove_except(id, keep_timer) {
            return;
        }
        if let Some(persistence) = &self.inner.persistence {
            if let Err(err) = persistence.remove(id).await {
                warn!(id, error = %err, "failed to delete persisted session");
            }
        }
        info!(id, "session removed");
    }

    pub(crate) async fn persist(&self, id: &str) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        let Some(record) = self.inner.sessions.stored(id) else {
            return;
        };
        if let Err(err) = persistence.save(id, &record).await {
            warn!(id, error = %err, "failed to persist session");
        }
    }

    /// Profiles of all active sessions. Sessions whose lookup fails are
    /// considered dead and removed.
    pub async fn profiles(&self) -> Vec<Value> {
        let lookups = self.inner.sessions.ids().into_iter().map(|id| async move {
            let Some(credential) = self.inner.sessions.credential(&id) else {
                return None;
            };
            match self
                .inner
                .upstream
                .execute(Operation::Profile, RequestParams::default(), &credential)
                .await
            {
                Ok(response) => Some(response.body),
                Err(err) => {
                    error!(id = %id, error = %err, "profile lookup failed; dropping session");
                    self.remove_session(&id).await;
                    None
                }
            }
        });
        join_all(lookups).await.into_iter().flatten().collect()
    }

    async fn rehydrate(&self) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        let records = match persistence.load_all().await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "failed to load persisted sessions");
                return;
            }
        };
        for (id, record) in records {
            let mut credential = record.credential;
            credential.expires_in = 0;
            let epoch = self.inner.sessions.upsert(&id, credential, record.timestamp);
            self.schedule_refresh(&id, epoch, None, Duration::ZERO);
            info!(id = %id, event = "persistence loaded", "session rehydrated");
        }
    }
}

fn profile_id(profile: &Value) -> Option<String> {
    ["uri", "id"]
        .iter()
        .filter_map(|key| profile.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::session::StoredSession;
    use crate::upstream::fake::{credential_for, FakeUpstream, Reply};
    use serde_json::json;

    pub(crate) fn engine_with(upstream: Arc<FakeUpstream>) -> Engine {
        Engine::new(upstream, None, EngineSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_creates_session_and_announces_it() {
        let upstream = Arc::new(FakeUpstream::new());
        let engine = engine_with(upstream.clone());
        let (_, mut viewer) = engine.hub().connect();

        let auth = engine.begin_authorization().unwrap();
        assert!(auth.url.contains(&auth.state));
        assert_eq!(viewer.try_recv().unwrap(), r#"{"event":"init_authentication"}"#);

        let id = engine.complete_authorization("user123", &auth.state).await.unwrap();
        assert_eq!(id, "user123");
        assert!(engine.sessions().contains("user123"));
        assert_eq!(engine.sessions().timer_count("user123"), 1);
        let frame: Value = serde_json::from_str(&viewer.try_recv().unwrap()).unwrap();
        assert_eq!(frame, json!({"event": "authenticated", "id": "user123"}));
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_authorization_url_leaves_no_pending_state() {
        let upstream = Arc::new(FakeUpstream::new());
        *upstream.reject_authorize.lock() = true;
        let engine = engine_with(upstream);
        let (_, mut viewer) = engine.hub().connect();

        let err = engine.begin_authorization().unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationUrl(_)));
        assert_eq!(engine.inner.pending.len(), 0);
        assert!(viewer.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_state_is_forbidden_and_creates_nothing() {
        let upstream = Arc::new(FakeUpstream::new());
        let engine = engine_with(upstream.clone());
        engine.begin_authorization().unwrap();

        let result = engine.complete_authorization("user123", "forged").await;
        assert!(matches!(result, Err(AuthError::Forbidden)));
        assert!(engine.sessions().is_empty());
        assert_eq!(upstream.exchanges.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn state_cannot_be_replayed_while_first_callback_is_in_flight() {
        let upstream = Arc::new(FakeUpstream::new());
        *upstream.exchange_delay.lock() = Some(Duration::from_secs(2));
        let engine = engine_with(upstream.clone());
        let auth = engine.begin_authorization().unwrap();

        let first = {
            let engine = engine.clone();
            let state = auth.state.clone();
            tokio::spawn(async move { engine.complete_authorization("user123", &state).await })
        };
        tokio::task::yield_now().await;

        let second = engine.complete_authorization("user123", &auth.state).await;
        assert!(matches!(second, Err(AuthError::Forbidden)));
        assert_eq!(first.await.unwrap().unwrap(), "user123");
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_exchange_surfaces_upstream_message() {
        let upstream = Arc::new(FakeUpstream::new());
        *upstream.reject_exchange.lock() = true;
        let engine = engine_with(upstream);
        let auth = engine.begin_authorization().unwrap();

        let err = engine
            .complete_authorization("bad-code", &auth.state)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenExchangeFailed(_)));
        assert_eq!(err.to_string(), "Bad Request (400)");
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn profile_failure_does_not_create_session() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.script("user123", "profile", vec![Reply::Status(500, None)]);
        let engine = engine_with(upstream);
        let auth = engine.begin_authorization().unwrap();

        let err = engine
            .complete_authorization("user123", &auth.state)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProfileLookupFailed(_)));
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_sessions_are_persisted_and_removed() {
        let upstream = Arc::new(FakeUpstream::new());
        let persistence = MemoryPersistence::new();
        let engine = Engine::new(upstream, Some(persistence.clone()), EngineSettings::default());
        let auth = engine.begin_authorization().unwrap();
        engine.complete_authorization("alice", &auth.state).await.unwrap();

        let stored = persistence.get("alice").await.unwrap();
        assert_eq!(stored.credential.access_token, "tok-alice");

        engine.remove_session("alice").await;
        assert!(persistence.get("alice").await.is_none());
        assert_eq!(engine.sessions().timer_count("alice"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn profiles_drop_sessions_that_fail_lookup() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.script("bob", "profile", vec![Reply::Status(401, None)]);
        let engine = engine_with(upstream);
        engine.create_session("alice", credential_for("alice", 3600)).await;
        engine.create_session("bob", credential_for("bob", 3600)).await;

        let profiles = engine.profiles().await;
        assert_eq!(profiles, vec![json!({"uri": "alice", "display_name": "alice"})]);
        assert!(!engine.sessions().contains("bob"));
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rehydrated_sessions_refresh_before_first_poll() {
        let upstream = Arc::new(FakeUpstream::new());
        let persistence = MemoryPersistence::new();
        persistence
            .save(
                "alice",
                &StoredSession {
                    credential: credential_for("alice", 3600),
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        let engine = Engine::new(upstream.clone(), Some(persistence), EngineSettings::default());
        let (_, mut viewer) = engine.hub().connect();

        engine.start().await;
        assert!(engine.sessions().get("alice").unwrap().refresh_pending());
        assert_eq!(upstream.calls_for("playing"), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(upstream.refresh_count(), 1);
        assert!(!engine.sessions().get("alice").unwrap().refresh_pending());
        assert_eq!(upstream.calls_for("playing"), 1);

        let first: Value = serde_json::from_str(&viewer.try_recv().unwrap()).unwrap();
        assert_eq!(first, json!({"event": "token_refresh", "id": "alice"}));
        engine.stop().await;
    }

    #[test]
    fn profile_id_prefers_uri() {
        assert_eq!(
            profile_id(&json!({"uri": "spotify:user:1", "id": "1"})),
            Some("spotify:user:1".into())
        );
        assert_eq!(profile_id(&json!({"id": "1"})), Some("1".into()));
        assert_eq!(profile_id(&json!({"display_name": "x"})), None);
    }
}
