//! Per-session credential refresh.
//!
//! Each session owns one one-shot timer. When it fires it refreshes the
//! credential, stores the new grant and installs the next timer in its own
//! place; a failed refresh removes the session for good.

use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, error, info};

use crate::{engine::Engine, error::RefreshError, protocol::RelayEvent};

impl Engine {
    /// Delay until a credential issued for `expires_in` seconds should be
    /// renewed; zero when it is already inside the lead window.
    pub(crate) fn refresh_delay(&self, expires_in: u64) -> Duration {
        Duration::from_secs(expires_in).saturating_sub(self.inner.settings.refresh_lead)
    }

    /// Arms the refresh timer for session `id`, replacing whatever timer it
    /// had unless that timer is `caller`. No-op if the session is gone or was
    /// replaced since `epoch`.
    pub(crate) fn schedule_refresh(
        &self,
        id: &str,
        epoch: u64,
        caller: Option<u64>,
        delay: Duration,
    ) -> Option<u64> {
        let seq = self.inner.sessions.install_timer(id, epoch, caller, |seq| {
            let engine = self.clone();
            let id = id.to_string();
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => engine.run_refresh(&id, seq).await,
                }
            })
            .abort_handle()
        });
        if seq.is_some() {
            info!(id, event = "refresh_trigger", in_secs = delay.as_secs(), "refresh scheduled");
        }
        seq
    }

    async fn run_refresh(&self, id: &str, seq: u64) {
        let Some((epoch, refresh_token)) = self.inner.sessions.refresh_target(id, seq) else {
            debug!(id, seq, "refresh timer superseded");
            return;
        };

        let result = match refresh_token {
            Some(token) => self
                .inner
                .upstream
                .refresh(&token)
                .await
                .map_err(RefreshError::from)
                .and_then(|refreshed| match refreshed.expires_in {
                    0 => Err(RefreshError::ZeroLifetime),
                    _ => Ok(refreshed),
                }),
            None => Err(RefreshError::MissingRefreshToken),
        };

        match result {
            Ok(refreshed) => {
                counter!("playback_relay_refresh_total", 1, "outcome" => "ok");
                let Some(updated) =
                    self.inner
                        .sessions
                        .replace_credential(id, epoch, refreshed, Utc::now())
                else {
                    debug!(id, "session changed during refresh; discarding grant");
                    return;
                };
                self.persist(id).await;
                self.inner
                    .hub
                    .broadcast(&RelayEvent::TokenRefresh { id: id.to_string() }.into());
                self.schedule_refresh(id, epoch, Some(seq), self.refresh_delay(updated.expires_in));
            }
            Err(err) => {
                counter!("playback_relay_refresh_total", 1, "outcome" => "failed");
                error!(id, error = %err, "token refresh failed; session must re-authorize");
                self.remove_session_except(id, Some(seq)).await;
            }
        }
    }
}
