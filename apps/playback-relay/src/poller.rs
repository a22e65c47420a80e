use std::collections::HashSet;
use std::time::Duration;

#[cfg(test)]
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use spotify_client::{Operation, PlayerOperation, RequestParams};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::Engine, protocol::ServerMessage};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub default_delay: Duration,
    pub retry_delay: Duration,
    pub degraded_delay: Duration,
    /// Consecutive failures tolerated before a session counts as degraded.
    pub failure_threshold: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(2000),
            degraded_delay: Duration::from_millis(60_000),
            failure_threshold: 5,
        }
    }
}

/// What polling one session produced during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered,
    /// Session vanished or is waiting on its first refresh.
    Skipped,
    RateLimited { retry_after_secs: u64 },
    Retrying { failures: u32 },
    Degraded { failures: u32 },
}

/// Poll bookkeeping shared by the loop and the per-session poll tasks.
#[derive(Default)]
pub(crate) struct PollState {
    /// Sessions whose previous poll has not returned yet.
    in_flight: Mutex<HashSet<String>>,
    /// Outcomes reported since the loop last picked a delay.
    outcomes: Mutex<Vec<PollOutcome>>,
}

impl PollState {
    fn record(&self, outcome: PollOutcome) {
        self.outcomes.lock().push(outcome);
    }

    /// Delay owed to everything reported since the previous call.
    fn take_delay(&self, settings: &PollSettings) -> Duration {
        let outcomes = std::mem::take(&mut *self.outcomes.lock());
        next_delay(&outcomes, settings)
    }
}

/// Marks a session as being polled; cleared when the poll task ends.
struct InFlight {
    engine: Engine,
    id: String,
}

impl InFlight {
    fn claim(engine: &Engine, id: &str) -> Option<Self> {
        if !engine.inner.polling.in_flight.lock().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            engine: engine.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.engine.inner.polling.in_flight.lock().remove(&self.id);
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub outcomes: Vec<(String, PollOutcome)>,
    pub next_delay: Duration,
}

/// Wait before the next tick: the worst outcome reported wins.
pub fn next_delay<'a>(
    outcomes: impl IntoIterator<Item = &'a PollOutcome>,
    settings: &PollSettings,
) -> Duration {
    outcomes
        .into_iter()
        .fold(settings.default_delay, |delay, outcome| {
            let wanted = match outcome {
                PollOutcome::Delivered | PollOutcome::Skipped => settings.default_delay,
                PollOutcome::RateLimited { retry_after_secs } => {
                    Duration::from_millis(retry_after_secs.saturating_mul(1000))
                }
                PollOutcome::Retrying { .. } => settings.retry_delay,
                PollOutcome::Degraded { .. } => settings.degraded_delay,
            };
            delay.max(wanted)
        })
}

/// Sleeps unless shutdown comes first; returns `false` on shutdown.
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl Engine {
    /// Ticks on its own timer. Polls run as separate tasks, so a stuck call
    /// never delays the next tick; the loop waits the default delay, then
    /// any extra backoff owed to outcomes reported meanwhile.
    pub(crate) fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let settings = engine.inner.settings.poll.clone();
            loop {
                if !pause(&shutdown, settings.default_delay).await {
                    break;
                }
                let extra = engine
                    .inner
                    .polling
                    .take_delay(&settings)
                    .saturating_sub(settings.default_delay);
                if !extra.is_zero() {
                    debug!(extra_ms = extra.as_millis() as u64, "backing off before next tick");
                    if !pause(&shutdown, extra).await {
                        break;
                    }
                }
                engine.spawn_tick();
            }
            debug!("poll loop stopped");
        })
    }

    /// Starts one poll task per session. Does nothing while no viewer is
    /// connected; sessions still waiting on their previous poll are left out.
    pub(crate) fn spawn_tick(&self) -> Vec<JoinHandle<(String, PollOutcome)>> {
        if self.inner.hub.viewer_count() == 0 {
            return Vec::new();
        }

        self.inner
            .sessions
            .ids()
            .into_iter()
            .filter_map(|id| {
                let Some(guard) = InFlight::claim(self, &id) else {
                    debug!(id = %id, "previous poll still in flight");
                    return None;
                };
                let engine = self.clone();
                let shutdown = self.inner.shutdown.clone();
                Some(tokio::spawn(async move {
                    let _guard = guard;
                    let outcome = tokio::select! {
                        _ = shutdown.cancelled() => PollOutcome::Skipped,
                        outcome = engine.poll_session(&id) => outcome,
                    };
                    engine.inner.polling.record(outcome);
                    (id, outcome)
                }))
            })
            .collect()
    }

    /// Runs one tick to completion.
    #[cfg(test)]
    pub async fn run_tick(&self) -> TickReport {
        let outcomes: Vec<(String, PollOutcome)> = join_all(self.spawn_tick())
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        let next_delay = next_delay(
            outcomes.iter().map(|(_, outcome)| outcome),
            &self.inner.settings.poll,
        );
        TickReport {
            outcomes,
            next_delay,
        }
    }

    async fn poll_session(&self, id: &str) -> PollOutcome {
        let sessions = &self.inner.sessions;
        let Some(credential) = sessions.poll_credential(id) else {
            return PollOutcome::Skipped;
        };

        counter!("playback_relay_polls_total", 1);
        let result = self
            .inner
            .upstream
            .execute(
                Operation::Player(PlayerOperation::CurrentlyPlaying),
                RequestParams::default(),
                &credential,
            )
            .await;

        match result {
            Ok(response) => {
                let Some(previous_failures) = sessions.record_poll_success(id) else {
                    return PollOutcome::Skipped;
                };
                if previous_failures > 0 {
                    info!(id, ok = true, previous_failures, "polling recovered");
                }
                self.inner.hub.broadcast(&ServerMessage::Playback {
                    id: id.to_string(),
                    state: response.into_fields(),
                });
                PollOutcome::Delivered
            }
            Err(err) => {
                if let Some(retry_after_secs) = err.retry_after() {
                    counter!("playback_relay_rate_limited_total", 1);
                    info!(id, retry_after_secs, "{}", err);
                    if !sessions.contains(id) {
                        return PollOutcome::Skipped;
                    }
                    return PollOutcome::RateLimited { retry_after_secs };
                }

                let threshold = self.inner.settings.poll.failure_threshold;
                let Some(failures) = sessions.record_poll_failure(id, threshold + 1) else {
                    return PollOutcome::Skipped;
                };
                counter!("playback_relay_poll_failures_total", 1);
                if failures > threshold {
                    error!(id, failures, error = %err, "polling degraded; upstream keeps failing");
                    PollOutcome::Degraded { failures }
                } else {
                    warn!(id, failures, error = %err, "poll failed; retrying");
                    PollOutcome::Retrying { failures }
                }
            }
        }
    }
}
