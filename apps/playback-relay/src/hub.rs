use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub type ViewerId = Uuid;

/// Fan-out to connected viewers.
///
/// Each viewer is the sending half of the channel its socket task drains.
/// The open set is derived at send time: channels whose receiver is gone are
/// skipped and pruned, so no separate liveness bookkeeping exists.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    viewers: Arc<DashMap<ViewerId, mpsc::UnboundedSender<String>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> (ViewerId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let viewer_id = Uuid::new_v4();
        self.viewers.insert(viewer_id, tx);
        self.report_viewers();
        (viewer_id, rx)
    }

    pub fn disconnect(&self, viewer_id: ViewerId) {
        self.viewers.remove(&viewer_id);
        self.report_viewers();
    }

    /// Viewers whose channel is still open.
    pub fn open_viewers(&self) -> Vec<(ViewerId, mpsc::UnboundedSender<String>)> {
        self.viewers.retain(|_, tx| !tx.is_closed());
        self.viewers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn viewer_count(&self) -> usize {
        self.open_viewers().len()
    }

    /// Serializes once and sends to every open viewer. Returns how many
    /// viewers the frame was handed to.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let mut delivered = 0;
        for (viewer_id, tx) in self.open_viewers() {
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(viewer = %viewer_id, "viewer closed during broadcast");
            }
        }
        delivered
    }

    /// Sends to one viewer if its channel is still open.
    pub fn unicast(&self, message: &ServerMessage, viewer_id: ViewerId) -> bool {
        let Some(tx) = self
            .viewers
            .get(&viewer_id)
            .map(|entry| entry.value().clone())
            .filter(|tx| !tx.is_closed())
        else {
            debug!(viewer = %viewer_id, "unicast target is gone");
            return false;
        };
        match encode(message) {
            Some(frame) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn report_viewers(&self) {
        gauge!("playback_relay_viewers_connected", self.viewers.len() as f64);
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match message.to_json() {
        Ok(frame) => Some(frame),
        Err(err) => {
            error!(error = %err, "failed to serialize viewer frame");
            None
        }
    }
}
