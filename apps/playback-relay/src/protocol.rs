use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spotify_client::RequestParams;

/// Lifecycle notifications pushed to every viewer (or, for rejections, the
/// viewer that sent the command).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    InitAuthentication,
    Authenticated {
        id: String,
    },
    TokenRefresh {
        id: String,
    },
    CommandRejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        name: String,
        reason: String,
    },
}

/// Frames sent from the relay to viewers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Event(RelayEvent),
    /// Per-tick playback state of one session: `{id, ...state}`.
    Playback { id: String, state: Map<String, Value> },
    /// Result of a viewer command: `{id, request_id, request, ...fields}`.
    Reply {
        id: String,
        request_id: Option<Value>,
        request: String,
        fields: Map<String, Value>,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            ServerMessage::Event(event) => serde_json::to_string(event),
            ServerMessage::Playback { id, state } => {
                let mut frame = state.clone();
                frame.insert("id".to_string(), Value::String(id.clone()));
                serde_json::to_string(&frame)
            }
            ServerMessage::Reply {
                id,
                request_id,
                request,
                fields,
            } => {
                let mut frame = fields.clone();
                frame.insert("id".to_string(), Value::String(id.clone()));
                if let Some(request_id) = request_id {
                    frame.insert("request_id".to_string(), request_id.clone());
                }
                frame.insert("request".to_string(), Value::String(request.clone()));
                serde_json::to_string(&frame)
            }
        }
    }
}

impl From<RelayEvent> for ServerMessage {
    fn from(event: RelayEvent) -> Self {
        ServerMessage::Event(event)
    }
}

/// Frame sent by a viewer: `{id, name: "player.<operation>", query?, body?, request_id?}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientCommand {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub query: Option<Map<String, Value>>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub request_id: Option<Value>,
}

impl ClientCommand {
    /// Splits `name` into its family and operation segments.
    pub fn target(&self) -> (&str, Option<&str>) {
        match self.name.split_once('.') {
            Some((family, operation)) => (family, Some(operation)),
            None => (self.name.as_str(), None),
        }
    }

    pub fn params(&self) -> RequestParams {
        RequestParams {
            query: self.query.clone(),
            body: self.body.clone(),
        }
    }
}
