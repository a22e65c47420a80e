use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::{engine::Engine, hub::ViewerId, protocol::ClientCommand, routes::AppState};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

/// Drives one viewer connection until either side closes it.
async fn handle_socket(socket: WebSocket, engine: Engine) {
    let (viewer_id, mut rx) = engine.hub().connect();
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(viewer = %viewer_id, "viewer writer ended");
    });

    info!(viewer = %viewer_id, "viewer connected");

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(viewer = %viewer_id, error = %err, "viewer socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => dispatch(&engine, viewer_id, &text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => dispatch(&engine, viewer_id, &text),
                Err(_) => debug!(viewer = %viewer_id, "dropping non-utf8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    engine.hub().disconnect(viewer_id);
    writer.abort();
    info!(viewer = %viewer_id, "viewer disconnected");
}

/// Parses a viewer frame and runs it off the read loop so a slow upstream
/// call never stalls the socket.
fn dispatch(engine: &Engine, viewer_id: ViewerId, text: &str) {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => {
            debug!(viewer = %viewer_id, name = %command.name, "viewer command");
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle_command(viewer_id, command).await });
        }
        Err(err) => warn!(viewer = %viewer_id, error = %err, "malformed viewer frame"),
    }
}
