use std::str::FromStr;

use metrics::counter;
use spotify_client::{Operation, PlayerOperation};
use tracing::{debug, warn};

use crate::{
    engine::Engine,
    error::CommandRejection,
    hub::ViewerId,
    protocol::{ClientCommand, RelayEvent, ServerMessage},
};

const PLAYER_FAMILY: &str = "player";

impl Engine {
    /// Runs a viewer command against the named session and answers the
    /// sending viewer only. Nothing is broadcast.
    pub async fn handle_command(&self, viewer: ViewerId, command: ClientCommand) {
        let (id, operation) = match self.resolve(&command) {
            Ok(target) => target,
            Err(rejection) => {
                counter!("playback_relay_commands_total", 1, "outcome" => "rejected");
                debug!(viewer = %viewer, name = %command.name, reason = %rejection, "command rejected");
                self.inner.hub.unicast(
                    &RelayEvent::CommandRejected {
                        request_id: command.request_id,
                        name: command.name,
                        reason: rejection.to_string(),
                    }
                    .into(),
                    viewer,
                );
                return;
            }
        };

        let Some(credential) = self.inner.sessions.credential(&id) else {
            return;
        };
        let result = self
            .inner
            .upstream
            .execute(Operation::Player(operation), command.params(), &credential)
            .await;

        match result {
            Ok(response) => {
                counter!("playback_relay_commands_total", 1, "outcome" => "ok");
                self.inner.hub.unicast(
                    &ServerMessage::Reply {
                        id,
                        request_id: command.request_id,
                        request: operation.name().to_string(),
                        fields: response.into_fields(),
                    },
                    viewer,
                );
            }
            Err(err) => {
                counter!("playback_relay_commands_total", 1, "outcome" => "failed");
                warn!(id = %id, request = operation.name(), error = %err, "player command failed");
            }
        }
    }

    fn resolve(&self, command: &ClientCommand) -> Result<(String, PlayerOperation), CommandRejection> {
        let id = command.id.clone().ok_or(CommandRejection::MissingSession)?;
        if !self.inner.sessions.contains(&id) {
            return Err(CommandRejection::UnknownSession(id));
        }
        let (family, operation) = command.target();
        if family != PLAYER_FAMILY {
            return Err(CommandRejection::UnknownFamily(family.to_string()));
        }
        let operation = operation.unwrap_or_default();
        let operation = PlayerOperation::from_str(operation)
            .map_err(|_| CommandRejection::UnknownOperation(operation.to_string()))?;
        Ok((id, operation))
    }
}
