use std::fmt;
use std::str::FromStr;

use reqwest::Method;
use thiserror::Error;

/// What request body an operation sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPolicy {
    None,
    /// Always sends `{}`; the player endpoints reject a missing body.
    Empty,
    Forward,
}

/// Playback operations a viewer can invoke by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerOperation {
    Play,
    Pause,
    Previous,
    Next,
    RecentlyPlayed,
    CurrentlyPlaying,
    GetPlayer,
    Shuffle,
    Repeat,
    Volume,
    Seek,
    Transfer,
    ListDevices,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown player operation '{0}'")]
pub struct UnknownOperation(pub String);

impl PlayerOperation {
    pub const ALL: [PlayerOperation; 13] = [
        PlayerOperation::Play,
        PlayerOperation::Pause,
        PlayerOperation::Previous,
        PlayerOperation::Next,
        PlayerOperation::RecentlyPlayed,
        PlayerOperation::CurrentlyPlaying,
        PlayerOperation::GetPlayer,
        PlayerOperation::Shuffle,
        PlayerOperation::Repeat,
        PlayerOperation::Volume,
        PlayerOperation::Seek,
        PlayerOperation::Transfer,
        PlayerOperation::ListDevices,
    ];

    /// Short name used on the viewer wire protocol (`player.<name>`).
    pub fn name(self) -> &'static str {
        match self {
            PlayerOperation::Play => "play",
            PlayerOperation::Pause => "pause",
            PlayerOperation::Previous => "previous",
            PlayerOperation::Next => "next",
            PlayerOperation::RecentlyPlayed => "recent",
            PlayerOperation::CurrentlyPlaying => "playing",
            PlayerOperation::GetPlayer => "player",
            PlayerOperation::Shuffle => "shuffle",
            PlayerOperation::Repeat => "repeat",
            PlayerOperation::Volume => "volume",
            PlayerOperation::Seek => "seek",
            PlayerOperation::Transfer => "transfer",
            PlayerOperation::ListDevices => "devices",
        }
    }

    fn endpoint(self) -> (Method, &'static str, BodyPolicy) {
        match self {
            PlayerOperation::Play => (Method::PUT, "me/player/play", BodyPolicy::Forward),
            PlayerOperation::Pause => (Method::PUT, "me/player/pause", BodyPolicy::Empty),
            PlayerOperation::Previous => (Method::POST, "me/player/previous", BodyPolicy::None),
            PlayerOperation::Next => (Method::POST, "me/player/next", BodyPolicy::None),
            PlayerOperation::RecentlyPlayed => {
                (Method::GET, "me/player/recently-played", BodyPolicy::None)
            }
            PlayerOperation::CurrentlyPlaying => {
                (Method::GET, "me/player/currently-playing", BodyPolicy::None)
            }
            PlayerOperation::GetPlayer => (Method::GET, "me/player", BodyPolicy::None),
            PlayerOperation::Shuffle => (Method::PUT, "me/player/shuffle", BodyPolicy::Empty),
            PlayerOperation::Repeat => (Method::PUT, "me/player/repeat", BodyPolicy::Empty),
            PlayerOperation::Volume => (Method::PUT, "me/player/volume", BodyPolicy::Empty),
            PlayerOperation::Seek => (Method::PUT, "me/player/seek", BodyPolicy::Empty),
            PlayerOperation::Transfer => (Method::PUT, "me/player", BodyPolicy::Empty),
            PlayerOperation::ListDevices => (Method::GET, "me/player/devices", BodyPolicy::None),
        }
    }
}

impl FromStr for PlayerOperation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "recently-played" => PlayerOperation::RecentlyPlayed,
            "currently-playing" => PlayerOperation::CurrentlyPlaying,
            "get-player" => PlayerOperation::GetPlayer,
            "list-devices" => PlayerOperation::ListDevices,
            other => PlayerOperation::ALL
                .into_iter()
                .find(|op| op.name() == other)
                .ok_or_else(|| UnknownOperation(other.to_string()))?,
        };
        Ok(op)
    }
}

impl fmt::Display for PlayerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named upstream operation; resolves to a fixed verb and path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Profile,
    User(String),
    Player(PlayerOperation),
}

impl Operation {
    pub fn method(&self) -> Method {
        self.resolve().0
    }

    pub fn path(&self) -> String {
        self.resolve().1
    }

    pub fn body_policy(&self) -> BodyPolicy {
        self.resolve().2
    }

    /// Whether caller-supplied query parameters are forwarded.
    pub fn accepts_query(&self) -> bool {
        !matches!(
            self,
            Operation::Profile | Operation::User(_) | Operation::Player(PlayerOperation::ListDevices)
        )
    }

    fn resolve(&self) -> (Method, String, BodyPolicy) {
        match self {
            Operation::Profile => (Method::GET, "me".to_string(), BodyPolicy::None),
            Operation::User(id) => (Method::GET, format!("users/{}", id), BodyPolicy::None),
            Operation::Player(op) => {
                let (method, path, body) = op.endpoint();
                (method, path.to_string(), body)
            }
        }
    }
}

impl From<PlayerOperation> for Operation {
    fn from(op: PlayerOperation) -> Self {
        Operation::Player(op)
    }
}
