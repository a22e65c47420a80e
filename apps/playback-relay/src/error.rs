use spotify_client::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The callback's state token was never issued or was already used.
    #[error("Forbidden")]
    Forbidden,
    #[error("{0}")]
    TokenExchangeFailed(ClientError),
    #[error("profile lookup failed: {0}")]
    ProfileLookupFailed(String),
    #[error("failed to build authorization url: {0}")]
    AuthorizationUrl(ClientError),
}

/// Terminal failure of a scheduled refresh; the session is dropped.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("session has no refresh token")]
    MissingRefreshToken,
    #[error("refreshed token has no lifetime")]
    ZeroLifetime,
    #[error("token refresh rejected: {0}")]
    Upstream(#[from] ClientError),
}

/// Why a viewer command was not executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandRejection {
    #[error("command does not name a session")]
    MissingSession,
    #[error("no active session '{0}'")]
    UnknownSession(String),
    #[error("unknown command family '{0}'")]
    UnknownFamily(String),
    #[error("unknown player operation '{0}'")]
    UnknownOperation(String),
}
