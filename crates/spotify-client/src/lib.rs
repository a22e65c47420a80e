//! Asynchronous client for the Spotify Web API.
//!
//! Consumed by the playback relay. Covers the authorization-code flow
//! (authorize URL, code exchange, refresh) and a fixed table of
//! profile/player operations executed on behalf of a [`Credential`].
//! No session state lives here; callers own credentials and pass them in.

mod client;
mod credential;
mod error;
mod oauth;
mod operation;

pub use client::{classify_response, ApiClient, ApiResponse, RequestParams};
pub use credential::Credential;
pub use error::ClientError;
pub use oauth::{OAuthClient, OAuthConfig};
pub use operation::{BodyPolicy, Operation, PlayerOperation, UnknownOperation};
