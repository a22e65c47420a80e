use std::time::Duration;

use async_trait::async_trait;
use spotify_client::{
    ApiClient, ApiResponse, ClientError, Credential, OAuthClient, OAuthConfig, Operation,
    RequestParams,
};

/// The upstream service as seen by the engine.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn authorization_url(&self, state: &str) -> Result<String, ClientError>;

    async fn exchange_code(&self, code: &str) -> Result<Credential, ClientError>;

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ClientError>;

    async fn execute(
        &self,
        operation: Operation,
        params: RequestParams,
        credential: &Credential,
    ) -> Result<ApiResponse, ClientError>;
}

pub struct SpotifyUpstream {
    oauth: OAuthClient,
    api: ApiClient,
}

impl SpotifyUpstream {
    pub fn new(config: OAuthConfig, timeout: Duration) -> Result<Self, ClientError> {
        let api = ApiClient::new(config.api_base.clone(), timeout)?;
        let oauth = OAuthClient::new(config, timeout)?;
        Ok(Self { oauth, api })
    }
}

#[async_trait]
impl Upstream for SpotifyUpstream {
    fn authorization_url(&self, state: &str) -> Result<String, ClientError> {
        self.oauth.authorization_url(state)
    }

    async fn exchange_code(&self, code: &str) -> Result<Credential, ClientError> {
        self.oauth.exchange_code(code).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ClientError> {
        self.oauth.refresh(refresh_token).await
    }

    async fn execute(
        &self,
        operation: Operation,
        params: RequestParams,
        credential: &Credential,
    ) -> Result<ApiResponse, ClientError> {
        self.api.execute(&operation, params, credential).await
    }
}
