use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{
    client::{classify_response, DEFAULT_API_BASE},
    credential::Credential,
    error::ClientError,
};

pub const DEFAULT_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Application registration used for the authorization-code flow.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl OAuthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_authorize_url(mut self, url: impl Into<String>) -> Self {
        self.authorize_url = url.into();
        self
    }

    #[must_use]
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    #[must_use]
    pub fn with_api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = url.into();
        self
    }
}

/// Token endpoint client. Authenticates with the client id/secret pair
/// over HTTP basic auth and posts form-encoded grants.
#[derive(Clone)]
pub struct OAuthClient {
    config: OAuthConfig,
    http: Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig, timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Upstream authorization URL for a freshly minted `state` token.
    pub fn authorization_url(&self, state: &str) -> Result<String, ClientError> {
        let mut url = Url::parse(&self.config.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Credential, ClientError> {
        self.grant(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential, ClientError> {
        self.grant(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn grant(&self, form: &[(&str, &str)]) -> Result<Credential, ClientError> {
        debug!(grant_type = form[0].1, "requesting token grant");
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await?;
        let parsed = classify_response(status, retry_after.as_deref(), &bytes)?;
        if let Some(err) = parsed.error {
            return Err(ClientError::InvalidTokenResponse(err));
        }
        parse_grant(parsed.body)
    }
}

/// Decodes a token endpoint body. A grant without a positive `expires_in`
/// cannot be scheduled for renewal and is rejected.
fn parse_grant(body: serde_json::Value) -> Result<Credential, ClientError> {
    let credential = serde_json::from_value::<Credential>(body)
        .map_err(|err| ClientError::InvalidTokenResponse(err.to_string()))?;
    if credential.expires_in == 0 {
        return Err(ClientError::InvalidTokenResponse(
            "expires_in must be positive".to_string(),
        ));
    }
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn client() -> OAuthClient {
        let config = OAuthConfig::new(
            "client-123",
            "secret",
            "http://localhost:3000/redirect",
            vec!["user-read-playback-state".into(), "user-modify-playback-state".into()],
        );
        OAuthClient::new(config, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn authorization_url_carries_flow_parameters() {
        let url = client().authorization_url("state-abc").unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("accounts.spotify.com"));
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("client_id".into(), "client-123".into())));
        assert!(pairs.contains(&(
            "scope".into(),
            "user-read-playback-state user-modify-playback-state".into()
        )));
        assert!(pairs.contains(&(
            "redirect_uri".into(),
            "http://localhost:3000/redirect".into()
        )));
        assert!(pairs.contains(&("state".into(), "state-abc".into())));
    }

    #[test]
    fn grant_requires_positive_lifetime() {
        let grant = parse_grant(json!({"access_token": "a1", "expires_in": 3600})).unwrap();
        assert_eq!(grant.expires_in, 3600);

        for body in [
            json!({"access_token": "a1", "expires_in": 0}),
            json!({"access_token": "a1"}),
        ] {
            let err = parse_grant(body).unwrap_err();
            assert!(matches!(err, ClientError::InvalidTokenResponse(_)), "{err}");
        }
    }

    #[test]
    fn overrides_replace_default_endpoints() {
        let config = OAuthConfig::new("id", "secret", "http://localhost/cb", vec![])
            .with_authorize_url("http://127.0.0.1:9000/authorize")
            .with_token_url("http://127.0.0.1:9000/token")
            .with_api_base("http://127.0.0.1:9000/v1");
        assert_eq!(config.token_url, "http://127.0.0.1:9000/token");
        let client = OAuthClient::new(config, Duration::from_secs(1)).unwrap();
        let url = client.authorization_url("s").unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/authorize?"));
    }
}
