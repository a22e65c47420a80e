use std::time::Duration;

use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;
use url::Url;

use crate::{
    credential::Credential,
    error::ClientError,
    operation::{BodyPolicy, Operation},
};

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";

/// Caller-supplied query string and body for an operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RequestParams {
    #[serde(default)]
    pub query: Option<Map<String, Value>>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Successful upstream response.
///
/// 204/202 never carry a body; a body that fails to parse is reported in
/// `error` instead of failing the call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub body: Value,
    pub no_content: bool,
    pub accepted: bool,
    pub error: Option<String>,
}

impl Default for ApiResponse {
    fn default() -> Self {
        Self {
            body: Value::Object(Map::new()),
            no_content: false,
            accepted: false,
            error: None,
        }
    }
}

impl ApiResponse {
    /// Flattens the body and any set status flags into one JSON object.
    pub fn into_fields(self) -> Map<String, Value> {
        let mut fields = match self.body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other);
                map
            }
        };
        if self.no_content {
            fields.insert("no_content".to_string(), Value::Bool(true));
        }
        if self.accepted {
            fields.insert("accepted".to_string(), Value::Bool(true));
        }
        if let Some(error) = self.error {
            fields.insert("error".to_string(), Value::String(error));
        }
        fields
    }
}

/// Turns a raw upstream response into the relay's success/error shape.
pub fn classify_response(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &[u8],
) -> Result<ApiResponse, ClientError> {
    if status.as_u16() > 299 {
        let retry_after = retry_after.and_then(|value| value.trim().parse::<u64>().ok());
        return Err(ClientError::from_status(status, retry_after));
    }
    match status {
        StatusCode::NO_CONTENT => Ok(ApiResponse {
            no_content: true,
            ..ApiResponse::default()
        }),
        StatusCode::ACCEPTED => Ok(ApiResponse {
            accepted: true,
            ..ApiResponse::default()
        }),
        _ => match serde_json::from_slice::<Value>(body) {
            Ok(body) => Ok(ApiResponse {
                body,
                ..ApiResponse::default()
            }),
            Err(err) => {
                warn!(status = status.as_u16(), error = %err, "response body is not valid json");
                Ok(ApiResponse {
                    error: Some(err.to_string()),
                    ..ApiResponse::default()
                })
            }
        },
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    api_base: String,
}

impl ApiClient {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_http_client(http, api_base))
    }

    pub fn with_http_client(http: Client, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { http, api_base }
    }

    /// Full request URL for `operation`, with the query appended when the
    /// operation forwards one.
    pub fn url_for(
        &self,
        operation: &Operation,
        query: Option<&Map<String, Value>>,
    ) -> Result<Url, ClientError> {
        let mut url = Url::parse(&format!("{}/{}", self.api_base, operation.path()))?;
        if let Some(query) = query.filter(|q| !q.is_empty() && operation.accepts_query()) {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                match value {
                    Value::Null => continue,
                    Value::String(text) => pairs.append_pair(key, text),
                    other => pairs.append_pair(key, &other.to_string()),
                };
            }
        }
        Ok(url)
    }

    pub async fn execute(
        &self,
        operation: &Operation,
        params: RequestParams,
        credential: &Credential,
    ) -> Result<ApiResponse, ClientError> {
        let url = self.url_for(operation, params.query.as_ref())?;
        let mut request = self
            .http
            .request(operation.method(), url)
            .header(AUTHORIZATION, credential.authorization());
        match operation.body_policy() {
            BodyPolicy::None => {}
            BodyPolicy::Empty => request = request.json(&json!({})),
            BodyPolicy::Forward => {
                if let Some(body) = params.body.as_ref() {
                    request = request.json(body);
                }
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if status.as_u16() > 299 {
            return classify_response(status, retry_after.as_deref(), &[]);
        }
        let bytes = response.bytes().await?;
        classify_response(status, retry_after.as_deref(), &bytes)
    }
}
