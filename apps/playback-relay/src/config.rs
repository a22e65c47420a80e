use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use spotify_client::OAuthConfig;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(
    name = "playback-relay",
    author,
    version,
    about = "Relays live Spotify playback to WebSocket viewers"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "PLAYBACK_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// YAML file holding the OAuth client settings. Missing is fine when
    /// everything comes from the environment.
    #[arg(long, default_value = "config.yaml")]
    pub config: String,

    /// Redis URL; when set, sessions survive restarts.
    #[arg(long, env = "PERSIST")]
    pub persist: Option<String>,

    /// Timeout applied to every upstream HTTP call.
    #[arg(long, env = "PLAYBACK_RELAY_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config option \"{name}\" or environment variable \"{env}\" not set")]
    MissingOption { name: &'static str, env: &'static str },
    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub persist: Option<String>,
    pub http_timeout: Duration,
    pub oauth: OAuthConfig,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let oauth = load_oauth(&cli.config, None)
            .with_context(|| format!("failed to load OAuth settings from {}", cli.config))?;
        Ok(ServerConfig {
            listen_addr,
            persist: cli.persist.filter(|url| !url.trim().is_empty()),
            http_timeout: Duration::from_secs(cli.http_timeout_secs),
            oauth,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawOAuthSettings {
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<ScopeValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScopeValue {
    List(Vec<String>),
    Text(String),
}

/// Reads the optional YAML file at `path`, then overlays `CLIENT_ID`,
/// `CLIENT_SECRET`, `SCOPE` and `REDIRECT_URI` from the environment (or
/// from `env` when given).
pub fn load_oauth(path: &str, env: Option<HashMap<String, String>>) -> Result<OAuthConfig, ConfigError> {
    let raw: RawOAuthSettings = config::Config::builder()
        .add_source(
            config::File::with_name(path)
                .format(config::FileFormat::Yaml)
                .required(false),
        )
        .add_source(config::Environment::default().source(env))
        .build()?
        .try_deserialize()?;

    let client_id = required(raw.client_id, "client_id", "CLIENT_ID")?;
    let client_secret = required(raw.client_secret, "client_secret", "CLIENT_SECRET")?;
    let redirect_uri = required(raw.redirect_uri, "redirect_uri", "REDIRECT_URI")?;
    let scopes = match raw.scope {
        Some(ScopeValue::List(scopes)) => scopes,
        Some(ScopeValue::Text(text)) => parse_scope(&text),
        None => {
            return Err(ConfigError::MissingOption {
                name: "scope",
                env: "SCOPE",
            })
        }
    };

    Ok(OAuthConfig::new(client_id, client_secret, redirect_uri, scopes))
}

fn required(value: Option<String>, name: &'static str, env: &'static str) -> Result<String, ConfigError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingOption { name, env })
}

/// Accepts `[a, b]`, `a,b` or `a b`.
pub fn parse_scope(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|scope| scope.trim_matches(|c| c == '"' || c == '\''))
        .filter(|scope| !scope.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    #[test]
    fn scope_accepts_common_list_shapes() {
        let expected = vec!["user-read-playback-state", "user-modify-playback-state"];
        assert_eq!(
            parse_scope("[user-read-playback-state, user-modify-playback-state]"),
            expected
        );
        assert_eq!(
            parse_scope("user-read-playback-state,user-modify-playback-state"),
            expected
        );
        assert_eq!(
            parse_scope("user-read-playback-state user-modify-playback-state"),
            expected
        );
        assert!(parse_scope("[]").is_empty());
    }

    #[test]
    fn environment_supplies_every_option() {
        let oauth = load_oauth(
            "does-not-exist.yaml",
            env(&[
                ("CLIENT_ID", "abc"),
                ("CLIENT_SECRET", "shh"),
                ("REDIRECT_URI", "http://localhost:3000/redirect"),
                ("SCOPE", "[user-read-playback-state]"),
            ]),
        )
        .unwrap();
        assert_eq!(oauth.client_id, "abc");
        assert_eq!(oauth.client_secret, "shh");
        assert_eq!(oauth.redirect_uri, "http://localhost:3000/redirect");
        assert_eq!(oauth.scopes, vec!["user-read-playback-state"]);
    }

    #[test]
    fn missing_option_names_its_variable() {
        let err = load_oauth(
            "does-not-exist.yaml",
            env(&[("CLIENT_ID", "abc"), ("SCOPE", "a")]),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "config option \"client_secret\" or environment variable \"CLIENT_SECRET\" not set"
        );
    }

    #[test]
    fn yaml_file_is_overlaid_by_environment() {
        let path = std::env::temp_dir().join(format!("playback-relay-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "client_id: from-file\nclient_secret: file-secret\nredirect_uri: http://file/redirect\nscope:\n  - streaming\n  - user-read-email\n",
        )
        .unwrap();

        let oauth = load_oauth(path.to_str().unwrap(), env(&[("CLIENT_ID", "from-env")])).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(oauth.client_id, "from-env");
        assert_eq!(oauth.client_secret, "file-secret");
        assert_eq!(oauth.scopes, vec!["streaming", "user-read-email"]);
    }
}
