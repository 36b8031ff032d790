use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Optional HTTP listener serving GET /health for load-balancer checks.
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_bind: None,
            outbound_queue_capacity: default_outbound_queue_capacity(),
            liveness_interval_ms: default_liveness_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the signing-key service; the JWKS document is fetched
    /// from <keys_url>/.well-known/jwks.json.
    pub keys_url: String,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_expiry_interval_ms")]
    pub expiry_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// WebSocket URL of the shared event bus this gateway subscribes to.
    pub url: String,
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_owned()
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_liveness_interval_ms() -> u64 {
    30_000
}

fn default_grace_ms() -> u64 {
    10_000
}

fn default_expiry_interval_ms() -> u64 {
    1_000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli_overrides(
        &mut self,
        bind: Option<&str>,
        events_url: Option<&str>,
        keys_url: Option<&str>,
    ) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if let Some(url) = events_url {
            self.events.url = url.to_owned();
        }
        if let Some(url) = keys_url {
            self.auth.keys_url = url.to_owned();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }
        if self.server.outbound_queue_capacity == 0 {
            bail!("server.outbound_queue_capacity must be at least 1");
        }
        if self.server.liveness_interval_ms == 0 {
            bail!("server.liveness_interval_ms must be at least 1");
        }
        if self.auth.grace_ms == 0 {
            bail!("auth.grace_ms must be at least 1");
        }
        if self.auth.expiry_interval_ms == 0 {
            bail!("auth.expiry_interval_ms must be at least 1");
        }
        if !self.auth.keys_url.starts_with("http://") && !self.auth.keys_url.starts_with("https://")
        {
            bail!("auth.keys_url must be an http(s) URL");
        }
        if !self.events.url.starts_with("ws://") && !self.events.url.starts_with("wss://") {
            bail!("events.url must be a ws(s) URL");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_applies_defaults() -> Result<()> {
        let config = parse(
            r#"
            [server]

            [auth]
            keys_url = "https://keys.internal"

            [events]
            url = "wss://bus.internal/events"
            "#,
        )?;
        assert_eq!(config.server.bind, "127.0.0.1:8090");
        assert_eq!(config.server.http_bind, None);
        assert_eq!(config.server.outbound_queue_capacity, 64);
        assert_eq!(config.server.liveness_interval_ms, 30_000);
        assert_eq!(config.auth.grace_ms, 10_000);
        assert_eq!(config.auth.expiry_interval_ms, 1_000);
        Ok(())
    }

    #[test]
    fn full_config_round_trips() -> Result<()> {
        let config = parse(
            r#"
            [server]
            bind = "0.0.0.0:9000"
            http_bind = "0.0.0.0:9001"
            outbound_queue_capacity = 128
            liveness_interval_ms = 15000

            [auth]
            keys_url = "https://keys.internal/"
            grace_ms = 5000
            expiry_interval_ms = 500

            [events]
            url = "ws://bus.internal:7000"
            "#,
        )?;
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.http_bind.as_deref(), Some("0.0.0.0:9001"));
        assert_eq!(config.auth.grace_ms, 5_000);
        assert_eq!(config.auth.expiry_interval_ms, 500);
        Ok(())
    }

    #[test]
    fn bad_urls_are_rejected() {
        let base = |keys: &str, events: &str| {
            format!(
                r#"
                [server]

                [auth]
                keys_url = "{keys}"

                [events]
                url = "{events}"
                "#
            )
        };
        assert!(parse(&base("ftp://keys", "ws://bus")).is_err());
        assert!(parse(&base("https://keys", "https://bus")).is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let text = r#"
            [server]
            liveness_interval_ms = 0

            [auth]
            keys_url = "https://keys.internal"

            [events]
            url = "ws://bus.internal"
        "#;
        assert!(parse(text).is_err());
    }
}
