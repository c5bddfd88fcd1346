//! Configuration for Tachikoma
//!
//! Configuration is layered, lowest precedence first:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. A TOML file, `~/.tachikoma/config.toml` unless another path is given
//! 3. `.env` and process environment variables (`MQTT_*`, `OLLAMA_*`, `GOOGLE_*`)
//! 4. Command-line flags, applied by the binary
//!
//! # Example
//!
//! ```toml
//! [bus]
//! host = "broker.local"
//! channel = "lobby"
//!
//! [agent]
//! speaker_id = "tachikoma-blue"
//! system_prompt = "Answer briefly."
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TachikomaError};
use crate::topic::TopicTemplate;

/// Default topic template.
pub const DEFAULT_TOPIC_TEMPLATE: &str =
    "{namespace}/{channel}/{speaker_id}/{status}/{role}/{phase}/{context_id}";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub backend: BackendConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
}

/// Publish/subscribe transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// Base client id; the process id is appended when connecting
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: String,
    pub channel: String,
    pub topic_template: String,
    pub keep_alive_secs: u64,
    pub reconnect_secs: u64,
    /// Maximum wait for a publish acknowledgement
    pub ack_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "tachikoma".to_string(),
            username: None,
            password: None,
            namespace: "a2a".to_string(),
            channel: "default".to_string(),
            topic_template: DEFAULT_TOPIC_TEMPLATE.to_string(),
            keep_alive_secs: 30,
            reconnect_secs: 1,
            ack_timeout_secs: 30,
        }
    }
}

impl BusConfig {
    /// Client id unique to this process.
    pub fn session_client_id(&self) -> String {
        format!("{}-{}", self.client_id, std::process::id())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Generation backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "cogito:14b".to_string(),
            embedding_model: "mxbai-embed-large".to_string(),
        }
    }
}

/// Run loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity this agent speaks as on the bus
    pub speaker_id: String,
    /// Identity used by the interactive user participant
    pub user_id: String,
    pub system_prompt: String,
    /// Maximum silence between two streamed fragments
    pub stream_timeout_secs: u64,
    /// Maximum latency of a single tool invocation
    pub tool_timeout_secs: u64,
    /// Publish `role=tool` messages on the bus before regenerating
    pub publish_tool_results: bool,
    /// Messages kept when loading history on start
    pub history_limit: usize,
    /// Consecutive tool rounds allowed before a turn is abandoned
    pub max_tool_rounds: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            speaker_id: "tachikoma".to_string(),
            user_id: "user".to_string(),
            system_prompt: "You are one participant in a group chat. Reply concisely.".to_string(),
            stream_timeout_secs: 120,
            tool_timeout_secs: 60,
            publish_tool_results: false,
            history_limit: 200,
            max_tool_rounds: 8,
        }
    }
}

impl AgentConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Tool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub google_api_key: Option<String>,
    pub google_cse_id: Option<String>,
    pub scrape_max_chars: usize,
    pub recall_limit: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            google_api_key: None,
            google_cse_id: None,
            scrape_max_chars: 3000,
            recall_limit: 10,
        }
    }
}

impl Config {
    /// Directory holding config and history (`~/.tachikoma`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tachikoma")
    }

    /// Default config file path.
    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    /// Load defaults, then the TOML file (if present), then `.env` and the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed, an environment value is
    /// malformed, or the result fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        let mut config = if path.exists() {
            Self::from_toml(&std::fs::read_to_string(&path)?)?
        } else {
            Self::default()
        };
        dotenvy::dotenv().ok();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing fields keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TachikomaError::Config(e.to_string()))
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get("MQTT_HOSTNAME") {
            self.bus.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            self.bus.port = port
                .parse()
                .map_err(|_| TachikomaError::Config(format!("MQTT_PORT is not a port: {}", port)))?;
        }
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            self.agent.speaker_id = client_id.clone();
            self.bus.client_id = client_id;
        }
        if let Some(user_id) = get("MQTT_USER_ID") {
            self.agent.user_id = user_id;
        }
        if let Some(username) = get("MQTT_USERNAME") {
            self.bus.username = Some(username);
        }
        if let Some(password) = get("MQTT_PASSWORD") {
            self.bus.password = Some(password);
        }
        if let Some(channel) = get("MQTT_TOPIC") {
            self.bus.channel = channel;
        }
        if let Some(template) = get("MQTT_TOPIC_PREFIX") {
            self.bus.topic_template = template;
        }
        if let Some(url) = get("OLLAMA_HOST") {
            self.backend.base_url = url;
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            self.backend.model = model;
        }
        if let Some(key) = get("GOOGLE_API_KEY") {
            self.tools.google_api_key = Some(key);
        }
        if let Some(cx) = get("GOOGLE_CSE_ID") {
            self.tools.google_cse_id = Some(cx);
        }
        Ok(())
    }

    /// Reject configurations the run loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.agent.speaker_id.trim().is_empty() {
            return Err(TachikomaError::Config("speaker_id must not be empty".into()));
        }
        if self.bus.port == 0 {
            return Err(TachikomaError::Config("bus port must not be 0".into()));
        }
        if self.agent.stream_timeout_secs == 0 {
            return Err(TachikomaError::Config("stream_timeout_secs must be at least 1".into()));
        }
        if self.agent.tool_timeout_secs == 0 {
            return Err(TachikomaError::Config("tool_timeout_secs must be at least 1".into()));
        }
        if self.bus.ack_timeout_secs == 0 {
            return Err(TachikomaError::Config("ack_timeout_secs must be at least 1".into()));
        }
        if self.bus.channel.contains('/') {
            return Err(TachikomaError::Config("channel must be a single topic segment".into()));
        }
        TopicTemplate::parse(&self.bus.topic_template)?;
        Ok(())
    }

    /// Template parsed from `bus.topic_template`.
    pub fn topic_template(&self) -> Result<TopicTemplate> {
        TopicTemplate::parse(&self.bus.topic_template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.tools.scrape_max_chars, 3000);
        assert!(!config.agent.publish_tool_results);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            [bus]
            host = "broker.local"
            channel = "lobby"

            [agent]
            speaker_id = "blue"
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.host, "broker.local");
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.agent.speaker_id, "blue");
        assert_eq!(config.backend.model, "cogito:14b");
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = Config::from_toml("[bus]\nport = \"x\"").unwrap_err();
        assert!(matches!(err, TachikomaError::Config(_)));
    }

    #[test]
    fn test_apply_env() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOSTNAME", "mqtt.example"),
            ("MQTT_PORT", "8883"),
            ("MQTT_CLIENT_ID", "red"),
            ("MQTT_TOPIC", "lab"),
            ("MQTT_PASSWORD", ""),
            ("GOOGLE_API_KEY", "key"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bus.host, "mqtt.example");
        assert_eq!(config.bus.port, 8883);
        assert_eq!(config.agent.speaker_id, "red");
        assert_eq!(config.bus.client_id, "red");
        assert_eq!(config.bus.channel, "lab");
        assert_eq!(config.bus.password, None);
        assert_eq!(config.tools.google_api_key.as_deref(), Some("key"));
    }

    #[test]
    fn test_apply_env_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env(|k| (k == "MQTT_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.agent.speaker_id = " ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.topic_template = "{namespace}/{bogus}".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.channel = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.agent.stream_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(TachikomaError::Config(m)) if m.contains("stream_timeout_secs")));

        let mut config = Config::default();
        config.agent.tool_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(TachikomaError::Config(m)) if m.contains("tool_timeout_secs")));

        let mut config = Config::default();
        config.bus.ack_timeout_secs = 0;
        assert!(config.validate().is_err());

        let config = Config::from_toml("[agent]\nstream_timeout_secs = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_client_id_has_pid() {
        let config = BusConfig::default();
        assert_eq!(
            config.session_client_id(),
            format!("tachikoma-{}", std::process::id())
        );
    }
}
