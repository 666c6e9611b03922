use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read channel file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid channel file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid channel config: {0}")]
    Invalid(String),
}

/// One upstream channel: where to send requests and which provider quirks to
/// apply to its responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub channel_type: ChannelType,
    pub base_url: String,
    pub auth: ProviderAuthConfig,
    /// Free-form channel hint; for o-series and gpt-5 models it becomes the
    /// reasoning effort.
    #[serde(default)]
    pub other: String,
    /// Client model name to upstream model name.
    #[serde(default)]
    pub model_map: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub support_stream_options: bool,
    #[serde(default)]
    pub stream_escape_json: bool,
    #[serde(default)]
    pub reasoning_compat: bool,
    #[serde(default)]
    pub fix_total_tokens: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Openai,
    Azure,
    Custom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: ProviderAuthType,
    pub value: String,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub query_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAuthType {
    Bearer,
    Header,
    Query,
}

impl ChannelConfig {
    pub fn openai(id: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel_type: ChannelType::Openai,
            base_url: base_url.into(),
            auth: ProviderAuthConfig {
                auth_type: ProviderAuthType::Bearer,
                value: api_key.into(),
                header_name: None,
                query_name: None,
            },
            other: String::new(),
            model_map: HashMap::new(),
            support_stream_options: true,
            stream_escape_json: false,
            reasoning_compat: false,
            fix_total_tokens: false,
            timeout_ms: default_timeout_ms(),
            api_version: default_azure_api_version(),
        }
    }

    pub fn upstream_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_map
            .get(requested)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(requested)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("id must not be empty".to_string()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be http(s): {}",
                self.base_url
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

pub fn load_channel_file(path: impl AsRef<Path>) -> Result<ChannelConfig, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    let channel: ChannelConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
    channel.validate()?;
    Ok(channel)
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_azure_api_version() -> String {
    "2024-10-21".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_channel_gets_defaults() {
        let channel: ChannelConfig = serde_json::from_value(json!({
            "id": "main",
            "base_url": "https://api.example.com/v1",
            "auth": { "type": "bearer", "value": "sk-test" }
        }))
        .expect("channel");
        assert_eq!(channel.channel_type, ChannelType::Openai);
        assert!(channel.support_stream_options);
        assert!(!channel.reasoning_compat);
        assert_eq!(channel.timeout_ms, 300_000);
        channel.validate().expect("valid");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<ChannelConfig>(json!({
            "id": "main",
            "base_url": "https://api.example.com",
            "auth": { "type": "bearer", "value": "k" },
            "retries": 3
        }));
        assert!(result.is_err());
    }

    #[test]
    fn model_map_falls_back_to_requested() {
        let mut channel = ChannelConfig::openai("c", "http://localhost", "k");
        channel
            .model_map
            .insert("fast".to_string(), " gpt-4o-mini ".to_string());
        channel.model_map.insert("blank".to_string(), "  ".to_string());
        assert_eq!(channel.upstream_model("fast"), "gpt-4o-mini");
        assert_eq!(channel.upstream_model("blank"), "blank");
        assert_eq!(channel.upstream_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn validate_rejects_bad_base_url() {
        let channel = ChannelConfig::openai("c", "ftp://nope", "k");
        assert!(matches!(channel.validate(), Err(ConfigError::Invalid(_))));
    }
}
