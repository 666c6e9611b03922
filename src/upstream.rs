use crate::config::{ChannelConfig, ChannelType, ProviderAuthConfig, ProviderAuthType};
use crate::error::AppError;
use crate::stream::UpstreamBody;
use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

pub fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    match err.kind {
        UpstreamErrorKind::Decode => AppError::protocol(err.message),
        UpstreamErrorKind::Network | UpstreamErrorKind::Http => {
            AppError::transport(err.status, err.code, err.message)
        }
    }
}

/// A fully resolved upstream call, ready for a [`Transport`].
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub body: Value,
    pub timeout_ms: u64,
}

/// Sends outbound requests. The HTTP implementation is [`HttpTransport`];
/// tests substitute canned responses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: OutboundRequest) -> Result<Value, UpstreamCallError>;

    async fn send_raw(&self, req: OutboundRequest) -> Result<UpstreamBody, UpstreamCallError>;
}

pub fn build_chat_request(channel: &ChannelConfig, model: &str, body: Value) -> OutboundRequest {
    let url = match channel.channel_type {
        ChannelType::Azure => format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            channel.base_url.trim_end_matches('/'),
            model,
            channel.api_version
        ),
        ChannelType::Openai | ChannelType::Custom => {
            join_url(&channel.base_url, "/v1/chat/completions")
        }
    };
    OutboundRequest {
        url,
        body,
        timeout_ms: channel.timeout_ms,
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    channel: Arc<ChannelConfig>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, channel: Arc<ChannelConfig>) -> Self {
        Self { client, channel }
    }

    async fn call_raw(&self, req: OutboundRequest) -> Result<reqwest::Response, UpstreamCallError> {
        let mut builder = self
            .client
            .post(&req.url)
            .timeout(std::time::Duration::from_millis(req.timeout_ms))
            .json(&req.body);
        builder = apply_auth(builder, &self.channel.auth, self.channel.channel_type);
        let resp = builder
            .send()
            .await
            .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let code = extract_error_code(&text);
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                format!("upstream status {}: {}", status, text),
            )
            .with_code(code));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, req: OutboundRequest) -> Result<Value, UpstreamCallError> {
        let resp = self.call_raw(req).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
        })?;
        serde_json::from_str(&text).map_err(|err| {
            UpstreamCallError::new(
                UpstreamErrorKind::Decode,
                Some(status),
                format!("invalid upstream body: {err}"),
            )
        })
    }

    async fn send_raw(&self, req: OutboundRequest) -> Result<UpstreamBody, UpstreamCallError> {
        let resp = self.call_raw(req).await?;
        let status = resp.status();
        Ok(resp
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|err| {
                    UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
                })
            })
            .boxed())
    }
}

fn apply_auth(
    req: reqwest::RequestBuilder,
    auth: &ProviderAuthConfig,
    channel_type: ChannelType,
) -> reqwest::RequestBuilder {
    if channel_type == ChannelType::Azure {
        return req.header("api-key", &auth.value);
    }
    match auth.auth_type {
        ProviderAuthType::Bearer => req.bearer_auth(&auth.value),
        ProviderAuthType::Header => {
            let header_name = auth
                .header_name
                .clone()
                .unwrap_or_else(|| "x-api-key".to_string());
            req.header(header_name, &auth.value)
        }
        ProviderAuthType::Query => {
            let query_name = auth
                .query_name
                .clone()
                .unwrap_or_else(|| "api_key".to_string());
            req.query(&[(query_name, auth.value.as_str())])
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let code = value.get("error").and_then(|v| v.get("code"))?;
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
