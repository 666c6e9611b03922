use crate::config::{ChannelConfig, ConfigError, load_channel_file};
use crate::error::{AppError, AppResult};
use crate::relay::ChatRelay;
use crate::tokens::TiktokenCounter;
use crate::upstream::HttpTransport;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub metrics: PrometheusHandle,
    pub relay: ChatRelay,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub channel_file: Option<PathBuf>,
    pub upstream_base_url: Option<String>,
    pub upstream_api_key: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("UNIFORMIZE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_empty("UNIFORMIZE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
            channel_file: env_non_empty("UNIFORMIZE_CHANNEL_FILE").map(PathBuf::from),
            upstream_base_url: env_non_empty("UNIFORMIZE_UPSTREAM_BASE_URL"),
            upstream_api_key: env_non_empty("UNIFORMIZE_UPSTREAM_API_KEY").unwrap_or_default(),
        }
    }

    /// The channel file wins; otherwise a plain OpenAI channel is built from
    /// the base URL and key.
    pub fn resolve_channel(&self) -> Result<ChannelConfig, ConfigError> {
        if let Some(path) = self.channel_file.as_ref() {
            return load_channel_file(path);
        }
        let base_url = self.upstream_base_url.as_ref().ok_or_else(|| {
            ConfigError::Invalid(
                "set UNIFORMIZE_CHANNEL_FILE or UNIFORMIZE_UPSTREAM_BASE_URL".to_string(),
            )
        })?;
        let channel = ChannelConfig::openai("default", base_url.clone(), self.upstream_api_key.clone());
        channel.validate()?;
        Ok(channel)
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let channel = runtime.resolve_channel().map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "channel_config_invalid", err.to_string())
    })?;
    load_state_with_channel(runtime, channel).await
}

pub async fn load_state_with_channel(
    runtime: RuntimeConfig,
    channel: ChannelConfig,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("uniformize/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;

    let channel = Arc::new(channel);
    tracing::info!(
        channel_id = %channel.id,
        channel_type = ?channel.channel_type,
        base_url = %channel.base_url,
        "channel configured"
    );
    let transport = Arc::new(HttpTransport::new(http, channel.clone()));
    let relay = ChatRelay::new(channel, transport, Arc::new(TiktokenCounter));

    Ok(AppState {
        runtime: Arc::new(runtime),
        metrics,
        relay,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router();
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
}
