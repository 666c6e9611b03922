use crate::app::AppState;
use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::protocol::ChatCompletionRequest;
use crate::stream::{ChatStream, StreamEvent};
use crate::usage::UsageLedger;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>) -> AppResult<Response> {
    let mut model_ids: Vec<String> = state
        .relay
        .channel()
        .model_map
        .keys()
        .cloned()
        .collect();
    model_ids.sort();
    model_ids.dedup();

    let data: Vec<Value> = model_ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "uniformize"
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let req = parse_chat_request(body)?;
    let context = RequestContext::new(req.model.clone()).with_request_id(extract_request_id(&headers));
    let ledger = state.relay.start_ledger(&req);

    if req.is_stream() {
        let context = Arc::new(context);
        return match state
            .relay
            .create_chat_completion_stream(req, context.clone(), ledger)
            .await
        {
            Ok(stream) => Ok(Sse::new(stream_to_sse(stream, context)).into_response()),
            Err(err) => {
                tracing::warn!(model = %context.requested_model, "stream setup failed: {}", err.message);
                Ok(Sse::new(error_to_sse_stream(&err)).into_response())
            }
        };
    }

    let mut ledger = ledger;
    let resp = state
        .relay
        .create_chat_completion(req, &context, &mut ledger)
        .await?;
    record_usage(&context, &ledger, false);
    Ok(Json(resp).into_response())
}

fn parse_chat_request(body: Value) -> AppResult<ChatCompletionRequest> {
    let req: ChatCompletionRequest = serde_json::from_value(body).map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
    })?;
    if req.model.trim().is_empty() {
        return Err(
            AppError::new(StatusCode::BAD_REQUEST, "missing_model", "model is required")
                .with_param("model"),
        );
    }
    if req.messages.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "missing_messages",
            "messages must not be empty",
        )
        .with_param("messages"));
    }
    Ok(req)
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    let id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    Some(id)
}

/// Logs the settled ledger and feeds the token counters. Called exactly once
/// per request that reached the upstream.
fn record_usage(context: &RequestContext, ledger: &UsageLedger, is_stream: bool) {
    let model = context.requested_model.clone();
    metrics::counter!("uniformize_prompt_tokens_total", "model" => model.clone())
        .increment(ledger.prompt_tokens);
    metrics::counter!("uniformize_completion_tokens_total", "model" => model.clone())
        .increment(ledger.completion_tokens);
    tracing::info!(
        model = %model,
        request_id = context.request_id.as_deref().unwrap_or("-"),
        is_stream,
        prompt_tokens = ledger.prompt_tokens,
        completion_tokens = ledger.completion_tokens,
        total_tokens = ledger.total_tokens,
        extra_billing = ?ledger.extra_billing,
        "usage recorded"
    );
}

fn stream_to_sse(
    stream: ChatStream,
    context: Arc<RequestContext>,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let ChatStream { events, usage } = stream;
    tokio::spawn(async move {
        match usage.await {
            Ok(ledger) => record_usage(&context, &ledger, true),
            Err(err) => tracing::warn!("stream usage task failed: {err}"),
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(events)
        .flat_map(|event| futures_util::stream::iter(stream_event_to_sse(event)))
        .map(Ok)
}

fn stream_event_to_sse(event: StreamEvent) -> Vec<Event> {
    match event {
        StreamEvent::Data(data) => vec![Event::default().data(data)],
        StreamEvent::Done => vec![Event::default().data("[DONE]")],
        StreamEvent::Error(err) => vec![
            Event::default().data(err.to_json().to_string()),
            Event::default().data("[DONE]"),
        ],
    }
}

fn error_to_sse_stream(
    err: &AppError,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let events = vec![
        Event::default().data(err.to_json().to_string()),
        Event::default().data("[DONE]"),
    ];
    futures_util::stream::iter(events.into_iter().map(Ok))
}
