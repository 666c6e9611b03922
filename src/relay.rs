use crate::config::{ChannelConfig, ChannelType};
use crate::context::{RequestContext, TotalTokensHook, UsageHook};
use crate::error::{AppError, AppResult, ProviderErrorEnvelope, normalize_provider_error};
use crate::preprocess::{apply_model_quirks, chat_extra_billing, filter_empty_messages};
use crate::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, OBJECT_CHAT_COMPLETION, ProviderChatResponse,
    StreamOptions, Usage,
};
use crate::stream::{ChatStream, ChatStreamHandler, spawn_stream_pump};
use crate::tokens::TokenCounter;
use crate::upstream::{Transport, build_chat_request, upstream_error_to_app};
use crate::usage::UsageLedger;
use axum::http::StatusCode;
use std::sync::Arc;

/// Chat completion relay for one OpenAI-compatible channel.
#[derive(Clone)]
pub struct ChatRelay {
    channel: Arc<ChannelConfig>,
    transport: Arc<dyn Transport>,
    counter: Arc<dyn TokenCounter>,
    usage_hook: Option<Arc<dyn UsageHook>>,
}

impl ChatRelay {
    pub fn new(
        channel: Arc<ChannelConfig>,
        transport: Arc<dyn Transport>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        let usage_hook: Option<Arc<dyn UsageHook>> = if channel.fix_total_tokens {
            Some(Arc::new(TotalTokensHook))
        } else {
            None
        };
        Self {
            channel,
            transport,
            counter,
            usage_hook,
        }
    }

    pub fn with_usage_hook(mut self, hook: Arc<dyn UsageHook>) -> Self {
        self.usage_hook = Some(hook);
        self
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    /// Fresh ledger with the prompt tokens estimated from the request.
    pub fn start_ledger(&self, request: &ChatCompletionRequest) -> UsageLedger {
        let model = self.channel.upstream_model(&request.model);
        UsageLedger::new(self.counter.count_messages(&request.messages, model))
    }

    /// Maps the model to its upstream name, then applies that model's quirks.
    fn prepare(&self, request: &mut ChatCompletionRequest) {
        request.model = self.channel.upstream_model(&request.model).to_string();
        apply_model_quirks(request, &self.channel.other);
        if self.channel.channel_type == ChannelType::Custom {
            request.messages = filter_empty_messages(std::mem::take(&mut request.messages));
        }
    }

    fn outbound_body(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> AppResult<serde_json::Value> {
        let mut outbound = request.clone();
        if stream {
            outbound.stream = Some(true);
            outbound.stream_options = self.channel.support_stream_options.then(|| StreamOptions {
                include_usage: true,
                ..StreamOptions::default()
            });
        }
        serde_json::to_value(&outbound).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request_encode_failed",
                err.to_string(),
            )
        })
    }

    /// Single-shot completion. The ledger is only touched once the upstream
    /// answered with a usable body.
    pub async fn create_chat_completion(
        &self,
        mut request: ChatCompletionRequest,
        context: &RequestContext,
        ledger: &mut UsageLedger,
    ) -> AppResult<ChatCompletionResponse> {
        self.prepare(&mut request);
        let body = self.outbound_body(&request, false)?;
        let outbound = build_chat_request(&self.channel, &request.model, body);
        let value = self
            .transport
            .send(outbound)
            .await
            .map_err(upstream_error_to_app)?;
        let provider: ProviderChatResponse = serde_json::from_value(value)
            .map_err(|err| AppError::protocol(format!("invalid upstream response: {err}")))?;

        let envelope = ProviderErrorEnvelope {
            error: provider.error,
        };
        if let Some(err) = normalize_provider_error(&envelope) {
            return Err(err);
        }
        let mut response = provider.response;

        let mut usage = match response.usage.take() {
            Some(mut usage) if usage.completion_tokens > 0 => {
                if let Some(hook) = self.usage_hook.as_ref() {
                    hook.on_usage(&mut usage);
                }
                usage
            }
            _ => {
                let completion_tokens = self
                    .counter
                    .count_text(&response.content_text(), &request.model);
                tracing::debug!(
                    model = %request.model,
                    completion_tokens,
                    "upstream omitted completion usage, estimated from response text"
                );
                Usage {
                    prompt_tokens: ledger.prompt_tokens,
                    completion_tokens,
                    total_tokens: ledger.prompt_tokens.saturating_add(completion_tokens),
                    ..Usage::default()
                }
            }
        };

        ledger.commit(&usage);
        ledger.merge_extra_billing(chat_extra_billing(&request).as_ref());
        usage.total_tokens = ledger.total_tokens;
        usage.extra_billing = ledger.extra_billing.clone();
        response.usage = Some(usage);

        response.model = context.response_model_name(&response.model);
        if response.object.is_empty() {
            response.object = OBJECT_CHAT_COMPLETION.to_string();
        }
        Ok(response)
    }

    /// Streamed completion. On success the ledger moves into the stream pump
    /// and comes back settled through [`ChatStream::usage`].
    pub async fn create_chat_completion_stream(
        &self,
        mut request: ChatCompletionRequest,
        context: Arc<RequestContext>,
        ledger: UsageLedger,
    ) -> AppResult<ChatStream> {
        self.prepare(&mut request);
        let extra_billing = chat_extra_billing(&request);
        let body = self.outbound_body(&request, true)?;
        let outbound = build_chat_request(&self.channel, &request.model, body);
        let upstream = self
            .transport
            .send_raw(outbound)
            .await
            .map_err(upstream_error_to_app)?;

        let handler = ChatStreamHandler::new(extra_billing)
            .with_context(context)
            .with_usage_hook(self.usage_hook.clone())
            .with_reasoning_compat(self.channel.reasoning_compat)
            .with_escape_json(self.channel.stream_escape_json);
        Ok(spawn_stream_pump(
            upstream,
            handler,
            ledger,
            self.counter.clone(),
            request.model,
        ))
    }
}
