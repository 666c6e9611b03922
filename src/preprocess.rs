use crate::protocol::{ChatCompletionRequest, ChatMessage, ExtraBilling, TOLL_WEB_SEARCH_PREVIEW};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// The one gpt-5 variant that still accepts `temperature`.
pub const GPT5_CHAT_LATEST: &str = "gpt-5-chat-latest";

const SEARCH_PREVIEW_MARKER: &str = "search-preview";
const DEFAULT_SEARCH_CONTEXT_SIZE: &str = "medium";

static REASONING_MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^o[1-9]").expect("static regex"));

pub fn is_reasoning_model(model: &str) -> bool {
    REASONING_MODEL_RE.is_match(model) || has_prefix_ignore_case(model, "gpt-5")
}

fn has_prefix_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Rewrites a request for o-series and gpt-5 models, which reject
/// `max_tokens` and sampling temperature. `other_arg` is the channel's
/// reasoning effort override.
pub fn apply_model_quirks(request: &mut ChatCompletionRequest, other_arg: &str) {
    if !is_reasoning_model(&request.model) {
        return;
    }
    if let Some(max_tokens) = request.max_tokens.filter(|n| *n > 0) {
        request.max_completion_tokens = Some(max_tokens);
        request.max_tokens = None;
    }
    if request.model != GPT5_CHAT_LATEST {
        request.temperature = None;
    }
    if !other_arg.is_empty() {
        request.reasoning_effort = Some(other_arg.to_string());
    }
}

/// Extra billing tags implied by the request shape alone.
pub fn chat_extra_billing(request: &ChatCompletionRequest) -> Option<HashMap<String, ExtraBilling>> {
    if !request.model.contains(SEARCH_PREVIEW_MARKER) {
        return None;
    }
    let search_type = request
        .web_search_options
        .as_ref()
        .map(|opts| opts.search_context_size.as_str())
        .filter(|size| !size.is_empty())
        .unwrap_or(DEFAULT_SEARCH_CONTEXT_SIZE);

    let mut billing = HashMap::new();
    billing.insert(
        TOLL_WEB_SEARCH_PREVIEW.to_string(),
        ExtraBilling {
            billing_type: search_type.to_string(),
            call_count: 1,
        },
    );
    Some(billing)
}

/// Drops messages with no content. Assistant turns that only carry tool calls
/// are kept.
pub fn filter_empty_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|message| message.has_content() || message.has_tool_calls())
        .collect()
}
