use crate::error::ProviderError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const OBJECT_CHAT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";

/// Billing key for web-search-augmented chat models.
pub const TOLL_WEB_SEARCH_PREVIEW: &str = "web_search_preview";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_options: Option<WebSearchOptions>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default, deserialize_with = "null_as_default")]
    pub include_usage: bool,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchOptions {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub search_context_size: String,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(Value::String(content.into())),
            extra_body: HashMap::new(),
        }
    }

    /// Concatenated text of a string content or of the `text` items of a
    /// multipart content array.
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }

    pub fn has_content(&self) -> bool {
        match &self.content {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.extra_body
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .is_some_and(|calls| !calls.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraBilling {
    #[serde(rename = "type")]
    pub billing_type: String,
    pub call_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub prompt_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completion_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_billing: Option<HashMap<String, ExtraBilling>>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub object: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

impl ChatCompletionResponse {
    /// Assistant text across all choices, used for completion token estimation.
    pub fn content_text(&self) -> String {
        self.choices
            .iter()
            .map(|choice| choice.message.content_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub index: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

/// Non-streaming body as an OpenAI-compatible upstream returns it: either a
/// completion or an `error` object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderChatResponse {
    #[serde(default)]
    pub error: Option<ProviderError>,
    #[serde(flatten)]
    pub response: ChatCompletionResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionStreamResponse {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub object: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub choices: Vec<ChatCompletionStreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

impl ChatCompletionStreamResponse {
    pub fn response_text(&self) -> String {
        let mut out = String::new();
        for choice in &self.choices {
            if let Some(content) = choice.delta.content.as_deref() {
                out.push_str(content);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionStreamChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub index: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub delta: ChatCompletionDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Some providers nest usage inside the first choice instead of the chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Legacy field some providers use instead of `reasoning_content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

/// One decoded upstream stream frame, error object included.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderChatStreamResponse {
    #[serde(default)]
    pub error: Option<ProviderError>,
    #[serde(flatten)]
    pub chunk: ChatCompletionStreamResponse,
}

/// Reads an explicit `null` the same way as a missing field. Providers send
/// `"choices": null` or `"delta": null` on heartbeat and finish frames.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_preserves_unknown_fields() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "hi", "name": "bob" }],
            "top_p": 0.5,
            "tools": []
        }))
        .expect("request");
        assert_eq!(req.extra_body.get("top_p"), Some(&json!(0.5)));
        assert_eq!(req.messages[0].extra_body.get("name"), Some(&json!("bob")));
        let back = serde_json::to_value(&req).expect("encode");
        assert_eq!(back["top_p"], json!(0.5));
        assert!(back.get("max_tokens").is_none());
    }

    #[test]
    fn multipart_content_text_joins_text_items() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "hello " },
                { "type": "image_url", "image_url": { "url": "http://x" } },
                { "type": "text", "text": "world" }
            ]
        }))
        .expect("message");
        assert_eq!(msg.content_text(), "hello world");
        assert!(msg.has_content());
    }

    #[test]
    fn stream_frame_splits_error_from_chunk() {
        let frame: ProviderChatStreamResponse = serde_json::from_str(
            r#"{"error":{"message":"boom","type":"server_error"},"id":"x","choices":[]}"#,
        )
        .expect("frame");
        assert_eq!(frame.error.expect("error").message, "boom");
        assert_eq!(frame.chunk.id, "x");
        assert!(!frame.chunk.extra_body.contains_key("error"));
    }

    #[test]
    fn delta_keeps_unknown_fields_on_reencode() {
        let chunk: ChatCompletionStreamResponse = serde_json::from_str(
            r#"{"id":"c1","model":"m","choices":[{"index":0,"delta":{"content":"a","tool_calls":[{"index":0}]},"finish_reason":null,"logprobs":null}],"system_fingerprint":"fp"}"#,
        )
        .expect("chunk");
        let value = serde_json::to_value(&chunk).expect("encode");
        assert_eq!(value["system_fingerprint"], "fp");
        assert_eq!(value["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
        assert!(value["choices"][0].get("usage").is_none());
    }

    #[test]
    fn null_fields_read_as_defaults() {
        let resp: ProviderChatResponse = serde_json::from_str(
            r#"{"id":null,"object":null,"created":null,"model":null,"choices":[{"index":null,"message":null,"finish_reason":"stop"}],"usage":{"prompt_tokens":null,"completion_tokens":4,"total_tokens":null}}"#,
        )
        .expect("response");
        assert!(resp.error.is_none());
        let resp = resp.response;
        assert_eq!(resp.id, "");
        assert_eq!(resp.created, 0);
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].message.role, "");
        let usage = resp.usage.expect("usage");
        assert_eq!(usage.completion_tokens, 4);
        assert_eq!(usage.total_tokens, 0);

        let empty: ProviderChatResponse =
            serde_json::from_str(r#"{"choices":null}"#).expect("null choices");
        assert!(empty.response.choices.is_empty());
    }
}
