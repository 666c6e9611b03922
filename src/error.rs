use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Malformed upstream frame or body. Always fatal to the current exchange.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_protocol_error", message)
            .with_type("upstream_protocol_error")
    }

    /// Network failure, non-2xx status, or a broken body stream.
    pub fn transport(status: Option<StatusCode>, code: Option<String>, message: String) -> Self {
        Self::new(
            status.unwrap_or(StatusCode::BAD_GATEWAY),
            code.unwrap_or_else(|| "upstream_error".to_string()),
            message,
        )
        .with_type("upstream_error")
    }

    /// The client went away before the upstream stream terminated.
    pub fn stream_aborted() -> Self {
        Self::new(
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "client_closed_request",
            "downstream consumer closed before the stream finished",
        )
        .with_type("stream_aborted")
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status.as_u16(), self.message)
    }
}

impl std::error::Error for AppError {}

/// Error object as providers put it on the wire, either at the top level of a
/// response body or inside a stream chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderErrorEnvelope {
    #[serde(default)]
    pub error: Option<ProviderError>,
}

impl ProviderError {
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
            && self.error_type.is_empty()
            && value_is_blank(self.param.as_ref())
            && value_is_blank(self.code.as_ref())
    }
}

fn value_is_blank(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(s)) => s.is_empty(),
        Some(serde_json::Value::Number(n)) => n.as_i64() == Some(0),
        Some(_) => false,
    }
}

fn value_to_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Normalizes a decoded provider error envelope. An envelope with every field
/// empty means "no error" and yields `None`.
pub fn normalize_provider_error(envelope: &ProviderErrorEnvelope) -> Option<AppError> {
    let err = envelope.error.as_ref()?;
    if err.is_empty() {
        return None;
    }
    let code = value_to_string(err.code.as_ref()).unwrap_or_else(|| "upstream_error".to_string());
    let error_type = if err.error_type.is_empty() {
        "upstream_error".to_string()
    } else {
        err.error_type.clone()
    };
    let mut out = AppError::new(StatusCode::BAD_REQUEST, code, err.message.clone())
        .with_type(error_type);
    if let Some(param) = value_to_string(err.param.as_ref()) {
        out = out.with_param(param);
    }
    Some(out)
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl AppError {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(ErrorEnvelope {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: self.error_type.clone(),
                param: self.param.clone(),
                code: self.code.clone(),
            },
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = self.to_json();
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> ProviderErrorEnvelope {
        serde_json::from_value(value).expect("envelope")
    }

    #[test]
    fn empty_envelope_is_not_an_error() {
        assert!(normalize_provider_error(&envelope(json!({}))).is_none());
        assert!(
            normalize_provider_error(&envelope(json!({
                "error": { "message": "", "type": "", "param": null, "code": null }
            })))
            .is_none()
        );
        assert!(
            normalize_provider_error(&envelope(json!({ "error": { "code": 0 } }))).is_none()
        );
    }

    #[test]
    fn provider_error_is_bad_request_with_all_fields() {
        let err = normalize_provider_error(&envelope(json!({
            "error": {
                "message": "context too long",
                "type": "invalid_request_error",
                "param": "messages",
                "code": "context_length_exceeded"
            }
        })))
        .expect("error");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "context_length_exceeded");
        assert_eq!(err.error_type, "invalid_request_error");
        assert_eq!(err.param.as_deref(), Some("messages"));
        assert_eq!(err.message, "context too long");
    }

    #[test]
    fn numeric_code_is_stringified() {
        let err = normalize_provider_error(&envelope(json!({
            "error": { "message": "rate limited", "code": 429 }
        })))
        .expect("error");
        assert_eq!(err.code, "429");
        assert_eq!(err.error_type, "upstream_error");
    }

    #[test]
    fn json_body_matches_openai_envelope() {
        let body = AppError::protocol("bad frame").to_json();
        assert_eq!(body["error"]["code"], "upstream_protocol_error");
        assert_eq!(body["error"]["message"], "bad frame");
        assert!(body["error"]["param"].is_null());
    }
}
