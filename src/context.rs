use crate::protocol::Usage;

/// Immutable per-request facts the response path needs. Built once by the
/// handler and shared by the finalizer or the stream transcoder.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Model name exactly as the client sent it.
    pub requested_model: String,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(requested_model: impl Into<String>) -> Self {
        Self {
            requested_model: requested_model.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Client-facing name for a model the upstream reported.
    pub fn response_model_name(&self, upstream_model: &str) -> String {
        if self.requested_model.is_empty() {
            upstream_model.to_string()
        } else {
            self.requested_model.clone()
        }
    }
}

/// Inspects (and may adjust) provider-reported usage before it is committed.
///
/// Returning `true` asks the stream transcoder to re-encode the frame that
/// carried the usage, so the adjusted numbers reach the client.
pub trait UsageHook: Send + Sync {
    fn on_usage(&self, usage: &mut Usage) -> bool;
}

impl<F> UsageHook for F
where
    F: Fn(&mut Usage) -> bool + Send + Sync,
{
    fn on_usage(&self, usage: &mut Usage) -> bool {
        self(usage)
    }
}

/// Recomputes `total_tokens` for providers that report it inconsistently.
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalTokensHook;

impl UsageHook for TotalTokensHook {
    fn on_usage(&self, usage: &mut Usage) -> bool {
        let expected = usage.prompt_tokens.saturating_add(usage.completion_tokens);
        if usage.total_tokens == expected {
            return false;
        }
        tracing::debug!(
            reported = usage.total_tokens,
            expected,
            "correcting upstream total_tokens"
        );
        usage.total_tokens = expected;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_model_prefers_requested_name() {
        let ctx = RequestContext::new("my-alias");
        assert_eq!(ctx.response_model_name("gpt-4o-2024-08-06"), "my-alias");
        let empty = RequestContext::default();
        assert_eq!(empty.response_model_name("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn total_tokens_hook_only_flags_changes() {
        let mut usage = Usage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
            ..Usage::default()
        };
        assert!(!TotalTokensHook.on_usage(&mut usage));
        usage.total_tokens = 0;
        assert!(TotalTokensHook.on_usage(&mut usage));
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn closures_are_hooks() {
        let hook = |usage: &mut Usage| {
            usage.completion_tokens += 1;
            false
        };
        let mut usage = Usage::default();
        assert!(!hook.on_usage(&mut usage));
        assert_eq!(usage.completion_tokens, 1);
    }
}
