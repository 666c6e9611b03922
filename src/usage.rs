use crate::protocol::{ExtraBilling, Usage};
use crate::tokens::TokenCounter;
use std::collections::HashMap;

/// Per-request token and billing record.
///
/// Exactly one stage writes to a ledger at a time: the finalizer for a
/// single-shot exchange, or the stream pump for a streamed one. The stream
/// pump owns the ledger by value and hands it back when the stream ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageLedger {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub extra_billing: Option<HashMap<String, ExtraBilling>>,
    text: String,
    /// Largest total any provider report carried so far.
    reported_total: u64,
}

impl UsageLedger {
    pub fn new(prompt_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            ..Self::default()
        }
    }

    /// Copies provider-reported counts into the ledger. The counts always come
    /// from the report with the largest total, so a later smaller report does
    /// not replace them. The total never goes down; a provider that omits
    /// `total_tokens` gets prompt + completion.
    pub fn commit(&mut self, usage: &Usage) {
        let reported = if usage.total_tokens == 0 {
            usage.prompt_tokens.saturating_add(usage.completion_tokens)
        } else {
            usage.total_tokens
        };
        if reported < self.reported_total {
            tracing::debug!(
                reported,
                kept = self.reported_total,
                "ignoring usage report smaller than an earlier one"
            );
            return;
        }
        self.reported_total = reported;
        self.prompt_tokens = usage.prompt_tokens;
        self.completion_tokens = usage.completion_tokens;
        self.total_tokens = self.total_tokens.max(reported);
    }

    pub fn merge_extra_billing(&mut self, billing: Option<&HashMap<String, ExtraBilling>>) {
        let Some(billing) = billing else {
            return;
        };
        self.extra_billing
            .get_or_insert_with(HashMap::new)
            .extend(billing.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Floor for a stream cut off before any usage frame arrives.
    pub fn backfill_total(&mut self) {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens;
        }
    }

    pub fn append_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Fills in completion tokens from the accumulated text when the provider
    /// never reported any. Returns true when an estimate was used.
    pub fn settle(&mut self, counter: &dyn TokenCounter, model: &str) -> bool {
        if self.completion_tokens > 0 {
            return false;
        }
        if !self.text.is_empty() {
            self.completion_tokens = counter.count_text(&self.text, model);
        }
        let estimated = self.prompt_tokens.saturating_add(self.completion_tokens);
        self.total_tokens = self.total_tokens.max(estimated);
        true
    }

    pub fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            extra_billing: self.extra_billing.clone(),
            extra_body: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count_text(&self, text: &str, _model: &str) -> u64 {
            text.split_whitespace().count() as u64
        }
    }

    fn usage(prompt: u64, completion: u64, total: u64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            ..Usage::default()
        }
    }

    #[test]
    fn commit_never_lowers_total() {
        let mut ledger = UsageLedger::new(10);
        ledger.commit(&usage(10, 5, 15));
        ledger.commit(&usage(10, 2, 12));
        assert_eq!(ledger.total_tokens, 15);
        assert_eq!(ledger.completion_tokens, 5);
        assert_eq!(ledger.prompt_tokens, 10);
    }

    #[test]
    fn later_larger_report_replaces_counts() {
        let mut ledger = UsageLedger::new(10);
        ledger.commit(&usage(10, 2, 12));
        ledger.commit(&usage(10, 5, 15));
        assert_eq!(ledger.completion_tokens, 5);
        assert_eq!(ledger.total_tokens, 15);
    }

    #[test]
    fn provider_report_below_prompt_estimate_still_counts() {
        let mut ledger = UsageLedger::new(20);
        ledger.backfill_total();
        ledger.commit(&usage(8, 4, 12));
        assert_eq!(ledger.prompt_tokens, 8);
        assert_eq!(ledger.completion_tokens, 4);
        assert_eq!(ledger.total_tokens, 20);
    }

    #[test]
    fn commit_computes_missing_total() {
        let mut ledger = UsageLedger::new(0);
        ledger.commit(&usage(7, 3, 0));
        assert_eq!(ledger.total_tokens, 10);
    }

    #[test]
    fn backfill_only_when_total_is_zero() {
        let mut ledger = UsageLedger::new(12);
        ledger.backfill_total();
        assert_eq!(ledger.total_tokens, 12);
        ledger.commit(&usage(12, 8, 20));
        ledger.backfill_total();
        assert_eq!(ledger.total_tokens, 20);
    }

    #[test]
    fn merge_extra_billing_ignores_none() {
        let mut ledger = UsageLedger::new(0);
        ledger.merge_extra_billing(None);
        assert!(ledger.extra_billing.is_none());
        let mut billing = HashMap::new();
        billing.insert(
            "web_search_preview".to_string(),
            ExtraBilling {
                billing_type: "high".to_string(),
                call_count: 1,
            },
        );
        ledger.merge_extra_billing(Some(&billing));
        ledger.merge_extra_billing(Some(&billing));
        assert_eq!(ledger.extra_billing.as_ref().map(|m| m.len()), Some(1));
    }

    #[test]
    fn settle_estimates_from_text_when_no_completion_reported() {
        let mut ledger = UsageLedger::new(4);
        ledger.backfill_total();
        ledger.append_text("one two ");
        ledger.append_text("three");
        assert!(ledger.settle(&WordCounter, "gpt-4o"));
        assert_eq!(ledger.completion_tokens, 3);
        assert_eq!(ledger.total_tokens, 7);
    }

    #[test]
    fn settle_keeps_reported_usage() {
        let mut ledger = UsageLedger::new(4);
        ledger.commit(&usage(4, 9, 13));
        ledger.append_text("a b");
        assert!(!ledger.settle(&WordCounter, "gpt-4o"));
        assert_eq!(ledger.completion_tokens, 9);
        assert_eq!(ledger.total_tokens, 13);
    }
}
