use crate::protocol::ChatMessage;
use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

/// Counts tokens of arbitrary text for a given model.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> u64;

    fn count_messages(&self, messages: &[ChatMessage], model: &str) -> u64 {
        if messages.is_empty() {
            return 0;
        }
        let mut total = 0u64;
        for message in messages {
            total = total
                .saturating_add(MESSAGE_OVERHEAD_TOKENS)
                .saturating_add(self.count_text(&message.role, model))
                .saturating_add(self.count_text(&message.content_text(), model));
        }
        total.saturating_add(REPLY_PRIMER_TOKENS)
    }
}

const MESSAGE_OVERHEAD_TOKENS: u64 = 3;
const REPLY_PRIMER_TOKENS: u64 = 3;

static O200K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::o200k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        tracing::warn!("o200k_base tokenizer unavailable: {err}");
        None
    }
});

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        tracing::warn!("cl100k_base tokenizer unavailable: {err}");
        None
    }
});

/// BPE counter backed by `tiktoken-rs`. Models tiktoken does not know are
/// counted with cl100k.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenCounter;

impl TiktokenCounter {
    fn bpe_for(model: &str) -> Option<&'static CoreBPE> {
        match get_tokenizer(model) {
            Some(Tokenizer::O200kBase) => O200K.as_ref(),
            _ => CL100K.as_ref(),
        }
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str, model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        match Self::bpe_for(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => approximate_tokens(text),
        }
    }
}

/// Rough estimate used only when no BPE table could be loaded.
fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
