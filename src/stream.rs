use crate::context::{RequestContext, UsageHook};
use crate::error::{AppError, ProviderErrorEnvelope, normalize_provider_error};
use crate::protocol::{ExtraBilling, ProviderChatStreamResponse, Usage};
use crate::tokens::TokenCounter;
use crate::upstream::UpstreamCallError;
use crate::usage::UsageLedger;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DATA_PREFIX: &[u8] = b"data:";
const DONE_SENTINEL: &[u8] = b"[DONE]";
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub type UpstreamBody = BoxStream<'static, Result<Bytes, UpstreamCallError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Done,
    Errored,
}

/// What one upstream line turned into.
#[derive(Debug)]
pub enum LineOutcome {
    /// Nothing to send: non-data line or usage-only heartbeat.
    Skip,
    Data(String),
    Done,
    Error(AppError),
}

/// Item delivered to the downstream consumer. At most one `Done` or `Error`
/// is ever sent and nothing follows it.
#[derive(Debug)]
pub enum StreamEvent {
    Data(String),
    Done,
    Error(AppError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    PassThrough,
    Reencode,
}

impl Emit {
    fn force(&mut self, yes: bool) {
        if yes {
            *self = Emit::Reencode;
        }
    }
}

/// Per-request transcoder for OpenAI-compatible chat completion streams.
pub struct ChatStreamHandler {
    state: StreamState,
    context: Option<Arc<RequestContext>>,
    extra_billing: Option<HashMap<String, ExtraBilling>>,
    usage_hook: Option<Arc<dyn UsageHook>>,
    reasoning_compat: bool,
    escape_json: bool,
}

impl ChatStreamHandler {
    pub fn new(extra_billing: Option<HashMap<String, ExtraBilling>>) -> Self {
        Self {
            state: StreamState::Streaming,
            context: None,
            extra_billing,
            usage_hook: None,
            reasoning_compat: false,
            escape_json: false,
        }
    }

    pub fn with_context(mut self, context: Arc<RequestContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_usage_hook(mut self, hook: Option<Arc<dyn UsageHook>>) -> Self {
        self.usage_hook = hook;
        self
    }

    pub fn with_reasoning_compat(mut self, enabled: bool) -> Self {
        self.reasoning_compat = enabled;
        self
    }

    /// Re-encode every frame instead of passing payloads through.
    pub fn with_escape_json(mut self, enabled: bool) -> Self {
        self.escape_json = enabled;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Transcodes one upstream line. Payloads go out byte-identical unless a
    /// frame must change: reasoning compat, a usage hook edit, channel-wide
    /// escaping, or an upstream model name that differs from the client's.
    /// Aliased channels therefore never take the byte-identical path.
    pub fn handle_line(&mut self, line: &[u8], ledger: &mut UsageLedger) -> LineOutcome {
        if self.state != StreamState::Streaming {
            tracing::debug!(state = ?self.state, "line after terminal state ignored");
            return LineOutcome::Skip;
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return LineOutcome::Skip;
        };
        let payload = payload.trim_ascii();

        if payload == DONE_SENTINEL {
            self.state = StreamState::Done;
            return LineOutcome::Done;
        }

        let mut frame: ProviderChatStreamResponse = match serde_json::from_slice(payload) {
            Ok(frame) => frame,
            Err(err) => return self.fail(AppError::protocol(format!("invalid stream frame: {err}"))),
        };

        let envelope = ProviderErrorEnvelope {
            error: frame.error.take(),
        };
        if let Some(err) = normalize_provider_error(&envelope) {
            return self.fail(err);
        }

        let mut emit = if self.escape_json {
            Emit::Reencode
        } else {
            Emit::PassThrough
        };
        let chunk = &mut frame.chunk;

        if let Some(usage) = chunk.usage.as_mut() {
            if usage.completion_tokens > 0 {
                emit.force(self.record_usage(usage, ledger));
            }
            if chunk.choices.is_empty() {
                return LineOutcome::Skip;
            }
        } else if let Some(usage) = chunk.choices.first_mut().and_then(|c| c.usage.as_mut()) {
            if usage.completion_tokens > 0 {
                emit.force(self.record_usage(usage, ledger));
            }
        } else {
            ledger.backfill_total();
        }

        if let Some(context) = self.context.as_ref() {
            let client_model = context.response_model_name(&chunk.model);
            // An empty upstream name has nothing to leak; only a differing alias needs rewriting.
            emit.force(!chunk.model.is_empty() && chunk.model != client_model);
            chunk.model = client_model;
        }

        let text = chunk.response_text();
        if !text.is_empty() {
            ledger.append_text(&text);
        }

        if self.reasoning_compat && !chunk.choices.is_empty() {
            for choice in chunk.choices.iter_mut() {
                let delta = &mut choice.delta;
                let primary_empty = delta.reasoning_content.as_deref().is_none_or(str::is_empty);
                let legacy = delta.reasoning.take().filter(|s| !s.is_empty());
                if primary_empty && legacy.is_some() {
                    delta.reasoning_content = legacy;
                } else {
                    delta.reasoning = legacy;
                }
            }
            emit = Emit::Reencode;
        }

        match emit {
            Emit::Reencode => match serde_json::to_string(&frame.chunk) {
                Ok(data) => LineOutcome::Data(data),
                Err(err) => self.fail(AppError::protocol(format!(
                    "failed to encode stream frame: {err}"
                ))),
            },
            Emit::PassThrough => LineOutcome::Data(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    fn record_usage(&self, usage: &mut Usage, ledger: &mut UsageLedger) -> bool {
        let reencode = self
            .usage_hook
            .as_ref()
            .is_some_and(|hook| hook.on_usage(usage));
        ledger.commit(usage);
        ledger.merge_extra_billing(self.extra_billing.as_ref());
        reencode
    }

    fn fail(&mut self, err: AppError) -> LineOutcome {
        self.state = StreamState::Errored;
        LineOutcome::Error(err)
    }
}

/// Splits a byte stream into lines, tolerating `\r\n` and frames that
/// straddle network chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Some(line.freeze())
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

/// Consumer side of a streamed completion. `usage` resolves to the settled
/// ledger once the producer has stopped.
pub struct ChatStream {
    pub events: mpsc::Receiver<StreamEvent>,
    pub usage: JoinHandle<UsageLedger>,
}

/// Runs the reader loop on its own task. The ledger moves into the task and
/// comes back through `ChatStream::usage`.
pub fn spawn_stream_pump(
    body: UpstreamBody,
    handler: ChatStreamHandler,
    ledger: UsageLedger,
    counter: Arc<dyn TokenCounter>,
    model: String,
) -> ChatStream {
    let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
    let usage = tokio::spawn(async move {
        let mut ledger = ledger;
        let mut handler = handler;
        pump(body, &mut handler, &mut ledger, &tx, &model).await;
        if ledger.settle(counter.as_ref(), &model) {
            tracing::debug!(
                model = %model,
                completion_tokens = ledger.completion_tokens,
                "no upstream usage, completion tokens estimated from streamed text"
            );
        }
        ledger
    });
    ChatStream { events: rx, usage }
}

async fn pump(
    mut body: UpstreamBody,
    handler: &mut ChatStreamHandler,
    ledger: &mut UsageLedger,
    tx: &mpsc::Sender<StreamEvent>,
    model: &str,
) {
    let mut lines = LineBuffer::default();
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                abort_on_disconnect(model);
                return;
            }
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    if !deliver(handler.handle_line(&line, ledger), tx, model).await {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                metrics::counter!("uniformize_stream_errors_total", "model" => model.to_string())
                    .increment(1);
                tracing::warn!(model = %model, "upstream stream failed: {}", err.message);
                let _ = tx
                    .send(StreamEvent::Error(AppError::transport(
                        err.status, err.code, err.message,
                    )))
                    .await;
                return;
            }
            None => {
                if let Some(line) = lines.finish() {
                    if !deliver(handler.handle_line(&line, ledger), tx, model).await {
                        return;
                    }
                }
                tracing::debug!(model = %model, "upstream closed without [DONE]");
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        }
    }
}

/// Forwards one outcome. Returns false once the stream is over, either
/// because a terminal signal went out or because the consumer is gone.
async fn deliver(outcome: LineOutcome, tx: &mpsc::Sender<StreamEvent>, model: &str) -> bool {
    match outcome {
        LineOutcome::Skip => true,
        LineOutcome::Data(data) => {
            if tx.send(StreamEvent::Data(data)).await.is_err() {
                abort_on_disconnect(model);
                return false;
            }
            true
        }
        LineOutcome::Done => {
            tracing::debug!(model = %model, "upstream stream finished");
            let _ = tx.send(StreamEvent::Done).await;
            false
        }
        LineOutcome::Error(err) => {
            metrics::counter!("uniformize_stream_errors_total", "model" => model.to_string())
                .increment(1);
            tracing::warn!(model = %model, code = %err.code, "stream terminated: {}", err.message);
            let _ = tx.send(StreamEvent::Error(err)).await;
            false
        }
    }
}

fn abort_on_disconnect(model: &str) {
    let err = AppError::stream_aborted();
    tracing::warn!(model = %model, "{}", err.message);
}
