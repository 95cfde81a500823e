//! Inference backend client.
//!
//! The coordinator only sees [`InferenceBackend`]: hand it a model name and
//! the ordered conversation, get back a pull-based [`TokenStream`] that ends
//! in [`StreamChunk::Done`] or [`StreamChunk::Error`].  Dropping the stream
//! drops the underlying HTTP response, which is how generation is cancelled.
//!
//! [`OllamaBackend`] speaks the Ollama `/api/chat` protocol: a single POST
//! whose body is newline-delimited JSON, one object per generated piece.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::entities::Role;

/// A single chunk emitted by a streaming backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A piece of generated text.
    Token(String),
    /// Generation completed normally.
    Done,
    /// Generation terminated due to a backend error.
    Error(String),
}

/// Lazy, forward-only sequence of chunks.  Not restartable.
pub type TokenStream = BoxStream<'static, StreamChunk>;

/// One entry of the context handed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("inference backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The stream opened but failed before a completion marker.
    #[error("inference stream failed: {0}")]
    Stream(String),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    /// Open a generation stream for `context` on `model`.
    ///
    /// Errors returned here happen before any chunk is produced; failures
    /// after that arrive in-band as [`StreamChunk::Error`].
    async fn chat_stream(
        &self,
        model: &str,
        context: &[ContextMessage],
    ) -> Result<TokenStream, InferenceError>;
}

// ── Ollama ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ContextMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatLine {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaBackend {
    /// Build a client for the backend at `base_url`.  No request is made until
    /// the first turn.
    pub fn connect(base_url: &str, connect_timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn chat_stream(
        &self,
        model: &str,
        context: &[ContextMessage],
    ) -> Result<TokenStream, InferenceError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(%url, model, context_len = context.len(), "opening inference stream");

        let response = self
            .client
            .post(&url)
            .json(&OllamaChatRequest {
                model,
                messages: context,
                stream: true,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(model, status = status.as_u16(), "inference backend refused the request");
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(ndjson_chunks(response.bytes_stream()).boxed())
    }
}

// ── NDJSON decoding ───────────────────────────────────────────────────────────

/// Reassembles newline-delimited records from arbitrarily split reads.
///
/// Splitting happens on the `\n` byte, which never occurs inside a multi-byte
/// UTF-8 sequence, so a character cut across two reads is rebuilt intact.
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feed bytes; returns every complete, non-blank line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the input ends (a last record without `\n`).
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_owned())
}

/// Translate one Ollama record into zero or more chunks.
fn parse_line(line: &str) -> Vec<StreamChunk> {
    let parsed: OllamaChatLine = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed inference record");
            return vec![StreamChunk::Error(format!("malformed inference record: {e}"))];
        }
    };

    if let Some(err) = parsed.error {
        return vec![StreamChunk::Error(err)];
    }

    let mut chunks = Vec::with_capacity(2);
    if let Some(message) = parsed.message.filter(|m| !m.content.is_empty()) {
        chunks.push(StreamChunk::Token(message.content));
    }
    if parsed.done {
        chunks.push(StreamChunk::Done);
    }
    chunks
}

struct NdjsonState<S> {
    inner: Pin<Box<S>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<StreamChunk>,
    exhausted: bool,
    terminated: bool,
}

/// Adapt a byte stream of NDJSON records into [`StreamChunk`]s.
///
/// Stops after the first terminal chunk.  If the input ends without one,
/// the output simply ends and the consumer sees no [`StreamChunk::Done`].
pub(crate) fn ndjson_chunks<S, E>(inner: S) -> impl Stream<Item = StreamChunk> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + 'static,
{
    let state = NdjsonState {
        inner: Box::pin(inner),
        decoder: NdjsonDecoder::default(),
        pending: VecDeque::new(),
        exhausted: false,
        terminated: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.terminated {
                return None;
            }
            if let Some(chunk) = st.pending.pop_front() {
                if matches!(chunk, StreamChunk::Done | StreamChunk::Error(_)) {
                    st.terminated = true;
                }
                return Some((chunk, st));
            }
            if st.exhausted {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => {
                    for line in st.decoder.push(&bytes) {
                        st.pending.extend(parse_line(&line));
                    }
                }
                Some(Err(e)) => {
                    st.pending
                        .push_back(StreamChunk::Error(format!("inference stream interrupted: {e}")));
                }
                None => {
                    st.exhausted = true;
                    if let Some(line) = st.decoder.finish() {
                        st.pending.extend(parse_line(&line));
                    }
                }
            }
        }
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
