//! Streaming relay: backend chunks in, server-sent events out.
//!
//! [`pump`] moves chunks from the upstream [`TokenStream`] into a bounded
//! channel one at a time, in backend order.  A full channel suspends the
//! pump, so the backend is only read as fast as the client drains.  When
//! the receiving side goes away the pump returns at once and the upstream
//! stream is dropped, cancelling generation.
//!
//! Terminal events are not sent by the pump.  The coordinator sends them
//! after it has recorded the turn's outcome.
//!
//! The [`RelayReceiver`] counts the chunk bytes it hands to its consumer.
//! On a disconnect the pump reports only that delivered prefix, not what
//! was still sitting in the channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::services::inference::{StreamChunk, TokenStream};

/// One event on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Chunk(String),
    Done,
    /// Always the last event when present.
    Error(String),
}

impl RelayEvent {
    pub fn payload(&self) -> serde_json::Value {
        match self {
            RelayEvent::Chunk(text) => json!({ "chunk": text }),
            RelayEvent::Done => json!({ "done": true }),
            RelayEvent::Error(message) => json!({ "error": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Chunk(_))
    }

    /// `data: <json>` record.
    pub fn to_sse(&self) -> Event {
        Event::default().data(self.payload().to_string())
    }
}

/// Sending half of a relay channel.
#[derive(Debug)]
pub struct RelaySender {
    tx: mpsc::Sender<RelayEvent>,
    delivered: Arc<AtomicUsize>,
}

/// Receiving half of a relay channel.  Dropping it cancels the turn.
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::Receiver<RelayEvent>,
    delivered: Arc<AtomicUsize>,
}

/// Bounded relay channel holding at most `buffer` undelivered events.
pub fn channel(buffer: usize) -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let delivered = Arc::new(AtomicUsize::new(0));
    (
        RelaySender {
            tx,
            delivered: delivered.clone(),
        },
        RelayReceiver { rx, delivered },
    )
}

impl RelaySender {
    /// Queue `event`.  Fails once the receiver is gone.
    pub async fn send(&self, event: RelayEvent) -> Result<(), mpsc::error::SendError<RelayEvent>> {
        self.tx.send(event).await
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    /// Chunk bytes the consumer has taken so far.
    pub fn delivered_bytes(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }
}

fn count_delivery(delivered: &AtomicUsize, event: &RelayEvent) {
    if let RelayEvent::Chunk(text) = event {
        delivered.fetch_add(text.len(), Ordering::AcqRel);
    }
}

impl RelayReceiver {
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        let event = self.rx.recv().await?;
        count_delivery(&self.delivered, &event);
        Some(event)
    }

    /// The events as a stream.  A chunk counts as delivered when the stream
    /// yields it.
    pub fn into_stream(self) -> impl Stream<Item = RelayEvent> + Send + 'static {
        let delivered = self.delivered;
        ReceiverStream::new(self.rx).inspect(move |event| count_delivery(&delivered, event))
    }
}

/// How the upstream stream ended, with the reply text relayed before that.
/// For a disconnect this is the part the consumer actually took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { content: String },
    Failed { content: String, reason: String },
    Disconnected { content: String },
}

impl RelayOutcome {
    pub fn content(&self) -> &str {
        match self {
            RelayOutcome::Completed { content }
            | RelayOutcome::Failed { content, .. }
            | RelayOutcome::Disconnected { content } => content,
        }
    }
}

/// Forward `upstream` into `tx` until a terminal chunk, the end of the
/// stream, or the receiver is dropped.
pub async fn pump(mut upstream: TokenStream, tx: &RelaySender) -> RelayOutcome {
    let mut content = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => return disconnected(content, tx),
            next = upstream.next() => next,
        };

        match next {
            Some(StreamChunk::Token(token)) => {
                if token.is_empty() {
                    continue;
                }
                if tx.send(RelayEvent::Chunk(token.clone())).await.is_err() {
                    return disconnected(content, tx);
                }
                content.push_str(&token);
            }
            Some(StreamChunk::Done) => return RelayOutcome::Completed { content },
            Some(StreamChunk::Error(reason)) => return RelayOutcome::Failed { content, reason },
            None => {
                return RelayOutcome::Failed {
                    content,
                    reason: "inference stream ended without a completion marker".into(),
                };
            }
        }
    }
}

/// Chunks are delivered whole and in order, so the delivered byte count is
/// always a chunk boundary of `content`.
fn disconnected(mut content: String, tx: &RelaySender) -> RelayOutcome {
    let keep = tx.delivered_bytes().min(content.len());
    if content.is_char_boundary(keep) {
        content.truncate(keep);
    }
    RelayOutcome::Disconnected { content }
}

/// Wrap the event receiver of one turn as an SSE response.
pub fn sse_response(rx: RelayReceiver) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = rx
        .into_stream()
        .map(|event| Ok::<Event, Infallible>(event.to_sse()));
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
