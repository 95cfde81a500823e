//! Turn coordinator.
//!
//! One turn is: validate, persist the user message, stream the model's reply
//! to the caller, persist the reply, schedule fan-out.  The per-chat lock is
//! taken before the user message is written and released only once the
//! assistant side is settled, so turns on one chat are strictly sequential.
//!
//! ```text
//! Init ──► UserSaved ──► Streaming ──► Complete
//!   │          │             │
//!   └──────────┴─────────────┴──────► Failed
//! ```
//!
//! The user message is durable before the backend is called.  The terminal
//! `done` event is sent only after the assistant message is durable.
//!
//! A turn that creates its chat is all or nothing: if it fails, the new chat
//! and everything written to it are removed again.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PartialReplyPolicy;
use crate::entities::{
    Chat, ChatMessage, ChatStore, MessageStore, Role, SqliteStore, UserStore,
};
use crate::services::chat_locks::ChatLocks;
use crate::services::fanout::{FanoutHandle, FanoutJob};
use crate::services::inference::{ContextMessage, InferenceBackend, InferenceError};
use crate::services::registry::ModelRegistry;
use crate::services::relay::{self, RelayEvent, RelayOutcome, RelayReceiver, RelaySender};
use crate::services::search::SearchDocument;

/// Maximum allowed message length in bytes.
pub const MAX_PROMPT_BYTES: usize = 128 * 1024; // 128 KiB

/// Maximum title length in characters.
pub const MAX_TITLE_CHARS: usize = 200;

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Upstream(#[from] InferenceError),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("turn task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Init,
    UserSaved,
    Streaming,
    Complete,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Complete | TurnState::Failed)
    }

    fn can_advance_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Init, UserSaved)
                | (UserSaved, Streaming)
                | (Streaming, Complete)
                | (Init | UserSaved | Streaming, Failed)
        )
    }
}

/// Tracks one turn's state and logs its transitions.
#[derive(Debug)]
struct TurnTracker {
    turn_id: Uuid,
    chat_id: String,
    state: TurnState,
}

impl TurnTracker {
    fn new(chat_id: &str) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            chat_id: chat_id.to_owned(),
            state: TurnState::Init,
        }
    }

    fn advance(&mut self, next: TurnState) {
        if !self.state.can_advance_to(next) {
            error!(turn_id = %self.turn_id, chat_id = %self.chat_id, from = %self.state, to = %next, "invalid turn transition");
            return;
        }
        debug!(turn_id = %self.turn_id, chat_id = %self.chat_id, from = %self.state, to = %next, "turn transition");
        self.state = next;
    }
}

/// Input of one turn.  Without `chat_id` a chat is created first, which
/// needs `user_id` and `model`.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub model: Option<String>,
    pub content: String,
    pub title: Option<String>,
}

/// Why a turn ended in [`TurnState::Failed`] after its user message was saved.
#[derive(Debug)]
pub enum TurnFailure {
    Upstream(String),
    Persistence(sqlx::Error),
    Disconnected,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// The stored assistant message.  For failed turns this is the partial
    /// reply when the policy keeps it.
    pub assistant_message: Option<ChatMessage>,
    pub failure: Option<TurnFailure>,
}

/// A turn whose reply is being streamed.
///
/// Read `events` until it closes; the last event is terminal unless the
/// receiver was dropped.  Dropping `events` cancels generation.
#[derive(Debug)]
pub struct TurnHandle {
    pub chat: Chat,
    pub user_message: ChatMessage,
    pub model: String,
    pub events: RelayReceiver,
    pub outcome: JoinHandle<TurnOutcome>,
}

/// A completed non-streaming turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub chat: Chat,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
}

#[derive(Debug, Clone, Copy)]
pub struct TurnSettings {
    pub relay_buffer: usize,
    pub partial_reply_policy: PartialReplyPolicy,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            relay_buffer: 8,
            partial_reply_policy: PartialReplyPolicy::Persist,
        }
    }
}

pub struct TurnCoordinator {
    store: Arc<SqliteStore>,
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<ModelRegistry>,
    fanout: FanoutHandle,
    locks: ChatLocks,
    settings: TurnSettings,
}

impl TurnCoordinator {
    pub fn new(
        store: Arc<SqliteStore>,
        backend: Arc<dyn InferenceBackend>,
        registry: Arc<ModelRegistry>,
        fanout: FanoutHandle,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
            fanout,
            locks: ChatLocks::new(),
            settings,
        }
    }

    /// Start a turn and return as soon as the backend stream is open.
    ///
    /// Everything that can be rejected is rejected here, before the
    /// backend sees any content: validation, unknown chat/user/model, and
    /// failure to store the user message.  A backend that refuses the
    /// request also fails here, after the user message was stored; when the
    /// chat was created by this call it is removed again.
    pub async fn begin_turn(&self, req: TurnRequest) -> Result<TurnHandle, TurnError> {
        validate_content(&req.content)?;
        let title = validate_title(req.title.as_deref())?;
        let new_chat = req.chat_id.is_none();

        let (chat, guard) = match req.chat_id.as_deref() {
            Some(chat_id) => {
                let guard = self.locks.acquire(chat_id).await;
                let chat = self
                    .store
                    .get_chat(chat_id)
                    .await?
                    .ok_or_else(|| TurnError::NotFound(format!("chat {chat_id} not found")))?;
                (chat, guard)
            }
            None => {
                let chat = self
                    .create_chat(req.user_id.as_deref(), req.model.as_deref(), title)
                    .await?;
                let guard = self.locks.acquire(&chat.id).await;
                (chat, guard)
            }
        };

        let model = match req.model.as_deref() {
            Some(name) if name != chat.model_name => match self.resolve_model(name).await {
                Ok(model) => model,
                Err(e) => return Err(self.abandon(new_chat, &chat.id, e).await),
            },
            _ => chat.model_name.clone(),
        };

        let mut tracker = TurnTracker::new(&chat.id);

        let user_message = match self
            .store
            .append_message(&chat.id, Role::User, &req.content)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracker.advance(TurnState::Failed);
                error!(chat_id = %chat.id, error = %e, "failed to store user message; turn aborted");
                return Err(self.abandon(new_chat, &chat.id, e.into()).await);
            }
        };
        tracker.advance(TurnState::UserSaved);

        let history = match self.store.list_messages(&chat.id).await {
            Ok(h) => h,
            Err(e) => {
                tracker.advance(TurnState::Failed);
                error!(chat_id = %chat.id, error = %e, "failed to load chat history");
                return Err(self.abandon(new_chat, &chat.id, e.into()).await);
            }
        };
        let context: Vec<ContextMessage> = history
            .into_iter()
            .map(|m| ContextMessage {
                role: m.role,
                content: m.content,
            })
            .collect();

        let started = Instant::now();
        let upstream = match self.backend.chat_stream(&model, &context).await {
            Ok(s) => s,
            Err(e) => {
                tracker.advance(TurnState::Failed);
                warn!(chat_id = %chat.id, model = %model, context_len = context.len(), error = %e, "inference request failed");
                return Err(self.abandon(new_chat, &chat.id, e.into()).await);
            }
        };
        tracker.advance(TurnState::Streaming);
        info!(chat_id = %chat.id, model = %model, context_len = context.len(), "inference stream opened");

        let (tx, rx) = relay::channel(self.settings.relay_buffer);
        let driver = TurnDriver {
            store: self.store.clone(),
            fanout: self.fanout.clone(),
            policy: self.settings.partial_reply_policy,
            chat_id: chat.id.clone(),
            model: model.clone(),
            user_message: user_message.clone(),
            tracker,
            started,
            _guard: guard,
        };
        let outcome = tokio::spawn(driver.run(upstream, tx));

        Ok(TurnHandle {
            chat,
            user_message,
            model,
            events: rx,
            outcome,
        })
    }

    /// Run a whole turn and return once both messages are stored.
    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnResult, TurnError> {
        let new_chat = req.chat_id.is_none();
        let TurnHandle {
            chat,
            user_message,
            mut events,
            outcome,
            ..
        } = self.begin_turn(req).await?;

        while let Some(event) = events.recv().await {
            if event.is_terminal() {
                break;
            }
        }

        let outcome = outcome
            .await
            .map_err(|e| TurnError::Aborted(e.to_string()))?;

        let err = match (outcome.state, outcome.assistant_message, outcome.failure) {
            (TurnState::Complete, Some(assistant_message), _) => {
                // The chat row moved on; hand back the current one.
                let chat = self.store.get_chat(&chat.id).await?.unwrap_or(chat);
                return Ok(TurnResult {
                    chat,
                    user_message,
                    assistant_message,
                });
            }
            (_, _, Some(TurnFailure::Persistence(e))) => TurnError::Persistence(e),
            (_, _, Some(TurnFailure::Upstream(reason))) => {
                TurnError::Upstream(InferenceError::Stream(reason))
            }
            (state, _, _) => TurnError::Aborted(format!("turn ended in state {state}")),
        };

        // The driver has released the chat lock by now.
        if new_chat {
            let _guard = self.locks.acquire(&chat.id).await;
            return Err(self.abandon(true, &chat.id, err).await);
        }
        Err(err)
    }

    /// Remove a chat this turn created, then hand back `err`.  The caller
    /// holds the chat lock.
    async fn abandon(&self, new_chat: bool, chat_id: &str, err: TurnError) -> TurnError {
        if new_chat {
            match self.store.delete_chat(chat_id).await {
                Ok(_) => info!(chat_id, error = %err, "first turn failed; new chat removed"),
                Err(e) => error!(chat_id, error = %e, "failed to remove chat of a failed first turn"),
            }
        }
        err
    }

    /// Delete a chat and its messages once no turn is running on it, then
    /// drop it from the search index.  Returns `false` if it did not exist.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<bool, TurnError> {
        let deleted = {
            let _guard = self.locks.acquire(chat_id).await;
            self.store.delete_chat(chat_id).await?
        };
        if deleted {
            info!(chat_id, "chat deleted");
            self.fanout.submit(FanoutJob::UnindexChat(chat_id.to_owned()));
        }
        Ok(deleted)
    }

    async fn create_chat(
        &self,
        user_id: Option<&str>,
        model: Option<&str>,
        title: String,
    ) -> Result<Chat, TurnError> {
        let user_id = non_blank(user_id)
            .ok_or_else(|| TurnError::Validation("user_id is required".into()))?;
        let model = non_blank(model)
            .ok_or_else(|| TurnError::Validation("model_id is required".into()))?;

        if self.store.get_user(user_id).await?.is_none() {
            return Err(TurnError::NotFound(format!("user {user_id} not found")));
        }
        let model = self.resolve_model(model).await?;

        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            model_name: model,
            title,
            message_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.create_chat(chat.clone()).await?;
        info!(chat_id = %chat.id, user_id, model = %chat.model_name, "chat created");
        Ok(chat)
    }

    async fn resolve_model(&self, name: &str) -> Result<String, TurnError> {
        self.registry
            .resolve(name)
            .await?
            .map(|m| m.model_name)
            .ok_or_else(|| TurnError::NotFound(format!("model {name} not found")))
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|v| !v.is_empty())
}

fn validate_content(content: &str) -> Result<(), TurnError> {
    if content.trim().is_empty() {
        return Err(TurnError::Validation("message must not be empty".into()));
    }
    if content.len() > MAX_PROMPT_BYTES {
        return Err(TurnError::Validation(format!(
            "message too large ({} bytes); maximum is {} bytes",
            content.len(),
            MAX_PROMPT_BYTES,
        )));
    }
    Ok(())
}

fn validate_title(title: Option<&str>) -> Result<String, TurnError> {
    match non_blank(title) {
        None => Ok(DEFAULT_TITLE.to_owned()),
        Some(t) if t.chars().count() > MAX_TITLE_CHARS => Err(TurnError::Validation(format!(
            "title too long; maximum is {MAX_TITLE_CHARS} characters"
        ))),
        Some(t) => Ok(t.to_owned()),
    }
}

/// Owns the streaming half of a turn.  Holds the chat lock until it returns.
struct TurnDriver {
    store: Arc<SqliteStore>,
    fanout: FanoutHandle,
    policy: PartialReplyPolicy,
    chat_id: String,
    model: String,
    user_message: ChatMessage,
    tracker: TurnTracker,
    started: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl TurnDriver {
    async fn run(
        mut self,
        upstream: crate::services::inference::TokenStream,
        tx: RelaySender,
    ) -> TurnOutcome {
        let relayed = relay::pump(upstream, &tx).await;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let relayed_len = relayed.content().len();

        match relayed {
            RelayOutcome::Completed { content } => {
                let stored = self
                    .store
                    .append_message(&self.chat_id, Role::Assistant, &content)
                    .await;
                match stored {
                    Ok(assistant) => {
                        self.tracker.advance(TurnState::Complete);
                        let _ = tx.send(RelayEvent::Done).await;
                        info!(chat_id = %self.chat_id, model = %self.model, elapsed_ms, reply_len = content.len(), "turn complete");
                        self.schedule_fanout(&assistant);
                        self.finish(Some(assistant), None)
                    }
                    Err(e) => {
                        self.tracker.advance(TurnState::Failed);
                        error!(chat_id = %self.chat_id, error = %e, "failed to store assistant message");
                        let _ = tx
                            .send(RelayEvent::Error("failed to store assistant reply".into()))
                            .await;
                        self.finish(None, Some(TurnFailure::Persistence(e)))
                    }
                }
            }
            RelayOutcome::Failed { content, reason } => {
                self.tracker.advance(TurnState::Failed);
                warn!(chat_id = %self.chat_id, model = %self.model, elapsed_ms, relayed_len, reason = %reason, "inference failed mid-stream");
                let partial = self.keep_partial(&content).await;
                let _ = tx.send(RelayEvent::Error(reason.clone())).await;
                self.finish(partial, Some(TurnFailure::Upstream(reason)))
            }
            RelayOutcome::Disconnected { content } => {
                self.tracker.advance(TurnState::Failed);
                info!(chat_id = %self.chat_id, model = %self.model, elapsed_ms, relayed_len, "client disconnected; generation cancelled");
                let partial = self.keep_partial(&content).await;
                self.finish(partial, Some(TurnFailure::Disconnected))
            }
        }
    }

    /// Store the relayed prefix of a failed turn when the policy says so.
    /// After a disconnect that is only the part the client received.
    async fn keep_partial(&self, content: &str) -> Option<ChatMessage> {
        if self.policy == PartialReplyPolicy::Discard || content.is_empty() {
            return None;
        }
        match self
            .store
            .append_message(&self.chat_id, Role::Assistant, content)
            .await
        {
            Ok(m) => {
                debug!(chat_id = %self.chat_id, len = content.len(), "partial reply stored");
                Some(m)
            }
            Err(e) => {
                error!(chat_id = %self.chat_id, error = %e, "failed to store partial reply");
                None
            }
        }
    }

    fn schedule_fanout(&self, assistant: &ChatMessage) {
        self.fanout
            .submit(FanoutJob::IndexMessage(SearchDocument::from(&self.user_message)));
        self.fanout
            .submit(FanoutJob::IndexMessage(SearchDocument::from(assistant)));
        self.fanout.submit(FanoutJob::RecordUsage(self.model.clone()));
    }

    fn finish(
        self,
        assistant_message: Option<ChatMessage>,
        failure: Option<TurnFailure>,
    ) -> TurnOutcome {
        debug_assert!(self.tracker.state.is_terminal());
        TurnOutcome {
            state: self.tracker.state,
            assistant_message,
            failure,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
