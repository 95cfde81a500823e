//! Test fixtures and doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use crate::config::Config;
use crate::entities::{Chat, ChatStore, ModelStore, SqliteStore, UserRecord, UserStore};
use crate::seed;
use crate::services::cache::{CacheBackend, CacheError, MemoryCache};
use crate::services::fanout::{Fanout, FanoutConfig, FanoutWorker};
use crate::services::inference::{
    ContextMessage, InferenceBackend, InferenceError, StreamChunk, TokenStream,
};
use crate::services::registry::ModelRegistry;
use crate::services::search::{IndexError, SearchDocument, SearchHit, SearchIndex};
use crate::services::turn::{TurnCoordinator, TurnSettings};
use crate::state::AppState;

pub const TEST_PASSWORD: &str = "correct horse";

pub async fn memory_store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:")
        .await
        .expect("in-memory store")
}

pub async fn seed_catalog(store: &SqliteStore) {
    store
        .seed_models(&seed::default_catalog())
        .await
        .expect("seed catalog");
}

pub async fn seed_user(store: &SqliteStore, username: &str) -> UserRecord {
    let user = UserRecord {
        id: Uuid::new_v4().to_string(),
        username: username.to_owned(),
        email: format!("{username}@example.com"),
        password_digest: seed::hash_password(TEST_PASSWORD).expect("hash password"),
        default_model: None,
        theme: None,
        created_at: Utc::now(),
    };
    store.insert_user(user.clone()).await.expect("insert user");
    user
}

pub fn chat_for(user_id: &str, model: &str) -> Chat {
    let now = Utc::now();
    Chat {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_owned(),
        model_name: model.to_owned(),
        title: "Test chat".into(),
        message_count: 0,
        created_at: now,
        updated_at: now,
    }
}

pub async fn seed_chat_with(store: &SqliteStore, user_id: &str) -> Chat {
    let chat = chat_for(user_id, "llama3.1:latest");
    store.create_chat(chat.clone()).await.expect("create chat");
    chat
}

/// A fresh user owning one empty chat.
pub async fn seed_chat(store: &SqliteStore) -> Chat {
    let user = seed_user(store, &format!("user-{}", Uuid::new_v4().simple())).await;
    seed_chat_with(store, &user.id).await
}

// ── Inference ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Script {
    Reply(Vec<String>),
    FailAfter(Vec<String>, String),
    Truncated(Vec<String>),
    Endless,
}

/// Backend that plays a fixed script for every call and records what it
/// was asked.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    token_delay: Option<Duration>,
    refuse_next: Mutex<Option<u16>>,
    calls: Mutex<Vec<(String, Vec<ContextMessage>)>>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedBackend {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            token_delay: None,
            refuse_next: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn owned(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| (*t).to_owned()).collect()
    }

    pub fn replying(tokens: &[&str]) -> Self {
        Self::with_script(Script::Reply(Self::owned(tokens)))
    }

    pub fn failing_after(tokens: &[&str], error: &str) -> Self {
        Self::with_script(Script::FailAfter(Self::owned(tokens), error.to_owned()))
    }

    /// Tokens, then the stream just ends.
    pub fn truncated(tokens: &[&str]) -> Self {
        Self::with_script(Script::Truncated(Self::owned(tokens)))
    }

    /// Never finishes; see [`ScriptedBackend::stream_dropped`].
    pub fn endless() -> Self {
        Self::with_script(Script::Endless)
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Make the next call fail with `status` before streaming.
    pub fn refuse_next(&self, status: u16) {
        *self.refuse_next.lock().unwrap() = Some(status);
    }

    pub fn calls(&self) -> Vec<(String, Vec<ContextMessage>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether the last stream handed out has been dropped by its consumer.
    pub fn stream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn chat_stream(
        &self,
        model: &str,
        context: &[ContextMessage],
    ) -> Result<TokenStream, InferenceError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_owned(), context.to_vec()));

        if let Some(status) = self.refuse_next.lock().unwrap().take() {
            return Err(InferenceError::Status {
                status,
                body: "refused by script".into(),
            });
        }

        self.dropped.store(false, Ordering::SeqCst);
        let flag = DropFlag(self.dropped.clone());
        let delay = self.token_delay;

        let chunks: VecDeque<StreamChunk> = match &self.script {
            Script::Reply(tokens) => tokens
                .iter()
                .cloned()
                .map(StreamChunk::Token)
                .chain(std::iter::once(StreamChunk::Done))
                .collect(),
            Script::FailAfter(tokens, error) => tokens
                .iter()
                .cloned()
                .map(StreamChunk::Token)
                .chain(std::iter::once(StreamChunk::Error(error.clone())))
                .collect(),
            Script::Truncated(tokens) => tokens.iter().cloned().map(StreamChunk::Token).collect(),
            Script::Endless => VecDeque::new(),
        };
        let endless = matches!(self.script, Script::Endless);

        let stream = futures::stream::unfold((chunks, flag), move |(mut chunks, flag)| async move {
            match delay {
                Some(d) => tokio::time::sleep(d).await,
                None => tokio::task::yield_now().await,
            }
            if endless {
                return Some((StreamChunk::Token("more ".into()), (chunks, flag)));
            }
            let next = chunks.pop_front()?;
            Some((next, (chunks, flag)))
        });
        Ok(stream.boxed())
    }
}

// ── Search ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingIndex {
    indexed: Mutex<Vec<SearchDocument>>,
    removed: Mutex<Vec<String>>,
}

impl RecordingIndex {
    pub fn indexed_ids(&self) -> Vec<String> {
        self.indexed
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.message_id.clone())
            .collect()
    }

    pub fn removed_chats(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchIndex for RecordingIndex {
    async fn index(&self, doc: SearchDocument) -> Result<(), IndexError> {
        self.indexed.lock().unwrap().push(doc);
        Ok(())
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, IndexError> {
        Ok(self
            .indexed
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.content.contains(query))
            .take(limit as usize)
            .map(|d| SearchHit {
                id: d.message_id.clone(),
                chat_id: d.chat_id.clone(),
                content: d.content.clone(),
            })
            .collect())
    }

    async fn remove_chat(&self, chat_id: &str) -> Result<(), IndexError> {
        self.removed.lock().unwrap().push(chat_id.to_owned());
        Ok(())
    }
}

/// Index whose every operation fails as if the index were down.
#[derive(Debug, Default)]
pub struct FailingIndex {
    calls: AtomicUsize,
}

impl FailingIndex {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> IndexError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        IndexError::Unavailable(sqlx::Error::PoolClosed)
    }
}

#[async_trait]
impl SearchIndex for FailingIndex {
    async fn index(&self, _doc: SearchDocument) -> Result<(), IndexError> {
        Err(self.fail())
    }

    async fn search(&self, _query: &str, _limit: u32) -> Result<Vec<SearchHit>, IndexError> {
        Err(self.fail())
    }

    async fn remove_chat(&self, _chat_id: &str) -> Result<(), IndexError> {
        Err(self.fail())
    }
}

#[derive(Debug)]
pub struct PanickingIndex;

#[async_trait]
impl SearchIndex for PanickingIndex {
    async fn index(&self, _doc: SearchDocument) -> Result<(), IndexError> {
        panic!("index exploded");
    }

    async fn search(&self, _query: &str, _limit: u32) -> Result<Vec<SearchHit>, IndexError> {
        panic!("index exploded");
    }

    async fn remove_chat(&self, _chat_id: &str) -> Result<(), IndexError> {
        panic!("index exploded");
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FailingCache;

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Unavailable("down".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("down".into()))
    }
}

// ── Application ───────────────────────────────────────────────────────────────

/// A fully wired application over in-memory collaborators.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<SqliteStore>,
    pub user: UserRecord,
    pub worker: FanoutWorker,
}

pub async fn test_app(
    backend: Arc<dyn InferenceBackend>,
    search: Arc<dyn SearchIndex>,
    config: Config,
) -> TestApp {
    let store = Arc::new(memory_store().await);
    seed_catalog(&store).await;
    let user = seed_user(&store, "ada").await;

    let registry = Arc::new(ModelRegistry::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        config.model_cache_ttl,
    ));
    let (fanout, worker) = Fanout::start(
        search.clone(),
        registry.clone(),
        FanoutConfig {
            queue: config.fanout_queue,
            max_attempts: config.fanout_max_attempts,
            base_backoff: Duration::from_millis(1),
        },
    );
    let turns = Arc::new(TurnCoordinator::new(
        store.clone(),
        backend,
        registry.clone(),
        fanout.clone(),
        TurnSettings {
            relay_buffer: config.relay_buffer,
            partial_reply_policy: config.partial_reply_policy,
        },
    ));

    let state = Arc::new(AppState {
        config: Arc::new(config),
        store: store.clone(),
        registry,
        search,
        turns,
        fanout,
    });
    TestApp {
        state,
        store,
        user,
        worker,
    }
}
