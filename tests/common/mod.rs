//! Shared fixtures: a migrated in-memory database, seed helpers and the reference backend.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use di::Ref;
use market_chat::core::controller::{ChatController, ChatDependencies, ChatHandle, ChatOptions};
use market_chat::core::error::RepositoryError;
use market_chat::core::models::Message;
use market_chat::core::realtime::ReconnectPolicy;
use market_chat::core::state::ChatState;
use market_chat::infrastructure::database::DatabaseConnection;
use market_chat::infrastructure::realtime::ChangeFeed;
use market_chat::infrastructure::repositories::{DbConversationRepository, DbMessageRepository};
use market_chat::infrastructure::storage::LocalObjectStorage;
use market_chat::infrastructure::traits::MessageRepository;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

pub const WAIT: std::time::Duration = std::time::Duration::from_secs(5);

/// A single-connection in-memory database with migrations applied.
///
/// One connection that never idles out keeps the database alive for the whole test.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// `2025-06-01 12:00` plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub async fn seed_profile(pool: &SqlitePool, name: &str, role: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO profiles (id, display_name, email, role, password_hash, created_at) VALUES (?, ?, ?, ?, '', ?)",
    )
    .bind(id)
    .bind(name)
    .bind(format!("{}-{}@example.com", name.to_lowercase(), id.simple()))
    .bind(role)
    .bind(at(0))
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_product(pool: &SqlitePool, seller_id: Uuid, title: &str, price_cents: i64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO products (id, seller_id, title, price_cents, image_url, created_at) VALUES (?, ?, ?, ?, NULL, ?)",
    )
    .bind(id)
    .bind(seller_id)
    .bind(title)
    .bind(price_cents)
    .bind(at(0))
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_conversation(
    pool: &SqlitePool,
    buyer_id: Uuid,
    seller_id: Uuid,
    product_id: Option<Uuid>,
    created_at: DateTime<Utc>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO conversations (id, buyer_id, seller_id, product_id, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(buyer_id)
    .bind(seller_id)
    .bind(product_id)
    .bind(created_at)
    .execute(pool)
    .await
    .unwrap();
    id
}

/// Inserts a message and moves the conversation preview to it, like a committed send.
pub async fn seed_message(
    pool: &SqlitePool,
    conversation_id: Uuid,
    sender_id: Uuid,
    body: &str,
    created_at: DateTime<Utc>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender_id, body, attachment_url, created_at) VALUES (?, ?, ?, ?, NULL, ?)",
    )
    .bind(id)
    .bind(conversation_id)
    .bind(sender_id)
    .bind(body)
    .bind(created_at)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "UPDATE conversations SET last_message = ?, last_message_at = ?, last_sender_id = ? WHERE id = ?",
    )
    .bind(body)
    .bind(created_at)
    .bind(sender_id)
    .bind(conversation_id)
    .execute(pool)
    .await
    .unwrap();
    id
}

/// Message repository wrapper that can hold back history, hold back or fail sends, and counts
/// calls.
pub struct ScriptedMessages {
    inner: DbMessageRepository,
    feed: Ref<ChangeFeed>,
    history_gates: Mutex<HashMap<Uuid, Arc<Notify>>>,
    sends_open: watch::Sender<bool>,
    fail_sends: AtomicBool,
    pub history_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    /// Live feed connections at the start of each history read.
    pub connections_at_history: Mutex<Vec<usize>>,
}

impl ScriptedMessages {
    pub fn new(inner: DbMessageRepository, feed: Ref<ChangeFeed>) -> Self {
        ScriptedMessages {
            inner,
            feed,
            history_gates: Mutex::new(HashMap::new()),
            sends_open: watch::channel(true).0,
            fail_sends: AtomicBool::new(false),
            history_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            connections_at_history: Mutex::new(Vec::new()),
        }
    }

    /// History of `conversation_id` is returned only after the returned notify fires.
    pub fn hold_history(&self, conversation_id: Uuid) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(conversation_id, gate.clone());
        gate
    }

    /// Sends started from now on wait until `release_sends`.
    pub fn hold_sends(&self) {
        self.sends_open.send_replace(false);
    }

    pub fn release_sends(&self) {
        self.sends_open.send_replace(true);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageRepository for ScriptedMessages {
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, RepositoryError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.connections_at_history
            .lock()
            .unwrap()
            .push(self.feed.connection_count());
        let result = self.inner.list_messages(conversation_id).await;
        let gate = self.history_gates.lock().unwrap().remove(&conversation_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
        attachment_url: Option<String>,
    ) -> Result<Message, RepositoryError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let mut open = self.sends_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RepositoryError::Transient("service unavailable".to_owned()));
        }
        self.inner
            .send_message(conversation_id, sender_id, body, attachment_url)
            .await
    }
}

/// The reference backend over one database, with a scripted message repository in front.
pub struct TestBackend {
    pub pool: SqlitePool,
    pub connection: Ref<DatabaseConnection>,
    pub feed: Ref<ChangeFeed>,
    pub conversations: Ref<DbConversationRepository>,
    pub messages: Ref<ScriptedMessages>,
    pub storage_dir: tempfile::TempDir,
}

impl TestBackend {
    pub async fn new() -> Self {
        let pool = setup_test_db().await;
        let connection = Ref::new(DatabaseConnection::from_pool(pool.clone()));
        let feed = Ref::new(ChangeFeed::create());
        let conversations = Ref::new(DbConversationRepository::new(
            connection.clone(),
            feed.clone(),
        ));
        let messages = Ref::new(ScriptedMessages::new(
            DbMessageRepository::new(connection.clone(), feed.clone()),
            feed.clone(),
        ));

        TestBackend {
            pool,
            connection,
            feed,
            conversations,
            messages,
            storage_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn dependencies(&self) -> ChatDependencies {
        ChatDependencies {
            conversations: self.conversations.clone(),
            messages: self.messages.clone(),
            transport: self.feed.clone(),
            storage: Ref::new(LocalObjectStorage::new(
                self.storage_dir.path(),
                "http://files.test",
            )),
        }
    }

    /// A controller reconnecting quickly, so outage tests run in milliseconds.
    pub fn spawn_chat(&self) -> ChatHandle {
        ChatController::spawn(
            self.dependencies(),
            ChatOptions {
                reconnect: fast_reconnect(),
                ..ChatOptions::default()
            },
        )
    }
}

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        max_retries: 3,
        initial_backoff: std::time::Duration::from_millis(10),
        max_backoff: std::time::Duration::from_millis(40),
    }
}

/// Waits for a published state matching `predicate`, failing the test after [`WAIT`].
pub async fn wait_until(
    chat: &ChatHandle,
    predicate: impl FnMut(&ChatState) -> bool,
) -> ChatState {
    tokio::time::timeout(WAIT, chat.wait_for(predicate))
        .await
        .expect("timed out waiting for chat state")
        .unwrap()
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
