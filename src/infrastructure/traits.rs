//! Infrastructure traits, used for DI on higher levels

use crate::core::error::{AuthError, RepositoryError, StorageError, TransportError};
use crate::core::models::{
    AuthSession, Conversation, Credentials, Identity, Message, Product, Registration,
};
use crate::infrastructure::realtime::{ChangeFilter, ChangeStream};
use async_trait::async_trait;
use std::io;
use uuid::Uuid;

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Lists every conversation `user_id` takes part in, most recently active first.
    ///
    /// Counterpart profile and product are embedded in each row.
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, RepositoryError> {
        self.list_conversations_page(user_id, None, 0).await
    }

    /// Same ordering as `list_conversations`, one page at a time.
    async fn list_conversations_page(
        &self,
        user_id: Uuid,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<Conversation>, RepositoryError>;

    /// Fetches one conversation as seen by `user_id`.
    ///
    /// Returns `Err` if it does not exist or the user is not a participant.
    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, RepositoryError>;

    /// Returns the conversation keyed by (buyer, seller, product), creating it if needed.
    ///
    /// The result is seen from the buyer's side.
    async fn find_or_create_conversation(
        &self,
        buyer_id: Uuid,
        seller_id: Uuid,
        product_id: Option<Uuid>,
    ) -> Result<Conversation, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Messages of a conversation, oldest first.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, RepositoryError>;

    /// Appends a message and waits for the write to be acknowledged.
    ///
    /// Returns the stored row with its server id and timestamp. `body` and `attachment_url`
    /// cannot both be empty.
    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
        attachment_url: Option<String>,
    ) -> Result<Message, RepositoryError>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Lists the catalog newest first, optionally only one seller's products.
    async fn list_products(&self, seller_id: Option<Uuid>) -> Result<Vec<Product>, RepositoryError>;

    /// Adds a product. Returns `Err(Forbidden)` if `seller_id` is not a seller.
    async fn create_product(
        &self,
        seller_id: Uuid,
        title: String,
        price_cents: i64,
        image_url: Option<String>,
    ) -> Result<Product, RepositoryError>;
}

/// Push feed of row changes. A stream ending means the connection dropped.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, filter: ChangeFilter) -> Result<ChangeStream, TransportError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` and returns the public URL of the object.
    async fn put_object(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_up(&self, registration: &Registration) -> Result<AuthSession, AuthError>;

    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, AuthError>;

    /// Exchanges a refresh token for a new session. The old tokens stop working.
    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError>;

    /// Resolves an access token. Returns `Err(TokenExpired)` once it is no longer valid.
    async fn get_user(&self, access_token: &str) -> Result<Identity, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;
}

/// Key-value storage shared by every role of one client profile, like browser local storage.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> io::Result<Option<String>>;

    async fn set_item(&self, key: &str, value: String) -> io::Result<()>;

    async fn remove_item(&self, key: &str) -> io::Result<()>;
}
