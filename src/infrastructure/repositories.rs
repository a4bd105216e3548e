//! DB Repository abstractions

use crate::core::error::RepositoryError;
use crate::core::models::{self, Conversation, is_blank, preview_text};
use crate::infrastructure::database::{DatabaseConnection, logged};
use crate::infrastructure::entities;
use crate::infrastructure::realtime::{ChangeEvent, ChangeFeed, ChangeRow};
use crate::infrastructure::traits::{ConversationRepository, MessageRepository, ProductRepository};
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::debug;
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Conversations joined with the counterpart of the viewer (bound first) and the product.
const LISTING_SELECT: &str = "SELECT c.id, c.buyer_id, c.seller_id, c.product_id, c.last_message, c.last_message_at, c.created_at, \
     p.id AS counterpart_id, p.display_name AS counterpart_name, p.role AS counterpart_role, \
     pr.title AS product_title, pr.price_cents AS product_price_cents, pr.image_url AS product_image_url \
     FROM conversations c \
     INNER JOIN profiles p ON p.id = CASE WHEN c.buyer_id = ? THEN c.seller_id ELSE c.buyer_id END \
     LEFT JOIN products pr ON pr.id = c.product_id";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, attachment_url, created_at";

const PRODUCT_SELECT: &str = "SELECT pr.id, pr.seller_id, p.display_name AS seller_name, pr.title, pr.price_cents, pr.image_url, pr.created_at \
     FROM products pr INNER JOIN profiles p ON p.id = pr.seller_id";

#[injectable(ConversationRepository)]
pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
    feed: Ref<ChangeFeed>,
}

impl DbConversationRepository {
    pub fn new(connection: Ref<DatabaseConnection>, feed: Ref<ChangeFeed>) -> Self {
        DbConversationRepository { connection, feed }
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn list_conversations_page(
        &self,
        user_id: Uuid,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let sql = format!(
            "{LISTING_SELECT} WHERE c.buyer_id = ? OR c.seller_id = ? \
             ORDER BY c.last_message_at IS NULL, julianday(c.last_message_at) DESC, julianday(c.created_at) DESC, c.rowid DESC \
             LIMIT ? OFFSET ?"
        );

        let rows: Vec<entities::ConversationListing> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(user_id)
            .bind(user_id)
            .bind(limit.map(i64::from).unwrap_or(-1))
            .bind(i64::from(offset))
            .fetch_all(&**self.connection)
            .await
            .map_err(logged("listing conversations failed"))?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, RepositoryError> {
        let sql = format!("{LISTING_SELECT} WHERE c.id = ? AND (c.buyer_id = ? OR c.seller_id = ?)");

        let row: Option<entities::ConversationListing> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(conversation_id)
            .bind(user_id)
            .bind(user_id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged("fetching conversation failed"))?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("conversation {conversation_id}")))?
            .try_into()
    }

    async fn find_or_create_conversation(
        &self,
        buyer_id: Uuid,
        seller_id: Uuid,
        product_id: Option<Uuid>,
    ) -> Result<Conversation, RepositoryError> {
        if buyer_id == seller_id {
            return Err(RepositoryError::Validation(
                "cannot start a conversation with yourself".to_owned(),
            ));
        }

        let _write = self.feed.lock_writes().await;
        let mut tx = self
            .connection
            .begin()
            .await
            .map_err(logged("starting transaction failed"))?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM conversations WHERE buyer_id = ? AND seller_id = ? AND product_id IS ?",
        )
        .bind(buyer_id)
        .bind(seller_id)
        .bind(product_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(logged("looking up conversation failed"))?;

        let conversation_id = match existing {
            Some(id) => {
                tx.commit().await.map_err(logged("commit failed"))?;
                id
            }
            None => {
                require_role(&mut *tx, buyer_id, "buyer").await?;
                require_role(&mut *tx, seller_id, "seller").await?;

                if let Some(product_id) = product_id {
                    let owner: Option<Uuid> =
                        sqlx::query_scalar("SELECT seller_id FROM products WHERE id = ?")
                            .bind(product_id)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(logged("looking up product failed"))?;
                    match owner {
                        Some(owner) if owner == seller_id => {}
                        Some(_) => {
                            return Err(RepositoryError::Validation(format!(
                                "product {product_id} is not sold by {seller_id}"
                            )));
                        }
                        None => {
                            return Err(RepositoryError::NotFound(format!("product {product_id}")));
                        }
                    }
                }

                let created: entities::Conversation = sqlx::query_as(
                    "INSERT INTO conversations (id, buyer_id, seller_id, product_id, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id, buyer_id, seller_id, product_id, last_message, last_message_at, last_sender_id, created_at",
                )
                .bind(Uuid::new_v4())
                .bind(buyer_id)
                .bind(seller_id)
                .bind(product_id)
                .bind(Utc::now())
                .fetch_one(&mut *tx)
                .await
                .map_err(logged("creating conversation failed"))?;

                tx.commit().await.map_err(logged("commit failed"))?;
                debug!("created conversation {}", created.id);

                let id = created.id;
                self.feed
                    .publish(ChangeEvent::insert(ChangeRow::Conversation(created)));
                id
            }
        };

        self.get_conversation(buyer_id, conversation_id).await
    }
}

/// Fails with `Validation` when the profile has another role, `NotFound` when it is missing.
async fn require_role(
    connection: &mut SqliteConnection,
    profile_id: Uuid,
    role: &str,
) -> Result<(), RepositoryError> {
    let actual: Option<String> = sqlx::query_scalar("SELECT role FROM profiles WHERE id = ?")
        .bind(profile_id)
        .fetch_optional(connection)
        .await
        .map_err(logged("looking up profile role failed"))?;
    match actual.as_deref() {
        Some(actual) if actual == role => Ok(()),
        Some(_) => Err(RepositoryError::Validation(format!(
            "{profile_id} is not a {role}"
        ))),
        None => Err(RepositoryError::NotFound(format!("{role} {profile_id}"))),
    }
}

#[injectable(MessageRepository)]
pub struct DbMessageRepository {
    connection: Ref<DatabaseConnection>,
    feed: Ref<ChangeFeed>,
}

impl DbMessageRepository {
    pub fn new(connection: Ref<DatabaseConnection>, feed: Ref<ChangeFeed>) -> Self {
        DbMessageRepository { connection, feed }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<models::Message>, RepositoryError> {
        let rows: Vec<entities::Message> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY julianday(created_at) ASC, rowid ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&**self.connection)
        .await
        .map_err(logged("listing messages failed"))?;

        if rows.is_empty() {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&**self.connection)
                .await
                .map_err(logged("looking up conversation failed"))?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }
        }

        Ok(rows.into_iter().map(models::Message::from).collect())
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
        attachment_url: Option<String>,
    ) -> Result<models::Message, RepositoryError> {
        if is_blank(&body, attachment_url.as_deref()) {
            return Err(RepositoryError::Validation(
                "a message needs a body or an attachment".to_owned(),
            ));
        }

        let _write = self.feed.lock_writes().await;
        let mut tx = self
            .connection
            .begin()
            .await
            .map_err(logged("starting transaction failed"))?;

        let participants: Option<(Uuid, Uuid)> =
            sqlx::query_as("SELECT buyer_id, seller_id FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(logged("looking up conversation failed"))?;

        match participants {
            None => {
                return Err(RepositoryError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }
            Some((buyer_id, seller_id)) if sender_id != buyer_id && sender_id != seller_id => {
                return Err(RepositoryError::Forbidden(format!(
                    "{sender_id} is not a participant of {conversation_id}"
                )));
            }
            Some(_) => {}
        }

        let preview = preview_text(&body, attachment_url.as_deref());
        let message: entities::Message = sqlx::query_as(&format!(
            "INSERT INTO messages (id, conversation_id, sender_id, body, attachment_url, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_id)
        .bind(body)
        .bind(attachment_url)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(logged("inserting message failed"))?;

        let conversation: entities::Conversation = sqlx::query_as(
            "UPDATE conversations SET last_message = ?, last_message_at = ?, last_sender_id = ? WHERE id = ? RETURNING id, buyer_id, seller_id, product_id, last_message, last_message_at, last_sender_id, created_at",
        )
        .bind(preview)
        .bind(message.created_at)
        .bind(sender_id)
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(logged("touching conversation failed"))?;

        tx.commit().await.map_err(logged("commit failed"))?;

        self.feed
            .publish(ChangeEvent::insert(ChangeRow::Message(message.clone())));
        self.feed
            .publish(ChangeEvent::update(ChangeRow::Conversation(conversation)));

        Ok(message.into())
    }
}

#[injectable(ProductRepository)]
pub struct DbProductRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbProductRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        DbProductRepository { connection }
    }
}

#[async_trait]
impl ProductRepository for DbProductRepository {
    async fn list_products(
        &self,
        seller_id: Option<Uuid>,
    ) -> Result<Vec<models::Product>, RepositoryError> {
        let sql = format!(
            "{PRODUCT_SELECT} WHERE ? IS NULL OR pr.seller_id = ? \
             ORDER BY julianday(pr.created_at) DESC, pr.rowid DESC"
        );

        let rows: Vec<entities::Product> = sqlx::query_as(&sql)
            .bind(seller_id)
            .bind(seller_id)
            .fetch_all(&**self.connection)
            .await
            .map_err(logged("listing products failed"))?;

        Ok(rows.into_iter().map(models::Product::from).collect())
    }

    async fn create_product(
        &self,
        seller_id: Uuid,
        title: String,
        price_cents: i64,
        image_url: Option<String>,
    ) -> Result<models::Product, RepositoryError> {
        let title = title.trim().to_owned();
        if title.is_empty() || price_cents < 0 {
            return Err(RepositoryError::Validation(
                "a product needs a title and a non-negative price".to_owned(),
            ));
        }

        let role: Option<String> = sqlx::query_scalar("SELECT role FROM profiles WHERE id = ?")
            .bind(seller_id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged("looking up seller failed"))?;
        if role.as_deref() != Some("seller") {
            return Err(RepositoryError::Forbidden(format!(
                "{seller_id} cannot list products"
            )));
        }

        let product_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO products (id, seller_id, title, price_cents, image_url, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(product_id)
        .bind(seller_id)
        .bind(title)
        .bind(price_cents)
        .bind(image_url)
        .bind(Utc::now())
        .execute(&**self.connection)
        .await
        .map_err(logged("creating product failed"))?;
        debug!("created product {product_id}");

        let row: entities::Product = sqlx::query_as(&format!("{PRODUCT_SELECT} WHERE pr.id = ?"))
            .bind(product_id)
            .fetch_one(&**self.connection)
            .await
            .map_err(logged("fetching product failed"))?;

        Ok(row.into())
    }
}
