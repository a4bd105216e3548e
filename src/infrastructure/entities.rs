//! Database entities

use crate::core::error::RepositoryError;
use crate::core::models::{self, Counterpart, Identity, ProductSummary, Role, UnknownRole};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub role: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn identity(&self) -> Result<Identity, UnknownRole> {
        Ok(Identity {
            id: self.id,
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            role: self.role.parse()?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuthSession {
    pub token: String,
    pub refresh_token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A product row joined with its seller's display name.
#[derive(Debug, Clone, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub seller_name: String,
    pub title: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Product> for models::Product {
    fn from(product: Product) -> Self {
        models::Product {
            id: product.id,
            seller_id: product.seller_id,
            seller_name: product.seller_name,
            title: product.title,
            price_cents: product.price_cents,
            image_url: product.image_url,
            created_at: product.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub product_id: Option<Uuid>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A conversation row joined with the counterpart profile and the product.
#[derive(Debug, Clone, FromRow)]
pub struct ConversationListing {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub product_id: Option<Uuid>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub counterpart_id: Uuid,
    pub counterpart_name: String,
    pub counterpart_role: String,
    pub product_title: Option<String>,
    pub product_price_cents: Option<i64>,
    pub product_image_url: Option<String>,
}

impl TryFrom<ConversationListing> for models::Conversation {
    type Error = RepositoryError;

    fn try_from(row: ConversationListing) -> Result<Self, Self::Error> {
        let role: Role = row
            .counterpart_role
            .parse()
            .map_err(|e: UnknownRole| RepositoryError::Transient(e.to_string()))?;

        let product = match (row.product_id, row.product_title, row.product_price_cents) {
            (Some(id), Some(title), Some(price_cents)) => Some(ProductSummary {
                id,
                title,
                price_cents,
                image_url: row.product_image_url,
            }),
            _ => None,
        };

        Ok(models::Conversation {
            id: row.id,
            buyer_id: row.buyer_id,
            seller_id: row.seller_id,
            product,
            counterpart: Counterpart {
                id: row.counterpart_id,
                display_name: row.counterpart_name,
                role,
            },
            last_message: row.last_message,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for models::Message {
    fn from(message: Message) -> Self {
        models::Message {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body,
            attachment_url: message.attachment_url,
            created_at: message.created_at,
        }
    }
}
