//! Domain types shared by the repositories, the realtime layer and the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Preview shown in the conversation list for attachment-only messages.
pub const ATTACHMENT_PREVIEW: &str = "[attachment]";

/// Actor role. Each role gets its own isolated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Buyer, Role::Seller, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buyer" => Ok(Role::Buyer),
            "seller" => Ok(Role::Seller),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_owned())),
        }
    }
}

/// The authenticated user behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            email: email.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub display_name: String,
    pub credentials: Credentials,
    pub role: Role,
}

/// Tokens issued by the auth backend. This is what gets persisted per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub identity: Identity,
}

impl AuthSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Public part of the other participant's profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterpart {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: Uuid,
    pub title: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
}

/// A catalog listing, with the seller's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub seller_name: String,
    pub title: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn summary(&self) -> ProductSummary {
        ProductSummary {
            id: self.id,
            title: self.title.clone(),
            price_cents: self.price_cents,
            image_url: self.image_url.clone(),
        }
    }
}

/// A buyer/seller conversation as seen by one of its participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub product: Option<ProductSummary>,
    pub counterpart: Counterpart,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn product_id(&self) -> Option<Uuid> {
        self.product.as_ref().map(|p| p.id)
    }

    /// Inbox order: most recent activity first, silent conversations last, newest first among
    /// those.
    pub fn cmp_recency(a: &Conversation, b: &Conversation) -> Ordering {
        let by_activity = match (a.last_message_at, b.last_message_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_activity.then_with(|| b.created_at.cmp(&a.created_at))
    }
}

/// A committed message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn preview(&self) -> String {
        preview_text(&self.body, self.attachment_url.as_deref())
    }
}

/// True when there is nothing to send.
pub fn is_blank(body: &str, attachment_url: Option<&str>) -> bool {
    body.trim().is_empty() && attachment_url.is_none_or(|url| url.trim().is_empty())
}

pub fn preview_text(body: &str, attachment_url: Option<&str>) -> String {
    let body = body.trim();
    if body.is_empty() && attachment_url.is_some() {
        ATTACHMENT_PREVIEW.to_owned()
    } else {
        body.to_owned()
    }
}

/// A file to upload to object storage before the message referencing it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Identity of an entry in a thread. Optimistic entries carry a client-generated id until the
/// repository acknowledges them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKey {
    Temporary(Uuid),
    Server(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

/// One rendered entry of a message thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub key: MessageKey,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl ThreadMessage {
    pub fn committed(message: Message) -> Self {
        ThreadMessage {
            key: MessageKey::Server(message.id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body,
            attachment_url: message.attachment_url,
            created_at: message.created_at,
            state: DeliveryState::Sent,
        }
    }

    pub fn pending(
        temp_id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
        attachment_url: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        ThreadMessage {
            key: MessageKey::Temporary(temp_id),
            conversation_id,
            sender_id,
            body,
            attachment_url,
            created_at,
            state: DeliveryState::Pending,
        }
    }

    pub fn server_id(&self) -> Option<Uuid> {
        match self.key {
            MessageKey::Server(id) => Some(id),
            MessageKey::Temporary(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<Uuid> {
        match self.key {
            MessageKey::Temporary(id) => Some(id),
            MessageKey::Server(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, DeliveryState::Failed { .. })
    }
}
