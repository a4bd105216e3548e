//! Conversation list view

use crate::api::conversations::schemas::{ConversationItem, ConversationList};
use crate::api::{connection_banner, format_price};
use crate::core::state::{ChatState, ListStatus};
use std::fmt::Write;

pub fn list_view(state: &ChatState) -> ConversationList {
    let active = state.active_conversation();

    ConversationList {
        status: status_label(state.list_status()),
        error: match state.list_status() {
            ListStatus::Failed(reason) => Some(reason.clone()),
            _ => state.last_error().map(str::to_owned),
        },
        connection: connection_banner(state.connection()).map(str::to_owned),
        conversations: state
            .conversations()
            .iter()
            .map(|entry| ConversationItem::new(entry, active == Some(entry.conversation.id)))
            .collect(),
    }
}

/// One line per conversation, numbered from 1 in list order.
pub fn render_list(state: &ChatState) -> String {
    let view = list_view(state);
    let mut out = String::new();

    if let Some(banner) = &view.connection {
        let _ = writeln!(out, "! {banner}");
    }
    if let Some(error) = &view.error {
        let _ = writeln!(out, "! {error}");
    }

    match view.status {
        "loading" if view.conversations.is_empty() => {
            let _ = writeln!(out, "loading conversations...");
        }
        _ if view.conversations.is_empty() => {
            let _ = writeln!(out, "no conversations yet");
        }
        _ => {}
    }

    for (index, item) in view.conversations.iter().enumerate() {
        let marker = if item.selected { ">" } else { " " };
        let _ = write!(
            out,
            "{marker} {}. {} [{}]",
            index + 1,
            item.counterpart,
            item.counterpart_role
        );
        if let Some(title) = &item.product_title {
            let _ = write!(out, " about {title}");
            if let Some(price_cents) = item.product_price_cents {
                let _ = write!(out, " ({})", format_price(price_cents));
            }
        }
        if let Some(preview) = &item.preview {
            let _ = write!(out, ": {preview}");
        }
        if let Some(at) = item.last_message_at {
            let _ = write!(out, " ({})", at.format("%Y-%m-%d %H:%M"));
        }
        if item.has_unread {
            let _ = write!(out, " *");
        }
        out.push('\n');
    }

    out
}

fn status_label(status: &ListStatus) -> &'static str {
    match status {
        ListStatus::Idle => "idle",
        ListStatus::Loading => "loading",
        ListStatus::Ready => "ready",
        ListStatus::Failed(_) => "failed",
    }
}

pub mod schemas {
    use crate::core::state::ConversationEntry;
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use uuid::Uuid;

    #[derive(Serialize, Debug)]
    pub struct ConversationItem {
        pub id: Uuid,
        pub counterpart: String,
        pub counterpart_role: String,
        pub product_id: Option<Uuid>,
        pub product_title: Option<String>,
        pub product_price_cents: Option<i64>,
        pub product_image_url: Option<String>,
        pub preview: Option<String>,
        pub last_message_at: Option<DateTime<Utc>>,
        pub has_unread: bool,
        pub selected: bool,
    }

    impl ConversationItem {
        pub fn new(entry: &ConversationEntry, selected: bool) -> Self {
            let conversation = &entry.conversation;
            ConversationItem {
                id: conversation.id,
                counterpart: conversation.counterpart.display_name.clone(),
                counterpart_role: conversation.counterpart.role.to_string(),
                product_id: conversation.product_id(),
                product_title: conversation.product.as_ref().map(|p| p.title.clone()),
                product_price_cents: conversation.product.as_ref().map(|p| p.price_cents),
                product_image_url: conversation
                    .product
                    .as_ref()
                    .and_then(|p| p.image_url.clone()),
                preview: conversation.last_message.clone(),
                last_message_at: conversation.last_message_at,
                has_unread: entry.has_unread,
                selected,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationList {
        pub status: &'static str,
        pub error: Option<String>,
        pub connection: Option<String>,
        pub conversations: Vec<ConversationItem>,
    }
}
