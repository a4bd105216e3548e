//! Message thread view

use crate::api::messages::schemas::{Thread, ThreadItem};
use crate::core::state::{ChatState, ThreadStatus};
use std::fmt::Write;

/// View of the active thread, `None` while no conversation is selected.
pub fn thread_view(state: &ChatState) -> Option<Thread> {
    let conversation_id = state.active_conversation()?;
    let me = state.user_id();
    let title = state
        .conversation(conversation_id)
        .map(|entry| match &entry.conversation.product {
            Some(product) => format!(
                "{} about {}",
                entry.conversation.counterpart.display_name, product.title
            ),
            None => entry.conversation.counterpart.display_name.clone(),
        });

    let (status, error) = match state.thread_status() {
        ThreadStatus::Idle => ("idle", None),
        ThreadStatus::LoadingHistory => ("loading", None),
        ThreadStatus::Ready => ("ready", None),
        ThreadStatus::Failed(reason) => ("failed", Some(reason.clone())),
    };

    Some(Thread {
        conversation_id,
        title,
        status,
        error,
        resyncing: state.is_resyncing(),
        messages: state
            .thread()
            .iter()
            .map(|message| ThreadItem::new(message, me == Some(message.sender_id)))
            .collect(),
    })
}

/// The active thread oldest first. Failed entries show the temporary id to retry with.
pub fn render_thread(state: &ChatState) -> String {
    let Some(thread) = thread_view(state) else {
        return "no conversation selected\n".to_owned();
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "== {} ==",
        thread.title.as_deref().unwrap_or("conversation")
    );
    if let Some(error) = &thread.error {
        let _ = writeln!(out, "! could not load messages: {error}");
    }
    if thread.status == "loading" {
        let _ = writeln!(out, "loading messages...");
    } else if thread.resyncing {
        let _ = writeln!(out, "syncing...");
    }

    for item in &thread.messages {
        let who = if item.mine { "you" } else { "them" };
        let _ = write!(out, "[{}] {who}:", item.created_at.format("%H:%M"));
        if !item.body.is_empty() {
            let _ = write!(out, " {}", item.body);
        }
        if let Some(url) = &item.attachment_url {
            let _ = write!(out, " <{url}>");
        }
        match item.state {
            "pending" => out.push_str(" (sending)"),
            "failed" => {
                let _ = write!(
                    out,
                    " (failed: {}; retry {})",
                    item.failure.as_deref().unwrap_or("unknown error"),
                    item.temp_id.map(|id| id.to_string()).unwrap_or_default()
                );
            }
            _ => {}
        }
        out.push('\n');
    }

    out
}

pub mod schemas {
    use crate::core::models::{DeliveryState, MessageKey, ThreadMessage};
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use uuid::Uuid;

    #[derive(Serialize, Debug)]
    pub struct ThreadItem {
        /// Server id once acknowledged.
        pub id: Option<Uuid>,
        pub temp_id: Option<Uuid>,
        pub mine: bool,
        pub body: String,
        pub attachment_url: Option<String>,
        pub created_at: DateTime<Utc>,
        pub state: &'static str,
        pub failure: Option<String>,
    }

    impl ThreadItem {
        pub fn new(message: &ThreadMessage, mine: bool) -> Self {
            let (id, temp_id) = match message.key {
                MessageKey::Server(id) => (Some(id), None),
                MessageKey::Temporary(id) => (None, Some(id)),
            };
            let (state, failure) = match &message.state {
                DeliveryState::Pending => ("pending", None),
                DeliveryState::Sent => ("sent", None),
                DeliveryState::Failed { reason } => ("failed", Some(reason.clone())),
            };

            ThreadItem {
                id,
                temp_id,
                mine,
                body: message.body.clone(),
                attachment_url: message.attachment_url.clone(),
                created_at: message.created_at,
                state,
                failure,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct Thread {
        pub conversation_id: Uuid,
        pub title: Option<String>,
        pub status: &'static str,
        pub error: Option<String>,
        pub resyncing: bool,
        pub messages: Vec<ThreadItem>,
    }
}
