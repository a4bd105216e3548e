//! Chat state and the transitions applied to it.
//!
//! Everything here is synchronous. The controller feeds repository results, realtime events
//! and user commands through these methods one at a time, and publishes clones of the state
//! to renderers.

use crate::core::error::{ChatError, RepositoryError, TransportError};
use crate::core::models::{
    Conversation, DeliveryState, Message, MessageKey, ThreadMessage, is_blank,
};
use crate::core::realtime::{RealtimeEvent, SubscriptionScope};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ThreadStatus {
    #[default]
    Idle,
    LoadingHistory,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted. Loaded history is kept; `refresh` reconnects.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub conversation: Conversation,
    pub has_unread: bool,
}

/// The conversation selected by one `select` call. A new generation is issued per call, so a
/// result fetched for an earlier selection of the same conversation is also recognized as
/// stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub conversation_id: Uuid,
    pub generation: u64,
}

/// What the controller has to do after a realtime event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// Re-read history of the active conversation.
    ResyncThread(Selection),
    /// Re-read the conversation list.
    ReloadList,
}

/// An outgoing message ready to be written to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub temp_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachment_url: Option<String>,
}

/// A pushed copy of one of our own sends, paired with the pending entry it is held for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeldEcho {
    temp_id: Uuid,
    message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    user_id: Option<Uuid>,
    list_status: ListStatus,
    conversations: Vec<ConversationEntry>,
    selection: Option<Selection>,
    generation: u64,
    thread_status: ThreadStatus,
    thread: Vec<ThreadMessage>,
    held_echoes: Vec<HeldEcho>,
    connection: ConnectionState,
    resyncing: bool,
    last_error: Option<String>,
    subscriptions: Vec<SubscriptionScope>,
    echo_window: Duration,
}

impl Default for ChatState {
    fn default() -> Self {
        ChatState::new(Duration::seconds(30))
    }
}

impl ChatState {
    pub fn new(echo_window: Duration) -> Self {
        ChatState {
            user_id: None,
            list_status: ListStatus::Idle,
            conversations: Vec::new(),
            selection: None,
            generation: 0,
            thread_status: ThreadStatus::Idle,
            thread: Vec::new(),
            held_echoes: Vec::new(),
            connection: ConnectionState::Connected,
            resyncing: false,
            last_error: None,
            subscriptions: Vec::new(),
            echo_window,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn list_status(&self) -> &ListStatus {
        &self.list_status
    }

    pub fn conversations(&self) -> &[ConversationEntry] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<&ConversationEntry> {
        self.conversations
            .iter()
            .find(|entry| entry.conversation.id == conversation_id)
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn active_conversation(&self) -> Option<Uuid> {
        self.selection.map(|s| s.conversation_id)
    }

    pub fn thread_status(&self) -> &ThreadStatus {
        &self.thread_status
    }

    pub fn thread(&self) -> &[ThreadMessage] {
        &self.thread
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Scopes of the subscriptions the controller holds open.
    pub fn subscriptions(&self) -> &[SubscriptionScope] {
        &self.subscriptions
    }

    pub fn set_subscriptions(&mut self, scopes: Vec<SubscriptionScope>) {
        self.subscriptions = scopes;
    }

    pub fn begin_initialize(&mut self, user_id: Uuid) {
        if self.user_id != Some(user_id) {
            self.conversations.clear();
            self.clear_selection();
        }
        self.user_id = Some(user_id);
        self.list_status = ListStatus::Loading;
        self.connection = ConnectionState::Connected;
    }

    pub fn begin_list_reload(&mut self) {
        if self.list_status != ListStatus::Ready {
            self.list_status = ListStatus::Loading;
        }
    }

    /// Applies a fetched conversation list. Results for another user are dropped.
    pub fn apply_conversations(
        &mut self,
        user_id: Uuid,
        result: Result<Vec<Conversation>, RepositoryError>,
    ) -> bool {
        if self.user_id != Some(user_id) {
            debug!("dropping conversation list fetched for {user_id}");
            return false;
        }

        match result {
            Ok(conversations) => {
                let active = self.active_conversation();
                let previous = std::mem::take(&mut self.conversations);
                self.conversations = conversations
                    .into_iter()
                    .map(|conversation| {
                        let has_unread = Some(conversation.id) != active
                            && previous.iter().any(|p| {
                                p.conversation.id == conversation.id && p.has_unread
                            });
                        ConversationEntry {
                            conversation,
                            has_unread,
                        }
                    })
                    .collect();
                self.sort_conversations();
                self.list_status = ListStatus::Ready;
            }
            Err(e) => {
                let message = e.to_string();
                if self.list_status != ListStatus::Ready {
                    self.list_status = ListStatus::Failed(message.clone());
                }
                self.last_error = Some(message);
            }
        }
        true
    }

    /// Adds or replaces one conversation in the list.
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|entry| entry.conversation.id == conversation.id)
        {
            Some(entry) => entry.conversation = conversation,
            None => self.conversations.push(ConversationEntry {
                conversation,
                has_unread: false,
            }),
        }
        self.sort_conversations();
    }

    /// Switches the active conversation. Returns the new selection, or `None` when the thread
    /// was cleared.
    pub fn select(&mut self, conversation_id: Option<Uuid>) -> Option<Selection> {
        let Some(conversation_id) = conversation_id else {
            self.clear_selection();
            return None;
        };

        self.generation += 1;
        let selection = Selection {
            conversation_id,
            generation: self.generation,
        };
        self.selection = Some(selection);
        self.thread.clear();
        self.held_echoes.clear();
        self.thread_status = ThreadStatus::LoadingHistory;
        self.resyncing = false;
        if let Some(entry) = self
            .conversations
            .iter_mut()
            .find(|entry| entry.conversation.id == conversation_id)
        {
            entry.has_unread = false;
        }
        Some(selection)
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
        self.thread.clear();
        self.held_echoes.clear();
        self.thread_status = ThreadStatus::Idle;
        self.resyncing = false;
    }

    /// Marks a re-read of the active thread as in flight. Returns the selection to fetch for.
    pub fn begin_resync(&mut self) -> Option<Selection> {
        let selection = self.selection?;
        if self.thread_status == ThreadStatus::Ready {
            self.resyncing = true;
        } else {
            self.thread_status = ThreadStatus::LoadingHistory;
        }
        Some(selection)
    }

    /// Applies fetched history if `selection` is still the active one.
    ///
    /// Entries the fetch does not know about (local sends, realtime arrivals newer than the
    /// fetch) are kept.
    pub fn apply_history(
        &mut self,
        selection: Selection,
        result: Result<Vec<Message>, RepositoryError>,
    ) -> bool {
        if self.selection != Some(selection) {
            debug!(
                "dropping stale history for conversation {}",
                selection.conversation_id
            );
            return false;
        }

        let was_resync = self.resyncing;
        self.resyncing = false;

        match result {
            Ok(messages) => {
                let fetched: Vec<ThreadMessage> =
                    messages.into_iter().map(ThreadMessage::committed).collect();
                let kept: Vec<ThreadMessage> = std::mem::take(&mut self.thread)
                    .into_iter()
                    .filter(|entry| match entry.key {
                        MessageKey::Temporary(_) => true,
                        MessageKey::Server(id) => {
                            !fetched.iter().any(|f| f.server_id() == Some(id))
                        }
                    })
                    .collect();

                self.thread = fetched;
                for entry in kept {
                    self.insert_sorted(entry);
                }
                self.thread_status = ThreadStatus::Ready;
            }
            Err(e) => {
                let message = e.to_string();
                if !was_resync {
                    self.thread_status = ThreadStatus::Failed(message.clone());
                }
                self.last_error = Some(message);
            }
        }
        true
    }

    /// Appends an optimistic entry for an outgoing message.
    ///
    /// Rejected when the conversation is not the selected one or when there is nothing to send.
    pub fn push_pending(
        &mut self,
        conversation_id: Uuid,
        body: String,
        attachment_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<OutgoingMessage, ChatError> {
        let sender_id = self.user_id.ok_or(ChatError::NotInitialized)?;
        if is_blank(&body, attachment_url.as_deref()) {
            return Err(ChatError::EmptyMessage);
        }
        if self.active_conversation() != Some(conversation_id) {
            return Err(ChatError::NotSelected(conversation_id));
        }

        let outgoing = OutgoingMessage {
            temp_id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body: body.trim().to_owned(),
            attachment_url,
        };
        self.insert_sorted(ThreadMessage::pending(
            outgoing.temp_id,
            conversation_id,
            sender_id,
            outgoing.body.clone(),
            outgoing.attachment_url.clone(),
            now,
        ));
        Ok(outgoing)
    }

    /// Resolves an optimistic entry with the repository's answer.
    pub fn resolve_send(
        &mut self,
        conversation_id: Uuid,
        temp_id: Uuid,
        result: Result<Message, RepositoryError>,
    ) {
        let position = self.position_of(MessageKey::Temporary(temp_id));

        let result = match (result, position) {
            (Err(e), Some(_)) => match self.take_own_echo(temp_id) {
                // the write went through even though the call failed
                Some(echo) => Ok(echo),
                None => Err(e),
            },
            (result, _) => result,
        };

        match result {
            Ok(message) => {
                self.touch(
                    message.conversation_id,
                    Some(message.preview()),
                    Some(message.created_at),
                    false,
                );
                self.held_echoes.retain(|held| held.message.id != message.id);

                match position {
                    Some(index) => {
                        if self.position_of(MessageKey::Server(message.id)).is_some() {
                            self.thread.remove(index);
                        } else {
                            self.replace_at(index, ThreadMessage::committed(message));
                        }
                    }
                    None => {
                        debug!("send {temp_id} resolved after leaving conversation {conversation_id}");
                    }
                }
            }
            Err(e) => {
                if let Some(index) = position {
                    self.thread[index].state = DeliveryState::Failed {
                        reason: e.to_string(),
                    };
                }
            }
        }

        self.release_unmatched_echoes();
    }

    /// Puts a failed entry back into `Pending` under the same temporary id.
    pub fn retry(&mut self, temp_id: Uuid) -> Result<OutgoingMessage, ChatError> {
        let index = self
            .position_of(MessageKey::Temporary(temp_id))
            .filter(|index| self.thread[*index].is_failed())
            .ok_or(ChatError::UnknownMessage(temp_id))?;

        let entry = &mut self.thread[index];
        entry.state = DeliveryState::Pending;
        Ok(OutgoingMessage {
            temp_id,
            conversation_id: entry.conversation_id,
            sender_id: entry.sender_id,
            body: entry.body.clone(),
            attachment_url: entry.attachment_url.clone(),
        })
    }

    /// Removes a failed entry.
    pub fn discard(&mut self, temp_id: Uuid) -> Result<(), ChatError> {
        let index = self
            .position_of(MessageKey::Temporary(temp_id))
            .filter(|index| self.thread[*index].is_failed())
            .ok_or(ChatError::UnknownMessage(temp_id))?;
        self.thread.remove(index);
        Ok(())
    }

    pub fn apply_realtime(&mut self, scope: SubscriptionScope, event: RealtimeEvent) -> FollowUp {
        match event {
            RealtimeEvent::MessageInserted(message) => {
                let from_counterpart = Some(message.sender_id) != self.user_id;
                let known = self.touch(
                    message.conversation_id,
                    Some(message.preview()),
                    Some(message.created_at),
                    from_counterpart,
                );
                if scope == SubscriptionScope::Conversation(message.conversation_id)
                    && self.active_conversation() == Some(message.conversation_id)
                {
                    self.receive(message);
                }
                if known {
                    FollowUp::None
                } else {
                    FollowUp::ReloadList
                }
            }
            RealtimeEvent::MessageUpdated(message) => {
                if let Some(index) = self.position_of(MessageKey::Server(message.id)) {
                    let entry = &mut self.thread[index];
                    entry.body = message.body;
                    entry.attachment_url = message.attachment_url;
                }
                FollowUp::None
            }
            RealtimeEvent::ConversationTouched {
                conversation_id,
                last_message,
                last_message_at,
                last_sender_id,
            } => {
                let from_counterpart =
                    last_sender_id.is_some_and(|sender| Some(sender) != self.user_id);
                if self.touch(conversation_id, last_message, last_message_at, from_counterpart) {
                    FollowUp::None
                } else {
                    FollowUp::ReloadList
                }
            }
            RealtimeEvent::Disconnected => {
                self.connection = ConnectionState::Reconnecting;
                FollowUp::None
            }
            RealtimeEvent::Reconnected => {
                self.connection = ConnectionState::Connected;
                match scope {
                    SubscriptionScope::Inbox(_) => FollowUp::ReloadList,
                    SubscriptionScope::Conversation(id) if self.active_conversation() == Some(id) => {
                        self.begin_resync().map_or(FollowUp::None, FollowUp::ResyncThread)
                    }
                    SubscriptionScope::Conversation(_) => FollowUp::None,
                }
            }
            RealtimeEvent::ConnectionLost(e) => {
                self.connection_lost(e);
                FollowUp::None
            }
        }
    }

    pub fn connection_lost(&mut self, e: TransportError) {
        self.connection = ConnectionState::Lost;
        self.last_error = Some(e.to_string());
    }

    pub fn mark_connected(&mut self) {
        self.connection = ConnectionState::Connected;
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Inserts a pushed message into the active thread, unless it is already there or it is
    /// the echo of one of our own pending sends.
    fn receive(&mut self, message: Message) {
        if self.position_of(MessageKey::Server(message.id)).is_some()
            || self.held_echoes.iter().any(|held| held.message.id == message.id)
        {
            return;
        }
        if let Some(temp_id) = self.unclaimed_pending(&message) {
            debug!("holding echo {} until send {temp_id} resolves", message.id);
            self.held_echoes.push(HeldEcho { temp_id, message });
            return;
        }
        self.insert_sorted(ThreadMessage::committed(message));
    }

    /// Updates a conversation's preview and re-sorts the list. Returns `false` when the
    /// conversation is not in the list.
    fn touch(
        &mut self,
        conversation_id: Uuid,
        last_message: Option<String>,
        last_message_at: Option<DateTime<Utc>>,
        counterpart_activity: bool,
    ) -> bool {
        let active = self.active_conversation();
        let Some(entry) = self
            .conversations
            .iter_mut()
            .find(|entry| entry.conversation.id == conversation_id)
        else {
            return false;
        };

        let newer = match (entry.conversation.last_message_at, last_message_at) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(current), Some(incoming)) => incoming >= current,
        };
        if newer {
            let advanced = entry.conversation.last_message_at != last_message_at;
            entry.conversation.last_message = last_message;
            entry.conversation.last_message_at = last_message_at;
            if advanced && counterpart_activity && active != Some(conversation_id) {
                entry.has_unread = true;
            }
            self.sort_conversations();
        }
        true
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| Conversation::cmp_recency(&a.conversation, &b.conversation));
    }

    fn position_of(&self, key: MessageKey) -> Option<usize> {
        self.thread.iter().position(|entry| entry.key == key)
    }

    /// Keeps the thread ascending by creation time; equal timestamps keep arrival order.
    fn insert_sorted(&mut self, entry: ThreadMessage) {
        let index = self
            .thread
            .partition_point(|existing| existing.created_at <= entry.created_at);
        self.thread.insert(index, entry);
    }

    /// Replaces in place, moving the entry only if its new timestamp breaks the order.
    fn replace_at(&mut self, index: usize, entry: ThreadMessage) {
        let after_previous = index == 0 || self.thread[index - 1].created_at <= entry.created_at;
        let before_next = index + 1 >= self.thread.len()
            || entry.created_at <= self.thread[index + 1].created_at;
        if after_previous && before_next {
            self.thread[index] = entry;
        } else {
            self.thread.remove(index);
            self.insert_sorted(entry);
        }
    }

    /// Pending entries that could have produced `message`, in thread order.
    fn pending_matches<'a>(&'a self, message: &'a Message) -> impl Iterator<Item = Uuid> + 'a {
        self.thread.iter().filter_map(move |entry| {
            let gap = message.created_at - entry.created_at;
            let matches = entry.is_pending()
                && Self::same_content(entry, message)
                && gap <= self.echo_window
                && -gap <= self.echo_window;
            entry.temp_id().filter(|_| matches)
        })
    }

    /// The first matching pending entry that holds no echo yet.
    fn unclaimed_pending(&self, message: &Message) -> Option<Uuid> {
        self.pending_matches(message)
            .find(|temp_id| !self.held_echoes.iter().any(|held| held.temp_id == *temp_id))
    }

    fn same_content(entry: &ThreadMessage, message: &Message) -> bool {
        entry.conversation_id == message.conversation_id
            && entry.sender_id == message.sender_id
            && entry.body == message.body
            && entry.attachment_url == message.attachment_url
    }

    /// Takes the echo held for a failed send. An echo that another pending entry could also
    /// own stays held, since the failed call cannot tell whose write it was.
    fn take_own_echo(&mut self, temp_id: Uuid) -> Option<Message> {
        let position = self
            .held_echoes
            .iter()
            .position(|held| held.temp_id == temp_id)?;
        let echo = &self.held_echoes[position].message;
        if self.pending_matches(echo).any(|other| other != temp_id) {
            debug!("echo {} is ambiguous, keeping send {temp_id} failed", echo.id);
            return None;
        }
        Some(self.held_echoes.remove(position).message)
    }

    /// Re-pairs echoes whose entry stopped pending; echoes nothing can claim any more are shown
    /// as regular messages.
    fn release_unmatched_echoes(&mut self) {
        let (paired, orphaned): (Vec<HeldEcho>, Vec<HeldEcho>) =
            std::mem::take(&mut self.held_echoes)
                .into_iter()
                .partition(|held| {
                    self.position_of(MessageKey::Temporary(held.temp_id))
                        .is_some_and(|index| self.thread[index].is_pending())
                });
        self.held_echoes = paired;

        for HeldEcho { message, .. } in orphaned {
            if let Some(temp_id) = self.unclaimed_pending(&message) {
                self.held_echoes.push(HeldEcho { temp_id, message });
            } else if self.position_of(MessageKey::Server(message.id)).is_none() {
                self.insert_sorted(ThreadMessage::committed(message));
            }
        }
    }
}
