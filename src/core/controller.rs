//! Chat state controller.
//!
//! One actor task per signed-in user owns the [`ChatState`]. Commands from [`ChatHandle`],
//! repository results and realtime events are queued and applied one at a time, and every
//! applied step is published on a watch channel for renderers.

use crate::config::ChatConfig;
use crate::core::error::{ChatError, RepositoryError};
use crate::core::models::{Attachment, Conversation, Message};
use crate::core::realtime::{
    EventCallback, RealtimeEvent, ReconnectPolicy, SubscriptionHandle, SubscriptionManager,
    SubscriptionScope,
};
use crate::core::state::{ChatState, ConnectionState, FollowUp, OutgoingMessage, Selection};
use crate::infrastructure::traits::{
    ConversationRepository, MessageRepository, ObjectStorage, RealtimeTransport,
};
use chrono::Utc;
use di::Ref;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Longest a history read waits for its conversation feed to connect.
const FEED_CONNECT_WAIT: Duration = Duration::from_secs(5);

/// Backend collaborators the controller reads from and writes to.
#[derive(Clone)]
pub struct ChatDependencies {
    pub conversations: Ref<dyn ConversationRepository>,
    pub messages: Ref<dyn MessageRepository>,
    pub transport: Ref<dyn RealtimeTransport>,
    pub storage: Ref<dyn ObjectStorage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub reconnect: ReconnectPolicy,
    /// How far apart a pending send and its realtime echo may be and still be paired.
    pub pending_echo_window: Duration,
    pub attachment_bucket: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        ChatOptions::from(&ChatConfig::default())
    }
}

impl From<&ChatConfig> for ChatOptions {
    fn from(config: &ChatConfig) -> Self {
        ChatOptions {
            reconnect: config.reconnect.clone(),
            pending_echo_window: config.pending_echo_window,
            attachment_bucket: config.attachment_bucket.clone(),
        }
    }
}

enum Command {
    Initialize {
        user_id: Uuid,
        done: oneshot::Sender<()>,
    },
    Select {
        conversation_id: Option<Uuid>,
        done: oneshot::Sender<()>,
    },
    Upsert {
        conversation: Conversation,
        select: bool,
        done: oneshot::Sender<()>,
    },
    Send {
        conversation_id: Uuid,
        body: String,
        attachment_url: Option<String>,
        reply: oneshot::Sender<Result<Uuid, ChatError>>,
    },
    Retry {
        temp_id: Uuid,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Discard {
        temp_id: Uuid,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Refresh {
        done: oneshot::Sender<()>,
    },
    Teardown {
        done: oneshot::Sender<()>,
    },
}

enum Internal {
    ConversationsLoaded {
        user_id: Uuid,
        result: Result<Vec<Conversation>, RepositoryError>,
    },
    HistoryLoaded {
        selection: Selection,
        result: Result<Vec<Message>, RepositoryError>,
    },
    SendCompleted {
        conversation_id: Uuid,
        temp_id: Uuid,
        result: Result<Message, RepositoryError>,
    },
    Realtime {
        handle: SubscriptionHandle,
        event: RealtimeEvent,
    },
}

pub struct ChatController {
    state: ChatState,
    dependencies: ChatDependencies,
    subscriptions: SubscriptionManager,
    conversation: Option<SubscriptionHandle>,
    inbox: Option<SubscriptionHandle>,
    internal: mpsc::UnboundedSender<Internal>,
    publisher: watch::Sender<ChatState>,
}

impl ChatController {
    /// Starts the controller task. It stops once every [`ChatHandle`] is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(dependencies: ChatDependencies, options: ChatOptions) -> ChatHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let echo_window = chrono::Duration::from_std(options.pending_echo_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let state = ChatState::new(echo_window);
        let (publisher, observer) = watch::channel(state.clone());

        let handle = ChatHandle {
            commands: commands_tx,
            state: observer,
            conversations: dependencies.conversations.clone(),
            storage: dependencies.storage.clone(),
            attachment_bucket: options.attachment_bucket.clone(),
        };

        let controller = ChatController {
            state,
            subscriptions: SubscriptionManager::new(
                dependencies.transport.clone(),
                options.reconnect,
            ),
            dependencies,
            conversation: None,
            inbox: None,
            internal: internal_tx,
            publisher,
        };
        tokio::spawn(controller.run(commands_rx, internal_rx));

        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = internal.recv() => {
                    self.handle_internal(event);
                    self.publish();
                }
            }
        }

        self.teardown();
        self.publish();
        debug!("chat controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { user_id, done } => {
                self.initialize(user_id);
                self.finish(done, ());
            }
            Command::Select {
                conversation_id,
                done,
            } => {
                self.select(conversation_id);
                self.finish(done, ());
            }
            Command::Upsert {
                conversation,
                select,
                done,
            } => {
                let conversation_id = conversation.id;
                self.state.upsert_conversation(conversation);
                if select {
                    self.select(Some(conversation_id));
                }
                self.finish(done, ());
            }
            Command::Send {
                conversation_id,
                body,
                attachment_url,
                reply,
            } => {
                let result = self
                    .state
                    .push_pending(conversation_id, body, attachment_url, Utc::now())
                    .map(|outgoing| {
                        let temp_id = outgoing.temp_id;
                        self.write_message(outgoing);
                        temp_id
                    });
                self.finish(reply, result);
            }
            Command::Retry { temp_id, reply } => {
                let result = self
                    .state
                    .retry(temp_id)
                    .map(|outgoing| self.write_message(outgoing));
                self.finish(reply, result);
            }
            Command::Discard { temp_id, reply } => {
                let result = self.state.discard(temp_id);
                self.finish(reply, result);
            }
            Command::Refresh { done } => {
                self.refresh();
                self.finish(done, ());
            }
            Command::Teardown { done } => {
                self.teardown();
                self.finish(done, ());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::ConversationsLoaded { user_id, result } => {
                self.state.apply_conversations(user_id, result);
            }
            Internal::HistoryLoaded { selection, result } => {
                self.state.apply_history(selection, result);
            }
            Internal::SendCompleted {
                conversation_id,
                temp_id,
                result,
            } => {
                if let Err(e) = &result {
                    warn!("sending {temp_id} to {conversation_id} failed: {e}");
                }
                self.state.resolve_send(conversation_id, temp_id, result);
            }
            Internal::Realtime { handle, event } => self.handle_realtime(handle, event),
        }
    }

    fn handle_realtime(&mut self, handle: SubscriptionHandle, event: RealtimeEvent) {
        let Some(scope) = self.subscriptions.scope_of(handle) else {
            debug!("dropping event from closed subscription {handle:?}");
            return;
        };

        let lost = matches!(event, RealtimeEvent::ConnectionLost(_));
        let follow_up = self.state.apply_realtime(scope, event);

        if lost {
            self.subscriptions.unsubscribe(handle);
            if self.conversation == Some(handle) {
                self.conversation = None;
            }
            if self.inbox == Some(handle) {
                self.inbox = None;
            }
        }

        match follow_up {
            FollowUp::None => {}
            FollowUp::ResyncThread(selection) => self.load_history(selection, None),
            FollowUp::ReloadList => {
                if let Some(user_id) = self.state.user_id() {
                    self.state.begin_list_reload();
                    self.load_conversations(user_id);
                }
            }
        }
    }

    fn initialize(&mut self, user_id: Uuid) {
        if self.state.user_id() != Some(user_id) {
            self.close_conversation_subscription();
        }
        self.state.begin_initialize(user_id);
        self.load_conversations(user_id);
        self.open_inbox(user_id);
        info!("chat initialized for {user_id}");
    }

    /// The previous conversation's subscription is closed before the next one opens.
    fn select(&mut self, conversation_id: Option<Uuid>) {
        self.close_conversation_subscription();
        if let Some(selection) = self.state.select(conversation_id) {
            self.open_conversation_subscription(selection);
        }
    }

    fn refresh(&mut self) {
        let reconnect = self.state.connection() == ConnectionState::Lost;
        self.state.clear_error();

        if let Some(user_id) = self.state.user_id() {
            self.state.begin_list_reload();
            self.load_conversations(user_id);
            if self.inbox.is_none() {
                self.open_inbox(user_id);
            }
        }

        if let Some(selection) = self.state.begin_resync() {
            if self.conversation.is_none() {
                self.open_conversation_subscription(selection);
            } else {
                self.load_history(selection, None);
            }
        }

        if reconnect {
            self.state.mark_connected();
        }
    }

    fn teardown(&mut self) {
        self.conversation = None;
        self.inbox = None;
        self.subscriptions.unsubscribe_all();
        self.state.clear_selection();
    }

    fn open_inbox(&mut self, user_id: Uuid) {
        if let Some(previous) = self.inbox.take() {
            self.subscriptions.unsubscribe(previous);
        }
        let scope = SubscriptionScope::Inbox(user_id);
        self.inbox = Some(self.subscriptions.subscribe(scope, self.callback()));
    }

    /// History is read once the feed listens, so a message committed during the read still
    /// arrives as an event.
    fn open_conversation_subscription(&mut self, selection: Selection) {
        let scope = SubscriptionScope::Conversation(selection.conversation_id);
        let (handle, listening) = self
            .subscriptions
            .subscribe_with_ready(scope, self.callback());
        self.conversation = Some(handle);
        self.load_history(selection, Some(listening));
    }

    fn close_conversation_subscription(&mut self) {
        if let Some(handle) = self.conversation.take() {
            self.subscriptions.unsubscribe(handle);
        }
    }

    fn callback(&self) -> EventCallback {
        let sink = self.internal.clone();
        Arc::new(move |handle, event| {
            // the controller is gone, nothing left to update
            let _ = sink.send(Internal::Realtime { handle, event });
        })
    }

    fn load_conversations(&self, user_id: Uuid) {
        let repository = self.dependencies.conversations.clone();
        let sink = self.internal.clone();
        tokio::spawn(async move {
            let result = repository.list_conversations(user_id).await;
            let _ = sink.send(Internal::ConversationsLoaded { user_id, result });
        });
    }

    fn load_history(&self, selection: Selection, listening: Option<oneshot::Receiver<()>>) {
        let repository = self.dependencies.messages.clone();
        let sink = self.internal.clone();
        tokio::spawn(async move {
            if let Some(listening) = listening {
                if tokio::time::timeout(FEED_CONNECT_WAIT, listening).await.is_err() {
                    warn!(
                        "feed for {} is slow to connect, reading history anyway",
                        selection.conversation_id
                    );
                }
            }
            let result = repository.list_messages(selection.conversation_id).await;
            let _ = sink.send(Internal::HistoryLoaded { selection, result });
        });
    }

    fn write_message(&self, outgoing: OutgoingMessage) {
        let repository = self.dependencies.messages.clone();
        let sink = self.internal.clone();
        tokio::spawn(async move {
            let result = repository
                .send_message(
                    outgoing.conversation_id,
                    outgoing.sender_id,
                    outgoing.body,
                    outgoing.attachment_url,
                )
                .await;
            let _ = sink.send(Internal::SendCompleted {
                conversation_id: outgoing.conversation_id,
                temp_id: outgoing.temp_id,
                result,
            });
        });
    }

    fn publish(&mut self) {
        self.state.set_subscriptions(self.subscriptions.live_scopes());
        self.publisher.send_replace(self.state.clone());
    }

    /// Publishes before answering so the caller observes its own command's effect.
    fn finish<T>(&mut self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }
}

/// Cloneable front end of a running [`ChatController`].
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChatState>,
    conversations: Ref<dyn ConversationRepository>,
    storage: Ref<dyn ObjectStorage>,
    attachment_bucket: String,
}

impl ChatHandle {
    /// Latest published state.
    pub fn state(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChatState> {
        self.state.clone()
    }

    /// Waits until a published state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ChatState) -> bool,
    ) -> Result<ChatState, ChatError> {
        let mut receiver = self.state.clone();
        receiver
            .wait_for(predicate)
            .await
            .map(|state| state.clone())
            .map_err(|_| ChatError::Closed)
    }

    /// Loads the conversation list of `user_id` and starts following its inbox.
    pub async fn initialize(&self, user_id: Uuid) -> Result<(), ChatError> {
        self.request(|done| Command::Initialize { user_id, done })
            .await
    }

    /// Switches to `conversation_id`, or back to no conversation.
    ///
    /// Returns once the switch is applied; history arrives later.
    pub async fn select_conversation(&self, conversation_id: Option<Uuid>) -> Result<(), ChatError> {
        self.request(|done| Command::Select {
            conversation_id,
            done,
        })
        .await
    }

    /// Appends a pending message and starts writing it. Returns its temporary id.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        body: impl Into<String>,
    ) -> Result<Uuid, ChatError> {
        let body = body.into();
        self.request(|reply| Command::Send {
            conversation_id,
            body,
            attachment_url: None,
            reply,
        })
        .await?
    }

    /// Uploads the attachment first; the message only becomes pending once the upload
    /// succeeded.
    pub async fn send_message_with_attachment(
        &self,
        conversation_id: Uuid,
        body: impl Into<String>,
        attachment: Attachment,
    ) -> Result<Uuid, ChatError> {
        let body = body.into();
        if attachment.bytes.is_empty() && body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.state.borrow().active_conversation() != Some(conversation_id) {
            return Err(ChatError::NotSelected(conversation_id));
        }

        let attachment_url = if attachment.bytes.is_empty() {
            None
        } else {
            let path = format!(
                "{conversation_id}/{}-{}",
                Uuid::new_v4().simple(),
                object_name(&attachment.file_name)
            );
            Some(
                self.storage
                    .put_object(&self.attachment_bucket, &path, attachment.bytes)
                    .await?,
            )
        };

        self.request(|reply| Command::Send {
            conversation_id,
            body,
            attachment_url,
            reply,
        })
        .await?
    }

    /// Sends a failed message again under the same temporary id.
    pub async fn retry_message(&self, temp_id: Uuid) -> Result<(), ChatError> {
        self.request(|reply| Command::Retry { temp_id, reply })
            .await?
    }

    pub async fn discard_message(&self, temp_id: Uuid) -> Result<(), ChatError> {
        self.request(|reply| Command::Discard { temp_id, reply })
            .await?
    }

    /// Finds or starts the conversation with `seller_id` about `product_id` and selects it.
    pub async fn open_conversation(
        &self,
        seller_id: Uuid,
        product_id: Option<Uuid>,
    ) -> Result<Uuid, ChatError> {
        let buyer_id = self
            .state
            .borrow()
            .user_id()
            .ok_or(ChatError::NotInitialized)?;
        let conversation = self
            .conversations
            .find_or_create_conversation(buyer_id, seller_id, product_id)
            .await?;
        let conversation_id = conversation.id;
        self.request(|done| Command::Upsert {
            conversation,
            select: true,
            done,
        })
        .await?;
        Ok(conversation_id)
    }

    /// Re-reads the list and the active thread, reopening subscriptions that were lost.
    pub async fn refresh(&self) -> Result<(), ChatError> {
        self.request(|done| Command::Refresh { done }).await
    }

    /// Closes every subscription and clears the thread. Safe to call repeatedly, also after the
    /// controller stopped.
    pub async fn teardown(&self) {
        if self
            .request(|done| Command::Teardown { done })
            .await
            .is_err()
        {
            debug!("teardown on a stopped chat controller");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ChatError::Closed)?;
        response.await.map_err(|_| ChatError::Closed)
    }
}

fn object_name(file_name: &str) -> String {
    let name: String = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if name.trim_matches('.').is_empty() {
        "attachment".to_owned()
    } else {
        name
    }
}
