//! Realtime subscription manager.
//!
//! Owns every live subscription. Each one runs as a task that connects to the transport,
//! forwards matching changes to its callback in commit order, and reconnects with
//! exponential backoff when the connection drops. Missed changes are not replayed; after a
//! reconnect the callback receives [`RealtimeEvent::Reconnected`] and the owner is expected to
//! re-read from the repositories.

use crate::core::error::TransportError;
use crate::core::models::Message;
use crate::infrastructure::realtime::{ChangeEvent, ChangeFilter, ChangeKind, ChangeRow};
use crate::infrastructure::traits::RealtimeTransport;
use chrono::{DateTime, Utc};
use di::Ref;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// Message inserts and updates of one conversation.
    Conversation(Uuid),
    /// Preview changes of every conversation the user takes part in.
    Inbox(Uuid),
}

impl SubscriptionScope {
    pub fn filter(&self) -> ChangeFilter {
        match *self {
            SubscriptionScope::Conversation(id) => ChangeFilter::MessagesInConversation(id),
            SubscriptionScope::Inbox(user_id) => ChangeFilter::ConversationsOfParticipant(user_id),
        }
    }
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionScope::Conversation(id) => write!(f, "conversation {id}"),
            SubscriptionScope::Inbox(user_id) => write!(f, "inbox of {user_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    ConversationTouched {
        conversation_id: Uuid,
        last_message: Option<String>,
        last_message_at: Option<DateTime<Utc>>,
        last_sender_id: Option<Uuid>,
    },
    /// The transport dropped; a reconnect is scheduled.
    Disconnected,
    /// Connected again after a drop. Changes in between were not delivered.
    Reconnected,
    /// Reconnect attempts are exhausted; the subscription has ended.
    ConnectionLost(TransportError),
}

impl RealtimeEvent {
    pub fn from_change(change: ChangeEvent) -> Self {
        match (change.kind, change.row) {
            (ChangeKind::Insert, ChangeRow::Message(m)) => RealtimeEvent::MessageInserted(m.into()),
            (ChangeKind::Update, ChangeRow::Message(m)) => RealtimeEvent::MessageUpdated(m.into()),
            (_, ChangeRow::Conversation(c)) => RealtimeEvent::ConversationTouched {
                conversation_id: c.id,
                last_message: c.last_message,
                last_message_at: c.last_message_at,
                last_sender_id: c.last_sender_id,
            },
        }
    }
}

pub type EventCallback = Arc<dyn Fn(SubscriptionHandle, RealtimeEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

struct LiveSubscription {
    scope: SubscriptionScope,
    task: JoinHandle<()>,
}

pub struct SubscriptionManager {
    transport: Ref<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    next_handle: u64,
    live: HashMap<SubscriptionHandle, LiveSubscription>,
}

impl SubscriptionManager {
    pub fn new(transport: Ref<dyn RealtimeTransport>, policy: ReconnectPolicy) -> Self {
        SubscriptionManager {
            transport,
            policy,
            next_handle: 1,
            live: HashMap::new(),
        }
    }

    /// Opens a subscription. An existing subscription with the same scope is closed first, so
    /// a scope never has two live handles.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&mut self, scope: SubscriptionScope, on_event: EventCallback) -> SubscriptionHandle {
        let (handle, _first_attempt) = self.subscribe_with_ready(scope, on_event);
        handle
    }

    /// Same as [`subscribe`](Self::subscribe). The receiver completes once the first connect
    /// attempt has finished, whether it succeeded or not; after a successful one every later
    /// change reaches `on_event`.
    pub fn subscribe_with_ready(
        &mut self,
        scope: SubscriptionScope,
        on_event: EventCallback,
    ) -> (SubscriptionHandle, oneshot::Receiver<()>) {
        if let Some(existing) = self.handle_for(scope) {
            self.unsubscribe(existing);
        }

        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;

        let (ready, first_attempt) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            self.transport.clone(),
            self.policy.clone(),
            scope,
            handle,
            on_event,
            ready,
        ));
        self.live.insert(handle, LiveSubscription { scope, task });
        info!("subscribed to {scope}");
        (handle, first_attempt)
    }

    /// Closes a subscription. Returns `false` if the handle was not live.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        match self.live.remove(&handle) {
            Some(subscription) => {
                subscription.task.abort();
                info!("unsubscribed from {}", subscription.scope);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_all(&mut self) {
        let handles: Vec<SubscriptionHandle> = self.live.keys().copied().collect();
        for handle in handles {
            self.unsubscribe(handle);
        }
    }

    pub fn scope_of(&self, handle: SubscriptionHandle) -> Option<SubscriptionScope> {
        self.live.get(&handle).map(|s| s.scope)
    }

    pub fn handle_for(&self, scope: SubscriptionScope) -> Option<SubscriptionHandle> {
        self.live
            .iter()
            .find(|(_, s)| s.scope == scope)
            .map(|(handle, _)| *handle)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_scopes(&self) -> Vec<SubscriptionScope> {
        let mut scopes: Vec<(u64, SubscriptionScope)> = self
            .live
            .iter()
            .map(|(handle, s)| (handle.0, s.scope))
            .collect();
        scopes.sort_by_key(|(handle, _)| *handle);
        scopes.into_iter().map(|(_, scope)| scope).collect()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for (_, subscription) in self.live.drain() {
            subscription.task.abort();
        }
    }
}

async fn run_subscription(
    transport: Ref<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    scope: SubscriptionScope,
    handle: SubscriptionHandle,
    on_event: EventCallback,
    ready: oneshot::Sender<()>,
) {
    let mut failures: u32 = 0;
    let mut interrupted = false;
    let mut ready = Some(ready);

    loop {
        let connected = transport.connect(scope.filter()).await;
        if let Some(ready) = ready.take() {
            // nobody may be waiting
            let _ = ready.send(());
        }

        match connected {
            Ok(mut changes) => {
                if interrupted {
                    info!("realtime feed for {scope} reconnected");
                    on_event(handle, RealtimeEvent::Reconnected);
                } else {
                    debug!("realtime feed for {scope} connected");
                }
                failures = 0;

                while let Some(change) = changes.next().await {
                    on_event(handle, RealtimeEvent::from_change(change));
                }

                warn!("realtime feed for {scope} disconnected");
                on_event(handle, RealtimeEvent::Disconnected);
            }
            Err(e) => {
                warn!("connecting realtime feed for {scope} failed: {e}");
            }
        }

        interrupted = true;
        failures += 1;
        if failures > policy.max_retries {
            warn!("giving up on realtime feed for {scope}");
            on_event(
                handle,
                RealtimeEvent::ConnectionLost(TransportError::ReconnectExhausted {
                    attempts: policy.max_retries,
                }),
            );
            return;
        }

        let delay = policy.backoff(failures);
        debug!("reconnecting {scope} in {delay:?} (attempt {failures})");
        tokio::time::sleep(delay).await;
    }
}
