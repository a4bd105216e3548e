//! In-process change feed.
//!
//! Writers publish row changes after their transaction commits; subscribers connect with a
//! table filter and receive matching changes as a stream. Delivery is at-most-once: a
//! subscriber that falls behind is disconnected and has to resynchronise from the
//! repositories.

use crate::core::error::TransportError;
use crate::infrastructure::entities;
use crate::infrastructure::traits::RealtimeTransport;
use async_stream::stream;
use async_trait::async_trait;
use di::{inject, injectable};
use futures_util::stream::BoxStream;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

pub type ChangeStream = BoxStream<'static, ChangeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRow {
    Message(entities::Message),
    Conversation(entities::Conversation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub row: ChangeRow,
}

impl ChangeEvent {
    pub fn insert(row: ChangeRow) -> Self {
        ChangeEvent {
            kind: ChangeKind::Insert,
            row,
        }
    }

    pub fn update(row: ChangeRow) -> Self {
        ChangeEvent {
            kind: ChangeKind::Update,
            row,
        }
    }
}

/// Table + column filter a subscriber connects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeFilter {
    /// `messages` where `conversation_id = id`
    MessagesInConversation(Uuid),
    /// `conversations` where `buyer_id = id or seller_id = id`
    ConversationsOfParticipant(Uuid),
}

impl ChangeFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, &event.row) {
            (ChangeFilter::MessagesInConversation(id), ChangeRow::Message(m)) => {
                m.conversation_id == *id
            }
            (ChangeFilter::ConversationsOfParticipant(user), ChangeRow::Conversation(c)) => {
                c.buyer_id == *user || c.seller_id == *user
            }
            _ => false,
        }
    }
}

pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    write_order: Mutex<()>,
    epoch: watch::Sender<u64>,
    available: AtomicBool,
    connections: Arc<AtomicUsize>,
}

#[injectable]
impl ChangeFeed {
    #[inject]
    pub fn create() -> ChangeFeed {
        ChangeFeed::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn with_capacity(capacity: usize) -> ChangeFeed {
        let (sender, _) = broadcast::channel(capacity);
        let (epoch, _) = watch::channel(0);
        ChangeFeed {
            sender,
            write_order: Mutex::new(()),
            epoch,
            available: AtomicBool::new(true),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Held by writers across commit and publish so subscribers see commit order.
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_order.lock().await
    }

    pub fn publish(&self, event: ChangeEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Ends every open connection. Subscribers see end-of-stream.
    pub fn drop_connections(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// While unavailable, connects fail and open connections are dropped.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.drop_connections();
        }
    }

    /// Number of connections whose stream is still alive.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn open(&self, filter: ChangeFilter) -> Result<ChangeStream, TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected(
                "change feed is unavailable".to_owned(),
            ));
        }

        let mut receiver = self.sender.subscribe();
        let mut epoch = self.epoch.subscribe();
        let guard = ConnectionGuard::new(self.connections.clone());
        debug!("change feed connection opened for {filter:?}");

        let changes = stream! {
            let _guard = guard;
            loop {
                let received = tokio::select! {
                    _ = epoch.changed() => None,
                    received = receiver.recv() => Some(received),
                };
                match received {
                    None => break,
                    Some(Ok(event)) => {
                        if filter.matches(&event) {
                            yield event;
                        }
                    }
                    Some(Err(RecvError::Lagged(skipped))) => {
                        warn!("change feed subscriber for {filter:?} lagged by {skipped} events, disconnecting");
                        break;
                    }
                    Some(Err(RecvError::Closed)) => break,
                }
            }
        };

        Ok(Box::pin(changes))
    }
}

#[async_trait]
impl RealtimeTransport for ChangeFeed {
    async fn connect(&self, filter: ChangeFilter) -> Result<ChangeStream, TransportError> {
        self.open(filter)
    }
}

struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(connections: Arc<AtomicUsize>) -> Self {
        connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { connections }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}
