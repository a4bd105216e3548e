//! Chat state transition tests
//!
//! The reducer is synchronous, so these drive it directly without a runtime.

mod common;

use common::at;
use chrono::{DateTime, Utc};
use market_chat::core::error::{ChatError, RepositoryError, TransportError};
use market_chat::core::models::{
    Conversation, Counterpart, DeliveryState, Message, MessageKey, Role,
};
use market_chat::core::realtime::{RealtimeEvent, SubscriptionScope};
use market_chat::core::state::{
    ChatState, ConnectionState, FollowUp, ListStatus, ThreadStatus,
};
use uuid::Uuid;

struct World {
    me: Uuid,
    seller: Uuid,
    c1: Uuid,
    c2: Uuid,
    c3: Uuid,
    state: ChatState,
}

fn conversation(id: Uuid, me: Uuid, seller: Uuid, last_at: Option<DateTime<Utc>>) -> Conversation {
    Conversation {
        id,
        buyer_id: me,
        seller_id: seller,
        product: None,
        counterpart: Counterpart {
            id: seller,
            display_name: "Sam".to_owned(),
            role: Role::Seller,
        },
        last_message: last_at.map(|_| "earlier".to_owned()),
        last_message_at: last_at,
        created_at: at(0),
    }
}

fn message(conversation_id: Uuid, sender_id: Uuid, body: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id,
        body: body.to_owned(),
        attachment_url: None,
        created_at,
    }
}

/// A signed-in buyer with C1 (newest), C2 and C3 loaded.
fn world() -> World {
    let me = Uuid::new_v4();
    let seller = Uuid::new_v4();
    let (c1, c2, c3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut state = ChatState::default();

    state.begin_initialize(me);
    assert_eq!(*state.list_status(), ListStatus::Loading);
    assert!(state.apply_conversations(
        me,
        Ok(vec![
            conversation(c3, me, seller, Some(at(1))),
            conversation(c1, me, seller, Some(at(3))),
            conversation(c2, me, seller, Some(at(2))),
        ])
    ));

    World { me, seller, c1, c2, c3, state }
}

/// `world()` with C1 selected and its two messages loaded.
fn world_in_c1() -> (World, Vec<Message>) {
    let mut w = world();
    let selection = w.state.select(Some(w.c1)).unwrap();
    let history = vec![
        message(w.c1, w.seller, "hi", at(1)),
        message(w.c1, w.me, "is it available?", at(2)),
    ];
    assert!(w.state.apply_history(selection, Ok(history.clone())));
    (w, history)
}

fn order(state: &ChatState) -> Vec<Uuid> {
    state.conversations().iter().map(|e| e.conversation.id).collect()
}

#[test]
fn test_conversations_sorted_by_recency() {
    let w = world();

    assert_eq!(order(&w.state), vec![w.c1, w.c2, w.c3]);
    assert_eq!(*w.state.list_status(), ListStatus::Ready);
}

#[test]
fn test_list_for_another_user_is_dropped() {
    let mut w = world();

    let applied = w.state.apply_conversations(Uuid::new_v4(), Ok(Vec::new()));

    assert!(!applied);
    assert_eq!(w.state.conversations().len(), 3);
}

#[test]
fn test_list_failure_is_displayable() {
    let mut state = ChatState::default();
    state.begin_initialize(Uuid::new_v4());
    let user = state.user_id().unwrap();

    state.apply_conversations(user, Err(RepositoryError::Transient("timeout".to_owned())));

    assert!(matches!(state.list_status(), ListStatus::Failed(reason) if reason.contains("timeout")));
    assert!(state.last_error().is_some());
}

// =============================================================================
// Sending
// =============================================================================

#[test]
fn test_send_is_pending_then_sent() {
    let (mut w, history) = world_in_c1();

    let outgoing = w
        .state
        .push_pending(w.c1, " hello ".to_owned(), None, at(10))
        .unwrap();

    assert_eq!(outgoing.body, "hello");
    assert_eq!(w.state.thread().len(), 3);
    let last = &w.state.thread()[2];
    assert_eq!(last.key, MessageKey::Temporary(outgoing.temp_id));
    assert_eq!(last.state, DeliveryState::Pending);

    let stored = message(w.c1, w.me, "hello", at(10));
    w.state.resolve_send(w.c1, outgoing.temp_id, Ok(stored.clone()));

    let thread = w.state.thread();
    assert_eq!(thread.len(), 3);
    assert_eq!(thread[0].server_id(), Some(history[0].id));
    assert_eq!(thread[2].key, MessageKey::Server(stored.id));
    assert_eq!(thread[2].state, DeliveryState::Sent);
    assert_eq!(
        w.state.conversation(w.c1).unwrap().conversation.last_message.as_deref(),
        Some("hello")
    );
}

#[test]
fn test_empty_message_is_rejected() {
    let (mut w, _) = world_in_c1();
    let before = w.state.clone();

    let blank = w.state.push_pending(w.c1, "   ".to_owned(), None, at(10));

    assert_eq!(blank, Err(ChatError::EmptyMessage));
    assert_eq!(w.state, before);
}

#[test]
fn test_send_requires_selection_and_user() {
    let (mut w, _) = world_in_c1();
    let mut fresh = ChatState::default();

    let elsewhere = w.state.push_pending(w.c2, "hi".to_owned(), None, at(10));
    let uninitialized = fresh.push_pending(w.c1, "hi".to_owned(), None, at(10));

    assert_eq!(elsewhere, Err(ChatError::NotSelected(w.c2)));
    assert_eq!(uninitialized, Err(ChatError::NotInitialized));
}

#[test]
fn test_attachment_only_message_is_accepted() {
    let (mut w, _) = world_in_c1();

    let outgoing = w
        .state
        .push_pending(w.c1, String::new(), Some("http://files.test/p.jpg".to_owned()), at(10))
        .unwrap();

    assert_eq!(outgoing.attachment_url.as_deref(), Some("http://files.test/p.jpg"));
    assert!(w.state.thread()[2].is_pending());
}

#[test]
fn test_failed_send_can_be_retried_under_same_id() {
    let (mut w, _) = world_in_c1();
    let outgoing = w.state.push_pending(w.c1, "hello".to_owned(), None, at(10)).unwrap();

    w.state.resolve_send(
        w.c1,
        outgoing.temp_id,
        Err(RepositoryError::Transient("offline".to_owned())),
    );

    assert!(w.state.thread()[2].is_failed());
    assert_eq!(w.state.thread().len(), 3);

    let again = w.state.retry(outgoing.temp_id).unwrap();
    assert_eq!(again.temp_id, outgoing.temp_id);
    assert_eq!(again.body, "hello");
    assert!(w.state.thread()[2].is_pending());
    assert_eq!(w.state.retry(outgoing.temp_id), Err(ChatError::UnknownMessage(outgoing.temp_id)));

    let stored = message(w.c1, w.me, "hello", at(11));
    w.state.resolve_send(w.c1, outgoing.temp_id, Ok(stored.clone()));
    assert_eq!(w.state.thread().len(), 3);
    assert_eq!(w.state.thread()[2].server_id(), Some(stored.id));
}

#[test]
fn test_failed_send_can_be_discarded() {
    let (mut w, _) = world_in_c1();
    let outgoing = w.state.push_pending(w.c1, "hello".to_owned(), None, at(10)).unwrap();

    assert_eq!(
        w.state.discard(outgoing.temp_id),
        Err(ChatError::UnknownMessage(outgoing.temp_id))
    );
    w.state.resolve_send(
        w.c1,
        outgoing.temp_id,
        Err(RepositoryError::Forbidden("blocked".to_owned())),
    );
    w.state.discard(outgoing.temp_id).unwrap();

    assert_eq!(w.state.thread().len(), 2);
}

#[test]
fn test_echo_before_acknowledgement_appears_once() {
    let (mut w, _) = world_in_c1();
    let outgoing = w.state.push_pending(w.c1, "hello".to_owned(), None, at(10)).unwrap();
    let stored = message(w.c1, w.me, "hello", at(10));

    w.state.apply_realtime(
        SubscriptionScope::Conversation(w.c1),
        RealtimeEvent::MessageInserted(stored.clone()),
    );
    assert_eq!(w.state.thread().len(), 3);
    assert!(w.state.thread()[2].is_pending());

    w.state.resolve_send(w.c1, outgoing.temp_id, Ok(stored.clone()));

    let copies = w
        .state
        .thread()
        .iter()
        .filter(|m| m.server_id() == Some(stored.id))
        .count();
    assert_eq!(copies, 1);
    assert_eq!(w.state.thread().len(), 3);
}

#[test]
fn test_echo_after_acknowledgement_is_ignored() {
    let (mut w, _) = world_in_c1();
    let outgoing = w.state.push_pending(w.c1, "hello".to_owned(), None, at(10)).unwrap();
    let stored = message(w.c1, w.me, "hello", at(10));

    w.state.resolve_send(w.c1, outgoing.temp_id, Ok(stored.clone()));
    w.state.apply_realtime(
        SubscriptionScope::Conversation(w.c1),
        RealtimeEvent::MessageInserted(stored),
    );

    assert_eq!(w.state.thread().len(), 3);
}

#[test]
fn test_failed_call_with_echo_counts_as_sent() {
    let (mut w, _) = world_in_c1();
    let outgoing = w.state.push_pending(w.c1, "hello".to_owned(), None, at(10)).unwrap();
    let stored = message(w.c1, w.me, "hello", at(10));

    w.state.apply_realtime(
        SubscriptionScope::Conversation(w.c1),
        RealtimeEvent::MessageInserted(stored.clone()),
    );
    w.state.resolve_send(
        w.c1,
        outgoing.temp_id,
        Err(RepositoryError::Transient("response lost".to_owned())),
    );

    assert_eq!(w.state.thread().len(), 3);
    assert_eq!(w.state.thread()[2].server_id(), Some(stored.id));
    assert_eq!(w.state.thread()[2].state, DeliveryState::Sent);
}

#[test]
fn test_failed_send_keeps_failure_when_echo_belongs_to_twin() {
    let (mut w, _) = world_in_c1();
    let first = w.state.push_pending(w.c1, "ok".to_owned(), None, at(10)).unwrap();
    let second = w.state.push_pending(w.c1, "ok".to_owned(), None, at(10)).unwrap();
    let second_stored = message(w.c1, w.me, "ok", at(10));

    w.state.apply_realtime(
        SubscriptionScope::Conversation(w.c1),
        RealtimeEvent::MessageInserted(second_stored.clone()),
    );
    w.state.resolve_send(
        w.c1,
        first.temp_id,
        Err(RepositoryError::Transient("offline".to_owned())),
    );

    assert_eq!(w.state.thread().len(), 4);
    assert!(w.state.thread()[2].is_failed());
    assert_eq!(w.state.thread()[2].temp_id(), Some(first.temp_id));
    assert!(w.state.thread()[3].is_pending());

    w.state.resolve_send(w.c1, second.temp_id, Ok(second_stored.clone()));

    let thread = w.state.thread();
    assert_eq!(thread.len(), 4);
    assert!(thread[2].is_failed());
    assert_eq!(thread[2].temp_id(), Some(first.temp_id));
    assert_eq!(thread[3].server_id(), Some(second_stored.id));
    assert_eq!(thread[3].state, DeliveryState::Sent);
}

#[test]
fn test_identical_message_from_counterpart_is_not_swallowed() {
    let (mut w, _) = world_in_c1();
    w.state.push_pending(w.c1, "ok".to_owned(), None, at(10)).unwrap();

    w.state.apply_realtime(
        SubscriptionScope::Conversation(w.c1),
        RealtimeEvent::MessageInserted(message(w.c1, w.seller, "ok", at(10))),
    );

    assert_eq!(w.state.thread().len(), 4);
}

// =============================================================================
// Selection
// =============================================================================

#[test]
fn test_stale_history_never_reaches_new_selection() {
    let mut w = world();
    let first = w.state.select(Some(w.c1)).unwrap();
    let second = w.state.select(Some(w.c2)).unwrap();

    let c1_history = vec![message(w.c1, w.seller, "for c1", at(1))];
    assert!(!w.state.apply_history(first, Ok(c1_history)));
    assert!(w.state.thread().is_empty());
    assert_eq!(*w.state.thread_status(), ThreadStatus::LoadingHistory);

    let c2_history = vec![message(w.c2, w.seller, "for c2", at(1))];
    assert!(w.state.apply_history(second, Ok(c2_history)));
    assert_eq!(w.state.thread().len(), 1);
    assert_eq!(w.state.thread()[0].body, "for c2");
}

#[test]
fn test_reselecting_invalidates_earlier_fetch() {
    let mut w = world();
    let first = w.state.select(Some(w.c1)).unwrap();
    let second = w.state.select(Some(w.c1)).unwrap();

    assert_ne!(first, second);
    assert!(!w.state.apply_history(first, Ok(Vec::new())));
    assert!(w.state.apply_history(second, Ok(Vec::new())));
}

#[test]
fn test_clearing_selection_twice_equals_once() {
    let (mut w, _) = world_in_c1();

    assert_eq!(w.state.select(None), None);
    let once = w.state.clone();
    assert_eq!(w.state.select(None), None);

    assert_eq!(w.state, once);
    assert_eq!(w.state.active_conversation(), None);
    assert!(w.state.thread().is_empty());
    assert_eq!(*w.state.thread_status(), ThreadStatus::Idle);
}

#[test]
fn test_history_failure_keeps_selection() {
    let mut w = world();
    let selection = w.state.select(Some(w.c1)).unwrap();

    w.state.apply_history(selection, Err(RepositoryError::Transient("timeout".to_owned())));

    assert!(matches!(w.state.thread_status(), ThreadStatus::Failed(_)));
    assert_eq!(w.state.active_conversation(), Some(w.c1));
}

// =============================================================================
// Realtime
// =============================================================================

#[test]
fn test_out_of_order_inserts_stay_sorted() {
    let (mut w, _) = world_in_c1();
    let scope = SubscriptionScope::Conversation(w.c1);

    for minute in [30, 20, 25, 20] {
        w.state.apply_realtime(
            scope,
            RealtimeEvent::MessageInserted(message(w.c1, w.seller, &format!("m{minute}"), at(minute))),
        );
    }

    let times: Vec<DateTime<Utc>> = w.state.thread().iter().map(|m| m.created_at).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    assert_eq!(w.state.thread().len(), 6);
}

#[test]
fn test_duplicate_insert_is_ignored() {
    let (mut w, _) = world_in_c1();
    let pushed = message(w.c1, w.seller, "once", at(5));
    let scope = SubscriptionScope::Conversation(w.c1);

    w.state.apply_realtime(scope, RealtimeEvent::MessageInserted(pushed.clone()));
    w.state.apply_realtime(scope, RealtimeEvent::MessageInserted(pushed));

    assert_eq!(w.state.thread().len(), 3);
}

#[test]
fn test_activity_in_inactive_conversation_moves_it_to_top() {
    let (mut w, _) = world_in_c1();
    let thread_before = w.state.thread().to_vec();

    let follow_up = w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::ConversationTouched {
            conversation_id: w.c3,
            last_message: Some("price dropped".to_owned()),
            last_message_at: Some(at(50)),
            last_sender_id: Some(w.seller),
        },
    );

    assert_eq!(follow_up, FollowUp::None);
    assert_eq!(order(&w.state), vec![w.c3, w.c1, w.c2]);
    let top = &w.state.conversations()[0];
    assert_eq!(top.conversation.last_message.as_deref(), Some("price dropped"));
    assert!(top.has_unread);
    assert_eq!(w.state.thread(), thread_before.as_slice());
}

#[test]
fn test_selecting_clears_unread() {
    let (mut w, _) = world_in_c1();
    w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::ConversationTouched {
            conversation_id: w.c2,
            last_message: Some("hello?".to_owned()),
            last_message_at: Some(at(40)),
            last_sender_id: Some(w.seller),
        },
    );
    assert!(w.state.conversation(w.c2).unwrap().has_unread);

    w.state.select(Some(w.c2));

    assert!(!w.state.conversation(w.c2).unwrap().has_unread);
}

#[test]
fn test_own_activity_does_not_mark_unread() {
    let (mut w, _) = world_in_c1();

    w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::MessageInserted(message(w.c3, w.me, "from my other device", at(45))),
    );

    assert_eq!(order(&w.state)[0], w.c3);
    assert!(!w.state.conversation(w.c3).unwrap().has_unread);
    assert_eq!(w.state.thread().len(), 2);
}

#[test]
fn test_own_touch_after_leaving_does_not_mark_unread() {
    let (mut w, _) = world_in_c1();
    w.state.push_pending(w.c1, "mine".to_owned(), None, at(20)).unwrap();
    w.state.select(Some(w.c2));

    w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::ConversationTouched {
            conversation_id: w.c1,
            last_message: Some("mine".to_owned()),
            last_message_at: Some(at(20)),
            last_sender_id: Some(w.me),
        },
    );

    let c1 = w.state.conversation(w.c1).unwrap();
    assert_eq!(c1.conversation.last_message.as_deref(), Some("mine"));
    assert!(!c1.has_unread);
}

#[test]
fn test_stale_touch_does_not_reorder() {
    let mut w = world();

    w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::ConversationTouched {
            conversation_id: w.c3,
            last_message: Some("old news".to_owned()),
            last_message_at: Some(at(0)),
            last_sender_id: Some(w.seller),
        },
    );

    assert_eq!(order(&w.state), vec![w.c1, w.c2, w.c3]);
    assert_eq!(
        w.state.conversation(w.c3).unwrap().conversation.last_message.as_deref(),
        Some("earlier")
    );
}

#[test]
fn test_unknown_conversation_reloads_list() {
    let mut w = world();

    let follow_up = w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::ConversationTouched {
            conversation_id: Uuid::new_v4(),
            last_message: Some("new buyer".to_owned()),
            last_message_at: Some(at(9)),
            last_sender_id: Some(w.seller),
        },
    );

    assert_eq!(follow_up, FollowUp::ReloadList);
}

#[test]
fn test_list_reload_keeps_unread_flags() {
    let mut w = world();
    w.state.apply_realtime(
        SubscriptionScope::Inbox(w.me),
        RealtimeEvent::ConversationTouched {
            conversation_id: w.c2,
            last_message: Some("ping".to_owned()),
            last_message_at: Some(at(30)),
            last_sender_id: Some(w.seller),
        },
    );

    let reloaded = vec![
        conversation(w.c1, w.me, w.seller, Some(at(3))),
        conversation(w.c2, w.me, w.seller, Some(at(30))),
    ];
    w.state.apply_conversations(w.me, Ok(reloaded));

    assert!(w.state.conversation(w.c2).unwrap().has_unread);
    assert!(!w.state.conversation(w.c1).unwrap().has_unread);
    assert!(w.state.conversation(w.c3).is_none());
}

#[test]
fn test_reconnect_resyncs_and_keeps_local_entries() {
    let (mut w, history) = world_in_c1();
    let outgoing = w.state.push_pending(w.c1, "still sending".to_owned(), None, at(10)).unwrap();
    let scope = SubscriptionScope::Conversation(w.c1);

    assert_eq!(w.state.apply_realtime(scope, RealtimeEvent::Disconnected), FollowUp::None);
    assert_eq!(w.state.connection(), ConnectionState::Reconnecting);

    let follow_up = w.state.apply_realtime(scope, RealtimeEvent::Reconnected);
    let FollowUp::ResyncThread(selection) = follow_up else {
        panic!("expected a resync, got {follow_up:?}");
    };
    assert!(w.state.is_resyncing());
    assert_eq!(w.state.connection(), ConnectionState::Connected);

    let missed = message(w.c1, w.seller, "sent while offline", at(5));
    let mut fetched = history.clone();
    fetched.push(missed.clone());
    assert!(w.state.apply_history(selection, Ok(fetched)));

    let keys: Vec<MessageKey> = w.state.thread().iter().map(|m| m.key).collect();
    assert_eq!(
        keys,
        vec![
            MessageKey::Server(history[0].id),
            MessageKey::Server(history[1].id),
            MessageKey::Server(missed.id),
            MessageKey::Temporary(outgoing.temp_id),
        ]
    );
    assert!(!w.state.is_resyncing());
}

#[test]
fn test_connection_lost_keeps_history() {
    let (mut w, _) = world_in_c1();

    w.state.apply_realtime(
        SubscriptionScope::Conversation(w.c1),
        RealtimeEvent::ConnectionLost(TransportError::ReconnectExhausted { attempts: 5 }),
    );

    assert_eq!(w.state.connection(), ConnectionState::Lost);
    assert_eq!(w.state.thread().len(), 2);
    assert!(w.state.last_error().is_some());
}
