/// Session manager tests
/// Drive the session against an in-memory backend and channel
extern crate pdv_chat;

use async_trait::async_trait;
use http::HeaderMap;
use pdv_chat::auth::{Credential, CredentialProvider, CurrentUser, StaticCredentials};
use pdv_chat::channel::{Channel, ChannelEvent, Connector};
use pdv_chat::config::Config;
use pdv_chat::conversation_store::UnreadStatus;
use pdv_chat::error::{ChatError, Result};
use pdv_chat::notify::{ChannelNotifier, Notification, NotificationLevel};
use pdv_chat::rest::ChatApi;
use pdv_chat::session::LoadOutcome;
use pdv_chat::types::{
    parse_timestamp, Conversation, ConversationId, Message, MessageId, OutgoingMessage,
    Participant, UserId,
};
use pdv_chat::SessionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::sleep;

const ME: &str = "staff-1";

// ─── Fakes ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeApi {
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<HashMap<ConversationId, Vec<Message>>>,
    fail_reads: AtomicBool,
    message_gates: Mutex<HashMap<ConversationId, Arc<Semaphore>>>,
    mark_read_gate: Mutex<Option<Arc<Semaphore>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn set_conversations(&self, list: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = list;
    }

    fn set_messages(&self, id: &str, list: Vec<Message>) {
        self.messages
            .lock()
            .unwrap()
            .insert(ConversationId::new(id), list);
    }

    fn gate_messages(&self, id: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.message_gates
            .lock()
            .unwrap()
            .insert(ConversationId::new(id), gate.clone());
        gate
    }

    fn gate_mark_read(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.mark_read_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn failure(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ChatError::Api {
                status: 500,
                message: "boom".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self, _headers: &HeaderMap) -> Result<Vec<Conversation>> {
        self.record("list_conversations".to_string());
        self.failure()?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn list_messages(
        &self,
        _headers: &HeaderMap,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        self.record(format!("list_messages:{}", conversation_id));
        let gate = self.message_gates.lock().unwrap().get(conversation_id).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        self.failure()?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_conversation(
        &self,
        _headers: &HeaderMap,
        recipient_id: &UserId,
    ) -> Result<Conversation> {
        self.record(format!("create_conversation:{}", recipient_id));
        let conv = conversation("9", recipient_id.as_str(), None, 0);
        self.conversations.lock().unwrap().push(conv.clone());
        Ok(conv)
    }

    async fn mark_read(&self, _headers: &HeaderMap, message_id: &MessageId) -> Result<()> {
        self.record(format!("mark_read:{}", message_id));
        let gate = self.mark_read_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(())
    }
}

struct FakeChannel {
    connected: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl FakeChannel {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeConnector {
    opened: Mutex<Vec<(String, Credential, Arc<FakeChannel>)>>,
}

impl FakeConnector {
    fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.opened.lock().unwrap()[index].2.clone()
    }

    fn credential(&self, index: usize) -> Credential {
        self.opened.lock().unwrap()[index].1.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str, credential: &Credential) -> Result<Arc<dyn Channel>> {
        let (events, _) = broadcast::channel(64);
        let channel = Arc::new(FakeChannel {
            connected: AtomicBool::new(true),
            events,
            sent: Mutex::new(Vec::new()),
        });
        self.opened
            .lock()
            .unwrap()
            .push((url.to_string(), credential.clone(), channel.clone()));
        Ok(channel)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn conversation(id: &str, other: &str, at: Option<&str>, unread: u32) -> Conversation {
    Conversation {
        other_participant: Some(Participant {
            id: UserId::new(other),
            name: Some(format!("User {}", other)),
            avatar_url: None,
        }),
        last_message_text: at.map(|_| "hello".to_string()),
        last_message_at: at.and_then(parse_timestamp),
        unread_count: unread,
        ..Conversation::new(id)
    }
}

fn message(id: &str, conv: &str, sender: &str, at: Option<&str>, read: bool) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conv),
        sender_id: UserId::new(sender),
        sender: Some(Participant {
            id: UserId::new(sender),
            name: Some(format!("User {}", sender)),
            avatar_url: None,
        }),
        body: format!("body {}", id),
        sent_at: at.and_then(parse_timestamp),
        read,
    }
}

fn signed_in() -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::signed_in(
        "token-1",
        CurrentUser {
            id: UserId::new(ME),
            name: Some("Staff".to_string()),
        },
    ))
}

fn session_with(
    api: &Arc<FakeApi>,
    credentials: Arc<dyn CredentialProvider>,
) -> (Arc<SessionManager>, mpsc::UnboundedReceiver<Notification>) {
    let (notifier, rx) = ChannelNotifier::new();
    let session = SessionManager::new(
        Config::default(),
        api.clone(),
        credentials,
        Arc::new(notifier),
    );
    (session, rx)
}

fn session(api: &Arc<FakeApi>) -> (Arc<SessionManager>, mpsc::UnboundedReceiver<Notification>) {
    session_with(api, signed_in())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

fn ids<T, F: Fn(&T) -> &str>(items: &[T], f: F) -> Vec<String> {
    items.iter().map(|i| f(i).to_string()).collect()
}

async fn unread_of(session: &SessionManager, id: &str) -> u32 {
    session
        .conversations()
        .await
        .into_iter()
        .find(|c| c.id.as_str() == id)
        .map(|c| c.unread_count)
        .unwrap_or_default()
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ─── Loading ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_conversations_load_most_recent_first() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![
        conversation("1", "c1", Some("2024-01-01"), 0),
        conversation("3", "c3", None, 0),
        conversation("2", "c2", Some("2024-01-03"), 0),
    ]);
    let (session, _rx) = session(&api);

    session.load_conversations().await.unwrap();

    let list = session.conversations().await;
    assert_eq!(ids(&list, |c| c.id.as_str()), vec!["2", "1", "3"]);
    assert!(!session.is_loading_conversations().await);
}

#[tokio::test]
async fn test_messages_load_oldest_first_with_stable_ties() {
    let api = Arc::new(FakeApi::default());
    api.set_messages(
        "1",
        vec![
            message("b", "1", "c1", Some("2024-01-02T10:00:00Z"), true),
            message("a", "1", "c1", Some("2024-01-01T10:00:00Z"), true),
            message("c", "1", ME, Some("2024-01-02T10:00:00Z"), true),
            message("z", "1", "c1", None, true),
        ],
    );
    let (session, _rx) = session(&api);

    session
        .select_conversation(conversation("1", "c1", None, 0))
        .await
        .unwrap();

    let msgs = session.messages().await;
    assert_eq!(ids(&msgs, |m| m.id.as_str()), vec!["z", "a", "b", "c"]);
    assert!(!session.is_loading_messages().await);
    assert!(!session.is_loading().await);
}

#[tokio::test]
async fn test_load_failure_keeps_previous_list_and_clears_flag() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 2)]);
    let (session, mut rx) = session(&api);
    session.load_conversations().await.unwrap();

    api.fail_reads.store(true, Ordering::SeqCst);
    let result = session.load_conversations().await;

    assert!(matches!(result, Err(ChatError::Api { status: 500, .. })));
    assert_eq!(session.conversations().await.len(), 1);
    assert!(!session.is_loading_conversations().await);
    let notes = drain(&mut rx);
    assert_eq!(
        notes.last(),
        Some(&Notification::error("Failed to load conversations"))
    );
}

#[tokio::test]
async fn test_refuses_to_load_without_credential() {
    let api = Arc::new(FakeApi::default());
    let creds = Arc::new(StaticCredentials::new(None, Some(CurrentUser::new(ME))));
    let (session, mut rx) = session_with(&api, creds);

    let result = session.load_conversations().await;

    assert!(matches!(result, Err(ChatError::NotAuthenticated)));
    assert!(api.calls().is_empty());
    let notes = drain(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].level, NotificationLevel::Error);
}

#[tokio::test]
async fn test_reload_keeps_open_conversation_badge_clear() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 0)]);
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();
    session
        .select_conversation_by_id(&ConversationId::new("1"))
        .await
        .unwrap();

    // The backend still counts unread messages for the open conversation
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-02"), 4)]);
    session.load_conversations().await.unwrap();

    assert_eq!(unread_of(&session, "1").await, 0);
    let selected = session.selected_conversation().await.unwrap();
    assert_eq!(selected.last_message_at, parse_timestamp("2024-01-02"));
}

// ─── Selection ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_select_marks_others_messages_read_and_zeroes_unread() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 2)]);
    api.set_messages(
        "1",
        vec![
            message("m1", "1", "c1", Some("2024-01-01T09:00:00Z"), false),
            message("m2", "1", ME, Some("2024-01-01T09:01:00Z"), false),
            message("m3", "1", "c1", Some("2024-01-01T09:02:00Z"), false),
            message("m4", "1", "c1", Some("2024-01-01T09:03:00Z"), true),
        ],
    );
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();

    session
        .select_conversation_by_id(&ConversationId::new("1"))
        .await
        .unwrap();

    assert_eq!(unread_of(&session, "1").await, 0);
    assert_eq!(
        session.unread_status(&ConversationId::new("1")).await,
        Some(UnreadStatus::Active)
    );
    for msg in session.messages().await {
        if msg.sender_id.as_str() != ME {
            assert!(msg.read, "message {} should be read", msg.id);
        }
    }
    let mut acks: Vec<String> = api
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("mark_read"))
        .collect();
    acks.sort();
    assert_eq!(acks, vec!["mark_read:m1", "mark_read:m3"]);
}

#[tokio::test]
async fn test_unread_stays_until_read_acks_are_issued() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 2)]);
    api.set_messages(
        "1",
        vec![
            message("m1", "1", "c1", Some("2024-01-01T09:00:00Z"), false),
            message("m2", "1", "c1", Some("2024-01-01T09:01:00Z"), false),
        ],
    );
    let gate = api.gate_mark_read();
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();

    let task = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .select_conversation_by_id(&ConversationId::new("1"))
                .await
        })
    };

    let recorder = api.clone();
    wait_until(|| {
        recorder
            .calls()
            .iter()
            .filter(|c| c.starts_with("mark_read"))
            .count()
            == 2
    })
    .await;
    // Acks are in flight: the counter has not been zeroed yet
    assert_eq!(unread_of(&session, "1").await, 2);

    gate.add_permits(2);
    task.await.unwrap().unwrap();
    assert_eq!(unread_of(&session, "1").await, 0);
}

#[tokio::test]
async fn test_selecting_another_conversation_leaves_other_unread_alone() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![
        conversation("1", "c1", Some("2024-01-01"), 3),
        conversation("2", "c2", Some("2024-01-03"), 1),
    ]);
    api.set_messages(
        "2",
        vec![message("m1", "2", "c2", Some("2024-01-03T08:00:00Z"), false)],
    );
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();

    session
        .select_conversation_by_id(&ConversationId::new("2"))
        .await
        .unwrap();

    assert_eq!(unread_of(&session, "1").await, 3);
    assert_eq!(unread_of(&session, "2").await, 0);
    assert_eq!(
        session.unread_status(&ConversationId::new("1")).await,
        Some(UnreadStatus::InactiveWithUnread(3))
    );
}

#[tokio::test]
async fn test_stale_message_load_is_discarded() {
    let api = Arc::new(FakeApi::default());
    api.set_messages("1", vec![message("old", "1", "c1", None, true)]);
    api.set_messages("2", vec![message("new", "2", "c2", None, true)]);
    let gate = api.gate_messages("1");
    let (session, _rx) = session(&api);

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .select_conversation(conversation("1", "c1", None, 0))
                .await
        })
    };
    let recorder = api.clone();
    wait_until(|| recorder.calls().contains(&"list_messages:1".to_string())).await;

    session
        .select_conversation(conversation("2", "c2", None, 0))
        .await
        .unwrap();
    // One permit for the pending load, one for the reload below
    gate.add_permits(2);
    first.await.unwrap().unwrap();

    let msgs = session.messages().await;
    assert_eq!(ids(&msgs, |m| m.id.as_str()), vec!["new"]);
    assert_eq!(
        session.selected_conversation().await.map(|c| c.id),
        Some(ConversationId::new("2"))
    );

    // A direct reload for the deselected conversation is discarded too
    let outcome = session
        .load_messages(&ConversationId::new("1"))
        .await
        .unwrap();
    assert_eq!(outcome, LoadOutcome::Stale);
    assert_eq!(session.messages().await.len(), 1);
}

#[tokio::test]
async fn test_reload_keeps_live_arrivals() {
    let api = Arc::new(FakeApi::default());
    api.set_messages("1", vec![message("m1", "1", "c1", None, true)]);
    let (session, _rx) = session(&api);
    session
        .select_conversation(conversation("1", "c1", None, 0))
        .await
        .unwrap();

    assert!(
        session
            .handle_inbound_message(message("m2", "1", "c1", None, false))
            .await
    );
    let outcome = session
        .load_messages(&ConversationId::new("1"))
        .await
        .unwrap();

    assert_eq!(outcome, LoadOutcome::Applied);
    let msgs = session.messages().await;
    assert_eq!(ids(&msgs, |m| m.id.as_str()), vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_reload_during_selection_keeps_unread_until_acks() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 2)]);
    api.set_messages(
        "1",
        vec![
            message("m1", "1", "c1", Some("2024-01-01T09:00:00Z"), false),
            message("m2", "1", "c1", Some("2024-01-01T09:01:00Z"), false),
        ],
    );
    let gate = api.gate_messages("1");
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();

    let task = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .select_conversation_by_id(&ConversationId::new("1"))
                .await
        })
    };
    let recorder = api.clone();
    wait_until(|| recorder.calls().contains(&"list_messages:1".to_string())).await;

    // Reload while the messages are still loading: nothing acknowledged yet
    session.load_conversations().await.unwrap();
    assert_eq!(unread_of(&session, "1").await, 2);

    // The message load fails, so no ack is ever sent
    api.fail_reads.store(true, Ordering::SeqCst);
    gate.add_permits(1);
    assert!(task.await.unwrap().is_err());

    assert_eq!(unread_of(&session, "1").await, 2);
    assert!(!api.calls().iter().any(|c| c.starts_with("mark_read")));
}

#[tokio::test]
async fn test_superseded_selection_still_clears_acknowledged_unread() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![
        conversation("1", "c1", Some("2024-01-01"), 2),
        conversation("2", "c2", Some("2024-01-03"), 0),
    ]);
    api.set_messages(
        "1",
        vec![
            message("m1", "1", "c1", Some("2024-01-01T09:00:00Z"), false),
            message("m2", "1", "c1", Some("2024-01-01T09:01:00Z"), false),
        ],
    );
    api.set_messages("2", vec![message("n1", "2", "c2", None, true)]);
    let gate = api.gate_mark_read();
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();

    let task = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .select_conversation_by_id(&ConversationId::new("1"))
                .await
        })
    };
    let recorder = api.clone();
    wait_until(|| {
        recorder
            .calls()
            .iter()
            .filter(|c| c.starts_with("mark_read"))
            .count()
            == 2
    })
    .await;

    // Open another conversation while the acks are in flight
    session
        .select_conversation_by_id(&ConversationId::new("2"))
        .await
        .unwrap();
    gate.add_permits(2);
    task.await.unwrap().unwrap();

    assert_eq!(unread_of(&session, "1").await, 0);
    assert_eq!(
        session.unread_status(&ConversationId::new("1")).await,
        Some(UnreadStatus::InactiveZero)
    );
    let msgs = session.messages().await;
    assert_eq!(ids(&msgs, |m| m.id.as_str()), vec!["n1"]);
}

#[tokio::test]
async fn test_select_without_credential_changes_nothing() {
    let api = Arc::new(FakeApi::default());
    let creds = Arc::new(StaticCredentials::new(None, Some(CurrentUser::new(ME))));
    let (session, mut rx) = session_with(&api, creds);

    let result = session
        .select_conversation(conversation("1", "c1", None, 3))
        .await;

    assert!(matches!(result, Err(ChatError::NotAuthenticated)));
    assert!(session.selected_conversation().await.is_none());
    assert!(api.calls().is_empty());
    assert_eq!(drain(&mut rx).len(), 1);
}

// ─── Inbound ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_inbound_message_is_applied_once() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 0)]);
    let (session, mut rx) = session(&api);
    session.load_conversations().await.unwrap();
    session
        .select_conversation_by_id(&ConversationId::new("1"))
        .await
        .unwrap();
    drain(&mut rx);

    let msg = message("m9", "1", "c1", Some("2024-01-05T10:00:00Z"), false);
    assert!(session.handle_inbound_message(msg.clone()).await);
    assert!(!session.handle_inbound_message(msg).await);

    assert_eq!(session.messages().await.len(), 1);
    assert_eq!(unread_of(&session, "1").await, 0);
    let notes = drain(&mut rx);
    assert_eq!(notes, vec![Notification::info("New message from User c1")]);
}

#[tokio::test]
async fn test_inbound_for_selected_never_increments_unread() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![conversation("1", "c1", Some("2024-01-01"), 0)]);
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();
    session
        .select_conversation_by_id(&ConversationId::new("1"))
        .await
        .unwrap();

    for i in 0..5 {
        session
            .handle_inbound_message(message(&format!("m{}", i), "1", "c1", None, false))
            .await;
    }

    assert_eq!(unread_of(&session, "1").await, 0);
    assert_eq!(session.messages().await.len(), 5);
}

#[tokio::test]
async fn test_inbound_for_other_conversation_counts_as_unread() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![
        conversation("1", "c1", Some("2024-01-01"), 0),
        conversation("2", "c2", Some("2024-01-03"), 0),
    ]);
    api.set_messages("2", vec![message("m1", "2", "c2", None, true)]);
    let (session, _rx) = session(&api);
    session.load_conversations().await.unwrap();
    session
        .select_conversation_by_id(&ConversationId::new("2"))
        .await
        .unwrap();
    let before = session.messages().await;

    session
        .handle_inbound_message(message("x1", "1", "c1", Some("2024-01-04T00:00:00Z"), false))
        .await;

    assert_eq!(unread_of(&session, "1").await, 1);
    assert_eq!(session.messages().await, before);
    assert_eq!(session.total_unread().await, 1);

    // Preview moves, order doesn't
    let list = session.conversations().await;
    assert_eq!(ids(&list, |c| c.id.as_str()), vec!["2", "1"]);
    assert_eq!(list[1].last_message_text.as_deref(), Some("body x1"));
}

#[tokio::test]
async fn test_own_inbound_message_is_not_announced() {
    let api = Arc::new(FakeApi::default());
    let (session, mut rx) = session(&api);
    session
        .select_conversation(conversation("1", "c1", None, 0))
        .await
        .unwrap();
    drain(&mut rx);

    session
        .handle_inbound_message(message("m1", "1", ME, None, false))
        .await;

    assert!(drain(&mut rx).is_empty());
    assert!(session.is_own_message(&session.messages().await[0]));
}

#[tokio::test]
async fn test_third_party_messages_are_recognised() {
    let api = Arc::new(FakeApi::default());
    let (session, _rx) = session(&api);
    session
        .select_conversation(conversation("1", "cust", None, 0))
        .await
        .unwrap();

    let staff = message("a", "1", "staff-2", None, true);
    let customer = message("b", "1", "cust", None, true);
    let mine = message("c", "1", ME, None, true);
    assert!(session.is_third_party_message(&staff).await);
    assert!(!session.is_third_party_message(&customer).await);
    assert!(!session.is_third_party_message(&mine).await);
}

// ─── Create and mark read ────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_conversation_reloads_and_opens_it() {
    let api = Arc::new(FakeApi::default());
    let (session, mut rx) = session(&api);

    let created = session
        .create_conversation(&UserId::new("cust-7"))
        .await
        .unwrap();

    assert_eq!(created.id.as_str(), "9");
    assert_eq!(
        session.selected_conversation().await.map(|c| c.id),
        Some(ConversationId::new("9"))
    );
    assert_eq!(session.conversations().await.len(), 1);
    assert!(drain(&mut rx).contains(&Notification::success("Conversation created")));
    assert_eq!(
        api.calls(),
        vec![
            "create_conversation:cust-7",
            "list_conversations",
            "list_messages:9"
        ]
    );
}

#[tokio::test]
async fn test_mark_read_updates_local_copy() {
    let api = Arc::new(FakeApi::default());
    api.set_messages("1", vec![message("m1", "1", ME, None, false)]);
    let (session, _rx) = session(&api);
    session
        .select_conversation(conversation("1", "c1", None, 0))
        .await
        .unwrap();
    assert!(!session.messages().await[0].read);

    session.mark_read(&MessageId::new("m1")).await.unwrap();

    assert!(session.messages().await[0].read);
    assert!(api.calls().contains(&"mark_read:m1".to_string()));
}

// ─── Channel ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_requires_credential_and_user() {
    let api = Arc::new(FakeApi::default());
    let connector = FakeConnector::default();

    let no_user = Arc::new(StaticCredentials::new(Some(Credential::new("t")), None));
    let (session, _rx) = session_with(&api, no_user);
    assert!(!session.connect(&connector).await.unwrap());

    let no_token = Arc::new(StaticCredentials::new(None, Some(CurrentUser::new(ME))));
    let (session, _rx) = session_with(&api, no_token);
    assert!(!session.connect(&connector).await.unwrap());

    assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn test_channel_events_reach_the_session() {
    let api = Arc::new(FakeApi::default());
    api.set_conversations(vec![
        conversation("1", "c1", Some("2024-01-01"), 0),
        conversation("2", "c2", Some("2024-01-02"), 0),
    ]);
    let (session, mut rx) = session(&api);
    let connector = FakeConnector::default();
    session.load_conversations().await.unwrap();
    assert!(session.connect(&connector).await.unwrap());
    assert!(session.is_connected().await);

    let channel = connector.channel(0);
    channel.emit(ChannelEvent::MessageReceived(message("m1", "1", "c1", None, false)));
    channel.emit(ChannelEvent::MessageReceived(message("m1", "1", "c1", None, false)));
    channel.emit(ChannelEvent::Error("token expired".to_string()));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(unread_of(&session, "1").await, 1);
    let notes = drain(&mut rx);
    assert_eq!(
        notes,
        vec![
            Notification::info("New message from User c1"),
            Notification::error("token expired"),
        ]
    );
}

#[tokio::test]
async fn test_send_rejects_blank_body_without_calling_channel() {
    let api = Arc::new(FakeApi::default());
    let (session, mut rx) = session(&api);
    let connector = FakeConnector::default();
    session.connect(&connector).await.unwrap();

    let result = session.send_message("   ", &UserId::new("cust")).await;

    assert!(matches!(result, Err(ChatError::Validation(_))));
    assert!(connector.channel(0).sent().is_empty());
    assert_eq!(drain(&mut rx), vec![Notification::error("Message is empty")]);
    assert!(!session.is_sending().await);
}

#[tokio::test]
async fn test_send_requires_live_channel() {
    let api = Arc::new(FakeApi::default());
    let (session, mut rx) = session(&api);

    let result = session.send_message("hi", &UserId::new("cust")).await;

    assert!(matches!(result, Err(ChatError::NotConnected)));
    assert_eq!(drain(&mut rx), vec![Notification::error("Chat is not connected")]);
}

#[tokio::test]
async fn test_send_trims_body_and_stores_nothing_locally() {
    let api = Arc::new(FakeApi::default());
    let (session, _rx) = session(&api);
    session
        .select_conversation(conversation("1", "cust", None, 0))
        .await
        .unwrap();
    let connector = FakeConnector::default();
    session.connect(&connector).await.unwrap();

    session
        .send_message("  olá  ", &UserId::new("cust"))
        .await
        .unwrap();

    assert_eq!(
        connector.channel(0).sent(),
        vec![OutgoingMessage {
            recipient_id: UserId::new("cust"),
            body: "olá".to_string(),
        }]
    );
    assert!(session.messages().await.is_empty());
    assert!(!session.is_sending().await);
}

#[tokio::test]
async fn test_credential_change_opens_a_fresh_channel() {
    let api = Arc::new(FakeApi::default());
    let creds = signed_in();
    let (session, _rx) = session_with(&api, creds.clone());
    let connector = FakeConnector::default();

    assert!(session.sync_connection(&connector).await.unwrap());
    assert!(session.sync_connection(&connector).await.unwrap());
    assert_eq!(connector.opened(), 1);

    creds.set_credential(Some(Credential::new("token-2")));
    assert!(session.sync_connection(&connector).await.unwrap());

    assert_eq!(connector.opened(), 2);
    assert!(!connector.channel(0).is_connected());
    assert!(connector.channel(1).is_connected());
    assert_eq!(connector.credential(1), Credential::new("token-2"));

    creds.sign_out();
    assert!(!session.sync_connection(&connector).await.unwrap());
    assert!(!session.is_connected().await);
    assert!(!connector.channel(1).is_connected());
}

#[tokio::test]
async fn test_disconnect_closes_channel() {
    let api = Arc::new(FakeApi::default());
    let (session, _rx) = session(&api);
    let connector = FakeConnector::default();
    session.connect(&connector).await.unwrap();

    session.disconnect().await;

    assert!(!session.is_connected().await);
    assert!(!connector.channel(0).is_connected());
}
