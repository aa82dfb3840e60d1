/// Conversation session manager
///
/// Owns the conversation list, the open conversation, its messages and the
/// real-time channel, and keeps them consistent while remote calls and
/// inbound events interleave.
///
/// No lock is held across a remote call. A selection epoch tells a finishing
/// call whether the conversation it was started for is still the open one.
use crate::auth::{auth_headers, is_authenticated, Credential, CredentialProvider};
use crate::channel::{self, Channel, ChannelEvent, Connector, Subscription};
use crate::config::Config;
use crate::conversation_store::{ConversationStore, UnreadStatus};
use crate::error::{ChatError, Result};
use crate::message_store::MessageStore;
use crate::notify::{Notification, Notifier};
use crate::rest::{ChatApi, HttpChatApi};
use crate::types::{Conversation, ConversationId, Message, MessageId, OutgoingMessage, UserId};
use futures_util::future::join_all;
use http::HeaderMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Inbound ids remembered for de-duplication across conversations
const DELIVERED_CAPACITY: usize = 1024;

/// Result of a message load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The message store now holds the response
    Applied,
    /// The selection changed while loading; the response was discarded
    Stale,
}

/// Bounded set of recently delivered message ids
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<MessageId>,
    set: HashSet<MessageId>,
}

impl RecentIds {
    /// Returns false if the id was already seen
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > DELIVERED_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct SessionState {
    conversations: ConversationStore,
    messages: MessageStore,
    selected: Option<Conversation>,
    epoch: u64,
    // Selection epoch whose read acks have been issued
    acked_epoch: Option<u64>,
    // In-flight counters, so overlapping calls don't clear each other's flag
    loading_conversations: u32,
    loading_messages: u32,
    creating: u32,
    sending: u32,
    delivered: RecentIds,
}

impl SessionState {
    fn selected_id(&self) -> Option<&ConversationId> {
        self.selected.as_ref().map(|c| &c.id)
    }
}

struct ChannelLink {
    channel: Arc<dyn Channel>,
    subscription: Subscription,
    credential: Credential,
    user: UserId,
}

pub struct SessionManager {
    config: Config,
    api: Arc<dyn ChatApi>,
    credentials: Arc<dyn CredentialProvider>,
    notifier: Arc<dyn Notifier>,
    state: RwLock<SessionState>,
    link: Mutex<Option<ChannelLink>>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        api: Arc<dyn ChatApi>,
        credentials: Arc<dyn CredentialProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            api,
            credentials,
            notifier,
            state: RwLock::new(SessionState::default()),
            link: Mutex::new(None),
        })
    }

    /// Session talking to the REST backend named in `config`
    pub fn with_http(
        config: Config,
        credentials: Arc<dyn CredentialProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let api = Arc::new(HttpChatApi::new(&config.api_base_url));
        Self::new(config, api, credentials, notifier)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ─── Remote operations ───────────────────────────────────────────────────

    /// Fetch the conversation list and store it in recency order
    pub async fn load_conversations(&self) -> Result<()> {
        let headers = self.authorized_headers()?;
        self.state.write().await.loading_conversations += 1;

        let result = self.api.list_conversations(&headers).await;

        let mut state = self.state.write().await;
        state.loading_conversations = state.loading_conversations.saturating_sub(1);
        match result {
            Ok(conversations) => {
                info!("Loaded {} conversations", conversations.len());
                state.conversations.replace_all(conversations);
                // The open conversation shows no badge once its acks went out;
                // before that the backend's count stands
                if let Some(id) = state.selected_id().cloned() {
                    if state.acked_epoch == Some(state.epoch) {
                        state.conversations.reset_unread(&id);
                    }
                    if let Some(fresh) = state.conversations.get(&id).cloned() {
                        state.selected = Some(fresh);
                    }
                }
                Ok(())
            }
            Err(e) => {
                drop(state);
                error!("Failed to load conversations: {}", e);
                self.report(&e, "Failed to load conversations");
                Err(e)
            }
        }
    }

    /// Fetch the messages of `conversation_id` into the message store.
    ///
    /// Only applied while that conversation is still the selected one.
    pub async fn load_messages(&self, conversation_id: &ConversationId) -> Result<LoadOutcome> {
        let epoch = self.state.read().await.epoch;
        self.load_messages_for(conversation_id, epoch).await
    }

    async fn load_messages_for(
        &self,
        conversation_id: &ConversationId,
        epoch: u64,
    ) -> Result<LoadOutcome> {
        let headers = self.authorized_headers()?;
        self.state.write().await.loading_messages += 1;

        let result = self.api.list_messages(&headers, conversation_id).await;

        let mut state = self.state.write().await;
        state.loading_messages = state.loading_messages.saturating_sub(1);
        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                drop(state);
                error!("Failed to load messages for {}: {}", conversation_id, e);
                self.report(&e, "Failed to load messages");
                return Err(e);
            }
        };

        if state.epoch != epoch || state.selected_id() != Some(conversation_id) {
            debug!("Discarding stale messages for conversation {}", conversation_id);
            return Ok(LoadOutcome::Stale);
        }

        // Keep live arrivals for this conversation the response doesn't know about yet
        let loaded: HashSet<&MessageId> = messages.iter().map(|m| &m.id).collect();
        let arrived: Vec<Message> = state
            .messages
            .as_slice()
            .iter()
            .filter(|m| &m.conversation_id == conversation_id && !loaded.contains(&m.id))
            .cloned()
            .collect();
        drop(loaded);

        debug!(
            "Loaded {} messages for conversation {} ({} live)",
            messages.len(),
            conversation_id,
            arrived.len()
        );
        state.messages.replace_all(messages);
        for msg in arrived {
            state.messages.append(msg);
        }
        Ok(LoadOutcome::Applied)
    }

    /// Open a conversation: load its messages, acknowledge the unread ones
    /// from other senders, then clear its unread counter.
    pub async fn select_conversation(&self, conversation: Conversation) -> Result<()> {
        let headers = self.authorized_headers()?;
        let Some(user) = self.credentials.current_user() else {
            self.report(&ChatError::NotAuthenticated, "Not signed in");
            return Err(ChatError::NotAuthenticated);
        };
        let id = conversation.id.clone();

        let epoch = {
            let mut state = self.state.write().await;
            state.epoch += 1;
            if state.selected_id() != Some(&id) {
                state.messages.clear();
            }
            state.conversations.set_selected(Some(id.clone()));
            state.selected = Some(conversation);
            state.epoch
        };
        info!("Selected conversation {}", id);

        if self.load_messages_for(&id, epoch).await? == LoadOutcome::Stale {
            return Ok(());
        }

        let unread = {
            let state = self.state.read().await;
            if state.epoch != epoch {
                return Ok(());
            }
            state.messages.unread_from_others(&user.id)
        };

        if !unread.is_empty() {
            let acks = unread.iter().map(|mid| self.api.mark_read(&headers, mid));
            let results = join_all(acks).await;
            for (mid, result) in unread.iter().zip(results) {
                if let Err(e) = result {
                    warn!("Failed to mark message {} as read: {}", mid, e);
                }
            }
            debug!("Acknowledged {} messages in conversation {}", unread.len(), id);
        }

        // Acks are issued; now the badge may go, even if another
        // conversation was opened meanwhile
        let mut state = self.state.write().await;
        state.conversations.reset_unread(&id);
        if state.epoch == epoch {
            for mid in &unread {
                state.messages.mark_read(mid);
            }
            if let Some(selected) = state.selected.as_mut() {
                selected.unread_count = 0;
            }
            state.acked_epoch = Some(epoch);
        }
        Ok(())
    }

    /// Select by id, falling back to a bare record when the list doesn't have it
    pub async fn select_conversation_by_id(&self, id: &ConversationId) -> Result<()> {
        let conversation = self
            .state
            .read()
            .await
            .conversations
            .get(id)
            .cloned()
            .unwrap_or_else(|| Conversation::new(id.clone()));
        self.select_conversation(conversation).await
    }

    /// Start a conversation with `recipient_id`, reload the list and open it
    pub async fn create_conversation(&self, recipient_id: &UserId) -> Result<Conversation> {
        let headers = self.authorized_headers()?;
        self.state.write().await.creating += 1;

        let result = self.api.create_conversation(&headers, recipient_id).await;

        {
            let mut state = self.state.write().await;
            state.creating = state.creating.saturating_sub(1);
        }

        let created = match result {
            Ok(conv) => conv,
            Err(e) => {
                error!("Failed to create conversation with {}: {}", recipient_id, e);
                let text = e
                    .server_message()
                    .unwrap_or("Failed to create conversation")
                    .to_string();
                self.report(&e, &text);
                return Err(e);
            }
        };
        info!("Created conversation {} with {}", created.id, recipient_id);
        self.notifier
            .notify(Notification::success("Conversation created"));

        // Both report their own failures
        let _ = self.load_conversations().await;
        let conversation = self
            .state
            .read()
            .await
            .conversations
            .get(&created.id)
            .cloned()
            .unwrap_or(created);
        let _ = self.select_conversation(conversation.clone()).await;
        Ok(conversation)
    }

    /// Send through the live channel. Nothing is appended locally; the
    /// server's echo is the only copy that enters the message store.
    pub async fn send_message(&self, body: &str, recipient_id: &UserId) -> Result<()> {
        let body = body.trim();
        if body.is_empty() {
            let e = ChatError::Validation("message body is empty".to_string());
            self.notifier.notify(Notification::error("Message is empty"));
            return Err(e);
        }

        let Some(channel) = self.live_channel().await else {
            self.notifier
                .notify(Notification::error("Chat is not connected"));
            return Err(ChatError::NotConnected);
        };

        self.state.write().await.sending += 1;
        let result = channel
            .send(OutgoingMessage {
                recipient_id: recipient_id.clone(),
                body: body.to_string(),
            })
            .await;
        {
            let mut state = self.state.write().await;
            state.sending = state.sending.saturating_sub(1);
        }

        if let Err(e) = &result {
            error!("Failed to send message to {}: {}", recipient_id, e);
            self.notifier
                .notify(Notification::error("Failed to send message"));
        }
        result
    }

    /// Acknowledge one message remotely, then mark it read locally
    pub async fn mark_read(&self, message_id: &MessageId) -> Result<()> {
        let headers = self.authorized_headers()?;
        if let Err(e) = self.api.mark_read(&headers, message_id).await {
            warn!("Failed to mark message {} as read: {}", message_id, e);
            return Err(e);
        }
        self.state.write().await.messages.mark_read(message_id);
        Ok(())
    }

    // ─── Inbound events ──────────────────────────────────────────────────────

    /// Apply a message pushed by the channel. Returns false for a duplicate.
    pub async fn handle_inbound_message(&self, message: Message) -> bool {
        let me = self.credentials.current_user().map(|u| u.id);
        {
            let mut state = self.state.write().await;
            if state.messages.contains(&message.id) || !state.delivered.insert(message.id.clone()) {
                debug!("Ignoring duplicate message {}", message.id);
                return false;
            }

            if state.selected_id() == Some(&message.conversation_id) {
                state.messages.append(message.clone());
            } else {
                state.conversations.increment_unread(&message.conversation_id);
            }
            state.conversations.record_activity(
                &message.conversation_id,
                &message.body,
                message.sent_at,
            );
        }

        if me.as_ref() != Some(&message.sender_id) {
            self.notifier.notify(Notification::info(format!(
                "New message from {}",
                message.sender_name()
            )));
        }
        true
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => info!("Chat channel connected"),
            ChannelEvent::Disconnected => info!("Chat channel disconnected"),
            ChannelEvent::MessageReceived(message) => {
                self.handle_inbound_message(message).await;
            }
            ChannelEvent::Error(text) => {
                error!("Chat channel error: {}", text);
                let text = if text.is_empty() {
                    "Chat connection error".to_string()
                } else {
                    text
                };
                self.notifier.notify(Notification::error(text));
            }
        }
    }

    // ─── Channel lifecycle ───────────────────────────────────────────────────

    /// Open a fresh channel for the current credential and user.
    ///
    /// Returns `Ok(false)` without trying when either is missing.
    pub async fn connect(self: &Arc<Self>, connector: &dyn Connector) -> Result<bool> {
        let mut link = self.link.lock().await;
        Self::teardown(&mut link).await;

        let (Some(credential), Some(user)) =
            (self.credentials.credential(), self.credentials.current_user())
        else {
            debug!("No credential or user; not connecting the chat channel");
            return Ok(false);
        };

        let channel = match connector.connect(&self.config.socket_url, &credential).await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Chat channel connection failed: {}", e);
                self.notifier
                    .notify(Notification::error(format!("Chat connection error: {}", e)));
                return Err(e);
            }
        };

        let manager: Weak<Self> = Arc::downgrade(self);
        let subscription = channel::subscribe(channel.as_ref(), move |event| {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_event(event).await;
                }
            }
        });

        *link = Some(ChannelLink {
            channel,
            subscription,
            credential,
            user: user.id,
        });
        Ok(true)
    }

    /// Unsubscribe and close the channel, if any
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        Self::teardown(&mut link).await;
    }

    /// Reconnect when the credential or user changed, disconnect when they are gone
    pub async fn sync_connection(self: &Arc<Self>, connector: &dyn Connector) -> Result<bool> {
        let credential = self.credentials.credential();
        let user = self.credentials.current_user().map(|u| u.id);
        {
            let link = self.link.lock().await;
            if let Some(current) = link.as_ref() {
                let unchanged = credential.as_ref() == Some(&current.credential)
                    && user.as_ref() == Some(&current.user);
                if unchanged && current.channel.is_connected() {
                    return Ok(true);
                }
            }
        }
        self.connect(connector).await
    }

    async fn teardown(link: &mut Option<ChannelLink>) {
        if let Some(old) = link.take() {
            debug!("Tearing down chat channel");
            old.subscription.unsubscribe();
            old.channel.close().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| l.channel.is_connected())
    }

    async fn live_channel(&self) -> Option<Arc<dyn Channel>> {
        let link = self.link.lock().await;
        link.as_ref()
            .filter(|l| l.channel.is_connected())
            .map(|l| l.channel.clone())
    }

    // ─── Predicates ──────────────────────────────────────────────────────────

    /// Sent by the signed-in user
    pub fn is_own_message(&self, message: &Message) -> bool {
        self.credentials
            .current_user()
            .is_some_and(|u| u.id == message.sender_id)
    }

    /// Sent by someone other than the signed-in user and the open
    /// conversation's counterpart, e.g. another staff member
    pub async fn is_third_party_message(&self, message: &Message) -> bool {
        let Some(user) = self.credentials.current_user() else {
            return false;
        };
        let state = self.state.read().await;
        let counterpart = state.selected.as_ref().and_then(|c| c.counterpart_id());
        is_third_party(message, &user.id, counterpart)
    }

    // ─── Snapshots ───────────────────────────────────────────────────────────

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.as_slice().to_vec()
    }

    pub async fn selected_conversation(&self) -> Option<Conversation> {
        self.state.read().await.selected.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.as_slice().to_vec()
    }

    pub async fn unread_status(&self, id: &ConversationId) -> Option<UnreadStatus> {
        self.state.read().await.conversations.unread_status(id)
    }

    pub async fn total_unread(&self) -> u32 {
        self.state.read().await.conversations.total_unread()
    }

    pub async fn is_loading_conversations(&self) -> bool {
        self.state.read().await.loading_conversations > 0
    }

    pub async fn is_loading_messages(&self) -> bool {
        self.state.read().await.loading_messages > 0
    }

    pub async fn is_loading(&self) -> bool {
        let state = self.state.read().await;
        state.loading_conversations > 0 || state.loading_messages > 0 || state.creating > 0
    }

    pub async fn is_sending(&self) -> bool {
        self.state.read().await.sending > 0
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn authorized_headers(&self) -> Result<HeaderMap> {
        let headers = auth_headers(self.credentials.as_ref());
        if !is_authenticated(&headers) {
            warn!("Refusing to call the backend without a credential");
            self.report(&ChatError::NotAuthenticated, "Not signed in");
            return Err(ChatError::NotAuthenticated);
        }
        Ok(headers)
    }

    fn report(&self, e: &ChatError, text: &str) {
        let text = if e.is_auth() {
            "Your session has expired or is missing. Please sign in again."
        } else {
            text
        };
        self.notifier.notify(Notification::error(text));
    }
}

/// Neither `me` nor the declared counterpart
pub fn is_third_party(message: &Message, me: &UserId, counterpart: Option<&UserId>) -> bool {
    &message.sender_id != me && Some(&message.sender_id) != counterpart
}
