/// Shared types for the chat layer
///
/// Domain records (`Conversation`, `Message`) are only built from the raw wire
/// shapes through `TryFrom`, so missing ids never leak past the boundary.
use crate::error::{ChatError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Id as the backend sends it: integer keys or strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Integer(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Integer(n) => n.to_string(),
        }
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "RawId", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<RawId> for $name {
            fn from(raw: RawId) -> Self {
                Self(raw.into())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Conversation identifier
    ConversationId
);
opaque_id!(
    /// Message identifier, unique across conversations
    MessageId
);
opaque_id!(
    /// User identifier (staff or customer)
    UserId
);

/// Counterpart in a conversation, or the sender of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: UserId,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Participant {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_COUNTERPART_NAME)
    }
}

/// Name shown for a counterpart that has no display name
pub const DEFAULT_COUNTERPART_NAME: &str = "Customer";

/// One conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub other_participant: Option<Participant>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: impl Into<ConversationId>) -> Self {
        Self {
            id: id.into(),
            other_participant: None,
            last_message_text: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    pub fn counterpart_id(&self) -> Option<&UserId> {
        self.other_participant.as_ref().map(|p| &p.id)
    }

    pub fn counterpart_name(&self) -> &str {
        self.other_participant
            .as_ref()
            .map(Participant::display_name)
            .unwrap_or(DEFAULT_COUNTERPART_NAME)
    }

    /// Short label for the last activity, relative to `now`
    pub fn last_activity_label(&self, now: DateTime<Utc>) -> String {
        describe_last_activity(self.last_message_at, now)
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender: Option<Participant>,
    pub body: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub read: bool,
}

impl Message {
    pub fn sender_name(&self) -> &str {
        self.sender
            .as_ref()
            .map(Participant::display_name)
            .unwrap_or(DEFAULT_COUNTERPART_NAME)
    }
}

/// Outbound send request on the real-time channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub recipient_id: UserId,
    pub body: String,
}

/// Body of `POST /conversations`
#[derive(Debug, Clone, Serialize)]
pub struct CreateConversationRequest<'a> {
    pub recipient_id: &'a UserId,
}

// ─── Wire shapes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawParticipant {
    #[serde(default)]
    pub user_id: Option<RawId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConversation {
    #[serde(default)]
    pub conversation_id: Option<RawId>,
    #[serde(default)]
    pub other_participant: Option<RawParticipant>,
    #[serde(default)]
    pub last_message_text: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>,
    #[serde(default)]
    pub unread_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub message_id: Option<RawId>,
    #[serde(default)]
    pub conversation_id: Option<RawId>,
    #[serde(default)]
    pub sender_id: Option<RawId>,
    #[serde(default)]
    pub sender: Option<RawParticipant>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub read: Option<bool>,
}

/// `POST /conversations` answers either with the record or wrapped in `conversation`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CreatedConversation {
    Wrapped { conversation: RawConversation },
    Bare(RawConversation),
}

impl CreatedConversation {
    pub fn into_raw(self) -> RawConversation {
        match self {
            CreatedConversation::Wrapped { conversation } => conversation,
            CreatedConversation::Bare(raw) => raw,
        }
    }
}

fn participant_from(raw: Option<RawParticipant>) -> Option<Participant> {
    let raw = raw?;
    let id = raw.user_id?;
    Some(Participant {
        id: id.into(),
        name: raw.name.filter(|n| !n.trim().is_empty()),
        avatar_url: raw.avatar_url.filter(|u| !u.trim().is_empty()),
    })
}

fn timestamp_from(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_timestamp(&raw);
    if parsed.is_none() && !raw.is_empty() {
        tracing::debug!("Ignoring unparseable timestamp {:?}", raw);
    }
    parsed
}

impl TryFrom<RawConversation> for Conversation {
    type Error = ChatError;

    fn try_from(raw: RawConversation) -> Result<Self> {
        let id = raw
            .conversation_id
            .ok_or_else(|| ChatError::Payload("conversation without conversation_id".to_string()))?;

        Ok(Self {
            id: id.into(),
            other_participant: participant_from(raw.other_participant),
            last_message_text: raw.last_message_text,
            last_message_at: timestamp_from(raw.last_message_at),
            unread_count: raw
                .unread_count
                .unwrap_or(0)
                .clamp(0, i64::from(u32::MAX)) as u32,
        })
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = ChatError;

    fn try_from(raw: RawMessage) -> Result<Self> {
        let id = raw
            .message_id
            .ok_or_else(|| ChatError::Payload("message without message_id".to_string()))?;
        let conversation_id = raw
            .conversation_id
            .ok_or_else(|| ChatError::Payload(format!("message {} without conversation_id", String::from(id.clone()))))?;
        let sender_id = raw
            .sender_id
            .ok_or_else(|| ChatError::Payload(format!("message {} without sender_id", String::from(id.clone()))))?;

        Ok(Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            sender: participant_from(raw.sender),
            body: raw.body.unwrap_or_default(),
            sent_at: timestamp_from(raw.sent_at),
            read: raw.read.unwrap_or(false),
        })
    }
}

/// Convert a list of raw records, skipping the malformed ones
pub fn validate_all<R, T>(raw: Vec<R>, what: &str) -> Vec<T>
where
    T: TryFrom<R, Error = ChatError>,
{
    let total = raw.len();
    let out: Vec<T> = raw
        .into_iter()
        .filter_map(|r| match T::try_from(r) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Skipping malformed {}: {}", what, e);
                None
            }
        })
        .collect();
    if out.len() != total {
        tracing::warn!("Kept {} of {} {} records", out.len(), total, what);
    }
    out
}

// ─── Time helpers ────────────────────────────────────────────────────────────

/// Parse the timestamp formats the backend is known to emit
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// "Now", "5min ago", "3h ago", "2d ago", or day/month for older activity
pub fn describe_last_activity(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "No messages".to_string();
    };
    let elapsed = now.signed_duration_since(at);
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();

    if minutes < 1 {
        "Now".to_string()
    } else if minutes < 60 {
        format!("{}min ago", minutes)
    } else if hours < 24 {
        format!("{}h ago", hours)
    } else if days < 7 {
        format!("{}d ago", days)
    } else {
        at.format("%d/%m").to_string()
    }
}
