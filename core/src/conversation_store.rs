/// Conversation list, kept in recency order (most recent activity first)
use crate::types::{Conversation, ConversationId};
use chrono::{DateTime, Utc};

/// Unread state of one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadStatus {
    /// Currently selected
    Active,
    /// Not selected, nothing pending
    InactiveZero,
    /// Not selected, `n` messages pending
    InactiveWithUnread(u32),
}

#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    items: Vec<Conversation>,
    selected: Option<ConversationId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list. Sorted by last activity, newest first; a
    /// conversation without a timestamp goes last.
    pub fn replace_all(&mut self, mut conversations: Vec<Conversation>) {
        // Option orders None below Some, so reversing the comparison puts None last
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        self.items = conversations;
    }

    /// Bump the unread counter of a conversation that is not selected
    pub fn increment_unread(&mut self, id: &ConversationId) -> bool {
        if self.is_selected(id) {
            return false;
        }
        match self.items.iter_mut().find(|c| &c.id == id) {
            Some(conv) => {
                conv.unread_count = conv.unread_count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    pub fn reset_unread(&mut self, id: &ConversationId) -> bool {
        match self.items.iter_mut().find(|c| &c.id == id) {
            Some(conv) => {
                conv.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn set_selected(&mut self, id: Option<ConversationId>) {
        self.selected = id;
    }

    pub fn selected(&self) -> Option<&ConversationId> {
        self.selected.as_ref()
    }

    pub fn is_selected(&self, id: &ConversationId) -> bool {
        self.selected.as_ref() == Some(id)
    }

    /// Update the preview of a conversation without moving it
    pub fn record_activity(&mut self, id: &ConversationId, preview: &str, at: Option<DateTime<Utc>>) {
        if let Some(conv) = self.items.iter_mut().find(|c| &c.id == id) {
            conv.last_message_text = Some(preview.to_string());
            if at.is_some() {
                conv.last_message_at = at;
            }
        }
    }

    pub fn unread_status(&self, id: &ConversationId) -> Option<UnreadStatus> {
        let conv = self.get(id)?;
        Some(if self.is_selected(id) {
            UnreadStatus::Active
        } else if conv.unread_count == 0 {
            UnreadStatus::InactiveZero
        } else {
            UnreadStatus::InactiveWithUnread(conv.unread_count)
        })
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|c| &c.id == id)
    }

    pub fn as_slice(&self) -> &[Conversation] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_unread(&self) -> u32 {
        self.items
            .iter()
            .fold(0u32, |acc, c| acc.saturating_add(c.unread_count))
    }
}
