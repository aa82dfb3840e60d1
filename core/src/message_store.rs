/// Messages of the open conversation, oldest first
use crate::types::{Message, MessageId, UserId};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    items: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list wholesale. Sorted by sent time, oldest first; undated
    /// messages count as oldest and ties keep their input order.
    pub fn replace_all(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));

        self.items.clear();
        self.ids.clear();
        for msg in messages {
            if self.ids.insert(msg.id.clone()) {
                self.items.push(msg);
            }
        }
    }

    /// Append in arrival order. Returns false if the id is already present.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.items.push(message);
        true
    }

    /// Set the local read flag. Unknown ids are ignored.
    pub fn mark_read(&mut self, id: &MessageId) -> bool {
        match self.items.iter_mut().find(|m| &m.id == id) {
            Some(msg) => {
                msg.read = true;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }

    /// Ids of unread messages not sent by `user`
    pub fn unread_from_others(&self, user: &UserId) -> Vec<MessageId> {
        self.items
            .iter()
            .filter(|m| !m.read && &m.sender_id != user)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.items.iter().find(|m| &m.id == id)
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
