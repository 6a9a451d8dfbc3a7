use chrono::{DateTime, Utc};
use shared::{
    domain::{ContentKind, ConversationKey, MessageId, UserId},
    protocol::MessageRecord,
};

/// Authenticated identity handed in by the surrounding auth collaborator.
/// Read-only to the engine; a new login produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub auth_token: String,
}

impl Session {
    pub fn new(user_id: UserId, auth_token: impl Into<String>) -> Self {
        Self {
            user_id,
            auth_token: auth_token.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// One timeline entry. `server_id` is absent until the server confirms the
/// message; `client_ref` ties an optimistic echo to that confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub server_id: Option<MessageId>,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
    pub content: String,
    pub content_kind: ContentKind,
    pub file_name: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub client_ref: Option<String>,
}

impl Message {
    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            server_id: Some(record.message_id),
            conversation: record.conversation,
            sender_id: record.sender_id,
            sender_name: record.sender_username,
            sender_avatar: record.sender_avatar,
            content: record.content,
            content_kind: record.content_kind,
            file_name: record.file_name,
            sent_at: record.sent_at,
            delivery: DeliveryState::Confirmed,
            client_ref: record.client_ref,
        }
    }

    /// Total order within a timeline: `(sent_at, server_id)` ascending, with
    /// unconfirmed entries sorting after confirmed ones at the same instant.
    pub(crate) fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.sent_at, self.server_id.map_or(i64::MAX, |id| id.0))
    }

    pub(crate) fn preview_text(&self) -> String {
        match self.content_kind {
            ContentKind::Text => self.content.clone(),
            ContentKind::Image | ContentKind::File => self
                .file_name
                .clone()
                .unwrap_or_else(|| self.content.clone()),
        }
    }
}
