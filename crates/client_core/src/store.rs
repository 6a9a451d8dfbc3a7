use std::collections::HashMap;

use shared::domain::{ConversationKey, MessageId};

use crate::types::{DeliveryState, Message};

/// How far apart an optimistic echo and its confirmation may sit in time and
/// still be matched by the sender+content heuristic.
const PENDING_MATCH_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// New entry inserted in sorted position.
    Inserted,
    /// Resolved an optimistic `Pending` entry to its server confirmation.
    Confirmed,
    /// Server id already present; dropped.
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationTimeline {
    pub messages: Vec<Message>,
    pub unread_count: u32,
    pub last_message_preview: Option<String>,
}

/// Single source of truth for per-conversation timelines. All mutation goes
/// through this API; the sync engine and composer write, everyone else reads
/// snapshots.
#[derive(Debug, Default)]
pub struct ConversationStore {
    timelines: HashMap<ConversationKey, ConversationTimeline>,
    hydration_buffers: HashMap<ConversationKey, Vec<Message>>,
    active: Option<ConversationKey>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<ConversationKey> {
        self.active
    }

    pub fn set_active(&mut self, conversation: Option<ConversationKey>) {
        self.active = conversation;
    }

    pub fn mark_read(&mut self, conversation: ConversationKey) {
        if let Some(timeline) = self.timelines.get_mut(&conversation) {
            timeline.unread_count = 0;
        }
    }

    pub fn snapshot(&self, conversation: ConversationKey) -> ConversationTimeline {
        self.timelines.get(&conversation).cloned().unwrap_or_default()
    }

    pub fn unread_count(&self, conversation: ConversationKey) -> u32 {
        self.timelines
            .get(&conversation)
            .map_or(0, |timeline| timeline.unread_count)
    }

    /// Oldest server-confirmed id in the timeline, used as the scrollback
    /// cursor.
    pub fn oldest_confirmed_id(&self, conversation: ConversationKey) -> Option<MessageId> {
        self.timelines
            .get(&conversation)?
            .messages
            .iter()
            .find_map(|message| message.server_id)
    }

    /// Applies one message to its conversation, resolving optimistic echoes
    /// and duplicates. While a hydration is in flight for the conversation,
    /// the message is additionally recorded in the side buffer so
    /// `replace_history` cannot lose it.
    pub fn append_or_merge(&mut self, message: Message) -> MergeResult {
        let conversation = message.conversation;
        let is_active = self.active == Some(conversation);
        let timeline = self.timelines.entry(conversation).or_default();
        let result = merge_into(&mut timeline.messages, message.clone());
        match result {
            MergeResult::Inserted => {
                if !is_active {
                    timeline.unread_count += 1;
                }
            }
            MergeResult::Confirmed | MergeResult::Duplicate => {}
        }
        if result != MergeResult::Duplicate {
            timeline.last_message_preview =
                timeline.messages.last().map(|last| last.preview_text());
            if let Some(buffer) = self.hydration_buffers.get_mut(&conversation) {
                buffer.push(message);
            }
        }
        result
    }

    pub fn begin_hydration(&mut self, conversation: ConversationKey) {
        self.hydration_buffers.insert(conversation, Vec::new());
    }

    pub fn abort_hydration(&mut self, conversation: ConversationKey) {
        self.hydration_buffers.remove(&conversation);
    }

    pub fn hydration_in_flight(&self, conversation: ConversationKey) -> bool {
        self.hydration_buffers.contains_key(&conversation)
    }

    /// Swaps in a freshly fetched history page, merging any live messages
    /// that arrived while the fetch was in flight. Called exactly once per
    /// successful hydration. `unread_count` is left for `mark_read`.
    pub fn replace_history(&mut self, conversation: ConversationKey, history: Vec<Message>) {
        let buffered = self
            .hydration_buffers
            .remove(&conversation)
            .unwrap_or_default();

        let mut merged: Vec<Message> = Vec::with_capacity(history.len() + buffered.len());
        for message in history {
            merge_into(&mut merged, message);
        }
        for message in buffered {
            merge_into(&mut merged, message);
        }

        let timeline = self.timelines.entry(conversation).or_default();
        timeline.messages = merged;
        timeline.last_message_preview = timeline.messages.last().map(|last| last.preview_text());
    }

    /// Merges an older page into an existing timeline (scrollback). No unread
    /// accounting; returns how many records were actually new.
    pub fn merge_history_page(
        &mut self,
        conversation: ConversationKey,
        page: Vec<Message>,
    ) -> usize {
        let timeline = self.timelines.entry(conversation).or_default();
        let mut inserted = 0;
        for message in page {
            if merge_into(&mut timeline.messages, message) == MergeResult::Inserted {
                inserted += 1;
            }
        }
        if inserted > 0 {
            timeline.last_message_preview =
                timeline.messages.last().map(|last| last.preview_text());
        }
        inserted
    }

    /// Flips an optimistic echo to `Failed` in place. The entry stays visible
    /// until the user retries or discards it.
    pub fn mark_send_failed(&mut self, conversation: ConversationKey, client_ref: &str) -> bool {
        let Some(timeline) = self.timelines.get_mut(&conversation) else {
            return false;
        };
        let Some(message) = timeline.messages.iter_mut().find(|message| {
            message.delivery == DeliveryState::Pending
                && message.client_ref.as_deref() == Some(client_ref)
        }) else {
            return false;
        };
        message.delivery = DeliveryState::Failed;
        true
    }

    /// Removes a `Failed` entry and hands it back, for an explicit retry.
    pub fn take_failed(
        &mut self,
        conversation: ConversationKey,
        client_ref: &str,
    ) -> Option<Message> {
        let timeline = self.timelines.get_mut(&conversation)?;
        let index = timeline.messages.iter().position(|message| {
            message.delivery == DeliveryState::Failed
                && message.client_ref.as_deref() == Some(client_ref)
        })?;
        let message = timeline.messages.remove(index);
        timeline.last_message_preview = timeline.messages.last().map(|last| last.preview_text());
        Some(message)
    }

    pub fn discard_failed(&mut self, conversation: ConversationKey, client_ref: &str) -> bool {
        self.take_failed(conversation, client_ref).is_some()
    }

    /// Drops all session-scoped state. Called at logout.
    pub fn clear(&mut self) {
        self.timelines.clear();
        self.hydration_buffers.clear();
        self.active = None;
    }
}

fn merge_into(messages: &mut Vec<Message>, message: Message) -> MergeResult {
    // An echoed client ref resolves the optimistic entry exactly.
    if let Some(client_ref) = message.client_ref.as_deref() {
        if let Some(index) = messages.iter().position(|existing| {
            existing.delivery == DeliveryState::Pending
                && existing.client_ref.as_deref() == Some(client_ref)
        }) {
            messages.remove(index);
            insert_sorted(messages, message);
            return MergeResult::Confirmed;
        }
    }

    if let Some(server_id) = message.server_id {
        if messages
            .iter()
            .any(|existing| existing.server_id == Some(server_id))
        {
            return MergeResult::Duplicate;
        }
    }

    // Transports that drop the ref fall back to sender + content + time
    // proximity against a still-pending echo.
    if message.server_id.is_some() && message.client_ref.is_none() {
        if let Some(index) = messages.iter().position(|existing| {
            existing.delivery == DeliveryState::Pending
                && existing.sender_id == message.sender_id
                && existing.content == message.content
                && (existing.sent_at - message.sent_at).num_seconds().abs()
                    <= PENDING_MATCH_WINDOW_SECS
        }) {
            messages.remove(index);
            insert_sorted(messages, message);
            return MergeResult::Confirmed;
        }
    }

    insert_sorted(messages, message);
    MergeResult::Inserted
}

fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let index = messages.partition_point(|existing| existing.sort_key() <= message.sort_key());
    messages.insert(index, message);
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
