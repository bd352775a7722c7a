use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload, ReadReceipt},
};
use tokio::sync::Mutex;

use crate::{
    conversations::sort_by_activity,
    types::{Conversation, Cursor, LastMessage, ReadState},
};

pub type SharedStore = Arc<Mutex<ChatStore>>;

/// Newest first by `created_at`, ties broken by descending `id`.
pub fn newest_first(a: &MessagePayload, b: &MessagePayload) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Moves `marker` forward to `(id, timestamp)` unless it already points at
/// the same or a later message.
fn advance_marker(marker: &mut Option<ReadState>, id: &MessageId, timestamp: DateTime<Utc>) -> bool {
    if let Some(current) = marker {
        let current_key = (current.last_read_timestamp, &current.last_read_message_id);
        if (timestamp, id) <= current_key {
            return false;
        }
    }
    *marker = Some(ReadState {
        last_read_message_id: id.clone(),
        last_read_timestamp: timestamp,
    });
    true
}

/// Owned per-conversation state. Every mutation is a single synchronous
/// merge, so callers holding the lock never observe a half-applied update.
#[derive(Debug)]
pub struct ChatStore {
    self_id: UserId,
    order: Vec<ConversationId>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<MessagePayload>>,
    read_states: HashMap<ConversationId, ReadState>,
    peer_reads: HashMap<ConversationId, ReadState>,
    older_in_flight: HashSet<ConversationId>,
}

impl ChatStore {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            order: Vec::new(),
            conversations: HashMap::new(),
            messages: HashMap::new(),
            read_states: HashMap::new(),
            peer_reads: HashMap::new(),
            older_in_flight: HashSet::new(),
        }
    }

    pub fn shared(self_id: UserId) -> SharedStore {
        Arc::new(Mutex::new(Self::new(self_id)))
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Replaces the conversation set with a fresh list fetch. Conversations
    /// whose history is already loaded keep their messages, cursor and read
    /// state; their unread count is recomputed locally unless the server
    /// reports activity newer than anything held locally.
    pub fn replace_conversations(&mut self, summaries: Vec<ConversationSummary>) {
        let mut order = Vec::with_capacity(summaries.len());
        let mut next = HashMap::with_capacity(summaries.len());
        let mut recompute = Vec::new();

        for summary in summaries {
            let mut conversation = Conversation::from(summary);
            if let Some(existing) = self.conversations.get(&conversation.id) {
                if existing.loaded {
                    conversation.cursor = existing.cursor.clone();
                    conversation.loaded = true;
                    if existing.activity_at() >= conversation.activity_at() {
                        conversation.last_message = existing.last_message.clone();
                        conversation.last_message_at = existing.last_message_at;
                        recompute.push(conversation.id.clone());
                    }
                }
            }
            if next.contains_key(&conversation.id) {
                continue;
            }
            order.push(conversation.id.clone());
            next.insert(conversation.id.clone(), conversation);
        }

        self.order = order;
        self.conversations = next;
        self.messages
            .retain(|id, _| self.conversations.contains_key(id));
        self.read_states
            .retain(|id, _| self.conversations.contains_key(id));
        self.peer_reads
            .retain(|id, _| self.conversations.contains_key(id));

        for id in recompute {
            self.recompute_unread(&id);
        }
    }

    /// Adds or refreshes a single conversation without touching the rest of
    /// the set. Local history, cursor and read state are kept; the summary's
    /// activity only replaces local activity that is older.
    pub fn upsert_conversation(&mut self, summary: ConversationSummary) -> Conversation {
        let incoming = Conversation::from(summary);
        let Some(existing) = self.conversations.get_mut(&incoming.id) else {
            self.order.push(incoming.id.clone());
            self.conversations
                .insert(incoming.id.clone(), incoming.clone());
            return incoming;
        };
        if incoming.other_participant.is_some() {
            existing.other_participant = incoming.other_participant.clone();
        }
        if incoming.listing_id.is_some() {
            existing.listing_id = incoming.listing_id.clone();
            existing.listing_title = incoming.listing_title.clone();
        }
        if !existing.loaded && incoming.activity_at() > existing.activity_at() {
            existing.last_message = incoming.last_message;
            existing.last_message_at = incoming.last_message_at;
            existing.unread_count = incoming.unread_count;
        }
        existing.clone()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Snapshot of all conversations, most recent activity first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .order
            .iter()
            .filter_map(|id| self.conversations.get(id).cloned())
            .collect();
        sort_by_activity(&mut list);
        list
    }

    fn entry(&mut self, id: &ConversationId) -> &mut Conversation {
        if !self.conversations.contains_key(id) {
            self.order.push(id.clone());
        }
        self.conversations
            .entry(id.clone())
            .or_insert_with(|| Conversation::new(id.clone()))
    }

    pub fn messages(&self, id: &ConversationId) -> &[MessagePayload] {
        self.messages.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn newest_timestamp(&self, id: &ConversationId) -> Option<DateTime<Utc>> {
        self.messages(id).first().map(|m| m.created_at)
    }

    pub fn contains_message(&self, id: &ConversationId, message_id: &MessageId) -> bool {
        self.messages(id).iter().any(|m| &m.id == message_id)
    }

    /// Merges a history page. An initial page replaces the sequence, keeping
    /// only local messages newer than anything in the page (pushes that
    /// landed while the page was in flight). Later pages add only unseen ids.
    /// Returns the number of messages added.
    pub fn apply_page(
        &mut self,
        id: &ConversationId,
        page: Vec<MessagePayload>,
        is_initial: bool,
    ) -> usize {
        let sequence = self.messages.entry(id.clone()).or_default();
        let before = sequence.len();

        let added = if is_initial {
            let newest_in_page = page.iter().map(|m| m.created_at).max();
            let carried = std::mem::take(sequence)
                .into_iter()
                .filter(|m| newest_in_page.map_or(true, |newest| m.created_at > newest));
            let mut seen = HashSet::new();
            for message in page.into_iter().chain(carried) {
                if seen.insert(message.id.clone()) {
                    sequence.push(message);
                }
            }
            sequence.sort_by(newest_first);
            sequence.len()
        } else {
            let mut seen: HashSet<MessageId> = sequence.iter().map(|m| m.id.clone()).collect();
            for message in page {
                if seen.insert(message.id.clone()) {
                    sequence.push(message);
                }
            }
            sequence.sort_by(newest_first);
            sequence.len() - before
        };

        self.entry(id).loaded = true;
        self.refresh_last_message(id);
        added
    }

    /// Inserts a single confirmed message at its ordered position unless its
    /// id is already present.
    pub fn insert_message(&mut self, message: MessagePayload) -> bool {
        let id = message.conversation_id.clone();
        let sequence = self.messages.entry(id.clone()).or_default();
        if sequence.iter().any(|m| m.id == message.id) {
            return false;
        }
        let position = sequence.partition_point(|m| newest_first(m, &message) == Ordering::Less);
        sequence.insert(position, message);

        self.entry(&id);
        self.refresh_last_message(&id);
        true
    }

    fn refresh_last_message(&mut self, id: &ConversationId) {
        let Some(head) = self.messages.get(id).and_then(|seq| seq.first()) else {
            return;
        };
        let head = LastMessage::from(head);
        let conversation = self.entry(id);
        if conversation
            .activity_at()
            .map_or(true, |current| head.timestamp >= current)
        {
            conversation.last_message_at = Some(head.timestamp);
            conversation.last_message = Some(head);
        }
    }

    pub fn cursor(&self, id: &ConversationId) -> Cursor {
        self.conversation(id)
            .map(|c| c.cursor.clone())
            .unwrap_or_default()
    }

    /// Updates the cursor. `Exhausted` is terminal and never overwritten.
    pub fn set_cursor(&mut self, id: &ConversationId, cursor: Cursor) -> bool {
        let conversation = self.entry(id);
        if conversation.cursor.is_exhausted() {
            return false;
        }
        conversation.cursor = cursor;
        true
    }

    /// Claims the older-history slot for a conversation, returning the
    /// cursor to fetch with. `None` when there is nothing to fetch or a fetch
    /// is already running.
    pub fn begin_older_load(&mut self, id: &ConversationId) -> Option<String> {
        let Cursor::Next(token) = self.cursor(id) else {
            return None;
        };
        self.older_in_flight.insert(id.clone()).then_some(token)
    }

    pub fn finish_older_load(&mut self, id: &ConversationId) {
        self.older_in_flight.remove(id);
    }

    pub fn read_state(&self, id: &ConversationId) -> Option<&ReadState> {
        self.read_states.get(id)
    }

    /// Records a successful read acknowledgment. Out-of-order
    /// acknowledgments for older messages leave the state untouched.
    pub fn record_read(&mut self, id: &ConversationId, message: &MessagePayload) -> bool {
        let mut marker = self.read_states.remove(id);
        let advanced = advance_marker(&mut marker, &message.id, message.created_at);
        if let Some(marker) = marker {
            self.read_states.insert(id.clone(), marker);
        }
        advanced
    }

    pub fn peer_read_state(&self, id: &ConversationId) -> Option<&ReadState> {
        self.peer_reads.get(id)
    }

    /// Records a peer's read receipt. The receipt is placed in time by the
    /// referenced message when it is loaded, otherwise by `read_at`.
    pub fn record_peer_read(&mut self, id: &ConversationId, receipt: &ReadReceipt) -> bool {
        let Some(message_id) = receipt.message_id.as_ref() else {
            return false;
        };
        let timestamp = self
            .messages(id)
            .iter()
            .find(|m| &m.id == message_id)
            .map(|m| m.created_at)
            .or(receipt.read_at);
        let Some(timestamp) = timestamp else {
            return false;
        };
        let mut marker = self.peer_reads.remove(id);
        let advanced = advance_marker(&mut marker, message_id, timestamp);
        if let Some(marker) = marker {
            self.peer_reads.insert(id.clone(), marker);
        }
        advanced
    }

    /// Most recent loaded message sent by someone other than the local user.
    pub fn latest_inbound(&self, id: &ConversationId) -> Option<MessagePayload> {
        self.messages(id)
            .iter()
            .find(|m| m.sender_id != self.self_id)
            .cloned()
    }

    fn is_unread(&self, id: &ConversationId, message: &MessagePayload) -> bool {
        if message.sender_id == self.self_id {
            return false;
        }
        self.read_state(id)
            .map_or(true, |state| message.created_at > state.last_read_timestamp)
    }

    /// Unread count derived from the loaded messages and the read marker.
    pub fn count_unread(&self, id: &ConversationId) -> u32 {
        let count = self
            .messages(id)
            .iter()
            .filter(|m| self.is_unread(id, m))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn recompute_unread(&mut self, id: &ConversationId) -> u32 {
        let count = self.count_unread(id);
        self.entry(id).unread_count = count;
        count
    }

    pub fn unread_count(&self, id: &ConversationId) -> u32 {
        self.conversation(id).map_or(0, |c| c.unread_count)
    }

    pub fn set_unread(&mut self, id: &ConversationId, count: u32) {
        self.entry(id).unread_count = count;
    }

    /// Counts a message that arrived for a conversation not being viewed.
    pub fn count_inbound(&mut self, id: &ConversationId, message: &MessagePayload) -> bool {
        if !self.is_unread(id, message) {
            return false;
        }
        let conversation = self.entry(id);
        conversation.unread_count = conversation.unread_count.saturating_add(1);
        true
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
