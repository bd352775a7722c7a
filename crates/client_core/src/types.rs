use chrono::{DateTime, SecondsFormat, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, LastMessagePayload, MessagePayload, ParticipantSummary},
};

/// Position of the next older history page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Cursor {
    /// No page has been fetched yet.
    #[default]
    Unset,
    Next(String),
    /// No more history. Terminal for the session.
    Exhausted,
}

impl Cursor {
    pub fn from_next(next: Option<String>) -> Self {
        match next {
            Some(token) if !token.is_empty() => Self::Next(token),
            _ => Self::Exhausted,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// Projection of the newest message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub id: Option<MessageId>,
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl From<LastMessagePayload> for LastMessage {
    fn from(value: LastMessagePayload) -> Self {
        Self {
            id: value.id,
            content: value.text,
            sender_id: value.sender,
            timestamp: value.created_at,
        }
    }
}

impl From<&MessagePayload> for LastMessage {
    fn from(value: &MessagePayload) -> Self {
        Self {
            id: Some(value.id.clone()),
            content: value.content.clone(),
            sender_id: value.sender_id.clone(),
            timestamp: value.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub other_participant: Option<ParticipantSummary>,
    pub listing_id: Option<String>,
    pub listing_title: Option<String>,
    pub last_message: Option<LastMessage>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub cursor: Cursor,
    pub loaded: bool,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            other_participant: None,
            listing_id: None,
            listing_title: None,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
            cursor: Cursor::Unset,
            loaded: false,
        }
    }

    /// Timestamp the conversation list is ordered by.
    pub fn activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_message
            .as_ref()
            .map(|message| message.timestamp)
            .or(self.last_message_at)
    }
}

impl From<ConversationSummary> for Conversation {
    fn from(summary: ConversationSummary) -> Self {
        Self {
            id: summary.id,
            other_participant: summary.other_participant,
            listing_id: summary.listing_id,
            listing_title: summary.listing_title,
            last_message: summary.last_message.map(LastMessage::from),
            last_message_at: summary.last_message_at,
            unread_count: summary.unread_count,
            cursor: Cursor::Unset,
            loaded: false,
        }
    }
}

/// Local read marker for one conversation. Only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub last_read_message_id: MessageId,
    pub last_read_timestamp: DateTime<Utc>,
}

/// One page of history. `before` walks back from a cursor, newest first;
/// `after` walks forward from a timestamp, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageRequest {
    pub limit: u32,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl PageRequest {
    pub fn latest(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn before(limit: u32, cursor: String) -> Self {
        Self {
            limit,
            before: Some(cursor),
            after: None,
        }
    }

    pub fn after(limit: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            limit,
            before: None,
            after: Some(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}
