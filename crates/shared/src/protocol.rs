use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ClientId, ConversationId, MessageId, UserId};

/// Close code the push channel uses when the token is missing or invalid.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
/// Close code the push channel uses when the user is not a participant.
pub const CLOSE_NOT_PARTICIPANT: u16 = 4003;

pub fn describe_close_code(code: u16) -> &'static str {
    match code {
        1000 => "normal closure",
        1001 => "going away",
        1006 => "abnormal closure",
        1011 => "server error",
        CLOSE_UNAUTHENTICATED => "unauthenticated",
        CLOSE_NOT_PARTICIPANT => "not a participant",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    #[serde(
        rename = "conversation",
        alias = "conversation_id",
        alias = "conversationId"
    )]
    pub conversation_id: ConversationId,
    #[serde(rename = "sender", alias = "sender_id", alias = "senderId")]
    pub sender_id: UserId,
    #[serde(rename = "text", alias = "content")]
    pub content: String,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Local correlation token of the optimistic send that produced this
    /// message, if any.
    #[serde(default, skip_serializing)]
    pub client_id: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(alias = "content")]
    pub text: String,
    #[serde(alias = "sender_id")]
    pub sender: UserId,
    pub created_at: DateTime<Utc>,
}

/// One entry of the conversation list. Display enrichment (participant and
/// listing identity) arrives pre-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePayload>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_participant: Option<ParticipantSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub results: Vec<MessagePayload>,
    #[serde(default, alias = "nextCursor", alias = "next_cursor")]
    pub next_before: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectConversationRequest {
    pub peer_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkReadResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub last_read_message: Option<MessageId>,
}

/// Peer read notification relayed by the push channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    #[serde(
        default,
        alias = "conversation_id",
        alias = "conversationId",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation: Option<ConversationId>,
    #[serde(
        default,
        alias = "messageId",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<MessageId>,
    #[serde(
        default,
        alias = "user",
        alias = "userId",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Frames received on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "message.new")]
    MessageNew { message: MessagePayload },
    #[serde(rename = "read.broadcast")]
    ReadBroadcast(ReadReceipt),
}

/// Frames sent on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "message.send")]
    MessageSend {
        #[serde(rename = "clientId")]
        client_id: ClientId,
        text: String,
    },
    #[serde(rename = "read.update")]
    ReadUpdate {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
}
