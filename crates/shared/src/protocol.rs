use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, DeleteScope, GroupId, MediaRef, MentionSpan, Message, MessageId,
        MessageStatus, Reaction, UserId, UserPresence,
    },
    error::ApiError,
};

/// Client-originated operations. Every state-mutating request expects an
/// acknowledgment; `Heartbeat` is the one genuinely fire-and-forget event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage(SendMessagePayload),
    MessageDelivered {
        message_ids: Vec<MessageId>,
    },
    MessageSeen {
        message_ids: Vec<MessageId>,
    },
    MessageEdited {
        message_id: MessageId,
        text: String,
    },
    MessageDeleted {
        message_id: MessageId,
        scope: DeleteScope,
    },
    ReactToMessage {
        message_id: MessageId,
        emoji: String,
    },
    MarkChatAsRead {
        conversation: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    Heartbeat,
    GetUserStatuses,
    GetOnlineUsers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub temp_id: MessageId,
    pub conversation: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<MentionSpan>,
}

/// Server push events, fanned out to every connection of the affected users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    /// A message opened a conversation the recipient had no entry for yet.
    NewChat {
        message: Message,
    },
    MessageStatusUpdate {
        message_ids: Vec<MessageId>,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    },
    MessageReaction {
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message_id: MessageId,
        scope: DeleteScope,
    },
    UserStatusUpdate(UserPresence),
    UnreadCountUpdate {
        snapshot: UnreadSnapshot,
    },
    UserMentioned {
        message_id: MessageId,
        group_id: GroupId,
        sender_name: String,
        group_name: String,
    },
    RefreshChats,
}

/// Authoritative unread-counter snapshot. Consumers replace their local
/// counters with this wholesale; it is never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnreadSnapshot {
    #[serde(default)]
    pub personal: HashMap<UserId, u32>,
    #[serde(default)]
    pub groups: HashMap<GroupId, u32>,
    #[serde(default)]
    pub mentions: HashMap<GroupId, u32>,
}

impl UnreadSnapshot {
    pub fn personal_total(&self) -> u32 {
        self.personal.values().sum()
    }

    pub fn group_total(&self) -> u32 {
        self.groups.values().sum()
    }

    pub fn mention_total(&self) -> u32 {
        self.mentions.values().sum()
    }
}

/// Acknowledgment body correlated to a specific `ClientRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AckPayload {
    Ok,
    Message { message: Message },
    Reactions { message_id: MessageId, reactions: Vec<Reaction> },
    Unread { snapshot: UnreadSnapshot },
    Statuses { statuses: Vec<UserPresence> },
    Error(ApiError),
}

/// Socket frame carrying a client request with an ack-correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub request_id: u64,
    pub sender_id: UserId,
    pub request: ClientRequest,
}

/// Socket frame from server to client: either a correlated ack or a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack { request_id: u64, ack: AckPayload },
    Event(ServerEvent),
}
