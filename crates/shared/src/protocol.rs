use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    domain::{ConversationId, JobId, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(alias = "_id")]
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<Uuid>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub recipient_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub client_message_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate {
        token: String,
    },
    SendMessage {
        message: StoredMessage,
    },
    #[serde(rename_all = "camelCase")]
    MarkMessagesRead {
        conversation_id: ConversationId,
    },
    #[serde(rename_all = "camelCase")]
    TypingStatus {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    JoinConversation {
        conversation_id: ConversationId,
    },
    #[serde(rename_all = "camelCase")]
    LeaveConversation {
        conversation_id: ConversationId,
    },
}

impl ClientRequest {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::SendMessage { .. } => "send_message",
            Self::MarkMessagesRead { .. } => "mark_messages_read",
            Self::TypingStatus { .. } => "typing_status",
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Authenticate { .. } => None,
            Self::SendMessage { message } => Some(&message.conversation_id),
            Self::MarkMessagesRead { conversation_id }
            | Self::TypingStatus {
                conversation_id, ..
            }
            | Self::JoinConversation { conversation_id }
            | Self::LeaveConversation { conversation_id } => Some(conversation_id),
        }
    }

    pub fn data(&self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        Ok(value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub conversation_id: ConversationId,
    pub reader_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Authenticated { user_id: UserId },
    MessageReceived { message: StoredMessage },
    UserTyping(TypingPayload),
    UserStopTyping(TypingPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    MessagesRead(ReadReceiptPayload),
    Error(ApiError),
}

impl ServerEvent {
    pub fn from_wire(event: &str, data: Value) -> serde_json::Result<Option<Self>> {
        let event = match event {
            "authenticated" => {
                let payload: AuthenticatedPayload = decode(data)?;
                Self::Authenticated {
                    user_id: payload.user_id,
                }
            }
            "message:received" | "receive_message" => {
                // Some servers wrap the record as `{ message: {...} }`.
                let data = match data {
                    Value::Object(mut map) if map.contains_key("message") => {
                        map.remove("message").unwrap_or(Value::Null)
                    }
                    other => other,
                };
                Self::MessageReceived {
                    message: decode(data)?,
                }
            }
            "user:typing" | "user_typing" => Self::UserTyping(decode(data)?),
            "user:stop_typing" | "user_stop_typing" => Self::UserStopTyping(decode(data)?),
            "user:online" | "user_online" => Self::UserOnline(decode(data)?),
            "user:offline" | "user_offline" => Self::UserOffline(decode(data)?),
            "messages:read" | "messages_read" => Self::MessagesRead(decode(data)?),
            "error" => Self::Error(decode(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> serde_json::Result<T> {
    serde_json::from_value(data)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl WireFrame {
    pub fn event(event: impl Into<String>, data: Value, ack: Option<u64>) -> Self {
        Self {
            event: Some(event.into()),
            data,
            ack,
        }
    }

    pub fn ack(id: u64, data: Value) -> Self {
        Self {
            event: None,
            data,
            ack: Some(id),
        }
    }

    pub fn ack_error(&self) -> Option<String> {
        match self.data.get("error")? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }
}
