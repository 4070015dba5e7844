use std::collections::{BTreeMap, BTreeSet};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationPage, ServerEvent, StoredMessage},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationViewState {
    pub local_user: Option<UserId>,
    pub messages_by_conversation: BTreeMap<ConversationId, Vec<StoredMessage>>,
    pub typing_users: BTreeMap<ConversationId, BTreeSet<UserId>>,
    pub online_users: BTreeSet<UserId>,
    pub unread_counts: BTreeMap<ConversationId, u32>,
}

impl ConversationViewState {
    pub fn messages(&self, conversation_id: &ConversationId) -> &[StoredMessage] {
        self.messages_by_conversation
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn unread_count(&self, conversation_id: &ConversationId) -> u32 {
        self.unread_counts
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_unread(&self) -> u32 {
        self.unread_counts.values().sum()
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.typing_users
            .get(conversation_id)
            .is_some_and(|users| users.contains(user_id))
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online_users.contains(user_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    SessionStarted {
        user_id: UserId,
    },
    MessageReceived {
        message: StoredMessage,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    UserStopTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
    ConversationLoaded {
        conversation_id: ConversationId,
        page: ConversationPage,
    },
}

impl RealtimeEvent {
    pub fn from_server(event: ServerEvent) -> Option<Self> {
        let event = match event {
            ServerEvent::Authenticated { user_id } => Self::SessionStarted { user_id },
            ServerEvent::MessageReceived { message } => Self::MessageReceived { message },
            ServerEvent::UserTyping(payload) => Self::UserTyping {
                conversation_id: payload.conversation_id,
                user_id: payload.user_id,
            },
            ServerEvent::UserStopTyping(payload) => Self::UserStopTyping {
                conversation_id: payload.conversation_id,
                user_id: payload.user_id,
            },
            ServerEvent::UserOnline(payload) => Self::UserOnline {
                user_id: payload.user_id,
            },
            ServerEvent::UserOffline(payload) => Self::UserOffline {
                user_id: payload.user_id,
            },
            ServerEvent::MessagesRead(payload) => Self::MessagesRead {
                conversation_id: payload.conversation_id,
                reader_id: payload.reader_id,
            },
            ServerEvent::Error(_) => return None,
        };
        Some(event)
    }
}

pub fn apply(state: &ConversationViewState, event: &RealtimeEvent) -> ConversationViewState {
    let mut next = state.clone();
    match event {
        RealtimeEvent::SessionStarted { user_id } => {
            next.local_user = Some(user_id.clone());
        }
        RealtimeEvent::MessageReceived { message } => {
            let messages = next
                .messages_by_conversation
                .entry(message.conversation_id.clone())
                .or_default();
            if messages.iter().any(|existing| existing.id == message.id) {
                return next;
            }
            messages.insert(0, message.clone());
            if next.local_user.as_ref() != Some(&message.sender_id) {
                *next
                    .unread_counts
                    .entry(message.conversation_id.clone())
                    .or_default() += 1;
            }
        }
        RealtimeEvent::UserTyping {
            conversation_id,
            user_id,
        } => {
            next.typing_users
                .entry(conversation_id.clone())
                .or_default()
                .insert(user_id.clone());
        }
        RealtimeEvent::UserStopTyping {
            conversation_id,
            user_id,
        } => {
            if let Some(users) = next.typing_users.get_mut(conversation_id) {
                users.remove(user_id);
                if users.is_empty() {
                    next.typing_users.remove(conversation_id);
                }
            }
        }
        RealtimeEvent::UserOnline { user_id } => {
            next.online_users.insert(user_id.clone());
        }
        RealtimeEvent::UserOffline { user_id } => {
            next.online_users.remove(user_id);
            for users in next.typing_users.values_mut() {
                users.remove(user_id);
            }
            next.typing_users.retain(|_, users| !users.is_empty());
        }
        RealtimeEvent::MarkRead { conversation_id } => {
            next.unread_counts.remove(conversation_id);
        }
        RealtimeEvent::MessagesRead {
            conversation_id,
            reader_id,
        } => {
            if next.local_user.as_ref() == Some(reader_id) {
                next.unread_counts.remove(conversation_id);
            } else if let Some(messages) = next.messages_by_conversation.get_mut(conversation_id) {
                for message in messages.iter_mut() {
                    if &message.sender_id != reader_id {
                        message.read = true;
                    }
                }
            }
        }
        RealtimeEvent::ConversationLoaded {
            conversation_id,
            page,
        } => {
            let messages = next
                .messages_by_conversation
                .entry(conversation_id.clone())
                .or_default();
            for message in &page.messages {
                if !messages.iter().any(|existing| existing.id == message.id) {
                    messages.push(message.clone());
                }
            }
            messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
    }
    next
}

#[cfg(test)]
#[path = "tests/projection_tests.rs"]
mod tests;
