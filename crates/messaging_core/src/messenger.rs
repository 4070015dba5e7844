use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, JobId, UserId},
    protocol::{ConversationPage, NewMessage, StoredMessage},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    api::MessageApi,
    bulk::{Recipient, RecipientSender, RenderedMessage},
    connection::{ConnectionManager, ConnectionStatus, SendOutcome},
    projection::RealtimeEvent,
    retry::RetryManager,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessage {
    pub conversation_id: ConversationId,
    pub recipient_id: UserId,
    pub subject: Option<String>,
    pub content: String,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub stored: StoredMessage,
    pub delivery: SendOutcome,
}

pub struct Messenger {
    api: Arc<dyn MessageApi>,
    connection: Arc<ConnectionManager>,
    retry: Arc<RetryManager>,
}

impl Messenger {
    pub fn new(
        api: Arc<dyn MessageApi>,
        connection: Arc<ConnectionManager>,
        retry: Arc<RetryManager>,
    ) -> Self {
        Self {
            api,
            connection,
            retry,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn send_direct(&self, draft: DirectMessage) -> Result<SentMessage> {
        let new_message = NewMessage {
            conversation_id: draft.conversation_id,
            recipient_id: draft.recipient_id,
            subject: draft.subject,
            content: draft.content,
            job_id: draft.job_id,
            client_message_id: Uuid::new_v4(),
        };
        let operation_id = format!(
            "persist:{}:{}",
            new_message.conversation_id, new_message.client_message_id
        );
        let pending = &new_message;
        let stored = self
            .retry
            .execute(&operation_id, || self.api.persist_message(pending))
            .await?;
        debug!(message_id = %stored.id, conversation_id = %stored.conversation_id, "messenger: persisted");

        let delivery = self.connection.send_message(stored.clone()).await;
        Ok(SentMessage { stored, delivery })
    }

    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<ConversationPage> {
        self.connection.join_conversation(conversation_id).await;
        let page = self.load_page(conversation_id, 1).await?;
        self.connection.mark_messages_as_read(conversation_id).await;
        info!(%conversation_id, messages = page.messages.len(), "messenger: conversation opened");
        Ok(page)
    }

    pub async fn load_page(&self, conversation_id: &ConversationId, page: u32) -> Result<ConversationPage> {
        let loaded = self
            .api
            .fetch_conversation_page(conversation_id, page)
            .await?;
        self.connection
            .apply_local(RealtimeEvent::ConversationLoaded {
                conversation_id: conversation_id.clone(),
                page: loaded.clone(),
            })
            .await;
        Ok(loaded)
    }
}

#[async_trait]
impl RecipientSender for Messenger {
    async fn ready(&self) -> Result<()> {
        if !self.api.is_configured() {
            bail!("message api is not configured");
        }
        if self.connection.status().await == ConnectionStatus::Abandoned {
            bail!("real-time connection was abandoned");
        }
        Ok(())
    }

    async fn send(&self, recipient: &Recipient, message: &RenderedMessage) -> Result<StoredMessage> {
        let subject = (!message.subject.is_empty()).then(|| message.subject.clone());
        let sent = self
            .send_direct(DirectMessage {
                conversation_id: recipient.conversation_id.clone(),
                recipient_id: recipient.recipient_id.clone(),
                subject,
                content: message.body.clone(),
                job_id: recipient.job_id.clone(),
            })
            .await?;
        Ok(sent.stored)
    }
}

#[cfg(test)]
#[path = "tests/messenger_tests.rs"]
mod tests;
