use std::sync::Arc;

use anyhow::Result;
use shared::protocol::ClientRequest;
use tracing::info;

pub mod api;
pub mod bulk;
pub mod config;
pub mod connection;
pub mod error;
pub mod messenger;
pub mod projection;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod ws_transport;

pub use api::{HttpMessageApi, MessageApi, MissingMessageApi};
pub use bulk::{BulkSendOrchestrator, BulkSendReport, MessageTemplate, Recipient};
pub use config::Settings;
pub use connection::{ClientEvent, ConnectionManager, ConnectionStatus, SendOutcome};
pub use messenger::{DirectMessage, Messenger, SentMessage};
pub use projection::{ConversationViewState, RealtimeEvent};
pub use queue::MessageQueue;
pub use retry::RetryManager;
pub use transport::{MemoryTransport, Transport};
pub use ws_transport::WebSocketTransport;

pub struct MessagingContext {
    settings: Settings,
    retry: Arc<RetryManager>,
    queue: MessageQueue<ClientRequest>,
    connection: Arc<ConnectionManager>,
    messenger: Arc<Messenger>,
    bulk: BulkSendOrchestrator,
}

impl MessagingContext {
    pub async fn build(settings: Settings) -> Result<Self> {
        let transport = Arc::new(WebSocketTransport::new(settings.resolved_ws_url()?));
        let api = Arc::new(HttpMessageApi::new(
            settings.server_url.clone(),
            settings.auth_token.clone(),
        ));
        Ok(Self::with_dependencies(settings, transport, api).await)
    }

    pub async fn offline(settings: Settings) -> Self {
        Self::with_dependencies(
            settings,
            Arc::new(MemoryTransport::new()),
            Arc::new(MissingMessageApi),
        )
        .await
    }

    pub async fn with_dependencies(
        settings: Settings,
        transport: Arc<dyn Transport>,
        api: Arc<dyn MessageApi>,
    ) -> Self {
        let retry = Arc::new(RetryManager::new(settings.retry.clone()));
        let queue = MessageQueue::new(settings.queue.clone());
        let connection = ConnectionManager::new(
            settings.connection.clone(),
            transport,
            Arc::clone(&retry),
            queue.clone(),
        )
        .await;
        let messenger = Arc::new(Messenger::new(
            api,
            Arc::clone(&connection),
            Arc::clone(&retry),
        ));
        let bulk = BulkSendOrchestrator::new(messenger.clone(), settings.bulk_batch_size);
        Self {
            settings,
            retry,
            queue,
            connection,
            messenger,
            bulk,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn queue(&self) -> &MessageQueue<ClientRequest> {
        &self.queue
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn bulk(&self) -> &BulkSendOrchestrator {
        &self.bulk
    }

    pub async fn start(&self) {
        match &self.settings.auth_token {
            Some(token) => self.connection.connect(token).await,
            None => info!("context: no auth token configured, staying offline"),
        }
    }

    pub async fn shutdown(&self) {
        self.connection.cleanup().await;
        self.retry.clear_all().await;
        info!("context: shut down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
