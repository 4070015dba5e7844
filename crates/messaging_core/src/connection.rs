use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::ConversationId,
    protocol::{ClientRequest, ServerEvent, StoredMessage},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ConnectionError, RetryError, TransportError},
    projection::{self, ConversationViewState, RealtimeEvent},
    queue::{FlushHandler, MessageQueue, WeakMessageQueue},
    retry::RetryManager,
    transport::{
        Transport, TransportEvent, CLIENT_DISCONNECT_REASON, SERVER_DISCONNECT_REASON,
    },
};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_reconnect_attempts: u32,
    pub ack_timeout: Duration,
    pub typing_idle: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            ack_timeout: Duration::from_secs(5),
            typing_idle: Duration::from_secs(3),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(10_000),
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        self.reconnect_base
            .checked_mul(factor)
            .unwrap_or(self.reconnect_max)
            .min(self.reconnect_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
    Abandoned,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub connected: bool,
    pub authenticated: bool,
    pub reconnect_attempts: u32,
    pub joined_channels: BTreeSet<ConversationId>,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChanged(ConnectionStatus),
    ViewUpdated(Arc<ConversationViewState>),
    ConnectionAbandoned { attempts: u32 },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(Value),
    Queued,
    /// Abandoned by `cleanup()` or a retry reset while still in flight.
    Dropped,
}

struct TypingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct ManagerState {
    status: ConnectionStatus,
    authenticated: bool,
    reconnect_attempts: u32,
    joined_channels: BTreeSet<ConversationId>,
    token: Option<String>,
    event_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    typing_timers: HashMap<ConversationId, TypingTimer>,
    next_typing_generation: u64,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    retry: Arc<RetryManager>,
    queue: MessageQueue<ClientRequest>,
    state: Mutex<ManagerState>,
    view: RwLock<Arc<ConversationViewState>>,
    events: broadcast::Sender<ClientEvent>,
    send_sequence: AtomicU64,
    cleanups: AtomicU64,
}

impl ConnectionManager {
    pub async fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        retry: Arc<RetryManager>,
        queue: MessageQueue<ClientRequest>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        queue
            .set_flush_handler(Arc::new(TransportFlushHandler {
                transport: Arc::clone(&transport),
                queue: queue.downgrade(),
                ack_timeout: config.ack_timeout,
            }))
            .await;

        let manager = Arc::new(Self {
            config,
            transport,
            retry,
            queue,
            state: Mutex::new(ManagerState {
                status: ConnectionStatus::Disconnected,
                authenticated: false,
                reconnect_attempts: 0,
                joined_channels: BTreeSet::new(),
                token: None,
                event_task: None,
                reconnect_task: None,
                typing_timers: HashMap::new(),
                next_typing_generation: 0,
            }),
            view: RwLock::new(Arc::new(ConversationViewState::default())),
            events,
            send_sequence: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
        });
        manager.ensure_event_loop().await;
        manager
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &MessageQueue<ClientRequest> {
        &self.queue
    }

    pub async fn view(&self) -> Arc<ConversationViewState> {
        Arc::clone(&*self.view.read().await)
    }

    pub async fn state(&self) -> ConnectionState {
        let guard = self.state.lock().await;
        ConnectionState {
            status: guard.status,
            connected: guard.status.is_connected(),
            authenticated: guard.authenticated,
            reconnect_attempts: guard.reconnect_attempts,
            joined_channels: guard.joined_channels.clone(),
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await.is_connected()
    }

    pub async fn connect(self: &Arc<Self>, token: &str) {
        {
            let mut guard = self.state.lock().await;
            match guard.status {
                ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Authenticated => {
                    debug!(status = ?guard.status, "connection: connect ignored");
                    return;
                }
                ConnectionStatus::Abandoned => guard.reconnect_attempts = 0,
                ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => {}
            }
            if let Some(task) = guard.reconnect_task.take() {
                task.abort();
            }
            guard.token = Some(token.to_string());
            guard.status = ConnectionStatus::Connecting;
        }
        self.ensure_event_loop().await;
        self.publish_status(ConnectionStatus::Connecting);
        info!("connection: connecting");
        self.transport.connect(token).await;
    }

    pub async fn disconnect(&self) {
        {
            let mut guard = self.state.lock().await;
            if let Some(task) = guard.reconnect_task.take() {
                task.abort();
            }
            guard.status = ConnectionStatus::Disconnected;
            guard.authenticated = false;
        }
        self.publish_status(ConnectionStatus::Disconnected);
        self.transport.disconnect().await;
    }

    pub async fn send_message(&self, message: StoredMessage) -> SendOutcome {
        let operation_id = format!(
            "send:{}:{}:{}",
            message.conversation_id,
            Utc::now().timestamp_millis(),
            self.send_sequence.fetch_add(1, Ordering::Relaxed)
        );
        self.deliver_or_queue(&operation_id, ClientRequest::SendMessage { message })
            .await
    }

    pub async fn mark_messages_as_read(&self, conversation_id: &ConversationId) -> SendOutcome {
        self.apply_local(RealtimeEvent::MarkRead {
            conversation_id: conversation_id.clone(),
        })
        .await;
        let operation_id = format!(
            "mark-read:{}:{}:{}",
            conversation_id,
            Utc::now().timestamp_millis(),
            self.send_sequence.fetch_add(1, Ordering::Relaxed)
        );
        self.deliver_or_queue(
            &operation_id,
            ClientRequest::MarkMessagesRead {
                conversation_id: conversation_id.clone(),
            },
        )
        .await
    }

    async fn deliver_or_queue(&self, operation_id: &str, request: ClientRequest) -> SendOutcome {
        let Some(channel_id) = request.conversation_id().cloned() else {
            warn!(event = request.event_name(), "connection: request without conversation");
            return SendOutcome::Queued;
        };

        if !self.is_connected().await {
            debug!(conversation_id = %channel_id, event = request.event_name(), "connection: offline, queueing");
            self.queue.enqueue(&channel_id, request).await;
            return SendOutcome::Queued;
        }

        let cleanups = self.cleanups.load(Ordering::SeqCst);
        let pending = &request;
        match self
            .retry
            .execute(operation_id, || self.emit_with_timeout(pending))
            .await
        {
            Ok(ack) => SendOutcome::Delivered(ack),
            Err(RetryError::Cancelled { .. }) => {
                debug!(conversation_id = %channel_id, operation_id, "connection: delivery cancelled, dropping");
                SendOutcome::Dropped
            }
            Err(err) if self.cleanups.load(Ordering::SeqCst) != cleanups => {
                debug!(conversation_id = %channel_id, operation_id, "connection: cleaned up during delivery, dropping: {err}");
                SendOutcome::Dropped
            }
            Err(err) => {
                warn!(
                    conversation_id = %channel_id,
                    operation_id,
                    "connection: delivery failed, falling back to queue: {err}"
                );
                self.queue.enqueue(&channel_id, request).await;
                SendOutcome::Queued
            }
        }
    }

    async fn emit_with_timeout(&self, request: &ClientRequest) -> anyhow::Result<Value> {
        let data = request.data()?;
        Ok(emit_acked(
            self.transport.as_ref(),
            request.event_name(),
            data,
            self.config.ack_timeout,
        )
        .await?)
    }

    pub async fn emit_typing(self: &Arc<Self>, conversation_id: &ConversationId, is_typing: bool) {
        {
            let mut guard = self.state.lock().await;
            if let Some(previous) = guard.typing_timers.remove(conversation_id) {
                previous.handle.abort();
            }
            if is_typing {
                guard.next_typing_generation += 1;
                let generation = guard.next_typing_generation;
                let manager = Arc::downgrade(self);
                let timer_conversation = conversation_id.clone();
                let idle = self.config.typing_idle;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(idle).await;
                    if let Some(manager) = manager.upgrade() {
                        manager
                            .typing_idle_elapsed(&timer_conversation, generation)
                            .await;
                    }
                });
                guard
                    .typing_timers
                    .insert(conversation_id.clone(), TypingTimer { generation, handle });
            }
        }
        self.send_typing(conversation_id, is_typing).await;
    }

    async fn typing_idle_elapsed(&self, conversation_id: &ConversationId, generation: u64) {
        {
            let mut guard = self.state.lock().await;
            match guard.typing_timers.get(conversation_id) {
                Some(timer) if timer.generation == generation => {
                    guard.typing_timers.remove(conversation_id);
                }
                _ => return,
            }
        }
        self.send_typing(conversation_id, false).await;
    }

    async fn send_typing(&self, conversation_id: &ConversationId, is_typing: bool) {
        if !self.is_connected().await {
            return;
        }
        let request = ClientRequest::TypingStatus {
            conversation_id: conversation_id.clone(),
            is_typing,
        };
        if let Err(err) = self.send_volatile(&request).await {
            debug!(conversation_id = %conversation_id, "connection: typing emit dropped: {err:#}");
        }
    }

    async fn send_volatile(&self, request: &ClientRequest) -> anyhow::Result<()> {
        let data = request.data()?;
        self.transport.send(request.event_name(), data).await?;
        Ok(())
    }

    pub async fn join_conversation(self: &Arc<Self>, conversation_id: &ConversationId) {
        let (status, token) = {
            let mut guard = self.state.lock().await;
            guard.joined_channels.insert(conversation_id.clone());
            (guard.status, guard.token.clone())
        };

        if status.is_connected() {
            let request = ClientRequest::JoinConversation {
                conversation_id: conversation_id.clone(),
            };
            if let Err(err) = self.send_volatile(&request).await {
                warn!(conversation_id = %conversation_id, "connection: join failed, will replay on reconnect: {err:#}");
            }
            return;
        }

        match (status, token) {
            (ConnectionStatus::Disconnected | ConnectionStatus::Abandoned, Some(token)) => {
                self.connect(&token).await;
            }
            (ConnectionStatus::Disconnected | ConnectionStatus::Abandoned, None) => {
                warn!(conversation_id = %conversation_id, "connection: join while signed out; room will be joined on connect");
            }
            _ => {}
        }
    }

    pub async fn leave_conversation(&self, conversation_id: &ConversationId) {
        let connected = {
            let mut guard = self.state.lock().await;
            guard.joined_channels.remove(conversation_id);
            if let Some(timer) = guard.typing_timers.remove(conversation_id) {
                timer.handle.abort();
            }
            guard.status.is_connected()
        };
        if connected {
            let request = ClientRequest::LeaveConversation {
                conversation_id: conversation_id.clone(),
            };
            if let Err(err) = self.send_volatile(&request).await {
                debug!(conversation_id = %conversation_id, "connection: leave emit dropped: {err:#}");
            }
        }
    }

    pub async fn apply_local(&self, event: RealtimeEvent) {
        self.apply_event(&event).await;
    }

    pub async fn cleanup(&self) {
        {
            let mut guard = self.state.lock().await;
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if let Some(task) = guard.event_task.take() {
                task.abort();
            }
            if let Some(task) = guard.reconnect_task.take() {
                task.abort();
            }
            for (_, timer) in guard.typing_timers.drain() {
                timer.handle.abort();
            }
            guard.joined_channels.clear();
            guard.status = ConnectionStatus::Disconnected;
            guard.authenticated = false;
            guard.reconnect_attempts = 0;
            guard.token = None;
        }
        self.transport.disconnect().await;
        self.queue.clear_all().await;
        self.publish_status(ConnectionStatus::Disconnected);
        info!("connection: cleaned up");
    }

    async fn ensure_event_loop(self: &Arc<Self>) {
        let mut guard = self.state.lock().await;
        if guard
            .event_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let mut transport_events = BroadcastStream::new(self.transport.subscribe());
        let manager = Arc::downgrade(self);
        guard.event_task = Some(tokio::spawn(async move {
            while let Some(event) = transport_events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection: transport events lagged");
                        continue;
                    }
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_transport_event(event).await;
            }
        }));
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::ConnectError(reason) => self.on_connection_failure(&reason).await,
            TransportEvent::Disconnected { reason } => self.on_disconnected(&reason).await,
            TransportEvent::Inbound { event, data } => self.on_inbound(&event, data).await,
        }
    }

    async fn on_connected(&self) {
        let (joined, token) = {
            let mut guard = self.state.lock().await;
            guard.status = ConnectionStatus::Connected;
            guard.authenticated = false;
            guard.reconnect_attempts = 0;
            if let Some(task) = guard.reconnect_task.take() {
                task.abort();
            }
            (guard.joined_channels.clone(), guard.token.clone())
        };
        info!(rooms = joined.len(), "connection: connected");
        self.publish_status(ConnectionStatus::Connected);

        if let Some(token) = token {
            if let Err(err) = self.send_volatile(&ClientRequest::Authenticate { token }).await {
                warn!("connection: authenticate emit failed: {err:#}");
            }
        }

        // Membership first, so the server routes the buffered messages below.
        for conversation_id in joined {
            let request = ClientRequest::JoinConversation { conversation_id };
            if let Err(err) = self.send_volatile(&request).await {
                warn!("connection: room rejoin failed: {err:#}");
            }
        }

        let flushed = self.queue.flush_all().await;
        if !flushed.is_empty() {
            info!(channels = flushed.len(), "connection: replayed queued messages");
        }
    }

    async fn on_connection_failure(self: &Arc<Self>, reason: &str) {
        let (attempts, abandoned) = {
            let mut guard = self.state.lock().await;
            if matches!(
                guard.status,
                ConnectionStatus::Abandoned | ConnectionStatus::Disconnected
            ) {
                debug!(status = ?guard.status, %reason, "connection: ignoring stale connect failure");
                return;
            }
            guard.reconnect_attempts += 1;
            guard.authenticated = false;
            let attempts = guard.reconnect_attempts;
            if attempts < self.config.max_reconnect_attempts {
                guard.status = ConnectionStatus::Reconnecting;
                let delay = self.config.reconnect_delay(attempts);
                warn!(
                    attempt = attempts,
                    max_attempts = self.config.max_reconnect_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "connection: connect failed, scheduling reconnect"
                );
                if let Some(task) = guard.reconnect_task.take() {
                    task.abort();
                }
                let manager = Arc::downgrade(self);
                guard.reconnect_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    reopen(manager).await;
                }));
                (attempts, false)
            } else {
                guard.status = ConnectionStatus::Abandoned;
                if let Some(task) = guard.reconnect_task.take() {
                    task.abort();
                }
                (attempts, true)
            }
        };

        if abandoned {
            let err = ConnectionError::Abandoned { attempts };
            error!(attempts, %reason, "connection: {err}");
            self.transport.disconnect().await;
            self.publish_status(ConnectionStatus::Abandoned);
            let _ = self
                .events
                .send(ClientEvent::ConnectionAbandoned { attempts });
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        } else {
            self.publish_status(ConnectionStatus::Reconnecting);
        }
    }

    async fn on_disconnected(self: &Arc<Self>, reason: &str) {
        let status = self.status().await;
        if matches!(
            status,
            ConnectionStatus::Abandoned | ConnectionStatus::Disconnected
        ) || reason == CLIENT_DISCONNECT_REASON
        {
            debug!(%reason, ?status, "connection: transport closed");
            return;
        }

        if reason == SERVER_DISCONNECT_REASON {
            let token = {
                let mut guard = self.state.lock().await;
                guard.status = ConnectionStatus::Reconnecting;
                guard.authenticated = false;
                guard.token.clone()
            };
            info!("connection: server closed the session, reconnecting once");
            self.publish_status(ConnectionStatus::Reconnecting);
            if let Some(token) = token {
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    transport.connect(&token).await;
                });
            }
            return;
        }

        self.on_connection_failure(reason).await;
    }

    async fn on_inbound(&self, event: &str, data: Value) {
        let server_event = match ServerEvent::from_wire(event, data) {
            Ok(Some(server_event)) => server_event,
            Ok(None) => {
                debug!(event, "connection: ignoring unknown inbound event");
                return;
            }
            Err(err) => {
                warn!(event, "connection: malformed inbound event: {err}");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("invalid server event {event}: {err}")));
                return;
            }
        };

        match &server_event {
            ServerEvent::Authenticated { user_id } => {
                {
                    let mut guard = self.state.lock().await;
                    guard.authenticated = true;
                    if guard.status == ConnectionStatus::Connected {
                        guard.status = ConnectionStatus::Authenticated;
                    }
                }
                info!(user_id = %user_id, "connection: authenticated");
                self.publish_status(ConnectionStatus::Authenticated);
            }
            ServerEvent::Error(api_error) => {
                let _ = self.events.send(ClientEvent::Error(format!(
                    "{:?}: {}",
                    api_error.code, api_error.message
                )));
            }
            _ => {}
        }

        if let Some(view_event) = RealtimeEvent::from_server(server_event) {
            self.apply_event(&view_event).await;
        }
    }

    async fn apply_event(&self, event: &RealtimeEvent) {
        let updated = {
            let mut view = self.view.write().await;
            let next = projection::apply(&view, event);
            if next == **view {
                None
            } else {
                let next = Arc::new(next);
                *view = Arc::clone(&next);
                Some(next)
            }
        };
        if let Some(view) = updated {
            let _ = self.events.send(ClientEvent::ViewUpdated(view));
        }
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let _ = self.events.send(ClientEvent::StatusChanged(status));
    }
}

async fn reopen(manager: Weak<ConnectionManager>) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let token = {
        let guard = manager.state.lock().await;
        if guard.status != ConnectionStatus::Reconnecting {
            return;
        }
        guard.token.clone()
    };
    if let Some(token) = token {
        info!("connection: reconnect attempt");
        manager.transport.connect(&token).await;
    }
}

async fn emit_acked(
    transport: &dyn Transport,
    event: &str,
    data: Value,
    ack_timeout: Duration,
) -> Result<Value, TransportError> {
    match tokio::time::timeout(ack_timeout, transport.emit(event, data)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            event: event.to_string(),
            timeout_ms: ack_timeout.as_millis() as u64,
        }),
    }
}

struct TransportFlushHandler {
    transport: Arc<dyn Transport>,
    queue: WeakMessageQueue<ClientRequest>,
    ack_timeout: Duration,
}

impl TransportFlushHandler {
    async fn put_back(&self, channel_id: &ConversationId, payloads: Vec<ClientRequest>, rearm: bool) {
        if let Some(queue) = self.queue.upgrade() {
            queue.requeue_front(channel_id, payloads, rearm).await;
        }
    }
}

#[async_trait]
impl FlushHandler<ClientRequest> for TransportFlushHandler {
    async fn handle_flush(
        &self,
        channel_id: &ConversationId,
        payloads: Vec<ClientRequest>,
    ) -> anyhow::Result<()> {
        if !self.transport.is_connected() {
            debug!(conversation_id = %channel_id, count = payloads.len(), "queue: offline, holding messages");
            self.put_back(channel_id, payloads, false).await;
            return Ok(());
        }

        for (index, request) in payloads.iter().enumerate() {
            let data = request.data()?;
            if let Err(err) =
                emit_acked(self.transport.as_ref(), request.event_name(), data, self.ack_timeout)
                    .await
            {
                let undelivered = payloads[index..].to_vec();
                let remaining = undelivered.len();
                self.put_back(channel_id, undelivered, true).await;
                return Err(anyhow!(
                    "flush of {} stopped with {remaining} undelivered: {err}",
                    channel_id
                ));
            }
        }
        debug!(conversation_id = %channel_id, count = payloads.len(), "queue: flushed to transport");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
