use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::WireFrame;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::TransportError,
    transport::{
        Transport, TransportEvent, CLIENT_DISCONNECT_REASON, TRANSPORT_CLOSE_REASON,
        TRANSPORT_ERROR_REASON,
    },
};

type PendingAcks = Arc<StdMutex<HashMap<u64, oneshot::Sender<WireFrame>>>>;

/// Id of the live session, 0 when there is none.
type ActiveSession = Arc<AtomicU64>;

struct Session {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct WebSocketTransport {
    url: Url,
    events: broadcast::Sender<TransportEvent>,
    active: ActiveSession,
    next_session: AtomicU64,
    connecting: AtomicBool,
    session: Mutex<Option<Session>>,
    pending_acks: PendingAcks,
    next_ack: AtomicU64,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            url,
            events,
            active: Arc::new(AtomicU64::new(0)),
            next_session: AtomicU64::new(1),
            connecting: AtomicBool::new(false),
            session: Mutex::new(None),
            pending_acks: Arc::new(StdMutex::new(HashMap::new())),
            next_ack: AtomicU64::new(1),
        }
    }

    fn session_url(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        if !token.is_empty() {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }

    async fn outbound(&self) -> Result<mpsc::UnboundedSender<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.outbound.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn write_frame(
        outbound: &mpsc::UnboundedSender<Message>,
        frame: &WireFrame,
    ) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(frame).map_err(|err| TransportError::Io(err.to_string()))?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn open(&self, token: &str) -> Option<oneshot::Sender<()>> {
        let url = self.session_url(token);
        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(url = %self.url, "ws: connect failed: {err}");
                let _ = self.events.send(TransportEvent::ConnectError(err.to_string()));
                return None;
            }
        };
        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (start, started) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(err) = ws_writer.send(message).await {
                    debug!("ws: write failed: {err}");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let active = Arc::clone(&self.active);
        let pending_acks = Arc::clone(&self.pending_acks);
        let reader = tokio::spawn(async move {
            let _ = started.await;
            let mut reason = TRANSPORT_CLOSE_REASON.to_string();
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireFrame>(&text) {
                        Ok(frame) => route_frame(frame, &events, &pending_acks),
                        Err(err) => warn!("ws: invalid frame: {err}"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            if !frame.reason.is_empty() {
                                reason = frame.reason.to_string();
                            }
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("ws: receive failed: {err}");
                        reason = TRANSPORT_ERROR_REASON.to_string();
                        break;
                    }
                }
            }
            // A replaced or locally closed session no longer owns the flag.
            if active
                .compare_exchange(session_id, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                fail_pending(&pending_acks);
                info!(%reason, session_id, "ws: connection dropped");
                let _ = events.send(TransportEvent::Disconnected { reason });
            }
        });

        let previous = self.session.lock().await.replace(Session {
            outbound,
            reader,
            writer,
        });
        if let Some(previous) = previous {
            shutdown_session(previous);
        }
        self.active.store(session_id, Ordering::SeqCst);
        info!(url = %self.url, session_id, "ws: connected");
        Some(start)
    }
}

fn route_frame(frame: WireFrame, events: &broadcast::Sender<TransportEvent>, pending: &PendingAcks) {
    match (frame.event.clone(), frame.ack) {
        (Some(event), _) => {
            let _ = events.send(TransportEvent::Inbound {
                event,
                data: frame.data,
            });
        }
        (None, Some(id)) => {
            let waiter = pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&id));
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                }
                None => debug!(ack = id, "ws: acknowledgement without waiter"),
            }
        }
        (None, None) => debug!("ws: frame without event or ack"),
    }
}

fn fail_pending(pending: &PendingAcks) {
    if let Ok(mut pending) = pending.lock() {
        // Dropping the senders wakes every waiter with `Closed`.
        pending.clear();
    }
}

fn shutdown_session(session: Session) {
    let _ = session.outbound.send(Message::Close(None));
    session.reader.abort();
    // The writer exits on its own once the close frame is flushed.
    drop(session.writer);
}

struct AckGuard {
    id: u64,
    pending: PendingAcks,
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, token: &str) {
        if self.is_connected() || self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let start = self.open(token).await;
        self.connecting.store(false, Ordering::SeqCst);
        if let Some(start) = start {
            let _ = self.events.send(TransportEvent::Connected);
            let _ = start.send(());
        }
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        let was_connected = self.active.swap(0, Ordering::SeqCst) != 0;
        if let Some(session) = session {
            shutdown_session(session);
        }
        fail_pending(&self.pending_acks);
        if was_connected {
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            });
        }
    }

    async fn emit(&self, event: &str, data: Value) -> Result<Value, TransportError> {
        let outbound = self.outbound().await?;
        let id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .map_err(|_| TransportError::Io("ack table poisoned".into()))?
            .insert(id, tx);
        let _guard = AckGuard {
            id,
            pending: Arc::clone(&self.pending_acks),
        };

        Self::write_frame(&outbound, &WireFrame::event(event, data, Some(id)))?;

        let reply = rx.await.map_err(|_| TransportError::Closed)?;
        if let Some(reason) = reply.ack_error() {
            return Err(TransportError::Rejected {
                event: event.to_string(),
                reason,
            });
        }
        Ok(reply.data)
    }

    async fn send(&self, event: &str, data: Value) -> Result<(), TransportError> {
        let outbound = self.outbound().await?;
        Self::write_frame(&outbound, &WireFrame::event(event, data, None))
    }

    fn is_connected(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/ws_transport_tests.rs"]
mod tests;
