use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::TransportError;

pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";
pub const TRANSPORT_CLOSE_REASON: &str = "transport close";
pub const TRANSPORT_ERROR_REASON: &str = "transport error";

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    ConnectError(String),
    Disconnected { reason: String },
    Inbound { event: String, data: Value },
}

/// Outcomes of `connect` are reported through `subscribe()`, not returned.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, token: &str);
    async fn disconnect(&self);
    async fn emit(&self, event: &str, data: Value) -> Result<Value, TransportError>;
    async fn send(&self, event: &str, data: Value) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedFrame {
    pub event: String,
    pub data: Value,
    pub acked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmitBehaviour {
    Fail(String),
    Reject(String),
    Hang,
}

#[derive(Default)]
struct MemoryState {
    tokens: Vec<String>,
    connect_script: VecDeque<Result<(), String>>,
    emitted: Vec<EmittedFrame>,
    attempts: HashMap<String, u32>,
    scripted_emits: HashMap<String, VecDeque<EmitBehaviour>>,
    acks: HashMap<String, Value>,
}

pub struct MemoryTransport {
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    state: Mutex<MemoryState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connected: AtomicBool::new(false),
            events,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = Result<(), String>>) {
        self.with_state(|state| state.connect_script.extend(outcomes));
    }

    pub fn script_emits(&self, event: &str, behaviours: impl IntoIterator<Item = EmitBehaviour>) {
        self.with_state(|state| {
            state
                .scripted_emits
                .entry(event.to_string())
                .or_default()
                .extend(behaviours)
        });
    }

    pub fn set_ack(&self, event: &str, ack: Value) {
        self.with_state(|state| {
            state.acks.insert(event.to_string(), ack);
        });
    }

    pub fn inject(&self, event: &str, data: Value) {
        let _ = self.events.send(TransportEvent::Inbound {
            event: event.to_string(),
            data,
        });
    }

    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn emitted(&self) -> Vec<EmittedFrame> {
        self.with_state(|state| state.emitted.clone())
    }

    pub fn emitted_events(&self) -> Vec<String> {
        self.with_state(|state| state.emitted.iter().map(|f| f.event.clone()).collect())
    }

    pub fn attempt_count(&self, event: &str) -> u32 {
        self.with_state(|state| state.attempts.get(event).copied().unwrap_or_default())
    }

    pub fn connect_tokens(&self) -> Vec<String> {
        self.with_state(|state| state.tokens.clone())
    }

    pub fn clear_emitted(&self) {
        self.with_state(|state| state.emitted.clear());
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, token: &str) {
        let outcome = self.with_state(|state| {
            state.tokens.push(token.to_string());
            state.connect_script.pop_front().unwrap_or(Ok(()))
        });
        match outcome {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::Connected);
            }
            Err(reason) => {
                self.connected.store(false, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::ConnectError(reason));
            }
        }
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            });
        }
    }

    async fn emit(&self, event: &str, data: Value) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let (behaviour, ack) = self.with_state(|state| {
            *state.attempts.entry(event.to_string()).or_default() += 1;
            let behaviour = state
                .scripted_emits
                .get_mut(event)
                .and_then(VecDeque::pop_front);
            let ack = state
                .acks
                .get(event)
                .cloned()
                .unwrap_or_else(|| json!({ "ok": true }));
            (behaviour, ack)
        });
        match behaviour {
            Some(EmitBehaviour::Fail(reason)) => Err(TransportError::Io(reason)),
            Some(EmitBehaviour::Reject(reason)) => Err(TransportError::Rejected {
                event: event.to_string(),
                reason,
            }),
            Some(EmitBehaviour::Hang) => {
                std::future::pending::<()>().await;
                Err(TransportError::Closed)
            }
            None => {
                self.with_state(|state| {
                    state.emitted.push(EmittedFrame {
                        event: event.to_string(),
                        data,
                        acked: true,
                    })
                });
                Ok(ack)
            }
        }
    }

    async fn send(&self, event: &str, data: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.with_state(|state| {
            *state.attempts.entry(event.to_string()).or_default() += 1;
            state.emitted.push(EmittedFrame {
                event: event.to_string(),
                data,
                acked: false,
            })
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
