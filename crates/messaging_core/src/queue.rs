use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::ConversationId;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(5000),
        }
    }
}

/// Receives drained buffers. Transmission and any re-enqueueing on failure
/// are the handler's business; the queue never assumes delivery.
#[async_trait]
pub trait FlushHandler<P>: Send + Sync {
    async fn handle_flush(&self, channel_id: &ConversationId, payloads: Vec<P>)
        -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct QueuedMessage<P> {
    pub channel_id: ConversationId,
    pub payload: P,
    pub enqueued_at: DateTime<Utc>,
}

struct ChannelTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct QueueState<P> {
    buffers: BTreeMap<ConversationId, VecDeque<QueuedMessage<P>>>,
    timers: HashMap<ConversationId, ChannelTimer>,
    next_timer_generation: u64,
}

struct QueueInner<P> {
    config: QueueConfig,
    state: Mutex<QueueState<P>>,
    handler: RwLock<Option<Arc<dyn FlushHandler<P>>>>,
}

pub struct MessageQueue<P> {
    inner: Arc<QueueInner<P>>,
}

impl<P> Clone for MessageQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct WeakMessageQueue<P> {
    inner: Weak<QueueInner<P>>,
}

impl<P> Clone for WeakMessageQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<P> WeakMessageQueue<P> {
    pub fn upgrade(&self) -> Option<MessageQueue<P>> {
        self.inner.upgrade().map(|inner| MessageQueue { inner })
    }
}

impl<P> MessageQueue<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState {
                    buffers: BTreeMap::new(),
                    timers: HashMap::new(),
                    next_timer_generation: 0,
                }),
                handler: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakMessageQueue<P> {
        WeakMessageQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub async fn set_flush_handler(&self, handler: Arc<dyn FlushHandler<P>>) {
        *self.inner.handler.write().await = Some(handler);
    }

    pub async fn enqueue(&self, channel_id: &ConversationId, payload: P) {
        let batch_full = {
            let mut state = self.inner.state.lock().await;
            let buffer = state.buffers.entry(channel_id.clone()).or_default();
            let was_empty = buffer.is_empty();
            buffer.push_back(QueuedMessage {
                channel_id: channel_id.clone(),
                payload,
                enqueued_at: Utc::now(),
            });
            let len = buffer.len();
            debug!(conversation_id = %channel_id, pending = len, "queue: enqueued");

            if len >= self.inner.config.batch_size {
                true
            } else {
                if was_empty {
                    self.arm_timer(&mut state, channel_id);
                }
                false
            }
        };

        if batch_full {
            self.flush(channel_id).await;
        }
    }

    pub async fn requeue_front(&self, channel_id: &ConversationId, payloads: Vec<P>, rearm: bool) {
        if payloads.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().await;
        let now = Utc::now();
        let buffer = state.buffers.entry(channel_id.clone()).or_default();
        for payload in payloads.into_iter().rev() {
            buffer.push_front(QueuedMessage {
                channel_id: channel_id.clone(),
                payload,
                enqueued_at: now,
            });
        }
        if rearm && !state.timers.contains_key(channel_id) {
            self.arm_timer(&mut state, channel_id);
        }
    }

    pub async fn flush(&self, channel_id: &ConversationId) -> Vec<P> {
        let payloads = {
            let mut state = self.inner.state.lock().await;
            if let Some(timer) = state.timers.remove(channel_id) {
                timer.handle.abort();
            }
            drain(&mut state, channel_id)
        };
        self.dispatch(channel_id, payloads).await
    }

    pub async fn flush_all(&self) -> Vec<(ConversationId, Vec<P>)> {
        let channels = self.pending_channels().await;
        let mut flushed = Vec::with_capacity(channels.len());
        for channel_id in channels {
            let payloads = self.flush(&channel_id).await;
            if !payloads.is_empty() {
                flushed.push((channel_id, payloads));
            }
        }
        flushed
    }

    pub async fn get_pending(&self, channel_id: &ConversationId) -> Vec<P> {
        self.inner
            .state
            .lock()
            .await
            .buffers
            .get(channel_id)
            .map(|buffer| buffer.iter().map(|queued| queued.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn pending_channels(&self) -> Vec<ConversationId> {
        self.inner
            .state
            .lock()
            .await
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(channel_id, _)| channel_id.clone())
            .collect()
    }

    pub async fn has_timer(&self, channel_id: &ConversationId) -> bool {
        self.inner.state.lock().await.timers.contains_key(channel_id)
    }

    pub async fn clear(&self, channel_id: &ConversationId) {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timers.remove(channel_id) {
            timer.handle.abort();
        }
        state.buffers.remove(channel_id);
    }

    pub async fn clear_all(&self) {
        let mut state = self.inner.state.lock().await;
        for (_, timer) in state.timers.drain() {
            timer.handle.abort();
        }
        state.buffers.clear();
    }

    fn arm_timer(&self, state: &mut QueueState<P>, channel_id: &ConversationId) {
        if let Some(previous) = state.timers.remove(channel_id) {
            previous.handle.abort();
        }
        state.next_timer_generation += 1;
        let generation = state.next_timer_generation;
        let interval = self.inner.config.flush_interval;
        let queue = self.downgrade();
        let timer_channel = channel_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(queue) = queue.upgrade() {
                queue.flush_from_timer(&timer_channel, generation).await;
            }
        });
        state
            .timers
            .insert(channel_id.clone(), ChannelTimer { generation, handle });
    }

    async fn flush_from_timer(&self, channel_id: &ConversationId, generation: u64) {
        let payloads = {
            let mut state = self.inner.state.lock().await;
            match state.timers.get(channel_id) {
                Some(timer) if timer.generation == generation => {
                    // Running inside this timer's task, so detach instead of abort.
                    state.timers.remove(channel_id);
                }
                _ => return,
            }
            drain(&mut state, channel_id)
        };
        debug!(conversation_id = %channel_id, count = payloads.len(), "queue: interval flush");
        self.dispatch(channel_id, payloads).await;
    }

    async fn dispatch(&self, channel_id: &ConversationId, payloads: Vec<P>) -> Vec<P> {
        if payloads.is_empty() {
            return payloads;
        }
        let handler = self.inner.handler.read().await.clone();
        if let Some(handler) = handler {
            if let Err(err) = handler.handle_flush(channel_id, payloads.clone()).await {
                warn!(
                    conversation_id = %channel_id,
                    count = payloads.len(),
                    "queue: flush handler failed: {err:#}"
                );
            }
        }
        payloads
    }
}

fn drain<P>(state: &mut QueueState<P>, channel_id: &ConversationId) -> Vec<P> {
    state
        .buffers
        .remove(channel_id)
        .map(|buffer| buffer.into_iter().map(|queued| queued.payload).collect())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
