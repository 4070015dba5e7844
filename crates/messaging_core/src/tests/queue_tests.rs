use super::*;
use anyhow::anyhow;

type Flushes = Arc<Mutex<Vec<(ConversationId, Vec<String>)>>>;

#[derive(Default)]
struct RecordingHandler {
    flushes: Flushes,
    fail: bool,
}

#[async_trait]
impl FlushHandler<String> for RecordingHandler {
    async fn handle_flush(
        &self,
        channel_id: &ConversationId,
        payloads: Vec<String>,
    ) -> anyhow::Result<()> {
        self.flushes
            .lock()
            .await
            .push((channel_id.clone(), payloads));
        if self.fail {
            return Err(anyhow!("socket closed"));
        }
        Ok(())
    }
}

/// Puts a late message into the queue while its own flush is being handled.
struct EnqueueDuringFlush {
    queue: WeakMessageQueue<String>,
    flushes: Flushes,
}

#[async_trait]
impl FlushHandler<String> for EnqueueDuringFlush {
    async fn handle_flush(
        &self,
        channel_id: &ConversationId,
        payloads: Vec<String>,
    ) -> anyhow::Result<()> {
        let first = {
            let mut flushes = self.flushes.lock().await;
            flushes.push((channel_id.clone(), payloads));
            flushes.len() == 1
        };
        if first {
            if let Some(queue) = self.queue.upgrade() {
                queue.enqueue(channel_id, "late".to_string()).await;
            }
        }
        Ok(())
    }
}

fn config(batch_size: usize) -> QueueConfig {
    QueueConfig {
        batch_size,
        flush_interval: Duration::from_millis(5000),
    }
}

async fn queue_with_recorder(batch_size: usize) -> (MessageQueue<String>, Flushes) {
    let queue = MessageQueue::new(config(batch_size));
    let handler = RecordingHandler::default();
    let flushes = Arc::clone(&handler.flushes);
    queue.set_flush_handler(Arc::new(handler)).await;
    (queue, flushes)
}

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

#[tokio::test(start_paused = true)]
async fn flush_preserves_enqueue_order() {
    let (queue, flushes) = queue_with_recorder(10).await;
    let expected: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();
    for message in &expected {
        queue.enqueue(&conv("conv1"), message.clone()).await;
    }

    let drained = queue.flush(&conv("conv1")).await;

    assert_eq!(drained, expected);
    let flushes = flushes.lock().await;
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0], (conv("conv1"), expected));
}

#[tokio::test(start_paused = true)]
async fn reaching_batch_size_flushes_once_and_cancels_timer() {
    let (queue, flushes) = queue_with_recorder(3).await;
    for message in ["a", "b", "c"] {
        queue.enqueue(&conv("conv1"), message.to_string()).await;
    }

    assert!(queue.get_pending(&conv("conv1")).await.is_empty());
    assert!(!queue.has_timer(&conv("conv1")).await);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let flushes = flushes.lock().await;
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].1, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn single_message_flushes_after_interval() {
    let (queue, flushes) = queue_with_recorder(10).await;
    queue.enqueue(&conv("conv1"), "only".to_string()).await;

    tokio::time::sleep(Duration::from_millis(4999)).await;
    assert!(flushes.lock().await.is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    {
        let flushes = flushes.lock().await;
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1, vec!["only"]);
    }

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(flushes.lock().await.len(), 1);
    assert!(queue.get_pending(&conv("conv1")).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn batch_of_two_flushes_on_second_enqueue() {
    let (queue, flushes) = queue_with_recorder(2).await;

    queue.enqueue(&conv("conv1"), "m1".to_string()).await;
    assert!(flushes.lock().await.is_empty());
    assert_eq!(queue.get_pending(&conv("conv1")).await, vec!["m1"]);

    queue.enqueue(&conv("conv1"), "m2".to_string()).await;
    assert_eq!(flushes.lock().await[0].1, vec!["m1", "m2"]);
    assert!(queue.get_pending(&conv("conv1")).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn timer_runs_from_first_message_of_buffer() {
    let (queue, flushes) = queue_with_recorder(10).await;
    queue.enqueue(&conv("conv1"), "first".to_string()).await;
    tokio::time::sleep(Duration::from_millis(3000)).await;
    queue.enqueue(&conv("conv1"), "second".to_string()).await;

    tokio::time::sleep(Duration::from_millis(2001)).await;

    let flushes = flushes.lock().await;
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].1, vec!["first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn channels_are_buffered_independently() {
    let (queue, flushes) = queue_with_recorder(2).await;
    queue.enqueue(&conv("a"), "a1".to_string()).await;
    queue.enqueue(&conv("b"), "b1".to_string()).await;
    queue.enqueue(&conv("a"), "a2".to_string()).await;

    {
        let flushes = flushes.lock().await;
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0], (conv("a"), vec!["a1".into(), "a2".into()]));
    }
    assert_eq!(queue.get_pending(&conv("b")).await, vec!["b1"]);
    assert!(queue.has_timer(&conv("b")).await);
}

#[tokio::test(start_paused = true)]
async fn clear_drops_messages_and_timer() {
    let (queue, flushes) = queue_with_recorder(10).await;
    queue.enqueue(&conv("conv1"), "draft".to_string()).await;
    queue.clear(&conv("conv1")).await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(flushes.lock().await.is_empty());
    assert!(queue.get_pending(&conv("conv1")).await.is_empty());
    assert!(!queue.has_timer(&conv("conv1")).await);
}

#[tokio::test(start_paused = true)]
async fn enqueue_during_flush_starts_fresh_buffer() {
    let queue = MessageQueue::new(config(10));
    let flushes: Flushes = Arc::default();
    queue
        .set_flush_handler(Arc::new(EnqueueDuringFlush {
            queue: queue.downgrade(),
            flushes: Arc::clone(&flushes),
        }))
        .await;

    queue.enqueue(&conv("conv1"), "m1".to_string()).await;
    let drained = queue.flush(&conv("conv1")).await;

    assert_eq!(drained, vec!["m1"]);
    assert_eq!(queue.get_pending(&conv("conv1")).await, vec!["late"]);
    assert!(queue.has_timer(&conv("conv1")).await);
}

#[tokio::test(start_paused = true)]
async fn failed_handler_still_drains_buffer() {
    let queue = MessageQueue::new(config(10));
    let handler = RecordingHandler {
        fail: true,
        ..RecordingHandler::default()
    };
    let flushes = Arc::clone(&handler.flushes);
    queue.set_flush_handler(Arc::new(handler)).await;

    queue.enqueue(&conv("conv1"), "m1".to_string()).await;
    let drained = queue.flush(&conv("conv1")).await;

    assert_eq!(drained, vec!["m1"]);
    assert_eq!(flushes.lock().await.len(), 1);
    assert!(queue.get_pending(&conv("conv1")).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn flush_without_handler_returns_payloads() {
    let queue: MessageQueue<String> = MessageQueue::new(config(10));
    queue.enqueue(&conv("conv1"), "m1".to_string()).await;
    assert_eq!(queue.flush(&conv("conv1")).await, vec!["m1"]);
    assert!(queue.flush(&conv("conv1")).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn requeue_front_keeps_undelivered_ahead_of_newer_messages() {
    let queue: MessageQueue<String> = MessageQueue::new(config(10));
    queue.enqueue(&conv("conv1"), "m3".to_string()).await;
    queue
        .requeue_front(&conv("conv1"), vec!["m1".into(), "m2".into()], false)
        .await;

    assert_eq!(
        queue.get_pending(&conv("conv1")).await,
        vec!["m1", "m2", "m3"]
    );
}

#[tokio::test(start_paused = true)]
async fn flush_all_visits_every_pending_channel() {
    let (queue, flushes) = queue_with_recorder(10).await;
    queue.enqueue(&conv("b"), "b1".to_string()).await;
    queue.enqueue(&conv("a"), "a1".to_string()).await;

    let flushed = queue.flush_all().await;

    assert_eq!(
        flushed,
        vec![
            (conv("a"), vec!["a1".to_string()]),
            (conv("b"), vec!["b1".to_string()])
        ]
    );
    assert_eq!(flushes.lock().await.len(), 2);
    assert!(queue.pending_channels().await.is_empty());
}
