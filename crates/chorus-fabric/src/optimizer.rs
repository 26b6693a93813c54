use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use chorus_core::types::now_rfc3339;

use crate::error::{FabricError, Result};
use crate::events::ServerEvent;
use crate::router::MessageRouter;

/// Fields never worth sending to a client.
const STRIPPED_FIELDS: [&str; 3] = ["debug_info", "internal_metadata", "raw_data"];

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub batch_interval: Duration,
    pub max_batch_size: usize,
    pub content_truncate_chars: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(100),
            max_batch_size: 20,
            content_truncate_chars: 1000,
        }
    }
}

struct UserQueue {
    items: Vec<ServerEvent>,
    oldest_enqueued: Option<Instant>,
}

impl UserQueue {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            oldest_enqueued: None,
        }
    }
}

/// Per-recipient outbound micro-batching.
///
/// Events accumulate per user until the queue reaches `max_batch_size`
/// (flushed inline by the enqueuer) or the oldest entry ages past
/// `batch_interval` (flushed by the background flusher). Typing, presence
/// and error events skip the queue entirely.
pub struct WsOptimizer {
    router: Arc<MessageRouter>,
    queues: DashMap<String, UserQueue>,
    config: OptimizerConfig,
}

impl WsOptimizer {
    pub fn new(router: Arc<MessageRouter>, config: OptimizerConfig) -> Arc<Self> {
        Arc::new(Self {
            router,
            queues: DashMap::new(),
            config,
        })
    }

    pub fn register_user(&self, user_id: &str) {
        self.queues.insert(user_id.to_string(), UserQueue::empty());
        debug!(user_id, "user registered with optimizer");
    }

    /// Unregister and drop any queued messages for the user.
    pub fn unregister_user(&self, user_id: &str) {
        self.queues.remove(user_id);
        debug!(user_id, "user unregistered from optimizer");
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.queues.contains_key(user_id)
    }

    pub fn queued_len(&self, user_id: &str) -> usize {
        self.queues.get(user_id).map(|q| q.items.len()).unwrap_or(0)
    }

    /// Queue an event for a registered user. Bypass kinds are delivered
    /// immediately; a queue that reaches the size cap flushes inline.
    pub fn queue_event(&self, user_id: &str, event: ServerEvent) -> Result<()> {
        if !self.is_active(user_id) {
            return Err(FabricError::UnknownUser(user_id.to_string()));
        }

        if event.bypasses_batching() {
            self.router.deliver_to_user(user_id, event);
            return Ok(());
        }

        let should_flush = {
            let mut queue = self
                .queues
                .get_mut(user_id)
                .ok_or_else(|| FabricError::UnknownUser(user_id.to_string()))?;
            if queue.items.is_empty() {
                queue.oldest_enqueued = Some(Instant::now());
            }
            queue.items.push(event);
            queue.items.len() >= self.config.max_batch_size
        };

        if should_flush {
            self.flush_user(user_id);
        }
        Ok(())
    }

    /// Flush a user's queue now. Flushing an empty queue is a no-op.
    pub fn flush_user(&self, user_id: &str) {
        let drained: Vec<ServerEvent> = {
            let Some(mut queue) = self.queues.get_mut(user_id) else {
                return;
            };
            queue.oldest_enqueued = None;
            std::mem::take(&mut queue.items)
        };
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        let messages: Vec<Value> = drained
            .iter()
            .map(|e| slim_payload(e.to_value(), self.config.content_truncate_chars))
            .collect();
        let batch = ServerEvent::Batch {
            messages,
            count,
            timestamp: now_rfc3339(),
        };
        self.router.deliver_to_user(user_id, batch);
        debug!(user_id, count, "flushed outbound batch");
    }

    /// Background flusher: ticks at the batch interval and flushes any
    /// queue whose oldest entry has waited long enough.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("outbound flusher started");
        let mut interval = tokio::time::interval(self.config.batch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due: Vec<String> = self
                        .queues
                        .iter()
                        .filter(|entry| {
                            entry
                                .value()
                                .oldest_enqueued
                                .map(|at| at.elapsed() >= self.config.batch_interval)
                                .unwrap_or(false)
                        })
                        .map(|entry| entry.key().clone())
                        .collect();
                    for user_id in due {
                        self.flush_user(&user_id);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbound flusher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Slim a single payload: drop fields clients never need and truncate long
/// content with an explicit marker.
fn slim_payload(mut value: Value, truncate_at: usize) -> Value {
    if let Value::Object(ref mut obj) = value {
        for field in STRIPPED_FIELDS {
            obj.remove(field);
        }
        let truncated = match obj.get("content") {
            Some(Value::String(content)) if content.chars().count() > truncate_at => {
                Some(content.chars().take(truncate_at).collect::<String>() + "...")
            }
            _ => None,
        };
        if let Some(short) = truncated {
            obj.insert("content".to_string(), Value::String(short));
            obj.insert("content_truncated".to_string(), Value::Bool(true));
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn setup(max_batch: usize) -> (Arc<WsOptimizer>, mpsc::Receiver<ServerEvent>) {
        let router = Arc::new(MessageRouter::new(100));
        let (tx, rx) = mpsc::channel(64);
        router.register_connection("u", tx);
        let optimizer = WsOptimizer::new(
            router,
            OptimizerConfig {
                batch_interval: Duration::from_millis(100),
                max_batch_size: max_batch,
                content_truncate_chars: 1000,
            },
        );
        optimizer.register_user("u");
        (optimizer, rx)
    }

    fn chat_event(n: usize, content: &str) -> ServerEvent {
        ServerEvent::NewMessage {
            message_id: format!("m{n}"),
            session_id: "s1".into(),
            sender_id: "alice".into(),
            content: content.to_string(),
            content_type: "text".into(),
            timestamp: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn batch_fills_then_flushes_in_order() {
        let (optimizer, mut rx) = setup(20);

        for n in 0..19 {
            optimizer.queue_event("u", chat_event(n, "hello")).unwrap();
        }
        // under the size cap and within the interval: nothing delivered yet
        assert!(rx.try_recv().is_err());
        assert_eq!(optimizer.queued_len("u"), 19);

        optimizer.queue_event("u", chat_event(19, "hello")).unwrap();
        match rx.try_recv() {
            Ok(ServerEvent::Batch { messages, count, .. }) => {
                assert_eq!(count, 20);
                assert_eq!(messages.len(), 20);
                assert_eq!(messages[0]["message_id"], "m0");
                assert_eq!(messages[19]["message_id"], "m19");
            }
            other => panic!("expected batch, got {other:?}"),
        }
        assert_eq!(optimizer.queued_len("u"), 0);
    }

    #[tokio::test]
    async fn bypass_kinds_skip_the_queue() {
        let (optimizer, mut rx) = setup(20);
        optimizer
            .queue_event("u", ServerEvent::typing("s1", "alice"))
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Typing { .. })));
        assert_eq!(optimizer.queued_len("u"), 0);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let (optimizer, _rx) = setup(20);
        assert!(matches!(
            optimizer.queue_event("ghost", chat_event(0, "hi")),
            Err(FabricError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn flush_of_empty_queue_is_a_noop() {
        let (optimizer, mut rx) = setup(20);
        optimizer.flush_user("u");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn long_content_is_truncated_with_marker() {
        let (optimizer, mut rx) = setup(1);
        let long = "x".repeat(1500);
        optimizer.queue_event("u", chat_event(0, &long)).unwrap();
        match rx.try_recv() {
            Ok(ServerEvent::Batch { messages, .. }) => {
                let content = messages[0]["content"].as_str().unwrap();
                assert_eq!(content.chars().count(), 1003); // 1000 + "..."
                assert_eq!(messages[0]["content_truncated"], true);
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn age_trigger_flushes_via_background_task() {
        let router = Arc::new(MessageRouter::new(100));
        let (tx, mut rx) = mpsc::channel(64);
        router.register_connection("u", tx);
        let optimizer = WsOptimizer::new(
            router,
            OptimizerConfig {
                batch_interval: Duration::from_millis(20),
                max_batch_size: 100,
                content_truncate_chars: 1000,
            },
        );
        optimizer.register_user("u");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = tokio::spawn(optimizer.clone().run_flusher(shutdown_rx));

        optimizer.queue_event("u", chat_event(0, "hi")).unwrap();
        let flushed = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("flusher should fire");
        assert!(matches!(flushed, Some(ServerEvent::Batch { count: 1, .. })));

        let _ = shutdown_tx.send(true);
        let _ = flusher.await;
    }

    #[test]
    fn slim_payload_strips_debug_fields() {
        let value = serde_json::json!({
            "type": "new_message",
            "content": "hi",
            "debug_info": {"trace": "x"},
            "internal_metadata": 1,
            "raw_data": [1, 2],
        });
        let slimmed = slim_payload(value, 1000);
        assert!(slimmed.get("debug_info").is_none());
        assert!(slimmed.get("internal_metadata").is_none());
        assert!(slimmed.get("raw_data").is_none());
        assert_eq!(slimmed["content"], "hi");
        assert!(slimmed.get("content_truncated").is_none());
    }
}
