use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use chorus_core::types::now_rfc3339;

use crate::types::{Expression, ExpressionType};

/// Ring buffer size for dispatch records.
const DISPATCH_HISTORY_CAP: usize = 50;

/// Async delivery hook: takes the finished expression, reports success.
pub type ChannelHandler =
    Arc<dyn Fn(Expression) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// One delivery attempt, kept for observability.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub timestamp: String,
    pub expression_type: ExpressionType,
    pub channel: String,
    pub success: bool,
    pub expression_id: String,
}

/// Routes finished expressions to named output channels.
///
/// Producers enqueue without blocking; a worker task drains the queue.
/// Direct `dispatch` is also available when the caller wants the result.
pub struct ExpressionDispatcher {
    channels: DashMap<String, ChannelHandler>,
    queue_tx: mpsc::UnboundedSender<(Expression, Option<String>)>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<(Expression, Option<String>)>>>,
    history: Mutex<VecDeque<DispatchRecord>>,
}

impl ExpressionDispatcher {
    pub fn new() -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            channels: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn register_channel(&self, name: &str, handler: ChannelHandler) {
        info!(channel = name, "output channel registered");
        self.channels.insert(name.to_string(), handler);
    }

    pub fn unregister_channel(&self, name: &str) {
        if self.channels.remove(name).is_some() {
            info!(channel = name, "output channel unregistered");
        }
    }

    /// Deliver one expression now. Resolves the channel (explicit wins,
    /// else the priority/type policy), invokes the handler, records the
    /// outcome.
    pub async fn dispatch(&self, expression: Expression, channel: Option<&str>) -> bool {
        let target = channel
            .map(str::to_string)
            .unwrap_or_else(|| select_channel(&expression));

        let Some(handler) = self.channels.get(&target).map(|h| h.clone()) else {
            error!(channel = %target, "no such output channel");
            return false;
        };

        let record_type = expression.expression_type;
        let record_id = expression.id.clone();
        let success = handler(expression).await;

        let mut history = self.history.lock().unwrap();
        if history.len() >= DISPATCH_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(DispatchRecord {
            timestamp: now_rfc3339(),
            expression_type: record_type,
            channel: target.clone(),
            success,
            expression_id: record_id,
        });
        drop(history);

        if success {
            debug!(channel = %target, "expression dispatched");
        } else {
            warn!(channel = %target, "expression dispatch failed");
        }
        success
    }

    /// Enqueue for the worker; never blocks the producer.
    pub fn queue_expression(&self, expression: Expression, channel: Option<String>) {
        if self.queue_tx.send((expression, channel)).is_err() {
            warn!("dispatch queue closed, expression dropped");
        }
    }

    pub fn dispatch_history(&self, limit: usize) -> Vec<DispatchRecord> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Worker loop draining the queue until shutdown flips. The receiver
    /// can only be taken once; a second worker is a no-op.
    pub async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.queue_rx.lock().unwrap().take() else {
            warn!("dispatch worker already running");
            return;
        };
        info!("dispatch worker started");
        loop {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some((expression, channel)) => {
                            self.dispatch(expression, channel.as_deref()).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Channel policy: high priority rides the main channel, reminders go to
/// notifications, low-stakes types to the secondary channel.
fn select_channel(expression: &Expression) -> String {
    if expression.priority_score > 0.8 {
        return "main".to_string();
    }
    match expression.expression_type {
        ExpressionType::Reminder => "notification".to_string(),
        ExpressionType::Greeting | ExpressionType::Observation => "secondary".to_string(),
        _ => "main".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextReference, Timing, TimingKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expression(ty: ExpressionType, priority: f64) -> Expression {
        Expression {
            id: format!("e-{ty}-{priority}"),
            expression_type: ty,
            content: "body".to_string(),
            context_reference: ContextReference {
                idle_secs: 0.0,
                time_period: "evening".to_string(),
                conversation_active: false,
            },
            timing: Timing {
                kind: TimingKind::Immediate,
                delay_secs: 0,
            },
            priority_score: priority,
            timestamp: now_rfc3339(),
            session_id: Some("s1".to_string()),
            user_id: Some("alice".to_string()),
            relationship_stage: None,
            user_info: None,
            final_content: Some("body".to_string()),
            style: None,
            is_fallback: false,
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> ChannelHandler {
        Arc::new(move |_expr| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
        })
    }

    #[test]
    fn channel_selection_policy() {
        assert_eq!(select_channel(&expression(ExpressionType::Question, 0.9)), "main");
        assert_eq!(
            select_channel(&expression(ExpressionType::Reminder, 0.5)),
            "notification"
        );
        assert_eq!(
            select_channel(&expression(ExpressionType::Greeting, 0.5)),
            "secondary"
        );
        assert_eq!(
            select_channel(&expression(ExpressionType::Observation, 0.5)),
            "secondary"
        );
        assert_eq!(
            select_channel(&expression(ExpressionType::Suggestion, 0.5)),
            "main"
        );
    }

    #[tokio::test]
    async fn dispatch_invokes_handler_and_records_history() {
        let dispatcher = ExpressionDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register_channel("main", counting_handler(counter.clone()));

        let ok = dispatcher
            .dispatch(expression(ExpressionType::Question, 0.9), None)
            .await;
        assert!(ok);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let history = dispatcher.dispatch_history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].channel, "main");
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn missing_channel_fails_without_history_entry() {
        let dispatcher = ExpressionDispatcher::new();
        let ok = dispatcher
            .dispatch(expression(ExpressionType::Question, 0.9), Some("nowhere"))
            .await;
        assert!(!ok);
        assert!(dispatcher.dispatch_history(10).is_empty());
    }

    #[tokio::test]
    async fn worker_drains_the_queue() {
        let dispatcher = ExpressionDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register_channel("main", counting_handler(counter.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(dispatcher.clone().run_worker(shutdown_rx));

        for _ in 0..3 {
            dispatcher.queue_expression(expression(ExpressionType::Question, 0.9), None);
        }

        // wait for the worker to drain
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should process all queued expressions");

        let _ = shutdown_tx.send(true);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let dispatcher = ExpressionDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register_channel("main", counting_handler(counter));
        for _ in 0..60 {
            dispatcher
                .dispatch(expression(ExpressionType::Question, 0.9), None)
                .await;
        }
        assert_eq!(dispatcher.dispatch_history(100).len(), 50);
    }
}
