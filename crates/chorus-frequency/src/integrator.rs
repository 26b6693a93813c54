use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_core::types::now_rfc3339;
use chorus_fabric::{MessageRouter, ServerEvent};
use chorus_storage::{ExpressionRecord, Storage};

use crate::dispatcher::{ChannelHandler, ExpressionDispatcher};
use crate::generator::ExpressionGenerator;
use crate::planner::ExpressionPlanner;
use crate::sense::FrequencySenseCore;
use crate::types::{
    Expression, ExternalItem, ItemPriority, SessionContext, CONTEXT_ITEMS_CAP,
};

/// Partial context update applied by the transport and dialogue layers.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub user_id: Option<String>,
    pub user_input: Option<String>,
    pub input_type: Option<String>,
    pub user_emotion: Option<String>,
    pub history_item: Option<String>,
    pub topic: Option<String>,
    pub has_open_questions: Option<bool>,
}

/// Owns the proactive-expression lifecycle: the per-session context
/// cache, the monitoring loop, and the wiring of the five pipeline
/// stages into the outbound fabric.
pub struct FrequencyIntegrator {
    storage: Arc<Storage>,
    sense: Arc<FrequencySenseCore>,
    planner: ExpressionPlanner,
    generator: ExpressionGenerator,
    dispatcher: Arc<ExpressionDispatcher>,
    contexts: DashMap<String, SessionContext>,
    monitoring_interval: Duration,
}

impl FrequencyIntegrator {
    /// Wire the pipeline together and register the `main` output channel,
    /// which bridges finished expressions back into the router as
    /// `proactive_expression` events and records them for analysis.
    pub fn new(
        storage: Arc<Storage>,
        sense: Arc<FrequencySenseCore>,
        planner: ExpressionPlanner,
        generator: ExpressionGenerator,
        dispatcher: Arc<ExpressionDispatcher>,
        router: Arc<MessageRouter>,
        monitoring_interval: Duration,
    ) -> Arc<Self> {
        dispatcher.register_channel(
            "main",
            main_channel_bridge(router, storage.clone()),
        );
        Arc::new(Self {
            storage,
            sense,
            planner,
            generator,
            dispatcher,
            contexts: DashMap::new(),
            monitoring_interval,
        })
    }

    /// Spawn the monitoring loop and the dispatch worker. Both stop
    /// cooperatively when the shutdown signal flips.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("frequency integrator starting");
        vec![
            tokio::spawn(self.dispatcher.clone().run_worker(shutdown.clone())),
            tokio::spawn(self.clone().run_monitor(shutdown)),
        ]
    }

    /// Merge a partial update into a session's context, creating it on
    /// first touch.
    pub fn update_context(&self, session_id: &str, update: ContextUpdate) {
        let mut ctx = self
            .contexts
            .entry(session_id.to_string())
            .or_insert_with(|| {
                SessionContext::new(
                    session_id,
                    update.user_id.clone().unwrap_or_else(|| "unknown".to_string()),
                )
            });

        if let Some(user_id) = update.user_id {
            ctx.user_id = user_id;
        }
        if let Some(input) = update.user_input {
            ctx.user_input = Some(input);
            ctx.last_user_activity = Instant::now();
            ctx.last_update = Instant::now();
        }
        if let Some(input_type) = update.input_type {
            ctx.input_type = Some(input_type);
        }
        if let Some(emotion) = update.user_emotion {
            ctx.user_emotion = emotion;
        }
        if let Some(item) = update.history_item {
            ctx.push_history(item);
        }
        if let Some(topic) = update.topic {
            ctx.push_topic(topic);
        }
        if let Some(open) = update.has_open_questions {
            ctx.has_open_questions = open;
        }
        debug!(session_id, "session context updated");
    }

    /// Record user activity on a session; bumps the interaction counter
    /// (best effort).
    pub async fn register_user_activity(&self, session_id: &str, user_id: &str, kind: &str) {
        self.update_context(
            session_id,
            ContextUpdate {
                user_id: Some(user_id.to_string()),
                ..ContextUpdate::default()
            },
        );
        if let Some(mut ctx) = self.contexts.get_mut(session_id) {
            ctx.last_user_activity = Instant::now();
            ctx.last_update = Instant::now();
        }
        if let Err(e) = self.storage.bump_interaction_count(user_id).await {
            warn!(user_id, error = %e, "interaction count bump failed");
        }
        debug!(session_id, user_id, kind, "user activity registered");
    }

    /// Feed an inbound user message into the context.
    pub async fn process_user_message(
        &self,
        session_id: &str,
        user_id: &str,
        message: &str,
        input_type: Option<&str>,
    ) {
        self.register_user_activity(session_id, user_id, "message").await;
        self.update_context(
            session_id,
            ContextUpdate {
                user_input: Some(message.to_string()),
                input_type: input_type.map(str::to_string),
                history_item: Some(format!("User: {message}")),
                ..ContextUpdate::default()
            },
        );
    }

    /// Feed the system's reply into the context; a question mark leaves
    /// an open question behind.
    pub fn process_system_response(&self, session_id: &str, response: &str) {
        let has_question = response.contains('?');
        self.update_context(
            session_id,
            ContextUpdate {
                history_item: Some(format!("AI: {response}")),
                has_open_questions: if has_question { Some(true) } else { None },
                ..ContextUpdate::default()
            },
        );
    }

    /// Attach an external notification to a session context.
    pub fn add_notification(&self, session_id: &str, content: &str, priority: ItemPriority) {
        let Some(mut ctx) = self.contexts.get_mut(session_id) else {
            warn!(session_id, "cannot add notification: unknown session");
            return;
        };
        if ctx.notifications.len() >= CONTEXT_ITEMS_CAP {
            ctx.notifications.remove(0);
        }
        ctx.notifications.push(ExternalItem {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            priority,
            timestamp: now_rfc3339(),
        });
    }

    /// Attach an external reminder to a session context.
    pub fn add_reminder(&self, session_id: &str, content: &str, priority: ItemPriority) {
        let Some(mut ctx) = self.contexts.get_mut(session_id) else {
            warn!(session_id, "cannot add reminder: unknown session");
            return;
        };
        if ctx.reminders.len() >= CONTEXT_ITEMS_CAP {
            ctx.reminders.remove(0);
        }
        ctx.reminders.push(ExternalItem {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            priority,
            timestamp: now_rfc3339(),
        });
    }

    /// Run the full sense → plan → generate → dispatch chain for one
    /// session. Returns whether an expression was emitted.
    pub async fn trigger_expression(&self, session_id: &str) -> bool {
        let Some(ctx) = self.contexts.get(session_id).map(|c| c.clone()) else {
            warn!(session_id, "cannot trigger expression: unknown session");
            return false;
        };

        let Some(expression) = self.sense.decide_expression(&ctx).await else {
            debug!(session_id, "sense core declined to express");
            return false;
        };

        let planned = self.planner.plan(expression, &ctx.user_id).await;
        let generated = self.generator.generate(planned).await;
        self.dispatcher
            .queue_expression(generated, Some("main".to_string()));

        info!(session_id, "proactive expression queued");
        true
    }

    /// Monitoring loop: each tick, every session that has been quiet for
    /// at least one interval gets an expression attempt.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("frequency monitor started");
        let mut interval = tokio::time::interval(self.monitoring_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due: Vec<String> = self
                        .contexts
                        .iter()
                        .filter(|entry| entry.value().last_update.elapsed() >= self.monitoring_interval)
                        .map(|entry| entry.key().clone())
                        .collect();
                    for session_id in due {
                        self.trigger_expression(&session_id).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("frequency monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.contexts.len()
    }
}

/// The `main` channel: deliver the expression to its user as a
/// `proactive_expression` event (live or spooled) and persist the record
/// for later analysis.
fn main_channel_bridge(router: Arc<MessageRouter>, storage: Arc<Storage>) -> ChannelHandler {
    Arc::new(move |expression: Expression| {
        let router = router.clone();
        let storage = storage.clone();
        Box::pin(async move {
            let Some(user_id) = expression.user_id.clone() else {
                warn!("expression without a user, dropping");
                return false;
            };
            let Some(content) = expression.final_content.clone() else {
                warn!("expression without final content, dropping");
                return false;
            };
            let stage = expression
                .relationship_stage
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "stranger".to_string());

            let event = ServerEvent::ProactiveExpression {
                session_id: expression.session_id.clone(),
                user_id: user_id.clone(),
                expression_type: expression.expression_type.as_str().to_string(),
                content: content.clone(),
                priority: expression.priority_score,
                relationship_stage: stage.clone(),
                timestamp: now_rfc3339(),
            };
            router.deliver_to_user(&user_id, event);

            let record = ExpressionRecord {
                id: expression.id.clone(),
                user_id,
                session_id: expression.session_id.clone(),
                expression_type: expression.expression_type.as_str().to_string(),
                content,
                priority_score: expression.priority_score,
                relationship_stage: stage,
                timestamp: expression.timestamp.clone(),
            };
            if let Err(e) = storage.record_expression(record).await {
                warn!(error = %e, "failed to persist expression record");
            }
            true
        })
    })
}
