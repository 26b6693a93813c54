use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use chorus_cache::ChatCaches;
use chorus_chat::ChatManager;
use chorus_core::ChorusConfig;
use chorus_dialogue::{ChatCompletionsClient, DialogueManager, LlmProvider};
use chorus_fabric::optimizer::OptimizerConfig;
use chorus_fabric::{MessageRouter, NotificationService, PresenceService, WsOptimizer};
use chorus_frequency::{
    ContextSampler, ExpressionDispatcher, ExpressionGenerator, ExpressionPlanner,
    FrequencyIntegrator, FrequencySenseCore, GeneratorConfig, SenseConfig,
};
use chorus_storage::Storage;

/// Central shared state — passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: ChorusConfig,
    pub storage: Arc<Storage>,
    pub caches: Arc<ChatCaches>,
    pub router: Arc<MessageRouter>,
    pub optimizer: Arc<WsOptimizer>,
    pub notifications: Arc<NotificationService>,
    pub presence: Arc<PresenceService>,
    pub chat: ChatManager,
    pub dialogue: Arc<DialogueManager>,
    pub integrator: Arc<FrequencyIntegrator>,
    /// In-flight dialogue requests per session; `/dialogue/{id}/stop`
    /// cancels them cooperatively.
    pub active_operations: DashMap<String, CancellationToken>,
}

impl AppState {
    /// Construct the whole subsystem graph from config.
    pub fn new(config: ChorusConfig) -> Self {
        let storage = Storage::open(&config.database.path);
        let caches = ChatCaches::new(
            Duration::from_secs(config.cache.ttl_seconds),
            Duration::from_secs(config.cache.sweep_interval_seconds),
        );

        let router = Arc::new(MessageRouter::new(
            config.offline.max_notifications_per_user,
        ));
        let optimizer = WsOptimizer::new(
            router.clone(),
            OptimizerConfig {
                batch_interval: Duration::from_millis(config.optimizer.batch_interval_ms),
                max_batch_size: config.optimizer.max_batch_size,
                content_truncate_chars: config.optimizer.content_truncate_chars,
            },
        );
        let notifications = NotificationService::new(
            router.clone(),
            config.offline.max_notifications_per_user,
        );
        let presence = PresenceService::new(
            router.clone(),
            Duration::from_secs(config.presence.heartbeat_timeout_secs),
            Duration::from_secs(config.presence.monitor_interval_secs),
        );

        let provider: Arc<dyn LlmProvider> = Arc::new(ChatCompletionsClient::new(
            config.provider.api_key.clone(),
            config.provider.base_url.clone(),
            Duration::from_secs(config.provider.request_timeout_secs),
        ));

        let chat = ChatManager::new(
            storage.clone(),
            caches.clone(),
            router.clone(),
            optimizer.clone(),
            notifications.clone(),
        );

        let dialogue = Arc::new(DialogueManager::new(
            storage.clone(),
            provider.clone(),
            config.provider.model.clone(),
            config.provider.temperature,
            config.provider.max_tokens,
            config.provider.retry_attempts,
        ));

        let sampler = Arc::new(ContextSampler::new(config.frequency.signal_weights.clone()));
        let sense = Arc::new(FrequencySenseCore::new(
            sampler,
            provider.clone(),
            SenseConfig {
                expression_threshold: config.frequency.expression_threshold,
                cooldown: Duration::from_secs(config.frequency.cooldown_secs),
                type_weights: config.frequency.type_weights.clone(),
                model: config.provider.model.clone(),
                temperature: config.provider.temperature,
                max_tokens: 100,
                retry_attempts: config.provider.retry_attempts,
            },
        ));
        let integrator = FrequencyIntegrator::new(
            storage.clone(),
            sense,
            ExpressionPlanner::new(storage.clone()),
            ExpressionGenerator::new(
                provider,
                GeneratorConfig::new(
                    config.provider.model.clone(),
                    config.provider.retry_attempts,
                ),
            ),
            ExpressionDispatcher::new(),
            router.clone(),
            Duration::from_secs(config.frequency.monitoring_interval_secs),
        );
        dialogue.attach_frequency_awareness();

        Self {
            config,
            storage,
            caches,
            router,
            optimizer,
            notifications,
            presence,
            chat,
            dialogue,
            integrator,
            active_operations: DashMap::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat/private", post(crate::http::chat::create_private))
        .route("/chat/group", post(crate::http::chat::create_group))
        .route("/chat/sessions", get(crate::http::chat::list_sessions))
        .route(
            "/chat/{session_id}/messages",
            post(crate::http::chat::send_message).get(crate::http::chat::list_messages),
        )
        .route(
            "/chat/{session_id}/typing",
            post(crate::http::chat::typing),
        )
        .route(
            "/messages/{message_id}/read",
            post(crate::http::chat::mark_read),
        )
        .route(
            "/dialogue/sessions",
            post(crate::http::dialogue::create_session),
        )
        .route("/dialogue/input", post(crate::http::dialogue::process_input))
        .route(
            "/dialogue/{session_id}/stop",
            post(crate::http::dialogue::stop),
        )
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
