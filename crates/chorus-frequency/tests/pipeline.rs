// Full proactive pipeline: context in, sense → plan → generate →
// dispatch, proactive_expression event out, record persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use chorus_dialogue::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use chorus_fabric::{MessageRouter, ServerEvent};
use chorus_frequency::{
    ContextSampler, ExpressionDispatcher, ExpressionGenerator, ExpressionPlanner,
    FrequencyIntegrator, FrequencySenseCore, GeneratorConfig, SenseConfig,
};
use chorus_storage::Storage;

struct StaticProvider(&'static str);

#[async_trait]
impl LlmProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            content: self.0.to_string(),
            model: req.model.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        })
    }
}

/// Deterministic scoring: only the user-activity signal counts, and a
/// question from a happy user scores 0.42.
fn test_sense(provider: Arc<dyn LlmProvider>) -> Arc<FrequencySenseCore> {
    let sampler = Arc::new(ContextSampler::new(HashMap::from([(
        "user_activity".to_string(),
        10.0,
    )])));
    Arc::new(
        FrequencySenseCore::new(
            sampler,
            provider,
            SenseConfig {
                expression_threshold: 0.35,
                cooldown: Duration::from_secs(300),
                type_weights: HashMap::from([
                    ("greeting".to_string(), 0.2),
                    ("question".to_string(), 0.3),
                    ("suggestion".to_string(), 0.25),
                    ("reminder".to_string(), 0.15),
                    ("observation".to_string(), 0.1),
                ]),
                model: "test".to_string(),
                temperature: 0.7,
                max_tokens: 100,
                retry_attempts: 0,
            },
        )
        .with_rng_seed(11),
    )
}

#[tokio::test]
async fn monitored_session_emits_a_proactive_expression() {
    let storage = Storage::in_memory();
    let router = Arc::new(MessageRouter::new(100));
    let provider: Arc<dyn LlmProvider> = Arc::new(StaticProvider("shall we keep going?"));

    // alice has a history: 25 interactions → familiar
    for _ in 0..25 {
        storage.bump_interaction_count("alice").await.unwrap();
    }

    let integrator = FrequencyIntegrator::new(
        storage.clone(),
        test_sense(provider.clone()),
        ExpressionPlanner::new(storage.clone()).with_rng_seed(2),
        ExpressionGenerator::new(provider, GeneratorConfig::new("test".to_string(), 0)),
        ExpressionDispatcher::new(),
        router.clone(),
        Duration::from_secs(60),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = integrator.start(shutdown_rx);

    let (tx, mut rx) = mpsc::channel(16);
    router.register_connection("alice", tx);

    // a question keeps the activity signal hot enough to cross the
    // configured threshold
    integrator
        .process_user_message("sess-1", "alice", "what do you think about this?", Some("question"))
        .await;
    integrator.update_context(
        "sess-1",
        chorus_frequency::ContextUpdate {
            user_emotion: Some("happy".to_string()),
            ..Default::default()
        },
    );

    let fired = integrator.trigger_expression("sess-1").await;
    assert!(fired, "hot context must fire an expression");

    // the main channel bridges into the router
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("expression should be delivered")
        .expect("channel open");
    match event {
        ServerEvent::ProactiveExpression {
            session_id,
            user_id,
            relationship_stage,
            content,
            ..
        } => {
            assert_eq!(session_id.as_deref(), Some("sess-1"));
            assert_eq!(user_id, "alice");
            assert_eq!(relationship_stage, "familiar");
            assert!(!content.is_empty());
        }
        other => panic!("expected proactive_expression, got {other:?}"),
    }

    // and the record is persisted for analysis
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let records = storage.list_expressions("alice", 10).await.unwrap();
            if !records.is_empty() {
                assert_eq!(records[0].relationship_stage, "familiar");
                assert_eq!(records[0].session_id.as_deref(), Some("sess-1"));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expression record should be persisted");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
}

#[tokio::test]
async fn cooldown_spans_trigger_calls() {
    let storage = Storage::in_memory();
    let router = Arc::new(MessageRouter::new(100));
    let provider: Arc<dyn LlmProvider> = Arc::new(StaticProvider("hello"));

    let integrator = FrequencyIntegrator::new(
        storage.clone(),
        test_sense(provider.clone()),
        ExpressionPlanner::new(storage.clone()).with_rng_seed(2),
        ExpressionGenerator::new(provider, GeneratorConfig::new("test".to_string(), 0)),
        ExpressionDispatcher::new(),
        router,
        Duration::from_secs(60),
    );

    integrator
        .process_user_message("sess-1", "alice", "are you there?", Some("question"))
        .await;
    integrator.update_context(
        "sess-1",
        chorus_frequency::ContextUpdate {
            user_emotion: Some("happy".to_string()),
            ..Default::default()
        },
    );

    assert!(integrator.trigger_expression("sess-1").await);
    // second trigger inside the 300 s cooldown stays quiet
    assert!(!integrator.trigger_expression("sess-1").await);
}

#[tokio::test]
async fn unknown_session_never_fires() {
    let storage = Storage::in_memory();
    let router = Arc::new(MessageRouter::new(100));
    let provider: Arc<dyn LlmProvider> = Arc::new(StaticProvider("hello"));
    let integrator = FrequencyIntegrator::new(
        storage.clone(),
        test_sense(provider.clone()),
        ExpressionPlanner::new(storage.clone()),
        ExpressionGenerator::new(provider, GeneratorConfig::new("test".to_string(), 0)),
        ExpressionDispatcher::new(),
        router,
        Duration::from_secs(60),
    );
    assert!(!integrator.trigger_expression("nope").await);
}

#[tokio::test]
async fn open_question_in_reply_is_tracked() {
    let storage = Storage::in_memory();
    let router = Arc::new(MessageRouter::new(100));
    let provider: Arc<dyn LlmProvider> = Arc::new(StaticProvider("hello"));
    let integrator = FrequencyIntegrator::new(
        storage.clone(),
        test_sense(provider.clone()),
        ExpressionPlanner::new(storage.clone()),
        ExpressionGenerator::new(provider, GeneratorConfig::new("test".to_string(), 0)),
        ExpressionDispatcher::new(),
        router,
        Duration::from_secs(60),
    );

    integrator
        .process_user_message("sess-1", "alice", "tell me something", None)
        .await;
    integrator.process_system_response("sess-1", "sure — what would you like to hear about?");
    assert_eq!(integrator.session_count(), 1);
}
