use std::sync::Arc;

use tracing::{debug, info, warn};

use chorus_core::types::RelationshipStage;
use chorus_dialogue::{chat_with_retry, ChatMessage, ChatRequest, LlmProvider};

use crate::types::{Expression, ExpressionType, Style};

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub retry_attempts: u32,
    /// Hard cap on the final rendered text.
    pub max_content_chars: usize,
}

impl GeneratorConfig {
    pub fn new(model: String, retry_attempts: u32) -> Self {
        Self {
            model,
            temperature: 0.7,
            max_tokens: 150,
            retry_attempts,
            max_content_chars: 200,
        }
    }
}

/// Renders the final proactive text: picks a style from the
/// (type, stage) table, prompts the LLM, and post-processes the output.
/// Falls back to a fixed (type, stage) line when the LLM fails.
pub struct ExpressionGenerator {
    provider: Arc<dyn LlmProvider>,
    config: GeneratorConfig,
}

impl ExpressionGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: GeneratorConfig) -> Self {
        Self { provider, config }
    }

    pub async fn generate(&self, mut expression: Expression) -> Expression {
        let stage = expression
            .relationship_stage
            .unwrap_or(RelationshipStage::Stranger);
        let style = style_for(expression.expression_type, stage);
        expression.style = Some(style);

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: self.generation_prompt(&expression, style),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        match chat_with_retry(self.provider.as_ref(), &request, self.config.retry_attempts).await {
            Ok(resp) => {
                let final_content = post_process(&resp.content, self.config.max_content_chars);
                debug!(
                    expression_type = %expression.expression_type,
                    style = style.as_str(),
                    "expression rendered"
                );
                expression.final_content = Some(final_content);
            }
            Err(e) => {
                warn!(error = %e, "generation failed, using fallback content");
                expression.final_content =
                    Some(fallback_content(expression.expression_type, stage).to_string());
                expression.is_fallback = true;
            }
        }

        info!(
            expression_type = %expression.expression_type,
            style = style.as_str(),
            fallback = expression.is_fallback,
            "expression generated"
        );
        expression
    }

    fn generation_prompt(&self, expression: &Expression, style: Style) -> Vec<ChatMessage> {
        let name = expression
            .user_info
            .as_ref()
            .map(|u| u.name.as_str())
            .unwrap_or("the user");
        let interaction_count = expression
            .user_info
            .as_ref()
            .map(|u| u.interaction_count)
            .unwrap_or(0);
        let ctx = &expression.context_reference;

        let system = format!(
            "You are an assistant reaching out to the user on your own initiative. \
             Render the final message.\n\n\
             Expression type: {}\n\
             Voice: {} — {}\n\n\
             User:\n\
             - Name: {name}\n\
             - Interactions so far: {interaction_count}\n\n\
             Context:\n\
             - Seconds since the user was last active: {:.0}\n\
             - Time of day: {}\n\
             - Conversation currently active: {}\n\n\
             Base content: {}\n\n\
             Rules:\n\
             1. Sound like a real person, matching the given voice\n\
             2. Stay concise — one or two sentences\n\
             3. Never explain that you are an AI or what you are doing\n\
             4. No exaggerated tone\n\
             5. Leave a natural opening for the user to respond",
            expression.expression_type,
            style.as_str(),
            style.guide(),
            ctx.idle_secs,
            ctx.time_period,
            ctx.conversation_active,
            expression.content,
        );

        vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Write the final {} for {name} in a {} voice, based on the base content.",
                expression.expression_type,
                style.as_str()
            )),
        ]
    }
}

/// Voice per (type, stage): distant stages get the formal voices, close
/// stages drift casual.
pub fn style_for(expression_type: ExpressionType, stage: RelationshipStage) -> Style {
    use ExpressionType::*;
    use RelationshipStage::*;
    match (expression_type, stage) {
        (Greeting, Stranger | Acquaintance) => Style::Professional,
        (Greeting, Familiar | Friend) => Style::Friendly,
        (Greeting, CloseFriend) => Style::Casual,

        (Question, Stranger) => Style::Professional,
        (Question, Acquaintance) => Style::Informative,
        (Question, Familiar) => Style::Friendly,
        (Question, Friend | CloseFriend) => Style::Casual,

        (Suggestion, Stranger | Acquaintance) => Style::Informative,
        (Suggestion, Familiar) => Style::Friendly,
        (Suggestion, Friend) => Style::Empathetic,
        (Suggestion, CloseFriend) => Style::Casual,

        (Reminder, Stranger) => Style::Professional,
        (Reminder, Acquaintance) => Style::Informative,
        (Reminder, Familiar | Friend) => Style::Friendly,
        (Reminder, CloseFriend) => Style::Casual,

        (Observation, Stranger) => Style::Professional,
        (Observation, Acquaintance) => Style::Informative,
        (Observation, Familiar) => Style::Empathetic,
        (Observation, Friend) => Style::Friendly,
        (Observation, CloseFriend) => Style::Casual,
    }
}

/// Trim wrapping quotes, collapse blank lines, cap length, ensure the
/// text ends with real punctuation.
pub fn post_process(raw: &str, max_chars: usize) -> String {
    let mut processed = raw.trim().trim_matches(['"', '\'']).to_string();
    while processed.contains("\n\n") {
        processed = processed.replace("\n\n", "\n");
    }
    let mut processed = processed.trim().to_string();

    if processed.chars().count() > max_chars {
        processed = processed.chars().take(max_chars).collect::<String>() + "...";
    }

    if let Some(last) = processed.chars().last() {
        if !matches!(last, '.' | '?' | '!') {
            processed.push('.');
        }
    }
    processed
}

/// Final-resort lines per (type, stage).
pub fn fallback_content(expression_type: ExpressionType, stage: RelationshipStage) -> &'static str {
    use ExpressionType::*;
    use RelationshipStage::*;
    match (expression_type, stage) {
        (Greeting, Stranger) => "Hello, is there anything I can help you with?",
        (Greeting, Acquaintance) => "Hello again — anything I can help with today?",
        (Greeting, Familiar) => "Hello, how has your day been?",
        (Greeting, Friend) => "Hey, how have you been?",
        (Greeting, CloseFriend) => "Hey, I was just thinking about you!",

        (Question, Stranger) => "What topics are you interested in?",
        (Question, Acquaintance) => "Do you have any hobbies you enjoy?",
        (Question, Familiar) => "Seen anything interesting lately?",
        (Question, Friend) => "By the way, anything new on your end?",
        (Question, CloseFriend) => "Honestly, what's been on your mind lately?",

        (Suggestion, Stranger) => "Perhaps you could try something new.",
        (Suggestion, Acquaintance) => "You might find this worth a look.",
        (Suggestion, Familiar) => "I think you might enjoy this.",
        (Suggestion, Friend) => "Hey, you should give this a try.",
        (Suggestion, CloseFriend) => "I bet you'd love this.",

        (Reminder, Stranger) => "Please note the time.",
        (Reminder, Acquaintance) => "A quick reminder for you.",
        (Reminder, Familiar) => "Don't forget, will you?",
        (Reminder, Friend) => "Remember what we talked about.",
        (Reminder, CloseFriend) => "Hey, quick reminder!",

        (Observation, Stranger) => "I noticed something worth mentioning.",
        (Observation, Acquaintance) => "It seems things have been moving along.",
        (Observation, Familiar) => "It looks like an interesting day.",
        (Observation, Friend) => "I just realized something interesting.",
        (Observation, CloseFriend) => "You know what I just realized?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chorus_core::types::now_rfc3339;
    use chorus_dialogue::{ChatResponse, ProviderError};
    use crate::types::{ContextReference, Timing, TimingKind, UserSummary};

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

    struct DeadProvider;

    #[async_trait]
    impl LlmProvider for DeadProvider {
        fn name(&self) -> &str {
            "dead"
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::Unavailable("down".to_string()))
        }
    }

    fn planned_expression(stage: RelationshipStage) -> Expression {
        Expression {
            id: "e1".to_string(),
            expression_type: ExpressionType::Greeting,
            content: "hey there".to_string(),
            context_reference: ContextReference {
                idle_secs: 60.0,
                time_period: "evening".to_string(),
                conversation_active: false,
            },
            timing: Timing {
                kind: TimingKind::Scheduled,
                delay_secs: 5,
            },
            priority_score: 0.8,
            timestamp: now_rfc3339(),
            session_id: Some("s1".to_string()),
            user_id: Some("alice".to_string()),
            relationship_stage: Some(stage),
            user_info: Some(UserSummary {
                name: "alice".to_string(),
                interaction_count: 30,
            }),
            final_content: None,
            style: None,
            is_fallback: false,
        }
    }

    #[test]
    fn post_process_trims_quotes_and_punctuates() {
        assert_eq!(post_process("\"hello there\"", 200), "hello there.");
        assert_eq!(post_process("done!", 200), "done!");
        assert_eq!(post_process("really?", 200), "really?");
    }

    #[test]
    fn post_process_collapses_blank_lines() {
        assert_eq!(post_process("a\n\n\nb", 200), "a\nb.");
    }

    #[test]
    fn post_process_caps_length_with_ellipsis() {
        let long = "x".repeat(500);
        let out = post_process(&long, 200);
        // 200 chars + "..." + terminal "."
        assert!(out.starts_with(&"x".repeat(200)));
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= 205);
    }

    #[test]
    fn style_table_follows_the_stage_gradient() {
        assert_eq!(
            style_for(ExpressionType::Greeting, RelationshipStage::Stranger),
            Style::Professional
        );
        assert_eq!(
            style_for(ExpressionType::Greeting, RelationshipStage::CloseFriend),
            Style::Casual
        );
        assert_eq!(
            style_for(ExpressionType::Suggestion, RelationshipStage::Friend),
            Style::Empathetic
        );
    }

    #[tokio::test]
    async fn generation_sets_final_content_and_style() {
        let generator = ExpressionGenerator::new(
            Arc::new(StaticProvider("\"good evening, alice\"")),
            GeneratorConfig::new("test".to_string(), 0),
        );
        let result = generator
            .generate(planned_expression(RelationshipStage::Familiar))
            .await;
        assert_eq!(result.final_content.as_deref(), Some("good evening, alice."));
        assert_eq!(result.style, Some(Style::Friendly));
        assert!(!result.is_fallback);
    }

    #[tokio::test]
    async fn failure_uses_stage_keyed_fallback() {
        let generator = ExpressionGenerator::new(
            Arc::new(DeadProvider),
            GeneratorConfig::new("test".to_string(), 0),
        );
        let result = generator
            .generate(planned_expression(RelationshipStage::Friend))
            .await;
        assert!(result.is_fallback);
        assert_eq!(
            result.final_content.as_deref(),
            Some(fallback_content(ExpressionType::Greeting, RelationshipStage::Friend))
        );
    }
}
