use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use chorus_core::types::RelationshipStage;

/// What kind of proactive utterance to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionType {
    Greeting,
    Question,
    Suggestion,
    Reminder,
    Observation,
}

impl ExpressionType {
    pub const ALL: [ExpressionType; 5] = [
        ExpressionType::Greeting,
        ExpressionType::Question,
        ExpressionType::Suggestion,
        ExpressionType::Reminder,
        ExpressionType::Observation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpressionType::Greeting => "greeting",
            ExpressionType::Question => "question",
            ExpressionType::Suggestion => "suggestion",
            ExpressionType::Reminder => "reminder",
            ExpressionType::Observation => "observation",
        }
    }
}

impl std::fmt::Display for ExpressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of an externally injected notification or reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemPriority {
    High,
    Medium,
    #[default]
    Normal,
}

/// A notification or reminder attached to a session context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalItem {
    pub id: String,
    pub content: String,
    pub priority: ItemPriority,
    pub timestamp: String,
}

/// Upper bound on conversation history lines kept per session context.
pub const CONTEXT_HISTORY_CAP: usize = 20;
/// Upper bound on tracked recent topics.
pub const CONTEXT_TOPICS_CAP: usize = 5;
/// Upper bound on pending notifications/reminders per context.
pub const CONTEXT_ITEMS_CAP: usize = 10;

/// Mutable per-session view the sampler reads from.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: String,
    pub last_update: Instant,
    pub last_user_activity: Instant,
    pub user_input: Option<String>,
    pub input_type: Option<String>,
    pub user_emotion: String,
    pub has_open_questions: bool,
    pub conversation_history: VecDeque<String>,
    pub recent_topics: Vec<String>,
    pub notifications: Vec<ExternalItem>,
    pub reminders: Vec<ExternalItem>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            last_update: Instant::now(),
            last_user_activity: Instant::now(),
            user_input: None,
            input_type: None,
            user_emotion: "neutral".to_string(),
            has_open_questions: false,
            conversation_history: VecDeque::new(),
            recent_topics: Vec::new(),
            notifications: Vec::new(),
            reminders: Vec::new(),
        }
    }

    pub fn push_history(&mut self, line: String) {
        if self.conversation_history.len() >= CONTEXT_HISTORY_CAP {
            self.conversation_history.pop_front();
        }
        self.conversation_history.push_back(line);
    }

    pub fn push_topic(&mut self, topic: String) {
        if self.recent_topics.contains(&topic) {
            return;
        }
        if self.recent_topics.len() >= CONTEXT_TOPICS_CAP {
            self.recent_topics.remove(0);
        }
        self.recent_topics.push(topic);
    }

    pub fn idle_secs(&self) -> f64 {
        self.last_user_activity.elapsed().as_secs_f64()
    }
}

/// One sampled context snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub timestamp: f64,
    pub datetime: String,
    pub signals: Signals,
    pub priority_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Signals {
    pub user_activity: UserActivitySignal,
    pub time_elapsed: TimeElapsedSignal,
    pub conversation_context: ConversationSignal,
    pub system_state: SystemStateSignal,
    pub external_events: ExternalEventsSignal,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserActivitySignal {
    pub idle_time: f64,
    pub input_type: String,
    pub user_emotion: String,
    pub has_question: bool,
    pub input_length: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeElapsedSignal {
    pub elapsed_since_last_sample: f64,
    pub hour_of_day: u32,
    pub time_period: String,
    pub is_weekend: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSignal {
    pub history_length: usize,
    pub recent_topics: Vec<String>,
    pub is_active_conversation: bool,
    pub has_open_questions: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStateSignal {
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalEventsSignal {
    pub notification_count: usize,
    pub reminder_count: usize,
    pub has_high_priority: bool,
    pub score: f64,
}

/// When the expression should go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingKind {
    Immediate,
    Delayed,
    Scheduled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timing {
    pub kind: TimingKind,
    pub delay_secs: u64,
}

/// Slice of the snapshot carried along for prompt context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextReference {
    pub idle_secs: f64,
    pub time_period: String,
    pub conversation_active: bool,
}

/// Compact profile summary attached by the planner.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub name: String,
    pub interaction_count: u64,
}

/// A proactive expression as it moves through the pipeline.
///
/// The sense core fills the seed fields; the planner attaches the
/// relationship stage and user summary; the generator sets
/// `final_content` and `style`.
#[derive(Debug, Clone, Serialize)]
pub struct Expression {
    pub id: String,
    pub expression_type: ExpressionType,
    pub content: String,
    pub context_reference: ContextReference,
    pub timing: Timing,
    pub priority_score: f64,
    pub timestamp: String,

    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub relationship_stage: Option<RelationshipStage>,
    pub user_info: Option<UserSummary>,

    pub final_content: Option<String>,
    pub style: Option<Style>,
    pub is_fallback: bool,
}

/// Voice used when rendering the final text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    Friendly,
    Professional,
    Casual,
    Empathetic,
    Informative,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Friendly => "friendly",
            Style::Professional => "professional",
            Style::Casual => "casual",
            Style::Empathetic => "empathetic",
            Style::Informative => "informative",
        }
    }

    /// Short guide sentence injected into the generation prompt.
    pub fn guide(&self) -> &'static str {
        match self {
            Style::Friendly => "warm and friendly, everyday language, light emoji are fine",
            Style::Professional => "professional and precise, no slang",
            Style::Casual => "relaxed and colloquial, contractions welcome",
            Style::Empathetic => "empathetic and warm, centered on how the user feels",
            Style::Informative => "clear and informative, lead with the point",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_and_topics_are_bounded() {
        let mut ctx = SessionContext::new("s1", "u1");
        for i in 0..30 {
            ctx.push_history(format!("line {i}"));
        }
        assert_eq!(ctx.conversation_history.len(), CONTEXT_HISTORY_CAP);
        assert_eq!(ctx.conversation_history.front().unwrap(), "line 10");

        for i in 0..8 {
            ctx.push_topic(format!("topic {i}"));
        }
        assert_eq!(ctx.recent_topics.len(), CONTEXT_TOPICS_CAP);
        // duplicates are ignored
        ctx.push_topic("topic 7".to_string());
        assert_eq!(ctx.recent_topics.len(), CONTEXT_TOPICS_CAP);
    }
}
