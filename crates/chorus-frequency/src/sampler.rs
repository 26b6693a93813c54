use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{Datelike, Local, Timelike};
use tracing::debug;

use crate::types::{
    ConversationSignal, ExternalEventsSignal, ExternalItem, ItemPriority, SessionContext, Signals,
    Snapshot, SystemStateSignal, TimeElapsedSignal, UserActivitySignal,
};

/// Ring buffer size for sampled snapshots.
const SAMPLE_HISTORY_CAP: usize = 50;

/// A conversation is active when there is history and the user spoke in
/// the last five minutes.
const ACTIVE_IDLE_SECS: f64 = 300.0;

/// Emits weighted multi-signal snapshots of a session context.
///
/// Pure arithmetic apart from the wall clock; the snapshot history is an
/// observability aid, never a source of truth.
pub struct ContextSampler {
    signal_weights: HashMap<String, f64>,
    last_sample: Mutex<Instant>,
    history: Mutex<VecDeque<Snapshot>>,
}

impl ContextSampler {
    pub fn new(signal_weights: HashMap<String, f64>) -> Self {
        Self {
            signal_weights,
            last_sample: Mutex::new(Instant::now()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Sample the context into a snapshot with a composite priority score
    /// in [0, 1].
    pub fn sample(&self, ctx: &SessionContext) -> Snapshot {
        let now = Local::now();
        let idle = ctx.idle_secs();

        let elapsed_since_last_sample = {
            let mut last = self.last_sample.lock().unwrap();
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            elapsed
        };

        let input = ctx.user_input.as_deref().unwrap_or("");
        let input_type = ctx.input_type.as_deref().unwrap_or("unknown");
        let user_activity = UserActivitySignal {
            idle_time: idle,
            input_type: input_type.to_string(),
            user_emotion: ctx.user_emotion.clone(),
            has_question: input.contains('?'),
            input_length: input.chars().count(),
            score: user_activity_score(idle, input_type, &ctx.user_emotion),
        };

        let hour = now.hour();
        let period = time_period(hour);
        let time_elapsed = TimeElapsedSignal {
            elapsed_since_last_sample,
            hour_of_day: hour,
            time_period: period.to_string(),
            is_weekend: matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun),
            score: time_elapsed_score(elapsed_since_last_sample, period),
        };

        let history_length = ctx.conversation_history.len();
        let is_active = history_length > 0 && idle < ACTIVE_IDLE_SECS;
        let conversation_context = ConversationSignal {
            history_length,
            recent_topics: ctx.recent_topics.clone(),
            is_active_conversation: is_active,
            has_open_questions: ctx.has_open_questions,
            score: conversation_score(history_length, is_active, ctx.has_open_questions),
        };

        let system_state = SystemStateSignal { score: 0.5 };

        let external_events = ExternalEventsSignal {
            notification_count: ctx.notifications.len(),
            reminder_count: ctx.reminders.len(),
            has_high_priority: has_high_priority(&ctx.notifications),
            score: external_events_score(&ctx.notifications, &ctx.reminders),
        };

        let signals = Signals {
            user_activity,
            time_elapsed,
            conversation_context,
            system_state,
            external_events,
        };
        let priority_score = self.priority_score(&signals);

        let snapshot = Snapshot {
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            datetime: now.to_rfc3339(),
            signals,
            priority_score,
        };

        let mut history = self.history.lock().unwrap();
        if history.len() >= SAMPLE_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(snapshot.clone());

        debug!(session_id = %ctx.session_id, priority_score, "context sampled");
        snapshot
    }

    pub fn sample_history(&self, limit: usize) -> Vec<Snapshot> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Weighted mean of the enabled signal scores.
    fn priority_score(&self, signals: &Signals) -> f64 {
        let scored = [
            ("user_activity", signals.user_activity.score),
            ("time_elapsed", signals.time_elapsed.score),
            ("conversation_context", signals.conversation_context.score),
            ("system_state", signals.system_state.score),
            ("external_events", signals.external_events.score),
        ];
        let mut total = 0.0;
        let mut total_weight = 0.0;
        for (name, score) in scored {
            if let Some(weight) = self.signal_weights.get(name) {
                total += weight * score;
                total_weight += weight;
            }
        }
        if total_weight > 0.0 {
            total / total_weight
        } else {
            0.5
        }
    }
}

pub fn time_period(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=17 => "afternoon",
        18..=21 => "evening",
        _ => "night",
    }
}

/// Idle time (capped at one hour), input kind, and mood blended 5:3:2.
fn user_activity_score(idle_secs: f64, input_type: &str, emotion: &str) -> f64 {
    let idle_score = (idle_secs / 3600.0).min(1.0);
    let type_score = match input_type {
        "question" => 0.8,
        "command" => 0.6,
        _ => 0.4,
    };
    let emotion_score = match emotion {
        "excited" | "happy" => 0.9,
        "neutral" => 0.7,
        "sad" | "confused" => 0.5,
        _ => 0.8,
    };
    idle_score * 0.5 + type_score * 0.3 + emotion_score * 0.2
}

/// Elapsed time (capped at two hours) and day-period blended 7:3.
fn time_elapsed_score(elapsed_secs: f64, period: &str) -> f64 {
    let elapsed_score = (elapsed_secs / 7200.0).min(1.0);
    let period_score = match period {
        "morning" => 0.8,
        "afternoon" => 0.7,
        "evening" => 0.9,
        _ => 0.3,
    };
    elapsed_score * 0.7 + period_score * 0.3
}

fn conversation_score(history_length: usize, is_active: bool, has_open_questions: bool) -> f64 {
    let history_score = (history_length as f64 / 20.0).min(1.0);
    let active_score = if is_active { 0.8 } else { 0.3 };
    let question_score = if has_open_questions { 0.9 } else { 0.5 };
    history_score * 0.3 + active_score * 0.4 + question_score * 0.3
}

fn has_high_priority(notifications: &[ExternalItem]) -> bool {
    notifications
        .iter()
        .any(|n| n.priority == ItemPriority::High)
}

fn external_events_score(notifications: &[ExternalItem], reminders: &[ExternalItem]) -> f64 {
    if notifications.is_empty() && reminders.is_empty() {
        return 0.1;
    }
    let notification_score = (notifications.len() as f64 / 5.0).min(1.0);
    let reminder_score = (reminders.len() as f64 / 3.0).min(1.0);
    let priority_score = if has_high_priority(notifications) {
        0.9
    } else if notifications
        .iter()
        .any(|n| n.priority == ItemPriority::Medium)
    {
        0.6
    } else {
        0.3
    };
    notification_score * 0.4 + reminder_score * 0.3 + priority_score * 0.3
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::types::now_rfc3339;

    fn default_weights() -> HashMap<String, f64> {
        HashMap::from([
            ("user_activity".to_string(), 10.0),
            ("time_elapsed".to_string(), 6.0),
            ("conversation_context".to_string(), 8.0),
            ("system_state".to_string(), 5.0),
            ("external_events".to_string(), 7.0),
        ])
    }

    #[test]
    fn empty_context_yields_priority_in_unit_range() {
        let sampler = ContextSampler::new(default_weights());
        let ctx = SessionContext::new("s1", "u1");
        let snap = sampler.sample(&ctx);
        assert!(snap.priority_score >= 0.0 && snap.priority_score <= 1.0);
        assert_eq!(snap.signals.conversation_context.history_length, 0);
        assert!(!snap.signals.conversation_context.is_active_conversation);
        assert!((snap.signals.external_events.score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn question_input_raises_activity_score() {
        let plain = user_activity_score(0.0, "text", "neutral");
        let question = user_activity_score(0.0, "question", "neutral");
        assert!(question > plain);
    }

    #[test]
    fn idle_time_is_capped_at_one_hour() {
        let one_hour = user_activity_score(3600.0, "text", "neutral");
        let two_hours = user_activity_score(7200.0, "text", "neutral");
        assert!((one_hour - two_hours).abs() < 1e-9);
    }

    #[test]
    fn evening_outranks_morning_outranks_afternoon_outranks_night() {
        let night = time_elapsed_score(0.0, "night");
        let afternoon = time_elapsed_score(0.0, "afternoon");
        let morning = time_elapsed_score(0.0, "morning");
        let evening = time_elapsed_score(0.0, "evening");
        assert!(evening > morning);
        assert!(morning > afternoon);
        assert!(afternoon > night);
    }

    #[test]
    fn period_boundaries() {
        assert_eq!(time_period(4), "night");
        assert_eq!(time_period(5), "morning");
        assert_eq!(time_period(11), "morning");
        assert_eq!(time_period(12), "afternoon");
        assert_eq!(time_period(17), "afternoon");
        assert_eq!(time_period(18), "evening");
        assert_eq!(time_period(21), "evening");
        assert_eq!(time_period(22), "night");
    }

    #[test]
    fn high_priority_notification_dominates_external_score() {
        let high = vec![ExternalItem {
            id: "n1".into(),
            content: "deploy failed".into(),
            priority: ItemPriority::High,
            timestamp: now_rfc3339(),
        }];
        let normal = vec![ExternalItem {
            id: "n2".into(),
            content: "fyi".into(),
            priority: ItemPriority::Normal,
            timestamp: now_rfc3339(),
        }];
        assert!(external_events_score(&high, &[]) > external_events_score(&normal, &[]));
    }

    #[test]
    fn sample_history_is_bounded() {
        let sampler = ContextSampler::new(default_weights());
        let ctx = SessionContext::new("s1", "u1");
        for _ in 0..60 {
            sampler.sample(&ctx);
        }
        assert_eq!(sampler.sample_history(100).len(), 50);
    }

    #[test]
    fn missing_weights_fall_back_to_midpoint() {
        let sampler = ContextSampler::new(HashMap::new());
        let ctx = SessionContext::new("s1", "u1");
        let snap = sampler.sample(&ctx);
        assert!((snap.priority_score - 0.5).abs() < 1e-9);
    }
}
