use serde::{Deserialize, Serialize};

/// Topology of speakers in a session.
///
/// The legacy spelling `human_to_ai_private` is accepted on parse and
/// canonicalized to [`DialogueType::HumanAiPrivate`]; serialization always
/// emits the canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueType {
    HumanHumanPrivate,
    HumanHumanGroup,
    HumanAiPrivate,
    AiAiDialogue,
    AiSelfReflection,
    HumanAiGroup,
    AiMultiHuman,
}

impl DialogueType {
    /// Canonical wire string, e.g. `"human_ai_private"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogueType::HumanHumanPrivate => "human_human_private",
            DialogueType::HumanHumanGroup => "human_human_group",
            DialogueType::HumanAiPrivate => "human_ai_private",
            DialogueType::AiAiDialogue => "ai_ai_dialogue",
            DialogueType::AiSelfReflection => "ai_self_reflection",
            DialogueType::HumanAiGroup => "human_ai_group",
            DialogueType::AiMultiHuman => "ai_multi_human",
        }
    }

    /// True for the two topologies with no AI participant.
    pub fn is_human_only(&self) -> bool {
        matches!(
            self,
            DialogueType::HumanHumanPrivate | DialogueType::HumanHumanGroup
        )
    }

    /// True when an AI response is produced for user input in this topology.
    pub fn is_ai_bearing(&self) -> bool {
        !self.is_human_only()
    }
}

impl std::str::FromStr for DialogueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human_human_private" => Ok(DialogueType::HumanHumanPrivate),
            "human_human_group" => Ok(DialogueType::HumanHumanGroup),
            // canonicalize the legacy spelling on read
            "human_ai_private" | "human_to_ai_private" => Ok(DialogueType::HumanAiPrivate),
            "ai_ai_dialogue" => Ok(DialogueType::AiAiDialogue),
            "ai_self_reflection" => Ok(DialogueType::AiSelfReflection),
            "human_ai_group" => Ok(DialogueType::HumanAiGroup),
            "ai_multi_human" => Ok(DialogueType::AiMultiHuman),
            other => Err(format!("unknown dialogue type: {other}")),
        }
    }
}

impl std::fmt::Display for DialogueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribution of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Role::Human),
            "ai" => Ok(Role::Ai),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload classification of a turn.
///
/// `System`, `Urgent` and `Notification` messages skip outbound batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    System,
    Urgent,
    Notification,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Audio => "audio",
            MessageType::System => "system",
            MessageType::Urgent => "urgent",
            MessageType::Notification => "notification",
        }
    }

    /// Whether messages of this type demand an immediate outbound flush.
    pub fn wants_immediate_flush(&self) -> bool {
        matches!(
            self,
            MessageType::System | MessageType::Urgent | MessageType::Notification
        )
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "audio" => Ok(MessageType::Audio),
            "system" => Ok(MessageType::System),
            "urgent" => Ok(MessageType::Urgent),
            "notification" => Ok(MessageType::Notification),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Coarse familiarity category derived from a user's interaction count.
///
/// Drives formality and style of proactive output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStage {
    Stranger,
    Acquaintance,
    Familiar,
    Friend,
    CloseFriend,
}

impl RelationshipStage {
    /// Map a monotonically non-decreasing interaction counter to a stage.
    pub fn from_interaction_count(count: u64) -> Self {
        match count {
            0..=5 => RelationshipStage::Stranger,
            6..=20 => RelationshipStage::Acquaintance,
            21..=50 => RelationshipStage::Familiar,
            51..=100 => RelationshipStage::Friend,
            _ => RelationshipStage::CloseFriend,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStage::Stranger => "stranger",
            RelationshipStage::Acquaintance => "acquaintance",
            RelationshipStage::Familiar => "familiar",
            RelationshipStage::Friend => "friend",
            RelationshipStage::CloseFriend => "close_friend",
        }
    }

    /// Formality level used by the expression style tables.
    pub fn formality(&self) -> Formality {
        match self {
            RelationshipStage::Stranger => Formality::High,
            RelationshipStage::Acquaintance => Formality::MediumHigh,
            RelationshipStage::Familiar => Formality::Medium,
            RelationshipStage::Friend => Formality::MediumLow,
            RelationshipStage::CloseFriend => Formality::Low,
        }
    }
}

impl std::fmt::Display for RelationshipStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formality bands used when styling proactive expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formality {
    High,
    MediumHigh,
    Medium,
    MediumLow,
    Low,
}

impl Formality {
    /// High and medium-high formality rewrite casual address into honorifics.
    pub fn honorifics(&self) -> bool {
        matches!(self, Formality::High | Formality::MediumHigh)
    }

    /// All bands except the most formal permit emoji.
    pub fn emoji(&self) -> bool {
        !matches!(self, Formality::High)
    }
}

/// RFC3339 timestamp for "now" — the single time-formatting helper shared by
/// all persistence paths.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
