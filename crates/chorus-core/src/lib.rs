pub mod config;
pub mod error;
pub mod types;

pub use config::ChorusConfig;
pub use error::ChorusError;
pub use types::{DialogueType, MessageType, RelationshipStage, Role};
