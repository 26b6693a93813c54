pub mod error;
pub mod manager;
pub mod views;

pub use error::ChatError;
pub use manager::ChatManager;
pub use views::{LastMessage, MessageView, SessionSummary};
