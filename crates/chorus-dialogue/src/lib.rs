pub mod client;
pub mod error;
pub mod manager;
pub mod provider;

pub use client::{chat_with_retry, ChatCompletionsClient};
pub use error::DialogueError;
pub use manager::{DialogueManager, ProcessResult};
pub use provider::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, MsgRole, ProviderError};
