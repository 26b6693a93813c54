pub mod batch;
pub mod db;
pub mod error;
pub mod memory;
pub mod shape;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DialogueStore, Storage};
pub use types::{
    ExpressionRecord, HealthStatus, Session, SessionFilter, SessionMetadata, SessionPatch,
    StoreHealth, Turn, TurnFilter, TurnMetadata, TurnPatch, UserProfile,
};
