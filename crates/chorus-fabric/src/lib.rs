pub mod error;
pub mod events;
pub mod notify;
pub mod optimizer;
pub mod presence;
pub mod router;

pub use error::FabricError;
pub use events::ServerEvent;
pub use notify::NotificationService;
pub use optimizer::WsOptimizer;
pub use presence::PresenceService;
pub use router::{ConnectionId, MessageRouter};
