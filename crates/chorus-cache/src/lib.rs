pub mod regions;
pub mod ttl;

pub use regions::ChatCaches;
pub use ttl::TtlCache;
