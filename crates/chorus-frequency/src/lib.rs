pub mod dispatcher;
pub mod generator;
pub mod integrator;
pub mod planner;
pub mod sampler;
pub mod sense;
pub mod types;

pub use dispatcher::ExpressionDispatcher;
pub use generator::{ExpressionGenerator, GeneratorConfig};
pub use integrator::{ContextUpdate, FrequencyIntegrator};
pub use planner::ExpressionPlanner;
pub use sampler::ContextSampler;
pub use sense::{FrequencySenseCore, SenseConfig};
pub use types::{Expression, ExpressionType, ItemPriority, SessionContext, Snapshot};
