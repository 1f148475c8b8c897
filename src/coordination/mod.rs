//! Scatter/gather execution: the task bodies a worker runs

pub mod executor;
pub mod node;
pub mod partition;
pub mod worker;

pub use executor::LeafExecutor;
pub use node::ScatterGatherNode;
pub use partition::IndexRange;
pub use worker::Worker;
