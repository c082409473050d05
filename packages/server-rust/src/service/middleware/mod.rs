//! Tower middleware layers for the operation pipeline.
//!
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`deadline`]: Enforces the operation's context deadline
//! - [`metrics`]: Operation timing and counting via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod deadline;
pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use deadline::DeadlineLayer;
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_operation_pipeline, OperationPipeline};
