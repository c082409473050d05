//! Operation execution framework.
//!
//! 1. **Carrier** (`carrier`): task-local request context for every operation
//! 2. **Wrapper** (`wrapper`): transport boundary; builds the context, classifies failures once
//! 3. **Middleware** (`middleware`): Tower layers (load-shedding, deadline, metrics)
//! 4. **Routing** (`router`): Dispatch to handlers by operation name
//! 5. **Domain services** (`domain`): Business operations
//! 6. **Resilience** (`executor`, `breaker`, `unit_of_work`): retries, circuit breaking, compensation
//! 7. **Background workers** (`worker`): off-path audit delivery

pub mod breaker;
pub mod carrier;
pub mod classify;
pub mod config;
pub mod domain;
pub mod executor;
pub mod middleware;
pub mod observability;
pub mod operation;
pub mod router;
pub mod unit_of_work;
pub mod worker;
pub mod wrapper;

#[cfg(test)]
mod scenarios;

// Re-export key types for convenient access.
pub use breaker::{BreakerRegistry, CircuitBreaker};
pub use classify::standard_classifier;
pub use config::ServerConfig;
pub use executor::ResilientExecutor;
pub use middleware::{build_operation_pipeline, OperationPipeline};
pub use observability::{FanoutSink, MetricsSink};
pub use operation::{
    Operation, OperationError, OperationRequest, ResponseEnvelope, TransportMetadata,
};
pub use router::{handler_fn, OperationHandler, OperationRouter};
pub use unit_of_work::{RollbackIncomplete, UnitOfWork, UnitOfWorkCoordinator, UnitReport, UnitState};
pub use worker::{AuditForwarder, BackgroundRunnable, BackgroundWorker, ChannelAuditSink};
pub use wrapper::OperationWrapper;
