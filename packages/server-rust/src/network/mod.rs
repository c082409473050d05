//! HTTP transport: configuration, header metadata, handlers, and drain control.

pub mod config;
pub mod handlers;
pub mod metadata;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use metadata::metadata_from_headers;
pub use module::NetworkModule;
pub use shutdown::{DrainController, InFlightGuard, ServingPhase};
