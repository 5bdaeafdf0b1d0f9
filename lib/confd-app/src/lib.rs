//! Process bootstrap primitives.
//!
//! Logging, the HTTP API server, and the introspection endpoints shared by the daemon's binaries.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "api")]
pub mod api;

#[cfg(feature = "logging")]
pub mod logging;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "api")]
    pub use super::api::APIBuilder;
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging};
    #[cfg(feature = "metrics")]
    pub use super::metrics::{emit_startup_metrics, MetricsAPIHandler};
}
