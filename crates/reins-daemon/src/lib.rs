//! Daemon runtime supervising managed services.
//!
//! Services register in order, start in order, and stop in reverse. Start
//! failure unwinds the services already started; stop applies a bounded
//! per-service timeout and abandons laggards with an error event. Lifecycle
//! events flow through an injectable sink, tracing-backed by default.

pub mod runtime;
pub mod service;

pub use runtime::{
    DaemonHealth, DaemonRuntime, DaemonRuntimeOptions, ServiceHealth,
    DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
};
pub use service::{
    DaemonEvent, DaemonEventSink, DaemonState, ManagedIntegrationService, ManagedService,
    TracingEventSink,
};
