//! Integration lifecycle, catalogue, and tool exposure.
//!
//! An integration is a pluggable connector to an external service: a
//! manifest describing its operations, a six-state lifecycle, credentials
//! held by the vault, and callable tools. This crate enforces the lifecycle
//! state machine, catalogues installed integrations, drives enable/disable
//! side effects, and multiplexes every operation through the meta-tool.

#[cfg(test)]
mod tests;

pub mod contract;
pub mod lifecycle;
pub mod manifest;
pub mod meta;
pub mod registry;
pub mod result;
pub mod state;

pub use contract::Integration;
pub use lifecycle::LifecycleManager;
pub use manifest::{
    IntegrationAuthKind, IntegrationConfig, IntegrationManifest, IntegrationRuntimeStatus,
    OperationDescriptor, StatusIndicator,
};
pub use meta::{
    capability_index_entry, IntegrationMetaTool, OperationTool, DISCOVER_TOKEN_BUDGET,
    META_TOOL_NAME,
};
pub use registry::{IntegrationCatalogEntry, IntegrationRegistry};
pub use result::DualChannelResult;
pub use state::{
    allowed_transitions, IntegrationState, IntegrationStateMachine, StateTransition,
};
