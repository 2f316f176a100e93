//! Callable tool contract, registry, and token-size estimation.
//!
//! Hosts the named-tool surface the agent runtime exposes: tools declare a
//! JSON-schema'd definition and execute against caller-supplied context.
//! The registry is the single mount point for the integration meta-tool and
//! per-operation tools.

pub mod budget;
pub mod registry;
pub mod tool;

pub use budget::{estimate_token_upper_bound, fits_token_budget};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCallContext, ToolDefinition, ToolExecutionResult};
