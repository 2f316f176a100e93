//! The integration plug-in contract.

use async_trait::async_trait;
use serde_json::Value;

use reins_core::IntegrationResult;

use crate::manifest::{IntegrationManifest, IntegrationRuntimeStatus, OperationDescriptor};
use crate::result::DualChannelResult;

/// Contract every installed integration satisfies.
///
/// The host never reflects on concrete types beyond this trait: connection
/// side effects, self-reported status, the operation catalogue, and
/// execution all flow through it. Credentials are not a parameter —
/// integrations read them from the vault they were constructed with.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Static manifest, including the declared operations.
    fn manifest(&self) -> &IntegrationManifest;

    /// Establishes the connection to the external service.
    async fn connect(&self) -> IntegrationResult<()>;

    /// Tears the connection down.
    async fn disconnect(&self) -> IntegrationResult<()>;

    /// Self-reported runtime health.
    fn status(&self) -> IntegrationRuntimeStatus;

    /// The callable operation catalogue. Defaults to the manifest's.
    fn operations(&self) -> Vec<OperationDescriptor> {
        self.manifest().operations.clone()
    }

    /// Executes one named operation with JSON arguments.
    async fn execute(
        &self,
        operation: &str,
        arguments: Value,
    ) -> IntegrationResult<DualChannelResult>;
}
