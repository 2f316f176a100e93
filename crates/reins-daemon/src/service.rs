//! Managed-service contract, lifecycle events, and the integration-service
//! adapter.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use reins_service::IntegrationService;

/// A component supervised by the daemon runtime.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Stable identifier used in events and health reports.
    fn id(&self) -> &str;

    /// Brings the service up. Called once per runtime start.
    async fn start(&self) -> Result<()>;

    /// Tears the service down. `signal` names the shutdown trigger when one
    /// exists (for example `SIGTERM`).
    async fn stop(&self, signal: Option<&str>) -> Result<()>;
}

/// Enumerates the runtime's own lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl DaemonState {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Lifecycle events emitted by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    ServiceRegistered {
        service_id: String,
    },
    StartRequested,
    StopRequested {
        signal: Option<String>,
    },
    SignalReceived {
        signal: String,
    },
    StateTransition {
        from: DaemonState,
        to: DaemonState,
    },
    Error {
        service_id: Option<String>,
        message: String,
    },
}

/// Sink for runtime lifecycle events.
pub trait DaemonEventSink: Send + Sync {
    fn emit(&self, event: &DaemonEvent);
}

/// Default sink writing structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl DaemonEventSink for TracingEventSink {
    fn emit(&self, event: &DaemonEvent) {
        match event {
            DaemonEvent::ServiceRegistered { service_id } => {
                tracing::info!(service_id = %service_id, "daemon service registered");
            }
            DaemonEvent::StartRequested => {
                tracing::info!("daemon start requested");
            }
            DaemonEvent::StopRequested { signal } => {
                tracing::info!(signal = signal.as_deref(), "daemon stop requested");
            }
            DaemonEvent::SignalReceived { signal } => {
                tracing::info!(signal = %signal, "daemon received shutdown signal");
            }
            DaemonEvent::StateTransition { from, to } => {
                tracing::info!(from = from.as_str(), to = to.as_str(), "daemon state changed");
            }
            DaemonEvent::Error {
                service_id,
                message,
            } => {
                tracing::error!(
                    service_id = service_id.as_deref(),
                    message = %message,
                    "daemon error"
                );
            }
        }
    }
}

/// Mounts the integration service under the daemon runtime.
pub struct ManagedIntegrationService {
    service: Arc<IntegrationService>,
}

impl ManagedIntegrationService {
    /// Wraps `service` for supervision.
    pub fn new(service: Arc<IntegrationService>) -> Arc<Self> {
        Arc::new(Self { service })
    }
}

#[async_trait]
impl ManagedService for ManagedIntegrationService {
    fn id(&self) -> &str {
        "integration-service"
    }

    async fn start(&self) -> Result<()> {
        self.service.start().await.map_err(anyhow::Error::from)
    }

    async fn stop(&self, _signal: Option<&str>) -> Result<()> {
        self.service.stop().await.map_err(anyhow::Error::from)
    }
}
