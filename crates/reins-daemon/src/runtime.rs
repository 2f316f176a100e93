//! Ordered service supervision with bounded shutdown.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};

use crate::service::{DaemonEvent, DaemonEventSink, DaemonState, ManagedService, TracingEventSink};

/// Default bounded shutdown timeout applied to each service stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 10;

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct DaemonRuntimeOptions {
    /// Per-service ceiling on `stop`; laggards are abandoned with an error
    /// event once it expires.
    pub shutdown_timeout: Duration,
}

impl Default for DaemonRuntimeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// Health of one supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHealth {
    pub id: String,
    pub running: bool,
}

/// Point-in-time runtime health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHealth {
    pub state: DaemonState,
    pub uptime_ms: Option<u64>,
    pub services: Vec<ServiceHealth>,
}

struct RuntimeState {
    state: DaemonState,
    started_at: Option<Instant>,
    running_ids: HashSet<String>,
}

/// Supervises an ordered set of managed services.
///
/// Startup order is registration order; shutdown is the exact reverse.
/// `start` and `stop` are idempotent and serialized against each other.
pub struct DaemonRuntime {
    services: Mutex<Vec<Arc<dyn ManagedService>>>,
    state: Mutex<RuntimeState>,
    lifecycle_lock: tokio::sync::Mutex<()>,
    options: DaemonRuntimeOptions,
    sink: Arc<dyn DaemonEventSink>,
}

impl Default for DaemonRuntime {
    fn default() -> Self {
        Self::new(DaemonRuntimeOptions::default(), Arc::new(TracingEventSink))
    }
}

impl DaemonRuntime {
    /// Creates a runtime with the given options and event sink.
    pub fn new(options: DaemonRuntimeOptions, sink: Arc<dyn DaemonEventSink>) -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            state: Mutex::new(RuntimeState {
                state: DaemonState::Stopped,
                started_at: None,
                running_ids: HashSet::new(),
            }),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            options,
            sink,
        }
    }

    /// Adds a service to the supervision order. Ids must be unique.
    pub fn register_service(&self, service: Arc<dyn ManagedService>) -> Result<()> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if services
            .iter()
            .any(|existing| existing.id() == service.id())
        {
            bail!("service '{}' is already registered", service.id());
        }
        let service_id = service.id().to_string();
        services.push(service);
        drop(services);
        self.sink
            .emit(&DaemonEvent::ServiceRegistered { service_id });
        Ok(())
    }

    /// Starts every service in registration order.
    ///
    /// Idempotent: a second call while running returns success without
    /// restarting anything. When a service fails to start, the ones already
    /// started are stopped in reverse order and the error is returned.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        if self.current_state() == DaemonState::Running {
            return Ok(());
        }
        self.sink.emit(&DaemonEvent::StartRequested);
        self.set_state(DaemonState::Starting);

        let services = self.service_snapshot();
        let mut started: Vec<Arc<dyn ManagedService>> = Vec::new();
        for service in services {
            match service.start().await {
                Ok(()) => {
                    self.mark_running(service.id(), true);
                    started.push(service);
                }
                Err(error) => {
                    self.sink.emit(&DaemonEvent::Error {
                        service_id: Some(service.id().to_string()),
                        message: format!("service failed to start: {error:#}"),
                    });
                    for done in started.iter().rev() {
                        self.stop_one(done, None).await;
                    }
                    self.set_state(DaemonState::Stopped);
                    return Err(error)
                        .with_context(|| format!("service '{}' failed to start", service.id()));
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.started_at = Some(Instant::now());
        }
        self.set_state(DaemonState::Running);
        Ok(())
    }

    /// Stops every service in reverse registration order. Idempotent.
    pub async fn stop(&self, signal: Option<&str>) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        if self.current_state() != DaemonState::Running {
            return Ok(());
        }
        self.sink.emit(&DaemonEvent::StopRequested {
            signal: signal.map(str::to_string),
        });
        self.set_state(DaemonState::Stopping);

        let services = self.service_snapshot();
        for service in services.iter().rev() {
            self.stop_one(service, signal).await;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.started_at = None;
        }
        self.set_state(DaemonState::Stopped);
        Ok(())
    }

    /// Blocks until SIGTERM/SIGINT arrives, then runs an orderly stop.
    /// Returns the signal name.
    pub async fn run_until_signal(&self) -> Result<String> {
        let signal = wait_for_shutdown_signal().await?;
        self.sink.emit(&DaemonEvent::SignalReceived {
            signal: signal.clone(),
        });
        self.stop(Some(&signal)).await?;
        Ok(signal)
    }

    /// Point-in-time health: runtime state, uptime, per-service liveness.
    pub fn health(&self) -> DaemonHealth {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let services = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|service| ServiceHealth {
                id: service.id().to_string(),
                running: state.running_ids.contains(service.id()),
            })
            .collect();
        DaemonHealth {
            state: state.state,
            uptime_ms: state
                .started_at
                .map(|instant| u64::try_from(instant.elapsed().as_millis()).unwrap_or(u64::MAX)),
            services,
        }
    }

    async fn stop_one(&self, service: &Arc<dyn ManagedService>, signal: Option<&str>) {
        match tokio::time::timeout(self.options.shutdown_timeout, service.stop(signal)).await {
            Ok(Ok(())) => {
                self.mark_running(service.id(), false);
            }
            Ok(Err(error)) => {
                self.mark_running(service.id(), false);
                self.sink.emit(&DaemonEvent::Error {
                    service_id: Some(service.id().to_string()),
                    message: format!("service failed to stop: {error:#}"),
                });
            }
            Err(_) => {
                self.mark_running(service.id(), false);
                self.sink.emit(&DaemonEvent::Error {
                    service_id: Some(service.id().to_string()),
                    message: format!(
                        "service did not stop within {}ms; abandoning it",
                        self.options.shutdown_timeout.as_millis()
                    ),
                });
            }
        }
    }

    fn service_snapshot(&self) -> Vec<Arc<dyn ManagedService>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_state(&self) -> DaemonState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    fn set_state(&self, to: DaemonState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = state.state;
            state.state = to;
            from
        };
        if from != to {
            self.sink.emit(&DaemonEvent::StateTransition { from, to });
        }
    }

    fn mark_running(&self, service_id: &str, running: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if running {
            state.running_ids.insert(service_id.to_string());
        } else {
            state.running_ids.remove(service_id);
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<String> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT".to_string())
        }
        _ = sigterm.recv() => Ok("SIGTERM".to_string()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<String> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok("SIGINT".to_string())
}
