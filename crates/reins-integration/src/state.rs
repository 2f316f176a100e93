//! Six-state integration lifecycle with isolated transition listeners.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use reins_core::{IntegrationError, IntegrationResult};

/// Enumerates the lifecycle states an integration moves through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    /// Installed but not yet configured.
    Installed,
    /// Configuration accepted, connection not attempted.
    Configured,
    /// Connected to the external service, tools not yet exposed.
    Connected,
    /// Fully operational; operation tools are registered.
    Active,
    /// Known-unhealthy but not torn down.
    Suspended,
    /// Torn down; re-enabling starts over from installed.
    Disconnected,
}

impl IntegrationState {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Configured => "configured",
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parses a wire token back into a state.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "installed" => Some(Self::Installed),
            "configured" => Some(Self::Configured),
            "connected" => Some(Self::Connected),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Returns the transition targets allowed from `from`. The table is data:
/// legality checks and the mutating path both read it.
pub fn allowed_transitions(from: IntegrationState) -> &'static [IntegrationState] {
    match from {
        IntegrationState::Installed => {
            &[IntegrationState::Configured, IntegrationState::Disconnected]
        }
        IntegrationState::Configured => {
            &[IntegrationState::Connected, IntegrationState::Disconnected]
        }
        IntegrationState::Connected => &[IntegrationState::Active, IntegrationState::Disconnected],
        IntegrationState::Active => &[IntegrationState::Suspended, IntegrationState::Disconnected],
        IntegrationState::Suspended => &[IntegrationState::Active, IntegrationState::Disconnected],
        IntegrationState::Disconnected => &[IntegrationState::Installed],
    }
}

/// One observed lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub integration_id: String,
    pub from: IntegrationState,
    pub to: IntegrationState,
}

type TransitionListener = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Tracks one lifecycle state per integration and broadcasts transitions.
///
/// Listeners are keyed: registering the same key twice is a no-op and
/// removal is by key. A panicking listener is isolated; it neither stops
/// later listeners nor rolls back the transition.
#[derive(Default)]
pub struct IntegrationStateMachine {
    states: Mutex<HashMap<String, IntegrationState>>,
    listeners: Mutex<Vec<(String, TransitionListener)>>,
}

impl IntegrationStateMachine {
    /// Creates an empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty state machine behind a shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Starts tracking `integration_id` at `installed` if unseen.
    pub fn track(&self, integration_id: &str) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(integration_id.to_string())
            .or_insert(IntegrationState::Installed);
    }

    /// Returns the current state, or `None` for unknown integrations.
    pub fn state(&self, integration_id: &str) -> Option<IntegrationState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(integration_id)
            .copied()
    }

    /// Non-mutating legality query for a prospective transition.
    pub fn can_transition(&self, integration_id: &str, to: IntegrationState) -> bool {
        self.state(integration_id)
            .map(|from| allowed_transitions(from).contains(&to))
            .unwrap_or(false)
    }

    /// Moves `integration_id` to `to` and notifies every listener.
    ///
    /// A rejected transition changes nothing and names the integration,
    /// the current state, and the requested state.
    pub fn transition(
        &self,
        integration_id: &str,
        to: IntegrationState,
    ) -> IntegrationResult<StateTransition> {
        let transition = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(from) = states.get(integration_id).copied() else {
                return Err(IntegrationError::state_transition(format!(
                    "integration '{integration_id}' is not tracked by the state machine"
                )));
            };
            if !allowed_transitions(from).contains(&to) {
                return Err(IntegrationError::state_transition(format!(
                    "integration '{integration_id}' cannot transition from '{}' to '{}'",
                    from.as_str(),
                    to.as_str()
                )));
            }
            states.insert(integration_id.to_string(), to);
            StateTransition {
                integration_id: integration_id.to_string(),
                from,
                to,
            }
        };

        tracing::debug!(
            integration_id = %transition.integration_id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            "integration state transition"
        );
        self.notify(&transition);
        Ok(transition)
    }

    /// Registers a listener under `key`. Returns false (and changes
    /// nothing) when the key is already registered.
    pub fn add_listener(
        &self,
        key: impl Into<String>,
        listener: impl Fn(&StateTransition) + Send + Sync + 'static,
    ) -> bool {
        let key = key.into();
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listeners.iter().any(|(existing, _)| existing == &key) {
            return false;
        }
        listeners.push((key, Arc::new(listener)));
        true
    }

    /// Removes the listener registered under `key`. True when one existed.
    pub fn remove_listener(&self, key: &str) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| existing != key);
        listeners.len() != before
    }

    fn notify(&self, transition: &StateTransition) {
        let snapshot: Vec<(String, TransitionListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (key, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(transition))).is_err() {
                tracing::warn!(
                    listener = %key,
                    integration_id = %transition.integration_id,
                    "state transition listener panicked"
                );
            }
        }
    }
}
