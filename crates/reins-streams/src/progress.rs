//! Throttled publish/subscribe for long-running background work.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Default minimum gap between forwarded `progress` events.
pub const DEFAULT_PROGRESS_MIN_INTERVAL_MS: u64 = 60_000;

/// Enumerates the stages a progress stream moves through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Started,
    Progress,
    Complete,
    Error,
}

impl ProgressStage {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Lifecycle edges are never throttled.
    pub fn is_lifecycle(self) -> bool {
        !matches!(self, Self::Progress)
    }
}

/// One progress update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub message: String,
    #[serde(default)]
    pub percent: Option<u8>,
    pub at_unix_ms: u64,
}

type ProgressListener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct ProgressEmitterState {
    listeners: Vec<(String, ProgressListener)>,
    last_event: Option<ProgressEvent>,
    last_forwarded_progress_unix_ms: Option<u64>,
}

/// Synchronous fan-out of progress events with interval throttling.
///
/// `started`/`complete`/`error` always go through; intermediate `progress`
/// events inside the configured minimum interval are dropped. The last
/// delivered event is cached and replayed to listeners that subscribe late.
pub struct ProgressEmitter {
    min_interval_ms: u64,
    state: Mutex<ProgressEmitterState>,
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_MIN_INTERVAL_MS)
    }
}

impl ProgressEmitter {
    /// Creates an emitter throttling `progress` to one per `min_interval_ms`.
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            state: Mutex::new(ProgressEmitterState {
                listeners: Vec::new(),
                last_event: None,
                last_forwarded_progress_unix_ms: None,
            }),
        }
    }

    /// Registers a listener under `key` and replays the cached last event to
    /// it. Duplicate keys are a no-op; returns false for them.
    pub fn add_listener(
        &self,
        key: impl Into<String>,
        listener: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> bool {
        let key = key.into();
        let listener: ProgressListener = Arc::new(listener);
        let replay = {
            let mut state = self.lock();
            if state.listeners.iter().any(|(existing, _)| existing == &key) {
                return false;
            }
            state.listeners.push((key, listener.clone()));
            state.last_event.clone()
        };
        if let Some(event) = replay {
            listener(&event);
        }
        true
    }

    /// Removes the listener registered under `key`. True when one existed.
    pub fn remove_listener(&self, key: &str) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| existing != key);
        state.listeners.len() != before
    }

    /// Delivers `event` to every listener synchronously and caches it.
    pub fn emit(&self, event: &ProgressEvent) {
        let listeners = {
            let mut state = self.lock();
            state.last_event = Some(event.clone());
            if event.stage == ProgressStage::Progress {
                state.last_forwarded_progress_unix_ms = Some(event.at_unix_ms);
            }
            state.listeners.clone()
        };
        for (_, listener) in listeners {
            listener(event);
        }
    }

    /// Forwards `event`, dropping intermediate `progress` updates that land
    /// within the minimum interval of the last forwarded one. Lifecycle
    /// stages always go through. Returns true when the event was delivered.
    pub fn emit_throttled(&self, event: &ProgressEvent) -> bool {
        if event.stage.is_lifecycle() {
            self.emit(event);
            return true;
        }
        let within_interval = {
            let state = self.lock();
            state
                .last_forwarded_progress_unix_ms
                .is_some_and(|last| event.at_unix_ms.saturating_sub(last) < self.min_interval_ms)
        };
        if within_interval {
            tracing::trace!(
                stage = event.stage.as_str(),
                at_unix_ms = event.at_unix_ms,
                "dropped throttled progress event"
            );
            return false;
        }
        self.emit(event);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressEmitterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
