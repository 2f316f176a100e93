//! Proactive OAuth refresh with bounded retry and terminal escalation.
//!
//! One timer and one in-flight refresh per integration id. Timers fire at
//! 80% of the token's remaining lifetime; transient failures retry with
//! exponential backoff, permanent ones demote the integration's status
//! indicator to `auth_expired` and disarm the timer.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};

use reins_core::{IntegrationError, IntegrationResult};

use crate::types::{Credential, CredentialType};
use crate::vault::{normalize_integration_id, CredentialVault};

/// Indicator written when refresh fails permanently.
pub const STATUS_INDICATOR_AUTH_EXPIRED: &str = "auth_expired";

/// Upper clamp for scheduled timer delays.
pub const MAX_TIMER_DELAY_MS: u64 = i32::MAX as u64;

/// Default substring markers classifying an error as transient.
pub const DEFAULT_TRANSIENT_ERROR_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "temporar",
    "rate limit",
    "429",
    "502",
    "503",
    "econnreset",
    "enotfound",
    "eai_again",
    "fetch failed",
];

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

type RefreshOutcome = IntegrationResult<Credential>;
type TransientClassifier = Arc<dyn Fn(&IntegrationError) -> bool + Send + Sync>;

/// Outcome of registering an in-flight refresh slot for an integration id.
enum InFlightSlot {
    /// A refresh is already running; await this receiver for its outcome.
    Existing(watch::Receiver<Option<RefreshOutcome>>),
    /// No refresh was running; this sender must be used to publish the outcome.
    New(watch::Sender<Option<RefreshOutcome>>),
}

/// Tokens returned by a refresh exchange. Absent fields fall back to the
/// prior credential's values when merged.
#[derive(Debug, Clone, Default)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub token_type: Option<String>,
}

/// Everything a refresher needs for one exchange attempt.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    pub integration_id: String,
    pub credential: Credential,
    pub refresh_token: String,
    pub attempt: usize,
    pub max_attempts: usize,
}

/// Caller-supplied exchange of a refresh token for fresh access credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, context: &RefreshContext) -> IntegrationResult<RefreshedTokens>;
}

/// Sink for status-indicator demotions on permanent refresh failure.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update_status(&self, integration_id: &str, indicator: &str, message: &str);
}

/// Tuning knobs for the refresh manager.
#[derive(Clone)]
pub struct RefreshOptions {
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Case-insensitive substrings marking an error transient. Replaced
    /// wholesale by deployments with different upstream error surfaces.
    pub transient_markers: Vec<String>,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            transient_markers: DEFAULT_TRANSIENT_ERROR_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }
}

/// Computes the scheduled delay for a token expiring at `expires_at`:
/// `floor(ttl * 0.8)` milliseconds from `now`, clamped to
/// `[0, MAX_TIMER_DELAY_MS]`. Already-expired tokens schedule immediately.
pub fn compute_refresh_delay_ms(expires_at: &str, now: DateTime<Utc>) -> IntegrationResult<u64> {
    let expires = DateTime::parse_from_rfc3339(expires_at)
        .map_err(|_| {
            IntegrationError::auth(format!(
                "credential expiry '{expires_at}' is not a valid instant"
            ))
        })?
        .with_timezone(&Utc);
    let ttl_ms = expires.signed_duration_since(now).num_milliseconds();
    if ttl_ms <= 0 {
        return Ok(0);
    }
    let delay = (ttl_ms as u128) * 8 / 10;
    Ok(u64::try_from(delay)
        .unwrap_or(MAX_TIMER_DELAY_MS)
        .min(MAX_TIMER_DELAY_MS))
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct RefreshManagerState {
    timer_generation: AtomicU64,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<RefreshOutcome>>>>,
}

/// Keeps OAuth tokens fresh without user involvement.
pub struct RefreshManager {
    vault: Arc<dyn CredentialVault>,
    status_updater: Arc<dyn StatusUpdater>,
    options: RefreshOptions,
    classifier: Option<TransientClassifier>,
    state: Arc<RefreshManagerState>,
}

impl RefreshManager {
    /// Creates a manager over `vault`, demoting through `status_updater`.
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        status_updater: Arc<dyn StatusUpdater>,
        options: RefreshOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault,
            status_updater,
            options,
            classifier: None,
            state: Arc::new(RefreshManagerState {
                timer_generation: AtomicU64::new(1),
                timers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Replaces the transient-error classifier outright. The default matches
    /// [`RefreshOptions::transient_markers`] against the message chain.
    /// Install overrides before scheduling: already-armed timers keep the
    /// manager handle they were spawned with.
    pub fn with_transient_classifier(
        self: Arc<Self>,
        classifier: impl Fn(&IntegrationError) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault: self.vault.clone(),
            status_updater: self.status_updater.clone(),
            options: self.options.clone(),
            classifier: Some(Arc::new(classifier)),
            state: self.state.clone(),
        })
    }

    /// Loads the integration's OAuth credential and arms a single timer at
    /// 80% of its remaining TTL. Re-scheduling replaces the prior timer.
    /// Returns the computed delay in milliseconds.
    pub fn schedule_refresh<'a>(
        self: &'a Arc<Self>,
        integration_id: &'a str,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Pin<Box<dyn Future<Output = IntegrationResult<u64>> + Send + 'a>> {
        // Boxed explicitly (rather than left as `async fn`) because this
        // function participates in a call cycle with `perform_refresh`
        // through a spawned task; leaving it as an opaque `impl Future`
        // makes that cycle's Send-ness unprovable to the compiler.
        Box::pin(async move {
            let id = normalize_integration_id(integration_id)?;
            let credential = self
                .vault
                .retrieve_of_type(&id, CredentialType::OAuth)
                .await?
                .ok_or_else(|| {
                    IntegrationError::auth(format!("no oauth credential stored for '{id}'"))
                })?;
            let Credential::OAuth { expires_at, .. } = &credential else {
                return Err(IntegrationError::auth(format!(
                    "credential for '{id}' is not refreshable"
                )));
            };
            let delay_ms = compute_refresh_delay_ms(expires_at, Utc::now())?;

            let generation = self.state.timer_generation.fetch_add(1, Ordering::SeqCst);
            let manager = Arc::clone(self);
            let timer_id = id.clone();
            // The timers lock is held across spawn + insert so the task cannot
            // observe the map before its own handle is registered.
            let mut timers = self.lock_timers()?;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                // Retire this timer's registration; a newer generation stays.
                if let Ok(mut timers) = manager.state.timers.lock() {
                    if timers
                        .get(&timer_id)
                        .is_some_and(|armed| armed.generation == generation)
                    {
                        timers.remove(&timer_id);
                    }
                }
                if let Err(error) = manager.refresh_now(&timer_id, refresher).await {
                    tracing::warn!(
                        integration_id = %timer_id,
                        error = %error,
                        "scheduled token refresh failed"
                    );
                }
            });
            if let Some(previous) = timers.insert(id.clone(), ArmedTimer { generation, handle }) {
                previous.handle.abort();
            }
            drop(timers);
            tracing::debug!(integration_id = %id, delay_ms, "scheduled token refresh");
            Ok(delay_ms)
        })
    }

    /// Refreshes immediately, deduplicating concurrent callers: while a
    /// refresh for `integration_id` is in flight, later callers await and
    /// observe the same outcome.
    pub async fn refresh_now(
        self: &Arc<Self>,
        integration_id: &str,
        refresher: Arc<dyn TokenRefresher>,
    ) -> IntegrationResult<Credential> {
        let id = normalize_integration_id(integration_id)?;

        let tx = match self.register_in_flight(&id)? {
            InFlightSlot::Existing(mut rx) => loop {
                let settled = rx.borrow().clone();
                if let Some(outcome) = settled {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(IntegrationError::operation(
                        "in-flight refresh slot dropped before settling",
                    ));
                }
            },
            InFlightSlot::New(tx) => tx,
        };

        let outcome = self.perform_refresh(&id, refresher).await;
        if let Ok(mut in_flight) = self.state.in_flight.lock() {
            in_flight.remove(&id);
        }
        let _ = tx.send(Some(outcome.clone()));
        outcome
    }

    /// Disarms the timer and forgets any in-flight entry for `integration_id`.
    pub fn cancel(&self, integration_id: &str) -> bool {
        let Ok(id) = normalize_integration_id(integration_id) else {
            return false;
        };
        let mut cancelled = false;
        if let Ok(mut timers) = self.state.timers.lock() {
            if let Some(armed) = timers.remove(&id) {
                armed.handle.abort();
                cancelled = true;
            }
        }
        if let Ok(mut in_flight) = self.state.in_flight.lock() {
            in_flight.remove(&id);
        }
        cancelled
    }

    /// Disarms every timer and forgets all in-flight entries.
    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.state.timers.lock() {
            for (_, armed) in timers.drain() {
                armed.handle.abort();
            }
        }
        if let Ok(mut in_flight) = self.state.in_flight.lock() {
            in_flight.clear();
        }
    }

    /// Returns true while a timer is armed for `integration_id`.
    pub fn has_scheduled(&self, integration_id: &str) -> bool {
        let Ok(id) = normalize_integration_id(integration_id) else {
            return false;
        };
        self.state
            .timers
            .lock()
            .map(|timers| timers.contains_key(&id))
            .unwrap_or(false)
    }

    fn lock_timers(&self) -> IntegrationResult<MutexGuard<'_, HashMap<String, ArmedTimer>>> {
        self.state
            .timers
            .lock()
            .map_err(|_| IntegrationError::operation("refresh timer table lock poisoned"))
    }

    fn lock_in_flight(
        &self,
    ) -> IntegrationResult<MutexGuard<'_, HashMap<String, watch::Receiver<Option<RefreshOutcome>>>>>
    {
        self.state
            .in_flight
            .lock()
            .map_err(|_| IntegrationError::operation("refresh in-flight table lock poisoned"))
    }

    /// Registers `id` as in-flight, returning the existing receiver if a
    /// refresh is already running or a fresh sender otherwise. Kept
    /// synchronous so the lock guard never spans an `.await` point.
    fn register_in_flight(&self, id: &str) -> IntegrationResult<InFlightSlot> {
        let mut in_flight = self.lock_in_flight()?;
        if let Some(existing) = in_flight.get(id) {
            return Ok(InFlightSlot::Existing(existing.clone()));
        }
        let (tx, rx) = watch::channel(None);
        in_flight.insert(id.to_string(), rx);
        Ok(InFlightSlot::New(tx))
    }

    fn is_transient(&self, error: &IntegrationError) -> bool {
        if let Some(classifier) = &self.classifier {
            return classifier(error);
        }
        self.options
            .transient_markers
            .iter()
            .any(|marker| error.message_chain_contains(marker))
    }

    fn backoff_ms(&self, attempt: usize) -> u64 {
        let shift = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let scaled = self
            .options
            .initial_backoff_ms
            .checked_shl(shift)
            .unwrap_or(u64::MAX);
        scaled.min(self.options.max_backoff_ms)
    }

    async fn perform_refresh(
        self: &Arc<Self>,
        id: &str,
        refresher: Arc<dyn TokenRefresher>,
    ) -> RefreshOutcome {
        let mut current = self
            .vault
            .retrieve_of_type(id, CredentialType::OAuth)
            .await?
            .ok_or_else(|| {
                IntegrationError::auth(format!("no oauth credential stored for '{id}'"))
            })?;

        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let refresh_token = match &current {
                Credential::OAuth { refresh_token, .. } => refresh_token.clone(),
                _ => {
                    return Err(IntegrationError::auth(format!(
                        "credential for '{id}' is not refreshable"
                    )))
                }
            };
            if refresh_token.trim().is_empty() {
                let error = IntegrationError::auth(format!(
                    "oauth credential for '{id}' has no refresh token"
                ));
                return Err(self.escalate(id, error).await);
            }

            let context = RefreshContext {
                integration_id: id.to_string(),
                credential: current.clone(),
                refresh_token,
                attempt,
                max_attempts,
            };
            tracing::debug!(integration_id = %id, attempt, max_attempts, "refreshing oauth token");

            match refresher.refresh(&context).await {
                Ok(tokens) => {
                    let merged = merge_refreshed_tokens(&current, tokens);
                    self.vault.store(id, merged.clone()).await?;
                    // A successful refresh always leaves the next timer armed.
                    self.schedule_refresh(id, refresher).await?;
                    tracing::info!(integration_id = %id, attempt, "oauth token refreshed");
                    return Ok(merged);
                }
                Err(error) => {
                    let transient = self.is_transient(&error);
                    if !transient || attempt >= max_attempts {
                        return Err(self.escalate(id, error).await);
                    }
                    let backoff = self.backoff_ms(attempt);
                    tracing::debug!(
                        integration_id = %id,
                        attempt,
                        backoff_ms = backoff,
                        error = %error,
                        "transient refresh failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    // Reload between attempts; fall back to the prior value
                    // when the reload itself fails.
                    match self.vault.retrieve_of_type(id, CredentialType::OAuth).await {
                        Ok(Some(reloaded)) => current = reloaded,
                        Ok(None) | Err(_) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn escalate(&self, id: &str, error: IntegrationError) -> IntegrationError {
        self.status_updater
            .update_status(id, STATUS_INDICATOR_AUTH_EXPIRED, error.message())
            .await;
        if let Ok(mut timers) = self.state.timers.lock() {
            if let Some(armed) = timers.remove(id) {
                armed.handle.abort();
            }
        }
        tracing::warn!(
            integration_id = %id,
            error = %error,
            "oauth refresh failed permanently"
        );
        error
    }
}

/// Merges exchange output into the prior credential, preserving
/// `refresh_token`, `scopes`, and `token_type` when the exchange omits them.
fn merge_refreshed_tokens(current: &Credential, tokens: RefreshedTokens) -> Credential {
    let (prior_refresh, prior_expires, prior_scopes, prior_token_type) = match current {
        Credential::OAuth {
            refresh_token,
            expires_at,
            scopes,
            token_type,
            ..
        } => (
            refresh_token.clone(),
            expires_at.clone(),
            scopes.clone(),
            token_type.clone(),
        ),
        _ => (String::new(), String::new(), Vec::new(), String::new()),
    };
    Credential::OAuth {
        access_token: tokens.access_token,
        refresh_token: tokens
            .refresh_token
            .filter(|token| !token.trim().is_empty())
            .unwrap_or(prior_refresh),
        expires_at: tokens.expires_at.unwrap_or(prior_expires),
        scopes: tokens.scopes.unwrap_or(prior_scopes),
        token_type: tokens.token_type.unwrap_or(prior_token_type),
    }
}
