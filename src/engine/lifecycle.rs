//! Engine lifecycle state
//!
//! State enum, activation flag, single-flight bookkeeping and the
//! first-init listeners. The startup steps themselves live on the engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

/// Where the engine is in its startup protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing built yet (default state)
    #[default]
    Uninitialized,
    /// A startup attempt is in flight
    Initializing,
    /// Graph built; synthesis operations run
    Ready,
    /// Platform cannot host the graph; every operation is a no-op
    Degraded,
    /// Last attempt failed; the next `ensure_ready` retries
    FailedRetryable,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::Degraded => "degraded",
            EngineState::FailedRetryable => "failed_retryable",
        }
    }

    /// Ready and Degraded are never left
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Degraded)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `ensure_ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    NotReady,
    Ready,
    Degraded,
}

impl Readiness {
    /// Whether synthesis operations should go ahead
    pub fn can_play(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl From<EngineState> for Readiness {
    fn from(state: EngineState) -> Self {
        match state {
            EngineState::Ready => Readiness::Ready,
            EngineState::Degraded => Readiness::Degraded,
            _ => Readiness::NotReady,
        }
    }
}

// ============================================================================
// Init Listeners
// ============================================================================

type InitCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct ListenerTable {
    fired: bool,
    next_id: u64,
    pending: Vec<(u64, InitCallback)>,
}

/// Handle returned by `on_audio_init`
///
/// Dropping the handle keeps the callback registered; call
/// [`InitSubscription::unsubscribe`] to remove it.
#[derive(Debug)]
#[must_use = "dropping the subscription does not unsubscribe"]
pub struct InitSubscription {
    id: Option<u64>,
    table: Weak<Mutex<ListenerTable>>,
}

impl InitSubscription {
    /// Remove the callback if it has not fired yet
    ///
    /// Returns whether a pending callback was removed.
    pub fn unsubscribe(self) -> bool {
        let (Some(id), Some(table)) = (self.id, self.table.upgrade()) else {
            return false;
        };
        let mut table = table.lock();
        let before = table.pending.len();
        table.pending.retain(|(pending, _)| *pending != id);
        table.pending.len() != before
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Shared lifecycle bookkeeping of one engine
pub(crate) struct Lifecycle {
    state: Mutex<EngineState>,
    activation_allowed: AtomicBool,
    /// Held for the whole of a startup attempt
    pub(crate) gate: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
    last_outcome: Mutex<Readiness>,
    listeners: Arc<Mutex<ListenerTable>>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &*self.state.lock())
            .field("activation_allowed", &self.activation_allowed())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Uninitialized),
            activation_allowed: AtomicBool::new(false),
            gate: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_outcome: Mutex::new(Readiness::NotReady),
            listeners: Arc::new(Mutex::new(ListenerTable::default())),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::info!(from = %*current, to = %state, "engine state change");
            *current = state;
        }
    }

    pub(crate) fn allow_activation(&self) {
        self.activation_allowed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn activation_allowed(&self) -> bool {
        self.activation_allowed.load(Ordering::SeqCst)
    }

    /// Number of completed startup attempts
    pub(crate) fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn last_outcome(&self) -> Readiness {
        *self.last_outcome.lock()
    }

    /// Record the outcome of an attempt and move to the matching state
    pub(crate) fn finish_attempt(&self, state: EngineState) -> Readiness {
        let outcome = Readiness::from(state);
        self.set_state(state);
        *self.last_outcome.lock() = outcome;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Register `callback` to run once the engine first initializes
    ///
    /// Runs `callback` right away when that already happened.
    pub(crate) fn subscribe<F>(&self, callback: F) -> InitSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        let mut table = self.listeners.lock();
        if table.fired {
            drop(table);
            callback();
            return InitSubscription {
                id: None,
                table: Weak::new(),
            };
        }
        let id = table.next_id;
        table.next_id += 1;
        table.pending.push((id, Box::new(callback)));
        InitSubscription {
            id: Some(id),
            table: Arc::downgrade(&self.listeners),
        }
    }

    /// Run pending init callbacks if the engine has initialized
    ///
    /// Callbacks run at most once, outside every lifecycle lock.
    pub(crate) fn notify_initialized(&self) {
        if !self.state().is_terminal() {
            return;
        }
        let pending = {
            let mut table = self.listeners.lock();
            if table.fired {
                return;
            }
            table.fired = true;
            std::mem::take(&mut table.pending)
        };
        for (_, callback) in pending {
            callback();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_listeners(&self) -> usize {
        self.listeners.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_default_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), EngineState::Uninitialized);
        assert!(!lifecycle.activation_allowed());
        assert_eq!(lifecycle.last_outcome(), Readiness::NotReady);
        assert_eq!(lifecycle.attempts(), 0);
    }

    #[test]
    fn test_readiness_from_state() {
        assert_eq!(Readiness::from(EngineState::Ready), Readiness::Ready);
        assert_eq!(Readiness::from(EngineState::Degraded), Readiness::Degraded);
        assert_eq!(Readiness::from(EngineState::FailedRetryable), Readiness::NotReady);
        assert!(Readiness::Ready.can_play());
        assert!(!Readiness::Degraded.can_play());
    }

    #[test]
    fn test_failed_attempt_does_not_fire_listeners() {
        let lifecycle = Lifecycle::new();
        let (count, callback) = counter();
        let _subscription = lifecycle.subscribe(callback);

        assert_eq!(lifecycle.finish_attempt(EngineState::FailedRetryable), Readiness::NotReady);
        lifecycle.notify_initialized();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.attempts(), 1);

        assert_eq!(lifecycle.finish_attempt(EngineState::Ready), Readiness::Ready);
        lifecycle.notify_initialized();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.pending_listeners(), 0);
    }

    #[test]
    fn test_listeners_fire_once() {
        let lifecycle = Lifecycle::new();
        let (count, callback) = counter();
        let _subscription = lifecycle.subscribe(callback);
        lifecycle.finish_attempt(EngineState::Degraded);
        lifecycle.notify_initialized();
        lifecycle.notify_initialized();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_subscriber_runs_immediately() {
        let lifecycle = Lifecycle::new();
        lifecycle.finish_attempt(EngineState::Ready);
        lifecycle.notify_initialized();
        let (count, callback) = counter();
        let subscription = lifecycle.subscribe(callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!subscription.unsubscribe());
    }

    #[test]
    fn test_unsubscribe_removes_pending_callback() {
        let lifecycle = Lifecycle::new();
        let (count, callback) = counter();
        let subscription = lifecycle.subscribe(callback);
        assert!(subscription.unsubscribe());
        lifecycle.finish_attempt(EngineState::Ready);
        lifecycle.notify_initialized();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
