//! Single-flight wrapper with one trailing rerun.
//!
//! Change events arrive in bursts (saving a form touches several rows), but an
//! export only needs to run once the burst has settled. An [`ActionCondenser`]
//! runs its action at most once at a time; triggers that arrive while a run is
//! in flight collapse into exactly one follow-up run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::sync::types::{BoxFuture, SyncResult};

type Action = dyn Fn() -> BoxFuture<'static, SyncResult<()>> + Send + Sync;

#[derive(Debug, Default)]
struct CondenseState {
    running: bool,
    rerun_requested: bool,
}

struct Inner {
    name: String,
    action: Box<Action>,
    state: Mutex<CondenseState>,
    executions: AtomicUsize,
}

/// A condensed asynchronous action.
///
/// Cloning shares the same state, so every clone collapses into the same
/// in-flight run.
#[derive(Clone)]
pub struct ActionCondenser {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ActionCondenser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCondenser")
            .field("name", &self.inner.name)
            .field("executions", &self.executions())
            .finish_non_exhaustive()
    }
}

impl ActionCondenser {
    /// Wrap `action`. `name` only shows up in logs.
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, SyncResult<()>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                action: Box::new(action),
                state: Mutex::new(CondenseState::default()),
                executions: AtomicUsize::new(0),
            }),
        }
    }

    /// Run the action, or schedule a rerun if it is already running.
    ///
    /// Returns once this call's work is done: immediately when it only
    /// flagged a rerun, otherwise after the last rerun has finished. Errors
    /// are logged and never returned.
    pub async fn trigger(&self) {
        {
            let mut state = self.lock_state();
            if state.running {
                state.rerun_requested = true;
                debug!(action = %self.inner.name, "Action in flight, rerun requested");
                return;
            }
            state.running = true;
        }

        let mut guard = RunningGuard {
            condenser: self,
            armed: true,
        };
        loop {
            self.inner.executions.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = (self.inner.action)().await {
                error!(action = %self.inner.name, error = %e, "Error in condensed action");
            }

            let mut state = self.lock_state();
            if state.rerun_requested {
                state.rerun_requested = false;
            } else {
                state.running = false;
                guard.armed = false;
                break;
            }
        }
    }

    /// Whether a run is currently in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Total number of times the action has been started.
    #[must_use]
    pub fn executions(&self) -> usize {
        self.inner.executions.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CondenseState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running flag if a run is abandoned, either because the action
/// panicked or because the `trigger` future was dropped mid-run.
struct RunningGuard<'a> {
    condenser: &'a ActionCondenser,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.condenser.lock_state();
            state.running = false;
            state.rerun_requested = false;
            debug!(action = %self.condenser.inner.name, "Condensed run abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::SyncError;
    use tokio::sync::Notify;

    /// Condenser whose first run blocks until `gate` is notified.
    fn gated(gate: Arc<Notify>, fail: bool) -> ActionCondenser {
        let calls = Arc::new(AtomicUsize::new(0));
        ActionCondenser::new("test", move || {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    gate.notified().await;
                }
                if fail {
                    Err(SyncError::Config("boom".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn test_single_call_runs_once() {
        let condenser = ActionCondenser::new("once", || Box::pin(async { Ok(()) }));
        condenser.trigger().await;
        assert_eq!(condenser.executions(), 1);
        assert!(!condenser.is_running());
    }

    #[tokio::test]
    async fn test_burst_collapses_into_one_rerun() {
        let gate = Arc::new(Notify::new());
        let condenser = gated(Arc::clone(&gate), false);

        let first = tokio::spawn({
            let condenser = condenser.clone();
            async move { condenser.trigger().await }
        });
        tokio::task::yield_now().await;
        assert!(condenser.is_running());

        for _ in 0..10 {
            condenser.trigger().await;
        }
        assert_eq!(condenser.executions(), 1);

        gate.notify_one();
        first.await.unwrap();

        assert_eq!(condenser.executions(), 2);
        assert!(!condenser.is_running());
    }

    #[tokio::test]
    async fn test_errors_do_not_block_rerun() {
        let gate = Arc::new(Notify::new());
        let condenser = gated(Arc::clone(&gate), true);

        let first = tokio::spawn({
            let condenser = condenser.clone();
            async move { condenser.trigger().await }
        });
        tokio::task::yield_now().await;
        condenser.trigger().await;

        gate.notify_one();
        first.await.unwrap();
        assert_eq!(condenser.executions(), 2);

        // still usable afterwards
        condenser.trigger().await;
        assert_eq!(condenser.executions(), 3);
    }

    #[tokio::test]
    async fn test_independent_condensers_overlap() {
        let gate = Arc::new(Notify::new());
        let slow = gated(Arc::clone(&gate), false);
        let fast = ActionCondenser::new("fast", || Box::pin(async { Ok(()) }));

        let handle = tokio::spawn({
            let slow = slow.clone();
            async move { slow.trigger().await }
        });
        tokio::task::yield_now().await;

        fast.trigger().await;
        assert_eq!(fast.executions(), 1);
        assert!(slow.is_running());

        gate.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_trigger_does_not_wedge() {
        let gate = Arc::new(Notify::new());
        let condenser = gated(gate, false);

        let dropped =
            tokio::time::timeout(std::time::Duration::from_millis(20), condenser.trigger()).await;
        assert!(dropped.is_err());
        assert!(!condenser.is_running());

        condenser.trigger().await;
        assert_eq!(condenser.executions(), 2);
    }

    #[tokio::test]
    async fn test_panicking_action_does_not_wedge() {
        let calls = Arc::new(AtomicUsize::new(0));
        let condenser = ActionCondenser::new("panics", {
            let calls = Arc::clone(&calls);
            move || -> BoxFuture<'static, SyncResult<()>> {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                Box::pin(async move {
                    assert!(!first, "first run fails hard");
                    Ok(())
                })
            }
        });

        let handle = tokio::spawn({
            let condenser = condenser.clone();
            async move { condenser.trigger().await }
        });
        assert!(handle.await.is_err());
        assert!(!condenser.is_running());

        condenser.trigger().await;
        assert_eq!(condenser.executions(), 2);
    }
}
