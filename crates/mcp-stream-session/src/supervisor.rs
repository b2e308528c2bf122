//! Process-wide supervisor owning one background task per session.

use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Default time `shutdown` waits for session tasks to wind down.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor error.
///
/// These signal broken startup/shutdown wiring in the hosting process and are
/// not meant to be retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Task supervisor is not initialized")]
    NotRunning,
    #[error("Task supervisor has been shut down")]
    ShutDown,
    #[error("Task supervisor already started")]
    AlreadyStarted,
}

enum State {
    Idle,
    Running {
        scope: CancellationToken,
        tracker: TaskTracker,
    },
    Stopped,
}

/// Supervisor for session tasks.
///
/// Lifecycle is `new` → `start` → `shutdown`. Every task spawned while
/// running receives a child of the supervisor's cancellation scope;
/// `shutdown` cancels the scope and waits for all tasks to exit.
pub struct TaskSupervisor {
    state: Mutex<State>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    /// Create a supervisor that is not yet running.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
        }
    }

    /// Open the cancellation scope.
    ///
    /// # Errors
    /// Returns error if already started or already shut down.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::Idle => {
                *state = State::Running {
                    scope: CancellationToken::new(),
                    tracker: TaskTracker::new(),
                };
                tracing::info!("Task supervisor started");
                Ok(())
            }
            State::Running { .. } => Err(SupervisorError::AlreadyStarted),
            State::Stopped => Err(SupervisorError::ShutDown),
        }
    }

    /// Whether tasks can currently be spawned.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Running { .. }
        )
    }

    /// Number of session tasks still alive.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Running { tracker, .. } => tracker.len(),
            State::Idle | State::Stopped => 0,
        }
    }

    /// Spawn the background task for a session.
    ///
    /// `task` is given a token that is cancelled on shutdown; the future it
    /// returns must finish promptly once the token fires.
    ///
    /// # Errors
    /// Returns error if the supervisor is not running.
    pub fn spawn<F, Fut>(&self, session_id: &str, task: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (token, tracker) = match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Running { scope, tracker } => (scope.child_token(), tracker.clone()),
            State::Idle => return Err(SupervisorError::NotRunning),
            State::Stopped => return Err(SupervisorError::ShutDown),
        };

        let session_id = session_id.to_string();
        let fut = task(token);
        tracker.spawn(async move {
            fut.await;
            tracing::debug!(%session_id, "Session task exited");
        });
        Ok(())
    }

    /// Cancel every session task and wait up to `timeout` for them to exit.
    ///
    /// Idempotent; a supervisor that was never started just moves to stopped.
    pub async fn shutdown(&self, timeout: Duration) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Stopped,
        );
        let State::Running { scope, tracker } = previous else {
            return;
        };

        tracing::info!(tasks = tracker.len(), "Shutting down task supervisor");
        scope.cancel();
        tracker.close();
        if tokio::time::timeout(timeout, tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = tracker.len(),
                timeout_secs = timeout.as_secs(),
                "Session tasks did not exit before shutdown timeout"
            );
        } else {
            tracing::info!("All session tasks stopped");
        }
    }
}
