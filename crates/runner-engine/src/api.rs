//! Public API for the in-process task runner.

use serde::{Deserialize, Serialize};

use taskrun_core::settings::RunnerSettings;

use crate::observer::Output;
use crate::task::{Recipe, TaskState};

/// Lifecycle event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RunnerEvent {
    /// The runner started driving the recipe.
    Started,
    /// Cancellation of the recipe was requested.
    CancelRequested,
    /// The head task moved to a new stage.
    TaskStateChanged {
        /// Task id.
        task_id: String,
        /// New stage.
        state: TaskState,
    },
    /// A task reached a terminal disposition and the cursor is advancing.
    TaskFinished {
        /// Task id.
        task_id: String,
        /// Terminal disposition (`Complete`, `Fail`, or `Cancelled`).
        state: TaskState,
        /// Error recorded on the task, if any.
        error: Option<String>,
    },
    /// A non-fatal problem worth surfacing.
    Warning {
        /// Warning message.
        message: String,
    },
    /// All tasks have been driven to a terminal state.
    RecipeComplete,
}

/// Terminal record of one task, preserved past its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: String,
    /// Terminal disposition (`Complete`, `Fail`, or `Cancelled`).
    pub state: TaskState,
    /// Error message recorded on the task, if any.
    pub error: Option<String>,
}

/// Per-task results of a completed recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeOutcome {
    /// One entry per task, in recipe order.
    pub tasks: Vec<TaskOutcome>,
}

impl RecipeOutcome {
    /// Number of tasks that did not complete cleanly.
    pub fn failed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.state != TaskState::Complete || task.error.is_some())
            .count()
    }
}

/// Handle to a running recipe.
pub struct RunnerHandle {
    pub(crate) inner: std::sync::Arc<crate::runner::RunnerInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<RecipeOutcome>>,
}

/// Start driving `recipe` on a background task.
pub fn start_runner(settings: RunnerSettings, recipe: Recipe) -> RunnerHandle {
    crate::runner::start_runner(settings, recipe)
}

impl RunnerHandle {
    /// Subscribe to the lifecycle event stream.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RunnerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe to the observer output stream (child stdout plus harness
    /// messages).
    pub fn subscribe_output(&self) -> tokio::sync::broadcast::Receiver<Output> {
        self.inner.observers.subscribe()
    }

    /// Cancel the recipe. The running child, if any, is killed; every
    /// remaining task is cancelled as the cursor reaches it.
    pub fn cancel(&self) {
        self.inner.request_cancel();
    }

    /// Wait for the recipe to finish, returning the per-task outcomes.
    pub async fn wait(self) -> anyhow::Result<RecipeOutcome> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("runner task join error: {err}")),
        }
    }
}
