//! The task state machine and the recipe cursor.
//!
//! One tokio task owns every piece of mutable state. It advances the head
//! task one stage per `step` call and, while a child runs, parks itself on
//! the per-run event channel; the child-exit path re-arms it. External
//! cancellation flips a flag and nudges the runner through a `Notify`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use portable_pty::ExitStatus;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::{Instant, timeout_at};
use tracing::warn;

use taskrun_core::settings::RunnerSettings;

use crate::api::{RecipeOutcome, RunnerEvent, RunnerHandle, TaskOutcome};
use crate::observer::{ObserverHub, StreamKind};
use crate::reporter::{Reporter, TaskStatus};
use crate::supervisor::{self, EXPIRE_TIME_FORMAT, RunEvent, RunEventKind, SIGKILL_SIGNO};
use crate::task::{Recipe, Task, TaskError, TaskState};
use crate::{env, fetch, metadata};

/// How long finalize waits for the pty reader to drain after the child is
/// gone.
const PTY_FLUSH_GRACE: Duration = Duration::from_millis(500);

pub(crate) struct RunnerInner {
    pub(crate) event_tx: broadcast::Sender<RunnerEvent>,
    pub(crate) observers: ObserverHub,
    cancel_requested: AtomicBool,
    notify: Notify,
}

impl RunnerInner {
    pub(crate) fn request_cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(RunnerEvent::CancelRequested);
            self.notify.notify_waiters();
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

enum Step {
    /// Step again promptly.
    Continue,
    /// A child is running; the exit path re-arms the machine.
    Suspend,
    /// No tasks left.
    RecipeComplete,
}

struct RunnerRuntime {
    settings: RunnerSettings,
    http: reqwest::Client,
    reporter: Reporter,
    recipe: Recipe,
    cursor: usize,
    run_serial: u64,
    run_tx: mpsc::UnboundedSender<RunEvent>,
    run_rx: mpsc::UnboundedReceiver<RunEvent>,
    outcomes: Vec<TaskOutcome>,
    inner: Arc<RunnerInner>,
}

impl RunnerRuntime {
    fn current(&self) -> &Task {
        &self.recipe.tasks[self.cursor]
    }

    fn emit(&self, event: RunnerEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn observe(&self, line: impl Into<String>) {
        self.inner.observers.write(StreamKind::Stderr, line);
    }

    fn set_state(&mut self, state: TaskState) {
        let task = &mut self.recipe.tasks[self.cursor];
        task.state = state;
        let task_id = task.task_id.clone();
        self.emit(RunnerEvent::TaskStateChanged { task_id, state });
    }

    fn fail(&mut self, error: TaskError) {
        self.recipe.tasks[self.cursor].error = Some(error);
        self.set_state(TaskState::Fail);
    }

    /// Fold an external cancellation into the head task before stepping it.
    /// Terminal processing (`Fail`, `Complete`) is allowed to finish so its
    /// reporting still happens; a running child is handled in `wait_running`.
    fn apply_pending_cancel(&mut self) {
        if !self.inner.cancel_requested() {
            return;
        }
        match self.current().state {
            TaskState::Running
            | TaskState::Aborted
            | TaskState::Fail
            | TaskState::Cancelled
            | TaskState::Complete => {}
            _ => self.set_state(TaskState::Cancelled),
        }
    }

    async fn step(&mut self) -> Step {
        match self.current().state {
            TaskState::Idle => {
                let task = self.current();
                let line = format!(
                    "** Fetching task: {} [{}]",
                    task.task_id,
                    task.path.display()
                );
                self.observe(line);
                self.set_state(TaskState::Fetch);
            }
            TaskState::Fetch => {
                let res = fetch::fetch_task(
                    &self.http,
                    &self.recipe.tasks[self.cursor],
                    &self.settings,
                )
                .await;
                match res {
                    Ok(()) => self.set_state(TaskState::Fetching),
                    Err(err) => self.fail(err.into()),
                }
            }
            TaskState::Fetching => self.set_state(TaskState::Metadata),
            TaskState::Metadata => {
                self.observe("** Updating metadata");
                match metadata::update_task(&mut self.recipe.tasks[self.cursor]) {
                    Ok(()) => self.set_state(TaskState::Env),
                    Err(err) => self.fail(err.into()),
                }
            }
            TaskState::Env => {
                self.observe("** Updating env vars");
                let env = env::build_env(&self.recipe, self.cursor, &self.settings);
                self.recipe.tasks[self.cursor].freeze_env(env);
                self.set_state(TaskState::Watchdog);
            }
            TaskState::Watchdog => {
                self.observe("** Updating watchdog");
                let seconds = self.current().max_time + self.settings.external_watchdog_grace;
                self.reporter.extend_watchdog(&self.recipe.recipe_uri, seconds);
                self.set_state(TaskState::Dependencies);
            }
            TaskState::Dependencies => {
                self.observe("** Installing dependencies");
                let res = fetch::install_dependencies(
                    &self.recipe.tasks[self.cursor],
                    &self.settings,
                )
                .await;
                match res {
                    Ok(()) => self.set_state(TaskState::Run),
                    Err(err) => self.fail(err.into()),
                }
            }
            TaskState::Run => {
                let task = self.current();
                let line = format!("** Running task: {} [{}]", task.task_id, task.name);
                self.observe(line);
                self.run_serial += 1;
                let res = supervisor::start(
                    &mut self.recipe.tasks[self.cursor],
                    &self.run_tx,
                    self.run_serial,
                    &self.settings,
                );
                match res {
                    Ok(()) => {
                        self.set_state(TaskState::Running);
                        return Step::Suspend;
                    }
                    Err(err) => self.fail(err),
                }
            }
            TaskState::Running | TaskState::Aborted => return Step::Suspend,
            TaskState::Fail => {
                if let Some(message) =
                    self.current().error.as_ref().map(|err| err.to_string())
                {
                    warn!("{message}");
                    self.observe(format!("** ERROR: {message}"));
                    self.reporter.report_status(
                        &self.recipe.tasks[self.cursor],
                        TaskStatus::Aborted,
                        Some(&message),
                    );
                    // the error stays recorded for the recipe summary
                }
                self.set_state(TaskState::Complete);
            }
            TaskState::Cancelled => {
                let line = format!("** Cancelling Task : {}", self.current().task_id);
                self.observe(line);
                self.reporter.report_status(
                    &self.recipe.tasks[self.cursor],
                    TaskStatus::Cancelled,
                    None,
                );
                return self.next_task(TaskState::Cancelled);
            }
            TaskState::Complete => {
                let line = format!("** Completed Task : {}", self.current().task_id);
                self.observe(line);
                return self.next_task(TaskState::Idle);
            }
        }
        Step::Continue
    }

    /// Record the finished head task, release its run resources, and select
    /// the next one. Cancellation carries over to the successor.
    fn next_task(&mut self, carry: TaskState) -> Step {
        let disposition = {
            let task = &mut self.recipe.tasks[self.cursor];
            task.clear_run();
            if carry == TaskState::Cancelled {
                TaskState::Cancelled
            } else if task.error.is_some() {
                TaskState::Fail
            } else {
                TaskState::Complete
            }
        };
        let task = &self.recipe.tasks[self.cursor];
        let outcome = TaskOutcome {
            task_id: task.task_id.clone(),
            state: disposition,
            error: task.error.as_ref().map(|err| err.to_string()),
        };
        self.emit(RunnerEvent::TaskFinished {
            task_id: outcome.task_id.clone(),
            state: outcome.state,
            error: outcome.error.clone(),
        });
        self.outcomes.push(outcome);

        // Anything still in the channel belongs to the finished run.
        while self.run_rx.try_recv().is_ok() {}

        self.cursor += 1;
        match self.recipe.tasks.get_mut(self.cursor) {
            Some(next) => {
                next.state = carry;
                Step::Continue
            }
            None => Step::RecipeComplete,
        }
    }

    /// Park the machine while the child runs, reacting to the four per-run
    /// event sources and to cancellation. Returns once finalize has run.
    async fn wait_running(&mut self) {
        loop {
            let inner = self.inner.clone();
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.cancel_requested() {
                self.cancel_running();
            }

            tokio::select! {
                _ = &mut notified => continue,
                ev = self.run_rx.recv() => {
                    let Some(ev) = ev else { return };
                    if ev.serial != self.run_serial {
                        continue;
                    }
                    match ev.kind {
                        RunEventKind::PtyLine(line) => {
                            self.inner.observers.write(StreamKind::Stdout, line);
                        }
                        RunEventKind::PtyClosed => {
                            if let Some(sources) =
                                self.recipe.tasks[self.cursor].sources.as_mut()
                            {
                                sources.pty.clear();
                            }
                        }
                        RunEventKind::HeartbeatTick => self.emit_heartbeat(),
                        RunEventKind::WatchdogFired => {
                            if self.handle_watchdog_expiry() {
                                // kill failed, the child is lost; finish now
                                self.finish_run().await;
                                return;
                            }
                        }
                        RunEventKind::ChildExited(status) => {
                            self.handle_child_exit(status);
                            self.finish_run().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// External cancellation while a child runs: mark the task cancelled and
    /// funnel through the same SIGKILL teardown the watchdog uses.
    fn cancel_running(&mut self) {
        if self.current().state == TaskState::Cancelled {
            return;
        }
        {
            let task = &mut self.recipe.tasks[self.cursor];
            if let Some(pid) = task.pid {
                let _ = supervisor::kill_child(pid);
            }
            if let Some(sources) = task.sources.as_mut() {
                sources.heartbeat.clear();
            }
        }
        self.set_state(TaskState::Cancelled);
    }

    /// The local watchdog fired. Returns true when the kill failed and the
    /// child must be considered lost.
    fn handle_watchdog_expiry(&mut self) -> bool {
        let task = &mut self.recipe.tasks[self.cursor];
        let Some(pid) = task.pid else { return false };
        let mut child_lost = false;
        if task.state != TaskState::Cancelled {
            if supervisor::kill_child(pid) {
                task.state = TaskState::Aborted;
            } else {
                let error = TaskError::WatchdogKillFailed {
                    pid,
                    signal: SIGKILL_SIGNO,
                };
                warn!("{error}");
                task.error = Some(error);
                if let Some(sources) = task.sources.as_mut() {
                    sources.child.clear();
                }
                child_lost = true;
            }
        }
        if let Some(sources) = task.sources.as_mut() {
            sources.heartbeat.clear();
        }
        child_lost
    }

    fn handle_child_exit(&mut self, status: ExitStatus) {
        let task = &mut self.recipe.tasks[self.cursor];
        let pid = task.pid.unwrap_or(0);
        if !status.success() {
            let error = match task.state {
                TaskState::Aborted => TaskError::WatchdogExpired {
                    pid,
                    signal: SIGKILL_SIGNO,
                },
                TaskState::Cancelled => TaskError::CancelledKill {
                    pid,
                    signal: SIGKILL_SIGNO,
                },
                _ => TaskError::NonZeroExit {
                    command: task.entry_point.first().cloned().unwrap_or_default(),
                    code: status.exit_code() as i32,
                },
            };
            task.error = Some(error);
        }
        task.pid_result = Some(status);
    }

    /// Post-exit finalize: tear down the timers and the child watch, drain
    /// the pty tail, and move the task to its terminal state. Cancellation is
    /// preserved.
    async fn finish_run(&mut self) {
        {
            let task = &mut self.recipe.tasks[self.cursor];
            if let Some(sources) = task.sources.as_mut() {
                sources.heartbeat.clear();
                sources.timeout.clear();
                sources.child.clear();
            }
        }
        self.flush_pty().await;
        let next = {
            let task = self.current();
            if task.state == TaskState::Cancelled {
                None
            } else if task.error.is_some() {
                Some(TaskState::Fail)
            } else {
                Some(TaskState::Complete)
            }
        };
        if let Some(state) = next {
            self.set_state(state);
        }
    }

    /// The child is gone; deliver whatever the pty reader still has buffered,
    /// bounded by a short grace period.
    async fn flush_pty(&mut self) {
        let armed = self
            .current()
            .sources
            .as_ref()
            .map(|sources| sources.pty.is_armed())
            .unwrap_or(false);
        if !armed {
            return;
        }
        let deadline = Instant::now() + PTY_FLUSH_GRACE;
        loop {
            match timeout_at(deadline, self.run_rx.recv()).await {
                Ok(Some(ev)) if ev.serial == self.run_serial => match ev.kind {
                    RunEventKind::PtyLine(line) => {
                        self.inner.observers.write(StreamKind::Stdout, line);
                    }
                    RunEventKind::PtyClosed => {
                        if let Some(sources) = self.recipe.tasks[self.cursor].sources.as_mut() {
                            sources.pty.clear();
                        }
                        return;
                    }
                    _ => {}
                },
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }

    fn emit_heartbeat(&self) {
        let task = self.current();
        let now = Local::now().format(EXPIRE_TIME_FORMAT);
        self.observe(format!(
            "*** Current Time: {now} Localwatchdog at: {}",
            task.expire_time
        ));
    }

    async fn run(mut self) -> anyhow::Result<RecipeOutcome> {
        self.emit(RunnerEvent::Started);
        while self.cursor < self.recipe.tasks.len() {
            self.apply_pending_cancel();
            match self.step().await {
                Step::Continue => {}
                Step::Suspend => self.wait_running().await,
                Step::RecipeComplete => break,
            }
        }
        self.emit(RunnerEvent::RecipeComplete);
        Ok(RecipeOutcome {
            tasks: self.outcomes,
        })
    }
}

pub(crate) fn start_runner(settings: RunnerSettings, recipe: Recipe) -> RunnerHandle {
    let (event_tx, _) = broadcast::channel(1024);
    let observers = ObserverHub::new(4096);
    let inner = Arc::new(RunnerInner {
        event_tx,
        observers,
        cancel_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let join = tokio::spawn(run_runner(inner.clone(), settings, recipe));
    RunnerHandle { inner, join }
}

async fn run_runner(
    inner: Arc<RunnerInner>,
    settings: RunnerSettings,
    recipe: Recipe,
) -> anyhow::Result<RecipeOutcome> {
    let http = match reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
    {
        Ok(http) => http,
        Err(err) => {
            let message = format!("build http client: {err:#}");
            let _ = inner.event_tx.send(RunnerEvent::Warning {
                message: message.clone(),
            });
            let _ = inner.event_tx.send(RunnerEvent::RecipeComplete);
            return Err(anyhow::anyhow!("{message}"));
        }
    };

    let reporter = Reporter::new(http.clone());
    let (run_tx, run_rx) = mpsc::unbounded_channel();

    let runtime = RunnerRuntime {
        settings,
        http,
        reporter,
        recipe,
        cursor: 0,
        run_serial: 0,
        run_tx,
        run_rx,
        outcomes: Vec::new(),
        inner,
    };
    runtime.run().await
}
