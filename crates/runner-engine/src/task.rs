//! Task and recipe model.
//!
//! A recipe is an ordered list of tasks assigned to this host; the runner
//! advances them one at a time. Tasks are built from the recipe file with
//! harness defaults and populated incrementally (fetched payload, metadata
//! merge, environment build) before they run.

use std::path::{Path, PathBuf};

use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::warn;

use taskrun_core::settings::RunnerSettings;

use crate::fetch::FetchError;
use crate::metadata::MetadataError;
use crate::supervisor::RunSources;

/// Errors recorded on a task while the runner drives it.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Spawning the child under a pty failed.
    #[error("Failed to fork!")]
    Fork,
    /// The task's working directory is unusable.
    #[error("Failed to chdir() to {path}")]
    Chdir {
        /// The directory that could not be entered.
        path: String,
    },
    /// Reserved for stderr-redirection failures around the pty spawn.
    #[error("Failed to redirect stderr")]
    StderrRedirect,
    /// The child exited with a nonzero status on its own.
    #[error("{command} returned non-zero {code}")]
    NonZeroExit {
        /// argv[0] of the entry point.
        command: String,
        /// Decoded exit code (128+signal for signal deaths).
        code: i32,
    },
    /// The local watchdog killed the child.
    #[error("Local watchdog expired! Killed {pid} with {signal}")]
    WatchdogExpired {
        /// Child pid.
        pid: u32,
        /// Signal number delivered.
        signal: i32,
    },
    /// The local watchdog fired but the kill did not land; the child is lost.
    #[error("Local watchdog expired! But we failed to kill {pid} with {signal}")]
    WatchdogKillFailed {
        /// Child pid.
        pid: u32,
        /// Signal number attempted.
        signal: i32,
    },
    /// The child was killed because the task was cancelled.
    #[error("Cancelled by user! Killed {pid} with {signal}")]
    CancelledKill {
        /// Child pid.
        pid: u32,
        /// Signal number delivered.
        signal: i32,
    },
    /// Fetching the task payload failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The task metadata file could not be applied.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Lifecycle stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting to be picked up by the runner.
    Idle,
    /// Fetching the task payload.
    Fetch,
    /// Payload fetched; about to read metadata.
    Fetching,
    /// Merging the task metadata file.
    Metadata,
    /// Building the child environment.
    Env,
    /// Extending the controller-side watchdog.
    Watchdog,
    /// Installing declared dependencies.
    Dependencies,
    /// Spawning the child.
    Run,
    /// Child is running; progress is driven by its event sources.
    Running,
    /// Internal sentinel: the local watchdog killed the child and the exit
    /// has not been collected yet. Collapses into `Fail` on finalize.
    Aborted,
    /// A stage failed; the error is reported and the task completes.
    Fail,
    /// Cancelled from outside.
    Cancelled,
    /// Finished; the runner advances to the next task.
    Complete,
}

/// How a task's payload is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    /// Clone or download-and-unpack from a URL (`git` or `http` scheme).
    Unpack {
        /// Source location.
        url: Url,
    },
    /// Install a named system package that carries the task.
    InstallPackage {
        /// Package name.
        name: String,
    },
}

/// A name/value pair from the recipe (parameters and roles).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// A single unit of work within a recipe.
#[derive(Debug)]
pub struct Task {
    /// Controller-assigned task id.
    pub task_id: String,
    /// Base URL for this task's status and results endpoints.
    pub task_uri: Url,
    /// Task name as shown to observers.
    pub name: String,
    /// Working directory the child runs in.
    pub path: PathBuf,
    /// Position within the recipe.
    pub order: i32,
    /// How to obtain the payload.
    pub fetch: Fetch,
    /// argv vector exec'd in the child.
    pub entry_point: Vec<String>,
    /// Local watchdog budget in seconds.
    pub max_time: u64,
    /// Compatibility mode: suppresses the env-var name prefix.
    pub rhts_compat: bool,
    /// Task parameters, in recipe order.
    pub params: Vec<Param>,
    /// Task roles, in recipe order.
    pub roles: Vec<Param>,
    /// System packages required before the task runs.
    pub dependencies: Vec<String>,
    /// Repositories cloned before the task runs.
    pub repo_dependencies: Vec<Url>,

    pub(crate) state: TaskState,
    pub(crate) pid: Option<u32>,
    pub(crate) pid_result: Option<portable_pty::ExitStatus>,
    pub(crate) env: Option<Vec<String>>,
    pub(crate) expire_time: String,
    pub(crate) error: Option<TaskError>,
    pub(crate) sources: Option<RunSources>,
}

impl Task {
    /// Create a task with harness defaults for everything the recipe does not
    /// specify.
    pub fn new(
        task_id: impl Into<String>,
        task_uri: Url,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        order: i32,
        fetch: Fetch,
        settings: &RunnerSettings,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_uri,
            name: name.into(),
            path: path.into(),
            order,
            fetch,
            entry_point: settings
                .default_entry_point
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            max_time: settings.default_max_time,
            rhts_compat: true,
            params: Vec::new(),
            roles: Vec::new(),
            dependencies: Vec::new(),
            repo_dependencies: Vec::new(),
            state: TaskState::Idle,
            pid: None,
            pid_result: None,
            env: None,
            expire_time: String::new(),
            error: None,
            sources: None,
        }
    }

    /// Current lifecycle stage.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Error recorded by the last failed stage, if any.
    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Install the materialized environment. The environment is frozen once
    /// built; a second attempt is rejected.
    pub(crate) fn freeze_env(&mut self, env: Vec<String>) -> bool {
        if self.env.is_some() {
            warn!("task {}: environment is frozen, ignoring rebuild", self.task_id);
            return false;
        }
        self.env = Some(env);
        true
    }

    /// Release the pid and all per-run event sources. Safe to call on a task
    /// that never ran.
    pub(crate) fn clear_run(&mut self) {
        self.sources = None;
        self.pid = None;
    }
}

/// An ordered collection of tasks assigned to this host.
#[derive(Debug)]
pub struct Recipe {
    /// Controller-assigned job id.
    pub job_id: String,
    /// Recipe-set id within the job.
    pub recipe_set_id: String,
    /// Recipe id.
    pub recipe_id: String,
    /// Base URL for recipe-level endpoints (watchdog extension).
    pub recipe_uri: Url,
    /// Distribution name of the host.
    pub osdistro: String,
    /// Major release of the host OS.
    pub osmajor: String,
    /// OS variant, when the distribution has one.
    pub osvariant: String,
    /// Host architecture.
    pub osarch: String,
    /// Recipe-level parameters.
    pub params: Vec<Param>,
    /// Recipe-level roles.
    pub roles: Vec<Param>,
    /// The tasks, in execution order.
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct RecipeFile {
    job_id: String,
    recipe_set_id: String,
    recipe_id: String,
    recipe_uri: String,
    #[serde(default)]
    osdistro: String,
    #[serde(default)]
    osmajor: String,
    #[serde(default)]
    osvariant: String,
    #[serde(default)]
    osarch: String,
    #[serde(default)]
    params: Vec<Param>,
    #[serde(default)]
    roles: Vec<Param>,
    tasks: Vec<TaskDef>,
}

#[derive(Debug, Deserialize)]
struct TaskDef {
    task_id: String,
    task_uri: String,
    name: String,
    #[serde(default)]
    path: Option<PathBuf>,
    order: i32,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    max_time: Option<u64>,
    #[serde(default)]
    params: Vec<Param>,
    #[serde(default)]
    roles: Vec<Param>,
    #[serde(default)]
    dependencies: Vec<String>,
}

impl TaskDef {
    fn into_task(self, settings: &RunnerSettings) -> anyhow::Result<Task> {
        let fetch = match (&self.url, &self.package) {
            (Some(url), None) => Fetch::Unpack {
                url: Url::parse(url)
                    .with_context(|| format!("task {}: invalid fetch url {url:?}", self.task_id))?,
            },
            (None, Some(name)) => Fetch::InstallPackage { name: name.clone() },
            _ => anyhow::bail!(
                "task {}: exactly one of \"url\" or \"package\" must be set",
                self.task_id
            ),
        };
        let task_uri = Url::parse(&self.task_uri)
            .with_context(|| format!("task {}: invalid task_uri", self.task_id))?;
        let path = match self.path {
            Some(p) => p,
            None => settings
                .task_root
                .join(self.name.trim_start_matches('/')),
        };

        let mut task = Task::new(
            self.task_id,
            task_uri,
            self.name,
            path,
            self.order,
            fetch,
            settings,
        );
        if let Some(ep) = self.entry_point {
            task.entry_point = ep.split_whitespace().map(str::to_string).collect();
        }
        if let Some(max_time) = self.max_time {
            task.max_time = max_time;
        }
        task.params = self.params;
        task.roles = self.roles;
        task.dependencies = self.dependencies;
        Ok(task)
    }
}

/// Load a recipe from a JSON file, applying harness defaults to each task.
pub fn load_recipe(path: &Path, settings: &RunnerSettings) -> anyhow::Result<Recipe> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read recipe {}", path.display()))?;
    let file: RecipeFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse recipe {}", path.display()))?;
    let recipe_uri = Url::parse(&file.recipe_uri).context("invalid recipe_uri")?;

    let mut tasks = Vec::with_capacity(file.tasks.len());
    for def in file.tasks {
        tasks.push(def.into_task(settings)?);
    }

    Ok(Recipe {
        job_id: file.job_id,
        recipe_set_id: file.recipe_set_id,
        recipe_id: file.recipe_id,
        recipe_uri,
        osdistro: file.osdistro,
        osmajor: file.osmajor,
        osvariant: file.osvariant,
        osarch: file.osarch,
        params: file.params,
        roles: file.roles,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RunnerSettings {
        RunnerSettings::default()
    }

    #[test]
    fn new_task_gets_defaults() {
        let task = Task::new(
            "1",
            Url::parse("http://lab/recipes/1/tasks/1/").unwrap(),
            "/examples/smoke",
            "/mnt/tests/examples/smoke",
            1,
            Fetch::InstallPackage {
                name: "smoke".into(),
            },
            &settings(),
        );
        assert_eq!(task.entry_point, vec!["make", "run"]);
        assert_eq!(task.max_time, RunnerSettings::DEFAULT_MAX_TIME);
        assert!(task.rhts_compat);
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[test]
    fn env_freezes_after_first_build() {
        let mut task = Task::new(
            "1",
            Url::parse("http://lab/t/1/").unwrap(),
            "t",
            "/tmp",
            1,
            Fetch::InstallPackage { name: "t".into() },
            &settings(),
        );
        assert!(task.freeze_env(vec!["A=1".into()]));
        assert!(!task.freeze_env(vec!["A=2".into()]));
        assert_eq!(task.env.as_deref(), Some(&["A=1".to_string()][..]));
    }

    #[test]
    fn recipe_file_maps_url_and_package_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.json");
        std::fs::write(
            &path,
            r#"{
                "job_id": "12", "recipe_set_id": "3", "recipe_id": "7",
                "recipe_uri": "http://lab/recipes/7/",
                "osarch": "x86_64",
                "tasks": [
                    {"task_id": "100", "task_uri": "http://lab/recipes/7/tasks/100/",
                     "name": "/examples/git-task", "order": 1,
                     "url": "git://lab/examples#main", "max_time": 120},
                    {"task_id": "101", "task_uri": "http://lab/recipes/7/tasks/101/",
                     "name": "/examples/pkg-task", "order": 2,
                     "package": "example-tests", "entry_point": "./runtest.sh --fast"}
                ]
            }"#,
        )
        .unwrap();

        let recipe = load_recipe(&path, &settings()).unwrap();
        assert_eq!(recipe.tasks.len(), 2);
        assert!(matches!(recipe.tasks[0].fetch, Fetch::Unpack { .. }));
        assert_eq!(recipe.tasks[0].max_time, 120);
        assert_eq!(
            recipe.tasks[0].path,
            PathBuf::from("/mnt/tests/examples/git-task")
        );
        assert!(matches!(
            recipe.tasks[1].fetch,
            Fetch::InstallPackage { .. }
        ));
        assert_eq!(
            recipe.tasks[1].entry_point,
            vec!["./runtest.sh", "--fast"]
        );
    }

    #[test]
    fn recipe_file_rejects_ambiguous_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.json");
        std::fs::write(
            &path,
            r#"{
                "job_id": "1", "recipe_set_id": "1", "recipe_id": "1",
                "recipe_uri": "http://lab/recipes/1/",
                "tasks": [
                    {"task_id": "1", "task_uri": "http://lab/t/1/", "name": "t",
                     "order": 1, "url": "git://x/y", "package": "both"}
                ]
            }"#,
        )
        .unwrap();
        assert!(load_recipe(&path, &settings()).is_err());
    }
}
