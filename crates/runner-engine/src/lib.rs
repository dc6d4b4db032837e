#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! In-process task-runner engine: task model, execution state machine, child
//! supervision, and controller reporting.

/// Public API for the engine crate.
pub mod api;

mod env;
mod fetch;
mod metadata;
mod observer;
mod reporter;
mod runner;
mod supervisor;
mod task;

pub use api::{RecipeOutcome, RunnerEvent, RunnerHandle, TaskOutcome, start_runner};
pub use fetch::FetchError;
pub use metadata::{MetadataError, parse_time_string};
pub use observer::{ObserverHub, Output, StreamKind};
pub use reporter::{Reporter, TaskStatus};
pub use task::{Fetch, Param, Recipe, Task, TaskError, TaskState, load_recipe};
