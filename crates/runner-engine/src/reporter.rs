//! Fire-and-forget reporting to the lab controller.
//!
//! All three operations POST `application/x-www-form-urlencoded` bodies and
//! return immediately; the request runs on its own tokio task. A non-2xx
//! answer is logged and dropped, never retried, and nothing waits for
//! in-flight requests at process exit.

use std::fmt;

use reqwest::Url;
use tracing::{info, warn};

use crate::task::Task;

/// Terminal status values the controller accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task was aborted by the harness.
    Aborted,
    /// The task was cancelled from outside.
    Cancelled,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Aborted => "Aborted",
            TaskStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status client for one runner.
#[derive(Debug, Clone)]
pub struct Reporter {
    http: reqwest::Client,
}

impl Reporter {
    /// Wrap a shared HTTP client.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Report a terminal status for `task`, with an optional reason shown to
    /// the user on the controller side.
    pub fn report_status(&self, task: &Task, status: TaskStatus, reason: Option<&str>) {
        let Some(url) = endpoint(&task.task_uri, "status") else {
            warn!("task {}: cannot build status endpoint", task.task_id);
            return;
        };
        let mut fields = vec![("status", status.as_str().to_string())];
        match reason {
            Some(reason) => {
                info!(
                    "{status} task {} due to error: {reason}",
                    task.task_id
                );
                fields.push(("message", reason.to_string()));
            }
            // this is basically a bug, but to be nice let's handle it
            None if status == TaskStatus::Aborted => {
                warn!("{status} task with no reason given");
            }
            None => {}
        }
        self.post(url, format!("status to {status}"), fields);
    }

    /// Push the controller-side watchdog out by `seconds`. Zero is rejected.
    pub fn extend_watchdog(&self, recipe_uri: &Url, seconds: u64) {
        if seconds == 0 {
            warn!("refusing to extend the external watchdog by zero seconds");
            return;
        }
        let Some(url) = endpoint(recipe_uri, "watchdog") else {
            warn!("cannot build watchdog endpoint from {recipe_uri}");
            return;
        };
        self.post(url, "watchdog".to_string(), vec![("seconds", seconds.to_string())]);
    }

    /// Submit a result record for `task`. Only `result` is required; absent
    /// optionals are not sent at all.
    pub fn report_result(
        &self,
        task: &Task,
        result: &str,
        score: Option<i64>,
        path: Option<&str>,
        message: Option<&str>,
    ) {
        let Some(url) = endpoint(&task.task_uri, "results") else {
            warn!("task {}: cannot build results endpoint", task.task_id);
            return;
        };
        let mut fields = vec![("result", result.to_string())];
        if let Some(score) = score {
            fields.push(("score", score.to_string()));
        }
        if let Some(path) = path {
            fields.push(("path", path.to_string()));
        }
        if let Some(message) = message {
            fields.push(("message", message.to_string()));
        }
        self.post(url, "results".to_string(), fields);
    }

    fn post(&self, url: Url, what: String, fields: Vec<(&'static str, String)>) {
        let http = self.http.clone();
        tokio::spawn(async move {
            match http.post(url).form(&fields).send().await {
                Ok(res) if res.status().is_success() => {}
                Ok(res) => {
                    warn!("Updating {what} Failed, http status {}", res.status());
                }
                Err(err) => {
                    warn!("Updating {what} Failed: {err:#}");
                }
            }
        });
    }
}

/// Append `leaf` as a path segment of `base`, tolerating bases with or
/// without a trailing slash.
fn endpoint(base: &Url, leaf: &str) -> Option<Url> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty().push(leaf);
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_with_and_without_trailing_slash() {
        let with = Url::parse("http://lab/recipes/7/tasks/42/").unwrap();
        let without = Url::parse("http://lab/recipes/7/tasks/42").unwrap();
        assert_eq!(
            endpoint(&with, "status").unwrap().as_str(),
            "http://lab/recipes/7/tasks/42/status"
        );
        assert_eq!(
            endpoint(&without, "results").unwrap().as_str(),
            "http://lab/recipes/7/tasks/42/results"
        );
    }
}
