//! Integration tests for the controller status client, against a local HTTP
//! sink.

mod common;

use std::time::Duration;

use reqwest::Url;
use tokio::time::timeout;

use taskrun_core::settings::RunnerSettings;
use taskrun_engine::{Fetch, Reporter, Task, TaskStatus};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn task_against(base: &str) -> Task {
    Task::new(
        "42",
        Url::parse(&format!("{base}/recipes/7/tasks/42/")).unwrap(),
        "/examples/reporting",
        "/mnt/tests/examples/reporting",
        1,
        Fetch::InstallPackage {
            name: "reporting".into(),
        },
        &RunnerSettings::default(),
    )
}

#[tokio::test]
async fn status_post_carries_status_and_message() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let task = task_against(&sink.base);

    reporter.report_status(
        &task,
        TaskStatus::Aborted,
        Some("Local watchdog expired! Killed 1234 with 9"),
    );

    let req = timeout(RECV_TIMEOUT, sink.requests.recv())
        .await
        .expect("no status POST arrived")
        .unwrap();
    assert_eq!(req.path, "/recipes/7/tasks/42/status");
    assert_eq!(req.fields.get("status").map(String::as_str), Some("Aborted"));
    assert_eq!(
        req.fields.get("message").map(String::as_str),
        Some("Local watchdog expired! Killed 1234 with 9")
    );
    assert_eq!(req.fields.len(), 2);
}

#[tokio::test]
async fn status_post_without_reason_sends_one_field() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let task = task_against(&sink.base);

    reporter.report_status(&task, TaskStatus::Cancelled, None);

    let req = timeout(RECV_TIMEOUT, sink.requests.recv())
        .await
        .expect("no status POST arrived")
        .unwrap();
    assert_eq!(
        req.fields.get("status").map(String::as_str),
        Some("Cancelled")
    );
    assert_eq!(req.fields.len(), 1);
}

#[tokio::test]
async fn repeated_status_posts_are_delivered_as_is() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let task = task_against(&sink.base);

    reporter.report_status(&task, TaskStatus::Aborted, Some("boom"));
    reporter.report_status(&task, TaskStatus::Aborted, Some("boom"));

    for _ in 0..2 {
        let req = timeout(RECV_TIMEOUT, sink.requests.recv())
            .await
            .expect("expected two identical POSTs")
            .unwrap();
        assert_eq!(req.fields.get("status").map(String::as_str), Some("Aborted"));
        assert_eq!(req.fields.get("message").map(String::as_str), Some("boom"));
    }
}

#[tokio::test]
async fn watchdog_extension_posts_seconds() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let recipe_uri = Url::parse(&format!("{}/recipes/7/", sink.base)).unwrap();

    reporter.extend_watchdog(&recipe_uri, 2400);

    let req = timeout(RECV_TIMEOUT, sink.requests.recv())
        .await
        .expect("no watchdog POST arrived")
        .unwrap();
    assert_eq!(req.path, "/recipes/7/watchdog");
    assert_eq!(req.fields.get("seconds").map(String::as_str), Some("2400"));
    assert_eq!(req.fields.len(), 1);
}

#[tokio::test]
async fn watchdog_extension_by_zero_is_a_no_op() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let recipe_uri = Url::parse(&format!("{}/recipes/7/", sink.base)).unwrap();

    reporter.extend_watchdog(&recipe_uri, 0);

    let res = timeout(Duration::from_millis(300), sink.requests.recv()).await;
    assert!(res.is_err(), "zero extension must not POST");
}

#[tokio::test]
async fn result_with_only_result_posts_exactly_one_field() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let task = task_against(&sink.base);

    reporter.report_result(&task, "Pass", None, None, None);

    let req = timeout(RECV_TIMEOUT, sink.requests.recv())
        .await
        .expect("no results POST arrived")
        .unwrap();
    assert_eq!(req.path, "/recipes/7/tasks/42/results");
    assert_eq!(req.fields.get("result").map(String::as_str), Some("Pass"));
    assert_eq!(req.fields.len(), 1);
}

#[tokio::test]
async fn result_optionals_are_sent_when_present() {
    let mut sink = common::spawn_sink().await;
    let reporter = Reporter::new(reqwest::Client::new());
    let task = task_against(&sink.base);

    reporter.report_result(
        &task,
        "Fail",
        Some(7),
        Some("/examples/reporting/check"),
        Some("expected 0 got 7"),
    );

    let req = timeout(RECV_TIMEOUT, sink.requests.recv())
        .await
        .expect("no results POST arrived")
        .unwrap();
    assert_eq!(req.fields.get("result").map(String::as_str), Some("Fail"));
    assert_eq!(req.fields.get("score").map(String::as_str), Some("7"));
    assert_eq!(
        req.fields.get("path").map(String::as_str),
        Some("/examples/reporting/check")
    );
    assert_eq!(
        req.fields.get("message").map(String::as_str),
        Some("expected 0 got 7")
    );
    assert_eq!(req.fields.len(), 4);
}
