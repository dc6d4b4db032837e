//! Fetching task payloads and installing dependencies.
//!
//! The dispatch recognizes `git` and `http` URLs plus package installs;
//! everything shells out, so the host's own tooling does the heavy lifting.

use std::path::Path;

use reqwest::Url;
use tokio::process::Command;
use tracing::debug;

use taskrun_core::settings::RunnerSettings;

use crate::task::{Fetch, Task};

/// Errors from fetching a task payload or installing its dependencies.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The fetch URL carries a scheme the harness does not implement.
    #[error("fetch scheme {0:?} is not supported")]
    UnsupportedScheme(String),
    /// A fetch helper command exited nonzero.
    #[error("{command} failed: {detail}")]
    CommandFailed {
        /// The program that failed.
        command: String,
        /// Its captured stderr, trimmed.
        detail: String,
    },
    /// Downloading an archive failed.
    #[error("download {url} failed: {detail}")]
    Download {
        /// The archive URL.
        url: String,
        /// Transport or HTTP status detail.
        detail: String,
    },
    /// Filesystem trouble while staging the payload.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fetch the payload for `task` into `task.path`.
pub(crate) async fn fetch_task(
    http: &reqwest::Client,
    task: &Task,
    settings: &RunnerSettings,
) -> Result<(), FetchError> {
    match &task.fetch {
        Fetch::Unpack { url } => match url.scheme() {
            "git" => fetch_git(url, &task.path).await,
            "http" => fetch_archive(http, url, &task.path).await,
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        },
        Fetch::InstallPackage { name } => install_package(name, settings).await,
    }
}

/// Install system packages and clone repository dependencies declared by the
/// task.
pub(crate) async fn install_dependencies(
    task: &Task,
    settings: &RunnerSettings,
) -> Result<(), FetchError> {
    if !task.dependencies.is_empty() && !settings.package_install_cmd.is_empty() {
        let mut argv = settings.package_install_cmd.clone();
        argv.extend(task.dependencies.iter().cloned());
        run_command(&argv).await?;
    }
    for url in &task.repo_dependencies {
        let dest = settings.task_root.join(url.path().trim_matches('/'));
        fetch_git(url, &dest).await?;
    }
    Ok(())
}

async fn fetch_git(url: &Url, dest: &Path) -> Result<(), FetchError> {
    if dest.join(".git").exists() {
        debug!("{} already cloned, skipping", dest.display());
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // The fragment names the branch to check out; git itself must not see it.
    let mut clone_url = url.clone();
    clone_url.set_fragment(None);

    let mut argv = vec![
        "git".to_string(),
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
    ];
    if let Some(branch) = url.fragment() {
        argv.push("--branch".to_string());
        argv.push(branch.to_string());
    }
    argv.push(clone_url.to_string());
    argv.push(dest.display().to_string());
    run_command(&argv).await
}

async fn fetch_archive(
    http: &reqwest::Client,
    url: &Url,
    dest: &Path,
) -> Result<(), FetchError> {
    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|err| FetchError::Download {
            url: url.to_string(),
            detail: format!("{err:#}"),
        })?;
    if !response.status().is_success() {
        return Err(FetchError::Download {
            url: url.to_string(),
            detail: format!("http status {}", response.status()),
        });
    }
    let body = response.bytes().await.map_err(|err| FetchError::Download {
        url: url.to_string(),
        detail: format!("{err:#}"),
    })?;

    let archive = tempfile::NamedTempFile::new()?;
    std::fs::write(archive.path(), &body)?;
    std::fs::create_dir_all(dest)?;

    let argv = vec![
        "tar".to_string(),
        "-xf".to_string(),
        archive.path().display().to_string(),
        "-C".to_string(),
        dest.display().to_string(),
    ];
    run_command(&argv).await
}

async fn install_package(name: &str, settings: &RunnerSettings) -> Result<(), FetchError> {
    if settings.package_install_cmd.is_empty() {
        debug!("package install command not configured, skipping {name}");
        return Ok(());
    }
    let mut argv = settings.package_install_cmd.clone();
    argv.push(name.to_string());
    run_command(&argv).await
}

async fn run_command(argv: &[String]) -> Result<(), FetchError> {
    debug!("running {argv:?}");
    let output = Command::new(&argv[0]).args(&argv[1..]).output().await?;
    if output.status.success() {
        return Ok(());
    }
    let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if detail.is_empty() {
        detail = output.status.to_string();
    }
    Err(FetchError::CommandFailed {
        command: argv[0].clone(),
        detail,
    })
}
