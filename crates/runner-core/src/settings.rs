use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Harness-wide settings.
///
/// Everything here has a production default; a settings file only needs to
/// name the fields it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Prefix applied to the well-known environment variables when a task is
    /// not running in compatibility mode.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    /// Entry point used when neither the recipe nor the task metadata set one.
    #[serde(default = "default_entry_point")]
    pub default_entry_point: String,

    /// Local watchdog budget (seconds) for tasks that do not declare one.
    #[serde(default = "default_max_time")]
    pub default_max_time: u64,

    /// Slack (seconds) added on top of a task's max time when extending the
    /// controller-side watchdog.
    #[serde(default = "default_external_watchdog_grace")]
    pub external_watchdog_grace: u64,

    /// Seconds between heartbeat lines while a task runs.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Command used to install system packages; the package name is appended.
    #[serde(default = "default_package_install_cmd")]
    pub package_install_cmd: Vec<String>,

    /// Directory that unpacked tasks live under.
    #[serde(default = "default_task_root")]
    pub task_root: PathBuf,
}

impl RunnerSettings {
    pub const DEFAULT_ENV_PREFIX: &'static str = "TASKRUN_";
    pub const DEFAULT_ENTRY_POINT: &'static str = "make run";
    pub const DEFAULT_MAX_TIME: u64 = 600;
    pub const DEFAULT_EXTERNAL_WATCHDOG_GRACE: u64 = 1800;
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 300;
    pub const DEFAULT_TASK_ROOT: &'static str = "/mnt/tests";
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
            default_entry_point: default_entry_point(),
            default_max_time: default_max_time(),
            external_watchdog_grace: default_external_watchdog_grace(),
            heartbeat_interval: default_heartbeat_interval(),
            package_install_cmd: default_package_install_cmd(),
            task_root: default_task_root(),
        }
    }
}

fn default_env_prefix() -> String {
    RunnerSettings::DEFAULT_ENV_PREFIX.to_string()
}

fn default_entry_point() -> String {
    RunnerSettings::DEFAULT_ENTRY_POINT.to_string()
}

fn default_max_time() -> u64 {
    RunnerSettings::DEFAULT_MAX_TIME
}

fn default_external_watchdog_grace() -> u64 {
    RunnerSettings::DEFAULT_EXTERNAL_WATCHDOG_GRACE
}

fn default_heartbeat_interval() -> u64 {
    RunnerSettings::DEFAULT_HEARTBEAT_INTERVAL
}

fn default_package_install_cmd() -> Vec<String> {
    vec!["dnf".to_string(), "-y".to_string(), "install".to_string()]
}

fn default_task_root() -> PathBuf {
    PathBuf::from(RunnerSettings::DEFAULT_TASK_ROOT)
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("taskrun").join("settings.json"))
}

/// Load settings from `path`, or from the default location when `path` is
/// `None`. A missing file yields the defaults.
pub fn load_settings(path: Option<&std::path::Path>) -> anyhow::Result<RunnerSettings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => settings_path()?,
    };
    if !path.exists() {
        return Ok(RunnerSettings::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let settings: RunnerSettings = serde_json::from_str(&raw)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = RunnerSettings::default();
        assert_eq!(s.env_prefix, "TASKRUN_");
        assert_eq!(s.default_entry_point, "make run");
        assert_eq!(s.heartbeat_interval, 300);
        assert_eq!(s.package_install_cmd[0], "dnf");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let s: RunnerSettings = serde_json::from_str(r#"{"env_prefix": "LAB_"}"#).unwrap();
        assert_eq!(s.env_prefix, "LAB_");
        assert_eq!(s.default_max_time, RunnerSettings::DEFAULT_MAX_TIME);
        assert_eq!(s.task_root, PathBuf::from("/mnt/tests"));
    }
}
