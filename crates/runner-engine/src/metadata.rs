//! Per-task metadata file.
//!
//! A task may carry a `metadata` file (TOML) at the root of its payload that
//! overrides the recipe's view of it: the entry point, the local watchdog
//! budget, and the dependency lists. The presence of the file also switches
//! the task out of compatibility mode, which turns on the env-var prefix.

use reqwest::Url;
use serde::Deserialize;

use crate::task::Task;

/// Errors from reading or applying a task metadata file.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The metadata file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The metadata file is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File path.
        path: String,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// A `max_time` value could not be understood.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    /// A repository dependency is not a valid URL.
    #[error("invalid repo dependency {0:?}")]
    InvalidRepo(String),
}

#[derive(Debug, Default, Deserialize)]
struct MetadataFile {
    entry_point: Option<String>,
    max_time: Option<MaxTime>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    repo_dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MaxTime {
    Seconds(u64),
    Text(String),
}

/// Parse a duration: bare seconds, or a number with an `s`/`m`/`h`/`d`
/// suffix.
pub fn parse_time_string(raw: &str) -> Result<u64, MetadataError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(MetadataError::InvalidDuration(raw.to_string()));
    }
    let (digits, multiplier) = match s.char_indices().last() {
        Some((idx, unit)) if unit.is_ascii_alphabetic() => {
            let multiplier = match unit.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                _ => return Err(MetadataError::InvalidDuration(raw.to_string())),
            };
            (&s[..idx], multiplier)
        }
        _ => (s, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| MetadataError::InvalidDuration(raw.to_string()))?;
    Ok(value * multiplier)
}

/// Merge `{task.path}/metadata` into the task, when the file exists.
///
/// Merging never unsets a field the file omits. A missing file leaves the
/// task in compatibility mode with its current values.
pub(crate) fn update_task(task: &mut Task) -> Result<(), MetadataError> {
    let path = task.path.join("metadata");
    if !path.exists() {
        return Ok(());
    }

    let raw = std::fs::read_to_string(&path).map_err(|source| MetadataError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: MetadataFile = toml::from_str(&raw).map_err(|source| MetadataError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    task.rhts_compat = false;
    if let Some(entry_point) = file.entry_point {
        task.entry_point = entry_point.split_whitespace().map(str::to_string).collect();
    }
    match file.max_time {
        Some(MaxTime::Seconds(secs)) => task.max_time = secs,
        Some(MaxTime::Text(text)) => task.max_time = parse_time_string(&text)?,
        None => {}
    }
    if !file.dependencies.is_empty() {
        task.dependencies = file.dependencies;
    }
    if !file.repo_dependencies.is_empty() {
        let mut repos = Vec::with_capacity(file.repo_dependencies.len());
        for raw in file.repo_dependencies {
            repos.push(Url::parse(&raw).map_err(|_| MetadataError::InvalidRepo(raw.clone()))?);
        }
        task.repo_dependencies = repos;
    }
    Ok(())
}
