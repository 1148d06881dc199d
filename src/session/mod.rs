//! Durable per-target run state.
//!
//! A session lives under `<output>/<target>/` and consists of `session.json`
//! (module statuses and metrics) plus one results file per completed module.
//! Restarting against the same target picks the session back up.

mod store;

pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Lifecycle status of a module within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
    /// Cancelled while running.
    Interrupted,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Pending => "pending",
            ModuleStatus::Running => "running",
            ModuleStatus::Completed => "completed",
            ModuleStatus::Error => "error",
            ModuleStatus::Skipped => "skipped",
            ModuleStatus::Interrupted => "interrupted",
        }
    }

    /// Whether the module has finished one way or another.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ModuleStatus::Pending | ModuleStatus::Running)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub status: ModuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub target: String,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleRecord>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl SessionRecord {
    pub fn new(target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            target: target.into(),
            start_time: now,
            last_updated: now,
            modules: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn status_of(&self, module: &str) -> ModuleStatus {
        self.modules
            .get(module)
            .map(|m| m.status)
            .unwrap_or_default()
    }

    /// Rewrite every `running` module as `interrupted`. Returns the names
    /// that were changed.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, record) in self.modules.iter_mut() {
            if record.status == ModuleStatus::Running {
                record.status = ModuleStatus::Interrupted;
                record.error
                    .get_or_insert_with(|| "run ended while module was running".to_string());
                changed.push(name.clone());
            }
        }
        changed
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SessionError::Io { path, source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> Self {
        let path = path.into();
        move |source| SessionError::Json { path, source }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
