//! Error types for the orchestrator.
//!
//! Only failures that abort a run before or between modules live here.
//! Tool-level failures are values ([`crate::core::ToolOutcome`]) and rate
//! limiting is an [`crate::core::Admission`], so neither appears below.

use crate::session::SessionError;
use thiserror::Error;

/// Pre-flight configuration problems. Always fatal to the whole run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The module dependency graph contains a cycle.
    #[error("circular dependency detected among modules: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// A module depends on a name that was never registered.
    #[error("module `{module}` depends on unregistered module `{dependency}`")]
    UnknownDependency { module: String, dependency: String },

    /// The same module name was registered twice.
    #[error("module `{0}` is registered more than once")]
    DuplicateModule(String),

    /// A configuration value is out of range.
    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    /// The target is not a valid domain name.
    #[error("invalid target domain: {0}")]
    InvalidTarget(String),
}

impl ConfigurationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }
}

/// A module failed. Recorded against the module; the run goes on if the
/// operator agrees.
#[derive(Debug, Error)]
#[error("module `{module}` failed: {message}")]
pub struct ModuleExecutionError {
    pub module: String,
    pub message: String,
}

impl ModuleExecutionError {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
        }
    }
}

/// A module had nothing it could do this run. Returned from `run` to have
/// the module recorded as skipped instead of completed, so a later run tries
/// it again.
#[derive(Debug, Error)]
#[error("module skipped: {reason}")]
pub struct ModuleSkipped {
    pub reason: String,
}

impl ModuleSkipped {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Errors that end a run early.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The operator chose to abort after tool verification reported issues.
    #[error("tool verification aborted by operator")]
    VerificationAborted,

    /// The run was cancelled (signal or explicit cancellation).
    #[error("run interrupted")]
    Interrupted,

    #[error("session store error: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ConfigurationError::CyclicDependency(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "circular dependency detected among modules: a -> b -> a"
        );
    }

    #[test]
    fn test_configuration_error_converts() {
        let err: OrchestratorError = ConfigurationError::DuplicateModule("dns".into()).into();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert_eq!(err.to_string(), "module `dns` is registered more than once");
    }

    #[test]
    fn test_module_execution_error_message() {
        let err = ModuleExecutionError::new("web_probing", "dependency `dns_analysis` has no stored results");
        assert_eq!(
            err.to_string(),
            "module `web_probing` failed: dependency `dns_analysis` has no stored results"
        );
    }

    #[test]
    fn test_module_skipped_survives_anyhow() {
        let err: anyhow::Error = ModuleSkipped::new("wordlist missing").into();
        let skipped = err.downcast_ref::<ModuleSkipped>().unwrap();
        assert_eq!(skipped.reason, "wordlist missing");
    }

    #[test]
    fn test_invalid_setting_helper() {
        let err = ConfigurationError::invalid("rate_limit.burst_size", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid setting `rate_limit.burst_size`: must be at least 1"
        );
    }
}
