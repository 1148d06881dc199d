//! Presence and version checks for external tools.

use super::registry::{ToolCatalog, ToolSpec};
use crate::core::{ToolInvocation, ToolOutcome, ToolRunner};
use crate::types::ToolName;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{error, info, warn};

const VERSION_TIMEOUT: Duration = Duration::from_secs(15);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Generic version patterns, tried in order.
static VERSION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)version\s*:?\s*v?(\d+\.\d+\.\d+)",
        r"(?i)v?(\d+\.\d+\.\d+)",
        r"(\d+\.\d+\.\d+(?:-\w+)?)",
        r"(\d+\.\d+)",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("Invalid version pattern"))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Ok,
    Missing,
    Outdated,
    /// Installed, but the version could not be determined.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: ToolName,
    pub installed: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub min_version: Option<String>,
    pub status: ToolState,
}

impl ToolStatus {
    /// Missing and outdated tools are always issues. An unknown version only
    /// matters when a minimum is required.
    pub fn is_issue(&self) -> bool {
        match self.status {
            ToolState::Missing | ToolState::Outdated => true,
            ToolState::Unknown => self.min_version.is_some(),
            ToolState::Ok => false,
        }
    }
}

/// Result of verifying a set of tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub timestamp: DateTime<Utc>,
    pub tools: BTreeMap<ToolName, ToolStatus>,
}

impl VerificationReport {
    pub fn has_issues(&self) -> bool {
        self.tools.values().any(ToolStatus::is_issue)
    }

    pub fn issues(&self) -> impl Iterator<Item = &ToolStatus> {
        self.tools.values().filter(|t| t.is_issue())
    }

    pub fn missing(&self) -> Vec<&ToolName> {
        self.with_state(ToolState::Missing)
    }

    pub fn outdated(&self) -> Vec<&ToolName> {
        self.with_state(ToolState::Outdated)
    }

    fn with_state(&self, state: ToolState) -> Vec<&ToolName> {
        self.tools
            .values()
            .filter(|t| t.status == state)
            .map(|t| &t.name)
            .collect()
    }

    /// Write the report as pretty JSON.
    pub fn export(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Checks tools against the catalog.
#[derive(Debug, Clone)]
pub struct ToolChecker {
    catalog: Arc<ToolCatalog>,
    runner: ToolRunner,
}

impl ToolChecker {
    pub fn new(catalog: Arc<ToolCatalog>, runner: ToolRunner) -> Self {
        Self { catalog, runner }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn tool_path(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    pub fn tool_exists(&self, name: &str) -> bool {
        self.tool_path(name).is_some()
    }

    /// Ask the tool for its version. Stdout and stderr are searched
    /// together because many tools print their banner on stderr, and the
    /// exit code is ignored because many exit non-zero after printing it.
    pub async fn tool_version(&self, name: &str) -> Option<String> {
        let fallback;
        let spec = match self.catalog.get(name) {
            Some(spec) => spec,
            None => {
                fallback = ToolSpec::new(name);
                &fallback
            }
        };

        let mut argv = vec![name.to_string()];
        argv.extend(spec.version_args.iter().cloned());
        let outcome = self
            .runner
            .execute(&ToolInvocation::new(argv).with_timeout(VERSION_TIMEOUT))
            .await;

        let result = match &outcome {
            ToolOutcome::Ok(r) => r,
            ToolOutcome::Failed { result: Some(r), .. } => r,
            other => {
                warn!(tool = name, outcome = %other, "Could not query tool version");
                return None;
            }
        };

        let combined = format!("{}{}", result.stdout, result.stderr);
        let custom = match spec.version_pattern.as_deref().map(Regex::new) {
            Some(Ok(re)) => Some(re),
            Some(Err(e)) => {
                warn!(tool = name, error = %e, "Ignoring invalid version pattern");
                None
            }
            None => None,
        };
        extract_version(&combined, custom.as_ref())
    }

    /// Check one tool. `min_version` falls back to the catalog's minimum.
    pub async fn check(&self, name: &str, min_version: Option<&str>) -> ToolStatus {
        let min_version = min_version
            .map(str::to_string)
            .or_else(|| self.catalog.get(name).and_then(|s| s.min_version.clone()));

        let Some(path) = self.tool_path(name) else {
            return ToolStatus {
                name: ToolName::new(name),
                installed: false,
                path: None,
                version: None,
                min_version,
                status: ToolState::Missing,
            };
        };

        let version = self.tool_version(name).await;
        let status = match (&version, &min_version) {
            (None, _) => ToolState::Unknown,
            (Some(v), Some(min)) if is_outdated(v, min) => ToolState::Outdated,
            (Some(_), _) => ToolState::Ok,
        };

        ToolStatus {
            name: ToolName::new(name),
            installed: true,
            path: Some(path),
            version,
            min_version,
            status,
        }
    }

    /// Check every required tool and log a summary of the problems found.
    pub async fn verify(&self, required: &BTreeMap<ToolName, Option<String>>) -> VerificationReport {
        let mut tools = BTreeMap::new();
        for (name, min) in required {
            let status = self.check(name.as_str(), min.as_deref()).await;
            match status.status {
                ToolState::Missing => error!(tool = %name, "Tool not found"),
                ToolState::Outdated => warn!(
                    tool = %name,
                    current = status.version.as_deref().unwrap_or("?"),
                    required = status.min_version.as_deref().unwrap_or("?"),
                    "Tool is outdated"
                ),
                ToolState::Unknown => warn!(tool = %name, "Could not determine tool version"),
                ToolState::Ok => info!(
                    tool = %name,
                    version = status.version.as_deref().unwrap_or("?"),
                    "Tool is available"
                ),
            }
            tools.insert(name.clone(), status);
        }

        let report = VerificationReport {
            timestamp: Utc::now(),
            tools,
        };

        for issue in report.issues() {
            if let Some(cmd) = self
                .catalog
                .get(issue.name.as_str())
                .and_then(|s| s.install_command.as_deref())
            {
                warn!(tool = %issue.name, command = cmd, "Suggested install command");
            }
        }

        report
    }

    /// Run the tool's install command. Returns whether it succeeded.
    pub async fn install(&self, name: &str) -> bool {
        let Some(command) = self
            .catalog
            .get(name)
            .and_then(|s| s.install_command.clone())
        else {
            warn!(tool = name, "No install command known");
            return false;
        };

        info!(tool = name, command = %command, "Installing tool");
        let outcome = self
            .runner
            .execute(&ToolInvocation::new(["sh", "-c", command.as_str()]).with_timeout(INSTALL_TIMEOUT))
            .await;
        match outcome {
            ToolOutcome::Ok(_) => {
                info!(tool = name, "Install command succeeded");
                true
            }
            other => {
                error!(tool = name, outcome = %other, "Install command failed");
                false
            }
        }
    }
}

/// Pull a version string out of tool output.
pub fn extract_version(output: &str, pattern: Option<&Regex>) -> Option<String> {
    pattern
        .into_iter()
        .chain(VERSION_PATTERNS.iter())
        .find_map(|re| re.captures(output))
        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str().to_string())
}

fn version_components(version: &str) -> Vec<u64> {
    let version = version.trim();
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);
    let core = version.split(['-', '+']).next().unwrap_or(version);
    core.split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Numeric comparison of dotted versions. The shorter version is padded
/// with zeros, so `1.2` equals `1.2.0`.
pub fn compare_versions(current: &str, minimum: &str) -> Ordering {
    let mut a = version_components(current);
    let mut b = version_components(minimum);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a.cmp(&b)
}

pub fn is_outdated(current: &str, minimum: &str) -> bool {
    compare_versions(current, minimum) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("2.6.0", "2.6.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.10.0", "2.9.1"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("v3.0.1", "3.0.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.5.0-dev", "1.5.0"), Ordering::Equal);
        assert!(is_outdated("2.5.9", "2.6.0"));
        assert!(!is_outdated("3.23.3", "3.23.3"));
    }

    #[test]
    fn test_extract_version_generic_patterns() {
        assert_eq!(
            extract_version("Current Version: v2.6.3\n", None).as_deref(),
            Some("2.6.3")
        );
        assert_eq!(
            extract_version("[INF] nuclei engine v3.1.0 (latest)", None).as_deref(),
            Some("3.1.0")
        );
        assert_eq!(extract_version("ffuf version 2.1", None).as_deref(), Some("2.1"));
        assert_eq!(extract_version("no digits here", None), None);
    }

    #[test]
    fn test_extract_version_custom_pattern_first() {
        let re = Regex::new(r"build (\d+)").unwrap();
        assert_eq!(
            extract_version("tool 1.2.3 build 42", Some(&re)).as_deref(),
            Some("42")
        );
        // Falls back to generic patterns when the custom one misses.
        assert_eq!(
            extract_version("tool 1.2.3", Some(&re)).as_deref(),
            Some("1.2.3")
        );
    }

    #[test]
    fn test_issue_classification() {
        let status = |state, min: Option<&str>| ToolStatus {
            name: ToolName::new("t"),
            installed: state != ToolState::Missing,
            path: None,
            version: None,
            min_version: min.map(str::to_string),
            status: state,
        };
        assert!(status(ToolState::Missing, None).is_issue());
        assert!(status(ToolState::Outdated, Some("1.0")).is_issue());
        assert!(status(ToolState::Unknown, Some("1.0")).is_issue());
        assert!(!status(ToolState::Unknown, None).is_issue());
        assert!(!status(ToolState::Ok, Some("1.0")).is_issue());
    }

    fn checker(catalog: ToolCatalog) -> ToolChecker {
        ToolChecker::new(Arc::new(catalog), ToolRunner::new(Duration::from_secs(10), 2))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_reports_missing_and_present() {
        let catalog = ToolCatalog::new()
            .register(ToolSpec::new("sh").version_args(["-c", "echo version 5.1.0"]))
            .register(ToolSpec::new("no-such-tool-4711").min_version("1.0.0"));
        let checker = checker(catalog);

        let mut required = BTreeMap::new();
        required.insert(ToolName::new("sh"), Some("5.0.0".to_string()));
        required.insert(ToolName::new("no-such-tool-4711"), None);

        let report = checker.verify(&required).await;
        let sh = &report.tools[&ToolName::new("sh")];
        assert_eq!(sh.status, ToolState::Ok);
        assert_eq!(sh.version.as_deref(), Some("5.1.0"));

        let missing = &report.tools[&ToolName::new("no-such-tool-4711")];
        assert_eq!(missing.status, ToolState::Missing);
        assert_eq!(missing.min_version.as_deref(), Some("1.0.0"));

        assert!(report.has_issues());
        assert_eq!(report.missing(), vec![&ToolName::new("no-such-tool-4711")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_outdated_tool_and_export() {
        let catalog = ToolCatalog::new()
            .register(ToolSpec::new("sh").version_args(["-c", "echo v1.0.0 >&2; exit 2"]));
        let checker = checker(catalog);

        let status = checker.check("sh", Some("2.0.0")).await;
        assert_eq!(status.status, ToolState::Outdated);
        assert_eq!(status.version.as_deref(), Some("1.0.0"));

        let mut required = BTreeMap::new();
        required.insert(ToolName::new("sh"), Some("2.0.0".to_string()));
        let report = checker.verify(&required).await;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tools").join("status.json");
        report.export(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["tools"]["sh"]["status"], "outdated");
        assert_eq!(json["tools"]["sh"]["installed"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_runs_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("installed");
        let catalog = ToolCatalog::new()
            .register(ToolSpec::new("fake").install_command(format!("touch {}", marker.display())))
            .register(ToolSpec::new("broken").install_command("exit 1"));
        let checker = checker(catalog);

        assert!(checker.install("fake").await);
        assert!(marker.exists());
        assert!(!checker.install("broken").await);
        assert!(!checker.install("unknown").await);
    }
}
