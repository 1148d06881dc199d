//! Operator checkpoints.
//!
//! The orchestrator stops to ask a human when tool verification finds
//! problems, and between modules: after one fails, or after one completes
//! while others remain.

use crate::tools::VerificationReport;
use crate::types::ModuleName;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use tracing::warn;

/// What to do when required tools are missing or outdated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolIssueChoice {
    Continue,
    /// Run install commands, then verify again.
    Update,
    Abort,
}

#[async_trait]
pub trait Operator: Send + Sync {
    /// Whether to go on after `module` failed with `error`.
    async fn confirm_continue(&self, module: &ModuleName, error: &str) -> bool;

    /// Whether to start the next module now that `completed` has finished.
    async fn confirm_next(&self, completed: &ModuleName) -> bool;

    async fn resolve_tool_issues(&self, report: &VerificationReport) -> ToolIssueChoice;
}

/// Answers every checkpoint the same way without asking.
#[derive(Debug, Clone, Copy)]
pub struct AutoOperator {
    pub continue_on_error: bool,
    pub tool_issues: ToolIssueChoice,
}

impl Default for AutoOperator {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            tool_issues: ToolIssueChoice::Continue,
        }
    }
}

#[async_trait]
impl Operator for AutoOperator {
    async fn confirm_continue(&self, module: &ModuleName, error: &str) -> bool {
        warn!(module = %module, error = error, proceed = self.continue_on_error, "Module failed");
        self.continue_on_error
    }

    async fn confirm_next(&self, _completed: &ModuleName) -> bool {
        true
    }

    async fn resolve_tool_issues(&self, _report: &VerificationReport) -> ToolIssueChoice {
        self.tool_issues
    }
}

/// Prompts on the terminal. Reads happen on a blocking thread so the
/// runtime keeps servicing other tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOperator;

impl ConsoleOperator {
    async fn ask(prompt: String) -> Option<String> {
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{}", prompt);
            let _ = stderr.flush();
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim().to_ascii_lowercase()),
            }
        })
        .await
        .ok()
        .flatten()
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn confirm_continue(&self, module: &ModuleName, error: &str) -> bool {
        let prompt = format!(
            "\nModule `{}` failed: {}\nContinue with the remaining modules? [y/N] ",
            module, error
        );
        parse_yes(Self::ask(prompt).await.as_deref())
    }

    async fn confirm_next(&self, completed: &ModuleName) -> bool {
        let prompt = format!("\nModule `{}` completed. Continue to the next module? [y/N] ", completed);
        parse_yes(Self::ask(prompt).await.as_deref())
    }

    async fn resolve_tool_issues(&self, report: &VerificationReport) -> ToolIssueChoice {
        let mut prompt = String::from("\nTool verification found problems:\n");
        for issue in report.issues() {
            prompt.push_str(&format!(
                "  {:<12} {:?} (installed {}, required {})\n",
                issue.name.as_str(),
                issue.status,
                issue.version.as_deref().unwrap_or("-"),
                issue.min_version.as_deref().unwrap_or("-"),
            ));
        }
        prompt.push_str("[c]ontinue anyway, [u]pdate tools, or [a]bort? ");

        loop {
            match parse_tool_choice(Self::ask(prompt.clone()).await.as_deref()) {
                Some(choice) => return choice,
                None => prompt = "Please answer c, u or a: ".to_string(),
            }
        }
    }
}

/// Only an explicit yes counts. End of input means no.
fn parse_yes(answer: Option<&str>) -> bool {
    matches!(answer, Some("y" | "yes"))
}

fn parse_tool_choice(answer: Option<&str>) -> Option<ToolIssueChoice> {
    match answer {
        None => Some(ToolIssueChoice::Abort),
        Some("c" | "continue") => Some(ToolIssueChoice::Continue),
        Some("u" | "update") => Some(ToolIssueChoice::Update),
        Some("a" | "abort") => Some(ToolIssueChoice::Abort),
        Some(_) => None,
    }
}
