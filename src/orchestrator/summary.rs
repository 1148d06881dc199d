// End-of-run summary

use crate::monitor::ResourceTotals;
use crate::session::ModuleStatus;
use crate::types::ModuleName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use super::RunPhase;

/// In-run state of one module, as shown in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleRunState {
    pub name: ModuleName,
    pub status: ModuleStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl ModuleRunState {
    pub fn pending(name: ModuleName) -> Self {
        Self {
            name,
            status: ModuleStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_secs: None,
            error: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub target: String,
    pub phase: RunPhase,
    pub modules: Vec<ModuleRunState>,
    pub totals: ResourceTotals,
}

impl RunSummary {
    pub fn count(&self, status: ModuleStatus) -> usize {
        self.modules.iter().filter(|m| m.status == status).count()
    }

    /// Plain-text table of every module followed by resource totals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run summary for {} ({})", self.target, self.phase);
        let _ = writeln!(out, "{:<22} {:<12} {:>10}  {}", "MODULE", "STATUS", "DURATION", "DETAIL");
        for m in &self.modules {
            let duration = m
                .duration_secs
                .map(|d| format!("{:.2}s", d))
                .unwrap_or_else(|| "-".to_string());
            let detail = m.error.as_deref().or(m.note.as_deref()).unwrap_or("");
            let _ = writeln!(
                out,
                "{:<22} {:<12} {:>10}  {}",
                m.name.as_str(),
                m.status.as_str(),
                duration,
                detail
            );
        }

        let _ = writeln!(
            out,
            "\nCompleted: {}  Skipped: {}  Errors: {}  Interrupted: {}  Pending: {}",
            self.count(ModuleStatus::Completed),
            self.count(ModuleStatus::Skipped),
            self.count(ModuleStatus::Error),
            self.count(ModuleStatus::Interrupted),
            self.count(ModuleStatus::Pending),
        );
        let _ = writeln!(
            out,
            "Duration: {:.2}s  Peak CPU: {:.1}%  Peak memory: {:.1}%  Network: {:.2} MB",
            self.totals.total_duration_secs,
            self.totals.peak_cpu_percent,
            self.totals.peak_memory_percent,
            self.totals.total_network_bytes as f64 / 1024.0 / 1024.0,
        );
        out
    }
}
