//! Pipeline modules.
//!
//! A module is one stage of the pipeline. It declares which modules must
//! run before it and which external tools it needs, and produces a single
//! JSON results blob that the session store persists.

mod context;
mod discovery;
mod dns_analysis;
mod registry;
mod vulnerability_scan;
mod web_fuzzing;
mod web_probing;

pub use context::{ModuleContext, RunServices};
pub use discovery::DiscoveryModule;
pub use dns_analysis::DnsAnalysisModule;
pub use registry::ModuleRegistry;
pub use vulnerability_scan::VulnerabilityScanModule;
pub use web_fuzzing::WebFuzzingModule;
pub use web_probing::WebProbingModule;

use crate::types::{ModuleName, ToolName};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// One stage of the pipeline.
///
/// Only [`ReconModule::run`] is required. The orchestrator calls `setup`,
/// `run` and `cleanup` in that order, with `cleanup` called even when `run`
/// fails.
#[async_trait]
pub trait ReconModule: Send + Sync {
    fn name(&self) -> ModuleName;

    /// Modules whose results this one reads.
    fn dependencies(&self) -> Vec<ModuleName> {
        Vec::new()
    }

    /// Tools this module shells out to, with an optional minimum version.
    fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        BTreeMap::new()
    }

    /// Timeout for tool invocations that do not set their own.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    async fn setup(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value>;

    async fn cleanup(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shorthand for building a `required_tools` map with no minimum versions.
pub(crate) fn tool_requirements<const N: usize>(names: [&str; N]) -> BTreeMap<ToolName, Option<String>> {
    names
        .into_iter()
        .map(|name| (ToolName::new(name), None))
        .collect()
}
