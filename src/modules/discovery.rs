// Passive subdomain discovery

use super::{ModuleContext, ReconModule, tool_requirements};
use crate::core::{TaskOutcome, ToolInvocation, ToolOutcome};
use crate::types::{ModuleName, ToolName};
use crate::utils::{merge_unique, output_lines};
use anyhow::bail;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Runs subfinder, amass and findomain side by side and merges their
/// answers into one sorted list of in-scope subdomains.
pub struct DiscoveryModule;

impl DiscoveryModule {
    pub const NAME: &'static str = "discovery";
}

fn source_commands(domain: &str) -> Vec<(&'static str, Vec<String>)> {
    let argv = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    vec![
        ("subfinder", argv(&["subfinder", "-d", domain, "-silent", "-all"])),
        ("amass", argv(&["amass", "enum", "-passive", "-d", domain])),
        ("findomain", argv(&["findomain", "-t", domain, "-q"])),
    ]
}

#[async_trait]
impl ReconModule for DiscoveryModule {
    fn name(&self) -> ModuleName {
        ModuleName::new(Self::NAME)
    }

    fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        tool_requirements(["subfinder", "amass", "findomain"])
    }

    async fn run(&self, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value> {
        let domain = ctx.target().to_string();
        let mut group = ctx.task_group::<(&'static str, ToolOutcome)>();
        for (tool, argv) in source_commands(&domain) {
            let ctx = ctx.clone();
            group.spawn(tool, async move {
                (tool, ctx.invoke_with_retry(ToolInvocation::new(argv)).await)
            });
        }

        let mut lists = Vec::new();
        let mut sources = BTreeMap::new();
        for report in group.join_all().await {
            let (tool, outcome) = match report.outcome {
                TaskOutcome::Completed(pair) => pair,
                TaskOutcome::Cancelled => continue,
                TaskOutcome::Panicked(msg) => {
                    warn!(task = %report.label, panic = %msg, "Discovery task panicked");
                    sources.insert(report.label, json!({"status": "panicked"}));
                    continue;
                }
            };

            match outcome.stdout() {
                Some(stdout) => {
                    ctx.write_raw(&format!("{}.txt", tool), stdout).await?;
                    let found: Vec<String> = output_lines(stdout).map(str::to_string).collect();
                    info!(tool = tool, found = found.len(), "Source finished");
                    sources.insert(tool.to_string(), json!({"status": "ok", "found": found.len()}));
                    lists.push(found);
                }
                None => {
                    warn!(tool = tool, outcome = %outcome, "Source produced no output");
                    sources.insert(tool.to_string(), json!({"status": outcome.to_string()}));
                }
            }
        }

        if ctx.is_cancelled() {
            bail!("discovery cancelled");
        }
        if lists.is_empty() {
            bail!("no discovery source produced output for {}", domain);
        }

        let subdomains = in_scope(ctx, lists);
        info!(domain = %domain, count = subdomains.len(), "Discovery complete");
        Ok(json!({
            "subdomains": subdomains,
            "count": subdomains.len(),
            "sources": sources,
        }))
    }
}

fn in_scope(ctx: &ModuleContext, lists: Vec<Vec<String>>) -> Vec<String> {
    merge_unique(lists.into_iter().map(|list| {
        list.into_iter().map(|host| host.trim_end_matches('.').to_ascii_lowercase())
    }))
    .into_iter()
    .filter(|host| ctx.target().in_scope(host))
    .collect()
}
