// HTTP probing of resolved hosts

use super::dns_analysis::string_list;
use super::{DnsAnalysisModule, ModuleContext, ReconModule, tool_requirements};
use crate::core::ToolInvocation;
use crate::types::{ModuleName, ToolName};
use crate::utils::{merge_unique, output_lines};
use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Probes resolved hosts with httpx and keeps the ones that answer.
pub struct WebProbingModule;

impl WebProbingModule {
    pub const NAME: &'static str = "web_probing";
}

/// The subset of an httpx JSON line the pipeline keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub url: String,
    #[serde(default, alias = "status-code")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub webserver: Option<String>,
}

#[async_trait]
impl ReconModule for WebProbingModule {
    fn name(&self) -> ModuleName {
        ModuleName::new(Self::NAME)
    }

    fn dependencies(&self) -> Vec<ModuleName> {
        vec![ModuleName::new(DnsAnalysisModule::NAME)]
    }

    fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        tool_requirements(["httpx"])
    }

    async fn run(&self, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value> {
        let dns = ctx.dependency_results(DnsAnalysisModule::NAME).await?;
        let hosts = string_list(&dns["resolved_hosts"]);
        if hosts.is_empty() {
            info!("No resolved hosts to probe");
            return Ok(json!({"live_urls": [], "probes": [], "count": 0}));
        }

        let invocation = ToolInvocation::new(["httpx", "-silent", "-json", "-title", "-web-server", "-status-code"])
            .with_stdin(hosts.join("\n"));
        let outcome = ctx.invoke_with_retry(invocation).await;
        let Some(stdout) = outcome.stdout() else {
            bail!("httpx failed: {}", outcome);
        };
        ctx.write_raw("httpx.jsonl", stdout).await?;

        let mut probes = parse_probes(stdout);
        probes.sort_by(|a, b| a.url.cmp(&b.url));
        probes.dedup_by(|a, b| a.url == b.url);
        let live_urls = merge_unique([probes.iter().map(|p| p.url.as_str())]);

        info!(probed = hosts.len(), live = live_urls.len(), "Web probing complete");
        Ok(json!({
            "live_urls": live_urls,
            "probes": probes,
            "count": live_urls.len(),
        }))
    }
}

fn parse_probes(output: &str) -> Vec<Probe> {
    output_lines(output)
        .filter_map(|line| match serde_json::from_str::<Probe>(line) {
            Ok(probe) => Some(probe),
            Err(e) => {
                debug!(error = %e, "Skipping unparseable httpx line");
                None
            }
        })
        .collect()
}
