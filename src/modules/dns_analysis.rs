// DNS resolution of discovered subdomains

use super::{DiscoveryModule, ModuleContext, ReconModule, tool_requirements};
use crate::core::ToolInvocation;
use crate::types::{ModuleName, ToolName};
use crate::utils::output_lines;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::info;

/// Resolves every discovered subdomain with dnsx and keeps the A records.
pub struct DnsAnalysisModule;

impl DnsAnalysisModule {
    pub const NAME: &'static str = "dns_analysis";
}

#[async_trait]
impl ReconModule for DnsAnalysisModule {
    fn name(&self) -> ModuleName {
        ModuleName::new(Self::NAME)
    }

    fn dependencies(&self) -> Vec<ModuleName> {
        vec![ModuleName::new(DiscoveryModule::NAME)]
    }

    fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        tool_requirements(["dnsx"])
    }

    async fn run(&self, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value> {
        let discovery = ctx.dependency_results(DiscoveryModule::NAME).await?;
        let hosts = string_list(&discovery["subdomains"]);
        if hosts.is_empty() {
            info!("No subdomains to resolve");
            return Ok(json!({"records": {}, "resolved_hosts": [], "count": 0}));
        }

        let invocation = ToolInvocation::new(["dnsx", "-silent", "-a", "-resp"]).with_stdin(hosts.join("\n"));
        let outcome = ctx.invoke_with_retry(invocation).await;
        let Some(stdout) = outcome.stdout() else {
            bail!("dnsx failed: {}", outcome);
        };
        ctx.write_raw("dnsx.txt", stdout).await?;

        let records = parse_a_records(stdout);
        let resolved: Vec<&String> = records.keys().collect();
        info!(queried = hosts.len(), resolved = resolved.len(), "DNS analysis complete");
        Ok(json!({
            "records": records,
            "resolved_hosts": resolved,
            "count": resolved.len(),
        }))
    }
}

/// Strings of a JSON array, ignoring anything else.
pub(crate) fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `host [A] [1.2.3.4]` style lines into host -> addresses.
fn parse_a_records(output: &str) -> BTreeMap<String, BTreeSet<String>> {
    let mut records: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for line in output_lines(output) {
        let mut parts = line.split_whitespace();
        let Some(host) = parts.next() else { continue };
        let addrs: Vec<String> = parts
            .map(|p| p.trim_matches(|c| c == '[' || c == ']'))
            .filter(|p| p.parse::<Ipv4Addr>().is_ok())
            .map(str::to_string)
            .collect();
        if !addrs.is_empty() {
            records
                .entry(host.to_ascii_lowercase())
                .or_default()
                .extend(addrs);
        }
    }
    records
}
