// Template-based vulnerability scanning

use super::dns_analysis::string_list;
use super::{ModuleContext, ReconModule, WebProbingModule, tool_requirements};
use crate::core::ToolInvocation;
use crate::types::{ModuleName, ToolName};
use crate::utils::output_lines;
use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Runs nuclei over the live URLs and groups findings by severity.
pub struct VulnerabilityScanModule;

impl VulnerabilityScanModule {
    pub const NAME: &'static str = "vulnerability_scan";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub template_id: String,
    pub name: String,
    pub severity: String,
    pub matched_at: String,
}

#[async_trait]
impl ReconModule for VulnerabilityScanModule {
    fn name(&self) -> ModuleName {
        ModuleName::new(Self::NAME)
    }

    fn dependencies(&self) -> Vec<ModuleName> {
        vec![ModuleName::new(WebProbingModule::NAME)]
    }

    fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        tool_requirements(["nuclei"])
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1800))
    }

    async fn run(&self, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value> {
        let probing = ctx.dependency_results(WebProbingModule::NAME).await?;
        let urls = string_list(&probing["live_urls"]);
        if urls.is_empty() {
            info!("No live URLs to scan");
            return Ok(json!({"findings_by_severity": {}, "total": 0}));
        }

        let targets = ctx.temp_path("targets.txt").await?;
        tokio::fs::write(&targets, urls.join("\n"))
            .await
            .with_context(|| format!("failed to write {}", targets.display()))?;

        let invocation = ToolInvocation::new([
            "nuclei".to_string(),
            "-l".to_string(),
            targets.to_string_lossy().into_owned(),
            "-jsonl".to_string(),
            "-silent".to_string(),
        ]);
        let outcome = ctx.invoke_with_retry(invocation).await;
        let Some(stdout) = outcome.stdout() else {
            bail!("nuclei failed: {}", outcome);
        };
        ctx.write_raw("nuclei.jsonl", stdout).await?;

        let by_severity = group_by_severity(parse_findings(stdout));
        let total: usize = by_severity.values().map(Vec::len).sum();
        info!(urls = urls.len(), findings = total, "Vulnerability scan complete");
        Ok(json!({
            "findings_by_severity": by_severity,
            "total": total,
        }))
    }

    async fn cleanup(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        ctx.session().remove_temp(ctx.module().as_str()).await?;
        Ok(())
    }
}

fn parse_findings(output: &str) -> Vec<Finding> {
    output_lines(output)
        .filter_map(|line| {
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable nuclei line");
                    return None;
                }
            };
            let text = |v: &serde_json::Value| v.as_str().unwrap_or_default().to_string();
            Some(Finding {
                template_id: text(&value["template-id"]),
                name: text(&value["info"]["name"]),
                severity: value["info"]["severity"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_ascii_lowercase(),
                matched_at: text(&value["matched-at"]),
            })
        })
        .collect()
}

fn group_by_severity(findings: Vec<Finding>) -> BTreeMap<String, Vec<Finding>> {
    let mut grouped: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
    for finding in findings {
        grouped.entry(finding.severity.clone()).or_default().push(finding);
    }
    for list in grouped.values_mut() {
        list.sort_by(|a, b| (&a.matched_at, &a.template_id).cmp(&(&b.matched_at, &b.template_id)));
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_findings_grouped_by_severity() {
        let output = r#"
{"template-id":"tech-detect","info":{"name":"Tech","severity":"info"},"matched-at":"https://b.example.com"}
{"template-id":"exposed-git","info":{"name":"Git","severity":"HIGH"},"matched-at":"https://a.example.com/.git"}
{"template-id":"tech-detect","info":{"name":"Tech","severity":"info"},"matched-at":"https://a.example.com"}
garbage
"#;
        let grouped = group_by_severity(parse_findings(output));
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["high"][0].template_id, "exposed-git");
        let info: Vec<_> = grouped["info"].iter().map(|f| f.matched_at.as_str()).collect();
        assert_eq!(info, vec!["https://a.example.com", "https://b.example.com"]);
    }

    #[test]
    fn test_missing_severity_is_unknown() {
        let findings = parse_findings(r#"{"template-id":"x"}"#);
        assert_eq!(findings[0].severity, "unknown");
        assert_eq!(findings[0].name, "");
    }
}
