// Content discovery on live web servers

use super::dns_analysis::string_list;
use super::{ModuleContext, ReconModule, WebProbingModule, tool_requirements};
use crate::core::{TaskOutcome, ToolInvocation, ToolOutcome};
use crate::error::ModuleSkipped;
use crate::types::{ModuleName, ToolName};
use crate::utils::{merge_unique, output_lines};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

const MATCH_CODES: &str = "200,204,301,302,307,401,403";

/// Runs ffuf against every live URL, one task per URL.
pub struct WebFuzzingModule;

impl WebFuzzingModule {
    pub const NAME: &'static str = "web_fuzzing";
}

fn ffuf_command(url: &str, wordlist: &str) -> Vec<String> {
    vec![
        "ffuf".to_string(),
        "-u".to_string(),
        format!("{}/FUZZ", url.trim_end_matches('/')),
        "-w".to_string(),
        wordlist.to_string(),
        "-mc".to_string(),
        MATCH_CODES.to_string(),
        "-s".to_string(),
    ]
}

#[async_trait]
impl ReconModule for WebFuzzingModule {
    fn name(&self) -> ModuleName {
        ModuleName::new(Self::NAME)
    }

    fn dependencies(&self) -> Vec<ModuleName> {
        vec![ModuleName::new(WebProbingModule::NAME)]
    }

    fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        tool_requirements(["ffuf"])
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(300))
    }

    async fn run(&self, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value> {
        let wordlist = ctx.config().wordlists.web_content.clone();
        if !wordlist.is_file() {
            warn!(wordlist = %wordlist.display(), "Wordlist not found, skipping fuzzing");
            return Err(ModuleSkipped::new(format!("wordlist {} not found", wordlist.display())).into());
        }

        let probing = ctx.dependency_results(WebProbingModule::NAME).await?;
        let urls = string_list(&probing["live_urls"]);
        let wordlist = wordlist.to_string_lossy().into_owned();

        let mut group = ctx.task_group::<(String, ToolOutcome)>();
        for url in urls {
            let ctx = ctx.clone();
            let argv = ffuf_command(&url, &wordlist);
            group.spawn(url.clone(), async move {
                let outcome = ctx.invoke_with_retry(ToolInvocation::new(argv)).await;
                (url, outcome)
            });
        }

        let mut findings = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for report in group.join_all().await {
            let (url, outcome) = match report.outcome {
                TaskOutcome::Completed(pair) => pair,
                TaskOutcome::Cancelled => continue,
                TaskOutcome::Panicked(msg) => {
                    failed.insert(report.label, msg);
                    continue;
                }
            };
            match outcome.stdout() {
                Some(stdout) => {
                    let paths = merge_unique([output_lines(stdout)]);
                    if !paths.is_empty() {
                        findings.insert(url, paths);
                    }
                }
                None => {
                    warn!(url = %url, outcome = %outcome, "Fuzzing failed for URL");
                    failed.insert(url, outcome.to_string());
                }
            }
        }

        let count: usize = findings.values().map(Vec::len).sum();
        info!(urls = findings.len(), paths = count, failed = failed.len(), "Web fuzzing complete");
        Ok(json!({
            "findings": findings,
            "failed": failed,
            "count": count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::modules::context::tests::test_context;
    use tempfile::TempDir;

    #[test]
    fn test_ffuf_command_appends_fuzz_keyword() {
        let argv = ffuf_command("https://www.example.com/", "/tmp/words.txt");
        assert_eq!(argv[2], "https://www.example.com/FUZZ");
        assert!(argv.contains(&"/tmp/words.txt".to_string()));
    }

    #[tokio::test]
    async fn test_missing_wordlist_skips_module() {
        let dir = TempDir::new().unwrap();
        let mut config = RunConfig::default();
        config.wordlists.web_content = dir.path().join("does-not-exist.txt");
        let ctx = test_context(&dir, WebFuzzingModule::NAME, config).await;

        let err = WebFuzzingModule.run(&ctx).await.unwrap_err();
        let skipped = err.downcast_ref::<ModuleSkipped>().unwrap();
        assert!(skipped.reason.contains("does-not-exist.txt"));
    }
}
