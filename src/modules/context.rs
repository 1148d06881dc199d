// Execution context handed to a running module

use crate::config::RunConfig;
use crate::core::{
    Admission, RateLimiter, ResultCache, RetryPolicy, TaskGroup, ToolInvocation, ToolOutcome, ToolResult,
    ToolRunner, cache_key, run_with_retry,
};
use crate::events::{EventBus, PipelineEvent};
use crate::session::SessionStore;
use crate::types::{ModuleName, TargetDomain};
use anyhow::Context as _;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Services shared by every module of one run.
#[derive(Clone)]
pub struct RunServices {
    pub target: TargetDomain,
    pub config: Arc<RunConfig>,
    pub runner: ToolRunner,
    pub cache: Arc<ResultCache<ToolResult>>,
    pub session: Arc<SessionStore>,
    pub events: Arc<EventBus>,
}

impl RunServices {
    pub fn new(target: TargetDomain, config: Arc<RunConfig>, session: Arc<SessionStore>, events: Arc<EventBus>) -> Self {
        let runner = ToolRunner::new(config.default_timeout(), config.execution.threads);
        let cache = Arc::new(ResultCache::new(config.cache_ttl(), config.cache.max_entries));
        Self {
            target,
            config,
            runner,
            cache,
            session,
            events,
        }
    }
}

/// Everything a module may touch while it runs.
///
/// Cheap to clone: fan-out tasks take their own copy.
#[derive(Clone)]
pub struct ModuleContext {
    module: ModuleName,
    services: RunServices,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    default_timeout: Option<Duration>,
    token: CancellationToken,
}

impl ModuleContext {
    pub fn new(
        module: ModuleName,
        services: RunServices,
        limiter: Arc<RateLimiter>,
        default_timeout: Option<Duration>,
        token: CancellationToken,
    ) -> Self {
        let retry = services.config.retry_policy();
        Self {
            module,
            services,
            limiter,
            retry,
            default_timeout,
            token,
        }
    }

    pub fn module(&self) -> &ModuleName {
        &self.module
    }

    pub fn target(&self) -> &TargetDomain {
        &self.services.target
    }

    pub fn config(&self) -> &RunConfig {
        &self.services.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.services.session
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run one tool invocation through the cache, the rate limiter and the
    /// runner, in that order. Never fails; inspect the outcome instead.
    pub async fn invoke(&self, invocation: ToolInvocation) -> ToolOutcome {
        let Some(tool) = invocation.program().map(str::to_string) else {
            return ToolOutcome::Failed {
                result: None,
                detail: "empty command".to_string(),
            };
        };

        let mut key_args = invocation.argv.clone();
        if let Some(stdin) = &invocation.stdin {
            key_args.push(stdin.clone());
        }
        let key = cache_key(&tool, &key_args);

        if let Some(hit) = self.services.cache.get(&key).await {
            debug!(module = %self.module, tool = %tool, "Tool result served from cache");
            self.emit_invoked(&tool, "cached", true).await;
            return ToolOutcome::Ok(hit);
        }

        if let Admission::Denied { available } = self.limiter.acquire(1).await {
            warn!(module = %self.module, tool = %tool, available, "Rate limit exceeded, invocation skipped");
            let outcome = ToolOutcome::RateLimited { tool: tool.clone() };
            self.emit_invoked(&tool, "rate_limited", false).await;
            return outcome;
        }

        let invocation = match (invocation.timeout, self.default_timeout) {
            (None, Some(timeout)) => invocation.with_timeout(timeout),
            _ => invocation,
        };

        let outcome = tokio::select! {
            _ = self.token.cancelled() => ToolOutcome::Failed {
                result: None,
                detail: format!("`{}` cancelled", tool),
            },
            outcome = self.services.runner.execute(&invocation) => outcome,
        };

        if let ToolOutcome::Ok(result) = &outcome {
            let metadata = serde_json::json!({
                "module": self.module.as_str(),
                "tool": tool,
                "exit_code": result.exit_code,
            });
            self.services.cache.set(key, result.clone(), None, metadata).await;
        }

        let label = match &outcome {
            ToolOutcome::Ok(_) => "ok",
            ToolOutcome::ToolMissing { .. } => "missing",
            ToolOutcome::RateLimited { .. } => "rate_limited",
            ToolOutcome::TimedOut { .. } => "timed_out",
            ToolOutcome::Failed { .. } => "failed",
        };
        self.emit_invoked(&tool, label, false).await;
        outcome
    }

    /// [`ModuleContext::invoke`] with exponential backoff on timeouts and
    /// non-zero exits. Returns the last outcome once attempts run out.
    pub async fn invoke_with_retry(&self, invocation: ToolInvocation) -> ToolOutcome {
        let label = format!("{}:{}", self.module, invocation.program().unwrap_or("?"));
        let result = run_with_retry(&self.retry, &label, |_attempt| {
            let ctx = self.clone();
            let invocation = invocation.clone();
            async move {
                let outcome = ctx.invoke(invocation).await;
                if outcome.is_retryable() && !ctx.is_cancelled() {
                    Err(outcome)
                } else {
                    Ok(outcome)
                }
            }
        })
        .await;

        match result {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    /// Stored results of a module this one depends on.
    pub async fn dependency_results(&self, module: &str) -> anyhow::Result<serde_json::Value> {
        self.services
            .session
            .get_results(module)
            .await
            .with_context(|| format!("failed to load results of `{}`", module))?
            .with_context(|| format!("no stored results for dependency `{}`", module))
    }

    /// A task group scoped to this module's cancellation token.
    pub fn task_group<T: Send + 'static>(&self) -> TaskGroup<T> {
        TaskGroup::new(&self.token)
    }

    pub async fn module_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(self.services.session.module_dir(self.module.as_str()).await?)
    }

    pub async fn raw_path(&self, file: &str) -> anyhow::Result<PathBuf> {
        Ok(self.services.session.raw_path(self.module.as_str(), file).await?)
    }

    pub async fn processed_path(&self, file: &str) -> anyhow::Result<PathBuf> {
        Ok(self.services.session.processed_path(self.module.as_str(), file).await?)
    }

    pub async fn temp_path(&self, file: &str) -> anyhow::Result<PathBuf> {
        Ok(self.services.session.temp_path(self.module.as_str(), file).await?)
    }

    /// Keep a tool's raw output next to the module's other artifacts.
    pub async fn write_raw(&self, file: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.raw_path(file).await?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn emit_invoked(&self, tool: &str, outcome: &str, cached: bool) {
        self.services
            .events
            .emit(PipelineEvent::ToolInvoked {
                module: self.module.to_string(),
                tool: tool.to_string(),
                outcome: outcome.to_string(),
                cached,
                at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::RateLimitConfig;
    use crate::events::EventTopic;
    use tempfile::TempDir;

    pub(crate) async fn test_context(dir: &TempDir, module: &str, config: RunConfig) -> ModuleContext {
        let target = TargetDomain::parse("example.com").unwrap();
        let session = Arc::new(SessionStore::open(dir.path(), target.as_str()).await.unwrap());
        let services = RunServices::new(target, Arc::new(config), session, Arc::new(EventBus::default()));
        let limiter = Arc::new(RateLimiter::new(module, services.config.rate_limit_config()));
        ModuleContext::new(ModuleName::new(module), services, limiter, None, CancellationToken::new())
    }

    fn fast_retry_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.execution.retry_delay_secs = 0.0;
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_caches_successful_runs() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "discovery", RunConfig::default()).await;
        let mut watch = ctx.services.events.watch();

        let first = ctx.invoke(ToolInvocation::new(["echo", "a.example.com"])).await;
        assert_eq!(first.stdout(), Some("a.example.com\n"));
        let second = ctx.invoke(ToolInvocation::new(["echo", "a.example.com"])).await;
        assert_eq!(second.stdout(), Some("a.example.com\n"));

        assert_eq!(ctx.services.cache.stats().await.hits, 1);
        let _ = watch.recv().await.unwrap();
        match watch.recv().await.unwrap() {
            PipelineEvent::ToolInvoked { cached, tool, .. } => {
                assert!(cached);
                assert_eq!(tool, "echo");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "discovery", RunConfig::default()).await;

        let outcome = ctx.invoke(ToolInvocation::new(["false"])).await;
        assert!(matches!(outcome, ToolOutcome::Failed { .. }));
        assert!(ctx.services.cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_tool_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "discovery", fast_retry_config()).await;
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        struct Count(Arc<std::sync::atomic::AtomicUsize>);
        #[async_trait::async_trait]
        impl crate::events::EventHandler for Count {
            async fn handle(&self, _event: &PipelineEvent) -> anyhow::Result<()> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }
        ctx.services
            .events
            .subscribe(EventTopic::ToolInvoked, Arc::new(Count(counter.clone())))
            .await;

        let outcome = ctx
            .invoke_with_retry(ToolInvocation::new(["definitely-not-a-real-recon-tool"]))
            .await;
        assert!(matches!(outcome, ToolOutcome::ToolMissing { .. }));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_is_retried_to_the_limit() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "discovery", fast_retry_config()).await;
        let mut watch = ctx.services.events.watch();

        let outcome = ctx.invoke_with_retry(ToolInvocation::new(["false"])).await;
        assert!(matches!(outcome, ToolOutcome::Failed { .. }));

        let mut invocations = 0;
        while let Ok(event) = watch.try_recv() {
            if matches!(event, PipelineEvent::ToolInvoked { .. }) {
                invocations += 1;
            }
        }
        assert_eq!(invocations, 3);
    }

    #[tokio::test]
    async fn test_exhausted_limiter_reports_rate_limited() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "discovery", RunConfig::default()).await;
        let limiter = Arc::new(RateLimiter::new(
            "discovery",
            RateLimitConfig {
                calls_per_second: 0.001,
                burst_size: 1,
                max_retries: 0,
                ..Default::default()
            },
        ));
        let ctx = ModuleContext { limiter, ..ctx };

        assert!(ctx.limiter().try_acquire(1).await.is_granted());
        let outcome = ctx.invoke(ToolInvocation::new(["echo", "hi"])).await;
        assert!(matches!(outcome, ToolOutcome::RateLimited { ref tool } if tool == "echo"));
    }

    #[tokio::test]
    async fn test_dependency_results() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "dns_analysis", RunConfig::default()).await;

        assert!(ctx.dependency_results("discovery").await.is_err());
        ctx.session()
            .save_results("discovery", &serde_json::json!({"subdomains": ["a.example.com"]}))
            .await
            .unwrap();
        let results = ctx.dependency_results("discovery").await.unwrap();
        assert_eq!(results["subdomains"][0], "a.example.com");
    }

    #[tokio::test]
    async fn test_write_raw_lands_in_module_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir, "discovery", RunConfig::default()).await;
        let path = ctx.write_raw("subfinder.txt", "a.example.com\n").await.unwrap();
        assert!(path.ends_with("example.com/discovery/raw/subfinder.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a.example.com\n");
    }
}
