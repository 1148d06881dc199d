//! Run driver.
//!
//! The orchestrator builds the dependency graph, verifies tools, then runs
//! modules one at a time in dependency order. Between modules it may stop to
//! ask the [`Operator`] whether to go on. Everything a module produces goes
//! through the [`SessionStore`], so an interrupted run can be resumed.

mod operator;
mod summary;

pub use operator::{AutoOperator, ConsoleOperator, Operator, ToolIssueChoice};
pub use summary::{ModuleRunState, RunSummary};

use crate::config::RunConfig;
use crate::core::RateLimiter;
use crate::error::{ModuleExecutionError, ModuleSkipped, OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, PipelineEvent};
use crate::modules::{ModuleContext, ModuleRegistry, ReconModule, RunServices};
use crate::monitor::PerformanceMonitor;
use crate::session::{ModuleStatus, SessionStore};
use crate::tools::{ToolCatalog, ToolChecker, VerificationReport};
use crate::types::{ModuleName, TargetDomain};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RESUMED_NOTE: &str = "results reused from previous session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    Initializing,
    VerifyingTools,
    RunningModules,
    Finalizing,
    Done,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Initializing => "initializing",
            RunPhase::VerifyingTools => "verifying-tools",
            RunPhase::RunningModules => "running-modules",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

enum ModuleOutcome {
    Completed,
    Skipped,
    Failed(String),
    Interrupted,
}

/// Drives one run against one target.
pub struct Orchestrator {
    target: TargetDomain,
    config: Arc<RunConfig>,
    registry: ModuleRegistry,
    order: Vec<ModuleName>,
    services: RunServices,
    checker: ToolChecker,
    monitor: PerformanceMonitor,
    operator: Arc<dyn Operator>,
    token: CancellationToken,
    phase: Mutex<RunPhase>,
    states: Mutex<Vec<ModuleRunState>>,
}

impl Orchestrator {
    /// Validate the configuration, build the dependency graph and open the
    /// target's session. Any configuration problem fails here, before a
    /// single module runs.
    pub async fn new(
        target: TargetDomain,
        config: RunConfig,
        registry: ModuleRegistry,
        operator: Arc<dyn Operator>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let order = registry.graph()?.compute_order()?;
        info!(
            domain = %target,
            order = ?order.iter().map(ModuleName::as_str).collect::<Vec<_>>(),
            "Computed module execution order"
        );

        let config = Arc::new(config);
        let session = Arc::new(SessionStore::open(&config.output.directory, target.as_str()).await?);
        let services = RunServices::new(target.clone(), config.clone(), session, Arc::new(EventBus::default()));

        let catalog = Arc::new(ToolCatalog::builtin().with_overrides(&config.tools));
        let checker = ToolChecker::new(catalog, services.runner.clone());
        let monitor = PerformanceMonitor::with_sysinfo(config.monitor_options());
        let states = order.iter().cloned().map(ModuleRunState::pending).collect();

        Ok(Self {
            target,
            config,
            registry,
            order,
            services,
            checker,
            monitor,
            operator,
            token: CancellationToken::new(),
            phase: Mutex::new(RunPhase::Initializing),
            states: Mutex::new(states),
        })
    }

    /// Replace the resource monitor, e.g. with one backed by a scripted sampler.
    pub fn with_monitor(mut self, monitor: PerformanceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_checker(mut self, checker: ToolChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Token that cancels the run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn execution_order(&self) -> &[ModuleName] {
        &self.order
    }

    pub fn session(&self) -> &SessionStore {
        &self.services.session
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub async fn phase(&self) -> RunPhase {
        *self.phase.lock().await
    }

    pub async fn module_states(&self) -> Vec<ModuleRunState> {
        self.states.lock().await.clone()
    }

    pub async fn summary(&self) -> RunSummary {
        RunSummary {
            target: self.target.to_string(),
            phase: self.phase().await,
            modules: self.module_states().await,
            totals: self.monitor.totals().await,
        }
    }

    /// Run every module in order.
    ///
    /// Returns the summary when the run reaches its end, including the case
    /// where the operator stopped it after a module error. Aborted tool
    /// verification and cancellation are returned as errors.
    pub async fn run(&self) -> OrchestratorResult<RunSummary> {
        self.services
            .events
            .emit(PipelineEvent::RunStarted {
                target: self.target.to_string(),
                modules: self.order.iter().map(ToString::to_string).collect(),
                at: Utc::now(),
            })
            .await;
        self.monitor.start_system().await;

        self.set_phase(RunPhase::VerifyingTools).await;
        if let Err(e) = self.verify_tools().await {
            error!(domain = %self.target, error = %e, "Tool verification aborted the run");
            self.set_phase(RunPhase::Aborted).await;
            self.monitor.stop_system().await;
            return Err(e);
        }

        self.set_phase(RunPhase::RunningModules).await;
        for (index, name) in self.order.iter().enumerate() {
            if self.token.is_cancelled() {
                break;
            }

            match self.run_module(name).await? {
                ModuleOutcome::Completed => {
                    let remaining = self.order.len() - index - 1;
                    if remaining > 0
                        && !self.token.is_cancelled()
                        && !self.operator.confirm_next(name).await
                    {
                        info!(module = %name, remaining, "Operator stopped the run after module completed");
                        break;
                    }
                }
                ModuleOutcome::Skipped => {}
                ModuleOutcome::Interrupted => break,
                ModuleOutcome::Failed(message) => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    if !self.operator.confirm_continue(name, &message).await {
                        warn!(module = %name, "Operator halted the run after module failure");
                        break;
                    }
                }
            }
        }

        self.set_phase(RunPhase::Finalizing).await;
        self.finalize().await?;

        let summary = if self.token.is_cancelled() {
            self.set_phase(RunPhase::Aborted).await;
            None
        } else {
            self.set_phase(RunPhase::Done).await;
            Some(self.summary().await)
        };

        let states = self.module_states().await;
        self.services
            .events
            .emit(PipelineEvent::RunFinished {
                target: self.target.to_string(),
                completed: states
                    .iter()
                    .filter(|s| matches!(s.status, ModuleStatus::Completed | ModuleStatus::Skipped))
                    .count(),
                errored: states.iter().filter(|s| s.status == ModuleStatus::Error).count(),
                at: Utc::now(),
            })
            .await;

        summary.ok_or(OrchestratorError::Interrupted)
    }

    async fn verify_tools(&self) -> OrchestratorResult<()> {
        let required = self.registry.required_tools();
        if required.is_empty() {
            return Ok(());
        }

        let report = self.checker.verify(&required).await;
        self.export_report(&report);
        if !report.has_issues() {
            info!(tools = required.len(), "All required tools verified");
            return Ok(());
        }

        match self.operator.resolve_tool_issues(&report).await {
            ToolIssueChoice::Continue => {
                warn!(issues = report.issues().count(), "Continuing despite tool issues");
                Ok(())
            }
            ToolIssueChoice::Abort => Err(OrchestratorError::VerificationAborted),
            ToolIssueChoice::Update => {
                for issue in report.issues() {
                    if !self.checker.install(issue.name.as_str()).await {
                        warn!(tool = %issue.name, "Tool update failed");
                    }
                }
                let report = self.checker.verify(&required).await;
                self.export_report(&report);
                if report.has_issues() {
                    warn!(
                        issues = report.issues().count(),
                        "Tools still have issues after update, dependent invocations may fail"
                    );
                }
                Ok(())
            }
        }
    }

    fn export_report(&self, report: &VerificationReport) {
        let path = self.services.session.root().join("tool_status.json");
        if let Err(e) = report.export(&path) {
            warn!(path = %path.display(), error = %e, "Failed to export tool status");
        }
    }

    async fn run_module(&self, name: &ModuleName) -> OrchestratorResult<ModuleOutcome> {
        let session = &self.services.session;
        let Some(module) = self.registry.get(name.as_str()) else {
            // The order is computed from the registry, so this cannot happen.
            return Ok(ModuleOutcome::Failed(format!("module `{}` is not registered", name)));
        };

        if session.module_status(name.as_str()).await == ModuleStatus::Completed
            && session.get_results(name.as_str()).await?.is_some()
        {
            info!(module = %name, "Module already completed, reusing stored results");
            self.update_state(name, |s| {
                s.status = ModuleStatus::Skipped;
                s.note = Some(RESUMED_NOTE.to_string());
            })
            .await;
            return Ok(ModuleOutcome::Skipped);
        }

        for dep in module.dependencies() {
            if session.get_results(dep.as_str()).await?.is_none() {
                let err = ModuleExecutionError::new(
                    name.as_str(),
                    format!("dependency `{}` has no stored results", dep),
                );
                return self.fail_module(name, err.to_string()).await;
            }
        }

        let started = Utc::now();
        self.update_state(name, |s| {
            s.status = ModuleStatus::Running;
            s.started_at = Some(started);
            s.error = None;
        })
        .await;
        session.update_module_status(name.as_str(), ModuleStatus::Running).await?;
        session.module_dir(name.as_str()).await?;
        self.services
            .events
            .emit(PipelineEvent::ModuleStarted {
                module: name.to_string(),
                at: started,
            })
            .await;
        info!(module = %name, "Starting module");

        let limiter = Arc::new(RateLimiter::new(name.as_str(), self.config.rate_limit_config()));
        limiter.start_monitoring().await;
        let ctx = ModuleContext::new(
            name.clone(),
            self.services.clone(),
            limiter.clone(),
            module.default_timeout(),
            self.token.child_token(),
        );

        self.monitor.start_module(name).await;
        let result = tokio::select! {
            _ = self.token.cancelled() => None,
            r = setup_and_run(module.as_ref(), &ctx) => Some(r),
        };
        if let Some(Err(e)) = &result {
            if e.downcast_ref::<ModuleSkipped>().is_none() {
                self.monitor.record_error(name.as_str()).await;
            }
        }
        let metrics = self.monitor.stop_module(name).await;
        limiter.stop_monitoring().await;

        if let Err(e) = module.cleanup(&ctx).await {
            warn!(module = %name, error = %e, "Module cleanup failed");
        }
        if let Some(metrics) = &metrics {
            match serde_json::to_value(metrics) {
                Ok(value) => session.update_metrics(name.as_str(), value).await?,
                Err(e) => warn!(module = %name, error = %e, "Failed to serialize module metrics"),
            }
            if let Some(text) = self.monitor.module_summary(name.as_str()).await {
                info!(module = %name, "{}", text);
            }
        }
        let duration = metrics.map(|m| m.duration_secs);

        match result {
            None => {
                warn!(module = %name, "Module interrupted");
                session
                    .record_failure(name.as_str(), ModuleStatus::Interrupted, "run interrupted")
                    .await?;
                session.remove_temp(name.as_str()).await?;
                self.update_state(name, |s| {
                    s.status = ModuleStatus::Interrupted;
                    s.completed_at = Some(Utc::now());
                    s.duration_secs = duration;
                    s.error = Some("run interrupted".to_string());
                })
                .await;
                Ok(ModuleOutcome::Interrupted)
            }
            Some(Ok(results)) => {
                session.save_results(name.as_str(), &results).await?;
                let duration_secs = duration.unwrap_or_default();
                self.update_state(name, |s| {
                    s.status = ModuleStatus::Completed;
                    s.completed_at = Some(Utc::now());
                    s.duration_secs = duration;
                })
                .await;
                self.services
                    .events
                    .emit(PipelineEvent::ModuleCompleted {
                        module: name.to_string(),
                        duration_secs,
                        at: Utc::now(),
                    })
                    .await;
                info!(module = %name, duration_secs, "Module completed");
                Ok(ModuleOutcome::Completed)
            }
            Some(Err(e)) => match e.downcast::<ModuleSkipped>() {
                Ok(skipped) => {
                    warn!(module = %name, reason = %skipped.reason, "Module skipped");
                    session.update_module_status(name.as_str(), ModuleStatus::Skipped).await?;
                    self.update_state(name, |s| {
                        s.status = ModuleStatus::Skipped;
                        s.completed_at = Some(Utc::now());
                        s.duration_secs = duration;
                        s.note = Some(skipped.reason);
                    })
                    .await;
                    Ok(ModuleOutcome::Skipped)
                }
                Err(e) => {
                    let err = ModuleExecutionError::new(name.as_str(), format!("{:#}", e));
                    self.update_state(name, |s| s.duration_secs = duration).await;
                    self.fail_module(name, err.to_string()).await
                }
            },
        }
    }

    async fn fail_module(&self, name: &ModuleName, message: String) -> OrchestratorResult<ModuleOutcome> {
        error!(module = %name, error = %message, "Module failed");
        self.services
            .session
            .record_failure(name.as_str(), ModuleStatus::Error, &message)
            .await?;
        self.update_state(name, |s| {
            s.status = ModuleStatus::Error;
            s.completed_at = Some(Utc::now());
            s.error = Some(message.clone());
        })
        .await;
        self.services
            .events
            .emit(PipelineEvent::ModuleFailed {
                module: name.to_string(),
                error: message.clone(),
                at: Utc::now(),
            })
            .await;
        Ok(ModuleOutcome::Failed(message))
    }

    async fn finalize(&self) -> OrchestratorResult<()> {
        let session = &self.services.session;
        let metrics_path = session.root().join("metrics.json");
        if let Err(e) = self.monitor.save_metrics(&metrics_path).await {
            warn!(path = %metrics_path.display(), error = %e, "Failed to save metrics");
        }
        self.monitor.stop_system().await;
        session.save().await?;

        let stats = self.services.cache.stats().await;
        info!(
            domain = %self.target,
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            "Run finalized"
        );
        Ok(())
    }

    async fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock().await = phase;
        info!(domain = %self.target, phase = %phase, "Run phase changed");
    }

    async fn update_state<F>(&self, name: &ModuleName, update: F)
    where
        F: FnOnce(&mut ModuleRunState),
    {
        if let Some(state) = self.states.lock().await.iter_mut().find(|s| &s.name == name) {
            update(state);
        }
    }
}

async fn setup_and_run(module: &dyn ReconModule, ctx: &ModuleContext) -> anyhow::Result<serde_json::Value> {
    module.setup(ctx).await?;
    module.run(ctx).await
}
