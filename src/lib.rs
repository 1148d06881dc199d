// Core modules
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod monitor;
pub mod session;
pub mod types;
pub mod utils;

// Pipeline structure
pub mod modules;
pub mod orchestrator;
pub mod tools;

// Re-export key types
pub use config::RunConfig;
pub use crate::core::{
    Admission, ModuleGraph, RateLimiter, ResultCache, RetryPolicy, TaskGroup, ToolInvocation, ToolOutcome,
    ToolResult, ToolRunner, run_with_retry,
};
pub use error::{ConfigurationError, ModuleExecutionError, ModuleSkipped, OrchestratorError, OrchestratorResult};
pub use events::{EventBus, EventHandler, EventTopic, PipelineEvent};
pub use modules::{ModuleContext, ModuleRegistry, ReconModule};
pub use monitor::{ModuleMetrics, PerformanceMonitor, ResourceSampler, SysinfoSampler};
pub use orchestrator::{
    AutoOperator, ConsoleOperator, ModuleRunState, Operator, Orchestrator, RunPhase, RunSummary,
    ToolIssueChoice,
};
pub use session::{ModuleRecord, ModuleStatus, SessionRecord, SessionStore};
pub use tools::{ToolCatalog, ToolChecker};
pub use types::{ModuleName, TargetDomain, ToolName};
