use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use recon_orchestrator::tools::VerificationReport;
use recon_orchestrator::{
    AutoOperator, ConsoleOperator, ModuleRegistry, Operator, Orchestrator, OrchestratorError, RunConfig,
    SessionStore, TargetDomain, ToolCatalog, ToolChecker, ToolIssueChoice, ToolRunner,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recon-orchestrator")]
#[command(about = "Dependency-ordered reconnaissance pipeline")]
struct Cli {
    /// Config file (JSON). Defaults to RECON_CONFIG, then the XDG config dir, then ./recon.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, global = true, env = "RECON_OUTPUT")]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline against a domain
    Run {
        domain: String,
        /// Never prompt: continue after module errors and past tool issues
        #[arg(short, long, default_value_t = false)]
        yes: bool,
        /// Archive any previous session for this domain first
        #[arg(long, default_value_t = false)]
        fresh: bool,
        /// Maximum concurrent tool processes
        #[arg(long)]
        threads: Option<usize>,
        /// Default tool timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Tool invocations per second
        #[arg(long)]
        rate_limit: Option<f64>,
    },
    /// Show the stored per-module status of a domain's session
    Status { domain: String },
    /// Archive a domain's session and start a fresh one
    Reset { domain: String },
    /// Verify the tools the built-in modules need
    CheckTools {
        /// Run install commands for missing or outdated tools
        #[arg(long, default_value_t = false)]
        install: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("recon_orchestrator=info".parse()?))
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = RunConfig::load(cli.config.as_deref())?;
    if let Some(output) = cli.output {
        config.output.directory = output;
    }

    match cli.command {
        Commands::Run {
            domain,
            yes,
            fresh,
            threads,
            timeout,
            rate_limit,
        } => {
            if let Some(threads) = threads {
                config.execution.threads = threads;
            }
            if let Some(timeout) = timeout {
                config.execution.default_timeout_secs = timeout;
            }
            if let Some(rate) = rate_limit {
                config.rate_limit.calls_per_second = rate;
            }

            let target = TargetDomain::parse(&domain)?;
            let operator: Arc<dyn Operator> = if yes {
                Arc::new(AutoOperator {
                    continue_on_error: true,
                    tool_issues: ToolIssueChoice::Continue,
                })
            } else {
                Arc::new(ConsoleOperator)
            };

            let orchestrator = Orchestrator::new(target, config, ModuleRegistry::builtin(), operator).await?;
            if fresh {
                let archived = orchestrator.session().archive().await?;
                info!(archive = %archived.display(), "Archived previous session");
            }

            let token = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    token.cancel();
                }
            });

            match orchestrator.run().await {
                Ok(summary) => println!("{}", summary.render()),
                Err(OrchestratorError::Interrupted) => {
                    println!("{}", orchestrator.summary().await.render());
                    bail!("run interrupted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Status { domain } => {
            let target = TargetDomain::parse(&domain)?;
            let store = SessionStore::open(&config.output.directory, target.as_str()).await?;
            let record = store.record().await;

            println!("Session for {} (started {})", record.target, record.start_time.format("%Y-%m-%d %H:%M:%S UTC"));
            if record.modules.is_empty() {
                println!("No modules have run yet.");
                return Ok(());
            }
            println!("{:<22} {:<12} {:<22} {}", "MODULE", "STATUS", "COMPLETED", "ERROR");
            println!("{}", "-".repeat(80));
            for (name, module) in &record.modules {
                let completed = module
                    .completed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<22} {:<12} {:<22} {}",
                    name,
                    module.status.as_str(),
                    completed,
                    module.error.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Reset { domain } => {
            let target = TargetDomain::parse(&domain)?;
            let store = SessionStore::open(&config.output.directory, target.as_str()).await?;
            let archived = store.archive().await?;
            println!("Session archived to {}", archived.display());
        }
        Commands::CheckTools { install } => {
            config.validate()?;
            let catalog = Arc::new(ToolCatalog::builtin().with_overrides(&config.tools));
            let checker = ToolChecker::new(catalog, ToolRunner::new(config.default_timeout(), config.execution.threads));
            let required = ModuleRegistry::builtin().required_tools();

            let mut report = checker.verify(&required).await;
            if install && report.has_issues() {
                for issue in report.issues() {
                    let ok = checker.install(issue.name.as_str()).await;
                    println!("install {:<12} {}", issue.name.as_str(), if ok { "ok" } else { "failed" });
                }
                report = checker.verify(&required).await;
            }

            print_report(&report);
            if report.has_issues() {
                bail!("{} tool(s) missing or outdated", report.issues().count());
            }
        }
    }

    Ok(())
}

fn print_report(report: &VerificationReport) {
    println!("{:<12} {:<10} {:<14} {:<10} {}", "TOOL", "STATUS", "VERSION", "MINIMUM", "PATH");
    println!("{}", "-".repeat(80));
    for status in report.tools.values() {
        println!(
            "{:<12} {:<10} {:<14} {:<10} {}",
            status.name.as_str(),
            format!("{:?}", status.status).to_lowercase(),
            status.version.as_deref().unwrap_or("-"),
            status.min_version.as_deref().unwrap_or("-"),
            status
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}
