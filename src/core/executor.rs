// Tool execution engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One external command to run. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub argv: Vec<String>,
    pub timeout: Option<Duration>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
}

impl ToolInvocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            timeout: None,
            cwd: None,
            stdin: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Feed `input` to the process on stdin.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// The binary name, i.e. `argv[0]`.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Captured output of a finished process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
}

/// What happened to an invocation. Callers branch on the variant instead of
/// catching errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok(ToolResult),
    ToolMissing { tool: String },
    RateLimited { tool: String },
    TimedOut { tool: String, timeout: Duration },
    Failed { result: Option<ToolResult>, detail: String },
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok(_))
    }

    /// Whether running the same invocation again could help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolOutcome::TimedOut { .. } | ToolOutcome::Failed { .. })
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match self {
            ToolOutcome::Ok(result) => Some(result),
            ToolOutcome::Failed { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<ToolResult> {
        match self {
            ToolOutcome::Ok(result) => Some(result),
            _ => None,
        }
    }

    /// Stdout of a successful run, or `None`.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ToolOutcome::Ok(result) => Some(result.stdout.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutcome::Ok(r) => write!(f, "completed in {:.2}s", r.duration_secs),
            ToolOutcome::ToolMissing { tool } => write!(f, "tool `{}` not found on PATH", tool),
            ToolOutcome::RateLimited { tool } => write!(f, "rate limit exceeded for `{}`", tool),
            ToolOutcome::TimedOut { tool, timeout } => {
                write!(f, "`{}` timed out after {:.1}s", tool, timeout.as_secs_f64())
            }
            ToolOutcome::Failed { detail, .. } => write!(f, "{}", detail),
        }
    }
}

/// Runs external processes with a bounded worker pool.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    default_timeout: Duration,
    workers: Arc<Semaphore>,
}

impl ToolRunner {
    pub fn new(default_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            default_timeout,
            workers: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run one invocation to completion or timeout.
    ///
    /// A binary that cannot be resolved yields [`ToolOutcome::ToolMissing`]
    /// without spawning anything. A non-zero exit yields
    /// [`ToolOutcome::Failed`] carrying the captured output; retrying is up
    /// to the caller.
    pub async fn execute(&self, invocation: &ToolInvocation) -> ToolOutcome {
        let Some(program) = invocation.program() else {
            return ToolOutcome::Failed {
                result: None,
                detail: "empty command".to_string(),
            };
        };

        let path = match which::which(program) {
            Ok(path) => path,
            Err(_) => {
                warn!(tool = program, "Tool not found on PATH");
                return ToolOutcome::ToolMissing {
                    tool: program.to_string(),
                };
            }
        };

        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ToolOutcome::Failed {
                    result: None,
                    detail: "worker pool closed".to_string(),
                };
            }
        };

        let timeout = invocation.timeout.unwrap_or(self.default_timeout);
        let mut command = Command::new(&path);
        command
            .args(&invocation.argv[1..])
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        debug!(tool = program, args = ?&invocation.argv[1..], timeout_secs = timeout.as_secs_f64(), "Spawning tool");
        let started = Instant::now();

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(tool = program, error = %e, "Failed to spawn tool");
                return ToolOutcome::Failed {
                    result: None,
                    detail: format!("failed to spawn `{}`: {}", program, e),
                };
            }
        };

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            let input = input.clone();
            // Written from a separate task so a full stdout pipe cannot
            // deadlock against a blocked stdin write.
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        // Dropping the future drops the child, and kill_on_drop terminates it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ToolOutcome::Failed {
                    result: None,
                    detail: format!("failed to collect output of `{}`: {}", program, e),
                };
            }
            Err(_) => {
                warn!(tool = program, timeout_secs = timeout.as_secs_f64(), "Tool timed out, process killed");
                return ToolOutcome::TimedOut {
                    tool: program.to_string(),
                    timeout,
                };
            }
        };

        let result = ToolResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration_secs: started.elapsed().as_secs_f64(),
        };

        if result.success {
            debug!(tool = program, duration_secs = result.duration_secs, "Tool finished");
            ToolOutcome::Ok(result)
        } else {
            let stderr = result.stderr.trim();
            let detail = if stderr.is_empty() {
                match result.exit_code {
                    Some(code) => format!("`{}` exited with code {}", program, code),
                    None => format!("`{}` terminated by signal", program),
                }
            } else {
                stderr.to_string()
            };
            debug!(tool = program, exit_code = ?result.exit_code, "Tool failed");
            ToolOutcome::Failed {
                result: Some(result),
                detail,
            }
        }
    }
}
