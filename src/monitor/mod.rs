//! Per-module and process-wide resource monitoring.
//!
//! Each module gets its own sampling task between [`PerformanceMonitor::start_module`]
//! and [`PerformanceMonitor::stop_module`]. A separate system task keeps a
//! bounded history for [`PerformanceMonitor::system_health`].

mod sampler;

pub use sampler::{ResourceSample, ResourceSampler, SysinfoSampler};

use crate::types::ModuleName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
        }
    }
}

/// Human-readable descriptions of every threshold `sample` exceeds.
pub fn check_thresholds(sample: &ResourceSample, thresholds: &Thresholds) -> Vec<String> {
    let mut breaches = Vec::new();
    if sample.cpu_percent > thresholds.cpu_percent {
        breaches.push(format!("High CPU usage: {:.1}%", sample.cpu_percent));
    }
    if sample.memory_percent > thresholds.memory_percent {
        breaches.push(format!("High memory usage: {:.1}%", sample.memory_percent));
    }
    if sample.disk_percent > thresholds.disk_percent {
        breaches.push(format!("High disk usage: {:.1}%", sample.disk_percent));
    }
    breaches
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub interval: Duration,
    pub system_interval: Duration,
    pub thresholds: Thresholds,
    pub history_size: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            system_interval: Duration::from_secs(5),
            thresholds: Thresholds::default(),
            history_size: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Monitoring,
    Stopped,
}

/// Resource usage of one module run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetrics {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub peak_cpu_percent: f64,
    pub peak_memory_percent: f64,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub total_network_bytes: u64,
    pub error_count: u32,
    pub sample_count: u64,
    pub threshold_warnings: u32,
}

impl ModuleMetrics {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            duration_secs: 0.0,
            peak_cpu_percent: 0.0,
            peak_memory_percent: 0.0,
            avg_cpu_percent: 0.0,
            avg_memory_percent: 0.0,
            total_network_bytes: 0,
            error_count: 0,
            sample_count: 0,
            threshold_warnings: 0,
        }
    }

    /// Fold one sample into the running peaks and means.
    pub fn record_sample(&mut self, sample: &ResourceSample) {
        self.sample_count += 1;
        let n = self.sample_count as f64;
        self.peak_cpu_percent = self.peak_cpu_percent.max(sample.cpu_percent);
        self.peak_memory_percent = self.peak_memory_percent.max(sample.memory_percent);
        self.avg_cpu_percent += (sample.cpu_percent - self.avg_cpu_percent) / n;
        self.avg_memory_percent += (sample.memory_percent - self.avg_memory_percent) / n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub latest: Option<ResourceSample>,
}

/// Totals across every monitored module.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceTotals {
    pub total_duration_secs: f64,
    pub peak_cpu_percent: f64,
    pub peak_memory_percent: f64,
    pub total_network_bytes: u64,
    pub error_count: u32,
}

type TaskSlot = Option<(CancellationToken, JoinHandle<()>)>;

struct ModuleEntry {
    state: MonitorState,
    metrics: ModuleMetrics,
    task: TaskSlot,
    baseline_network: u64,
    started: Instant,
}

type SharedSampler = Arc<std::sync::Mutex<Box<dyn ResourceSampler>>>;

/// Take a reading on the blocking pool. sysinfo refreshes and disk scans
/// block, so they stay off the runtime's worker threads.
async fn take_sample(sampler: &SharedSampler) -> ResourceSample {
    let sampler = sampler.clone();
    let reading = tokio::task::spawn_blocking(move || {
        let mut guard = sampler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.sample()
    })
    .await;
    match reading {
        Ok(sample) => sample,
        Err(e) => {
            warn!(error = %e, "Resource sampler task failed");
            ResourceSample::default()
        }
    }
}

/// Samples resources for modules and for the process as a whole.
pub struct PerformanceMonitor {
    sampler: SharedSampler,
    options: MonitorOptions,
    modules: Arc<Mutex<HashMap<ModuleName, ModuleEntry>>>,
    history: Arc<Mutex<VecDeque<ResourceSample>>>,
    system_task: Mutex<TaskSlot>,
    created: DateTime<Utc>,
    created_at: Instant,
}

impl PerformanceMonitor {
    pub fn new(sampler: Box<dyn ResourceSampler>, options: MonitorOptions) -> Self {
        Self {
            sampler: Arc::new(std::sync::Mutex::new(sampler)),
            options,
            modules: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            system_task: Mutex::new(None),
            created: Utc::now(),
            created_at: Instant::now(),
        }
    }

    /// Monitor backed by [`SysinfoSampler`].
    pub fn with_sysinfo(options: MonitorOptions) -> Self {
        Self::new(Box::new(SysinfoSampler::new()), options)
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Begin sampling for `module`. Does nothing if it is already monitored.
    pub async fn start_module(&self, module: &ModuleName) {
        let mut modules = self.modules.lock().await;
        if matches!(modules.get(module), Some(e) if e.state == MonitorState::Monitoring) {
            return;
        }

        let baseline = take_sample(&self.sampler).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(module_loop(
            module.clone(),
            self.sampler.clone(),
            self.modules.clone(),
            self.options.clone(),
            token.clone(),
        ));

        modules.insert(
            module.clone(),
            ModuleEntry {
                state: MonitorState::Monitoring,
                metrics: ModuleMetrics::new(Utc::now()),
                task: Some((token, handle)),
                baseline_network: baseline.network_total(),
                started: Instant::now(),
            },
        );
        debug!(module = %module, "Started module monitoring");
    }

    /// Stop sampling for `module` and finalize its metrics.
    pub async fn stop_module(&self, module: &ModuleName) -> Option<ModuleMetrics> {
        let task = {
            let mut modules = self.modules.lock().await;
            let entry = modules.get_mut(module)?;
            if entry.state != MonitorState::Monitoring {
                return Some(entry.metrics.clone());
            }
            entry.task.take()
        };

        // The loop takes the modules lock, so it must be released before awaiting.
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }

        let end = take_sample(&self.sampler).await;
        let mut modules = self.modules.lock().await;
        let entry = modules.get_mut(module)?;
        entry.metrics.total_network_bytes = end.network_total().saturating_sub(entry.baseline_network);
        entry.metrics.end_time = Some(Utc::now());
        entry.metrics.duration_secs = entry.started.elapsed().as_secs_f64();
        entry.state = MonitorState::Stopped;
        debug!(module = %module, duration_secs = entry.metrics.duration_secs, "Stopped module monitoring");
        Some(entry.metrics.clone())
    }

    pub async fn state(&self, module: &str) -> MonitorState {
        self.modules
            .lock()
            .await
            .get(module)
            .map(|e| e.state)
            .unwrap_or(MonitorState::Idle)
    }

    /// Count an error against a module's metrics.
    pub async fn record_error(&self, module: &str) {
        if let Some(entry) = self.modules.lock().await.get_mut(module) {
            entry.metrics.error_count += 1;
        }
    }

    pub async fn module_metrics(&self, module: &str) -> Option<ModuleMetrics> {
        self.modules.lock().await.get(module).map(|e| e.metrics.clone())
    }

    pub async fn all_metrics(&self) -> BTreeMap<String, ModuleMetrics> {
        self.modules
            .lock()
            .await
            .iter()
            .map(|(name, e)| (name.to_string(), e.metrics.clone()))
            .collect()
    }

    pub async fn totals(&self) -> ResourceTotals {
        let modules = self.modules.lock().await;
        let mut totals = ResourceTotals {
            total_duration_secs: self.created_at.elapsed().as_secs_f64(),
            ..Default::default()
        };
        for entry in modules.values() {
            let m = &entry.metrics;
            totals.peak_cpu_percent = totals.peak_cpu_percent.max(m.peak_cpu_percent);
            totals.peak_memory_percent = totals.peak_memory_percent.max(m.peak_memory_percent);
            totals.total_network_bytes += m.total_network_bytes;
            totals.error_count += m.error_count;
        }
        totals
    }

    /// Start the process-wide sampler. Idempotent.
    pub async fn start_system(&self) {
        let mut slot = self.system_task.lock().await;
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(system_loop(
            self.sampler.clone(),
            self.history.clone(),
            self.options.clone(),
            token.clone(),
        ));
        *slot = Some((token, handle));
        info!("System monitoring started");
    }

    pub async fn stop_system(&self) {
        let taken = self.system_task.lock().await.take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.await;
            info!("System monitoring stopped");
        }
    }

    pub async fn system_history(&self) -> Vec<ResourceSample> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn system_health(&self) -> SystemHealth {
        let latest = self.history.lock().await.back().cloned();
        let status = match &latest {
            None => HealthStatus::Unknown,
            Some(s) if check_thresholds(s, &self.options.thresholds).is_empty() => {
                HealthStatus::Healthy
            }
            Some(_) => HealthStatus::Warning,
        };
        SystemHealth { status, latest }
    }

    /// Write every module's metrics as pretty JSON to `path`.
    pub async fn save_metrics(&self, path: &Path) -> anyhow::Result<()> {
        let document = serde_json::json!({
            "timestamp": Utc::now(),
            "started": self.created,
            "total_duration_secs": self.created_at.elapsed().as_secs_f64(),
            "modules": self.all_metrics().await,
        });
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&document)?).await?;
        info!(path = %path.display(), "Saved performance metrics");
        Ok(())
    }

    /// Multi-line summary of one module's metrics.
    pub async fn module_summary(&self, module: &str) -> Option<String> {
        let m = self.module_metrics(module).await?;
        let mut lines = vec![
            format!("Performance summary for {}:", module),
            format!("  Duration:    {:.2}s", m.duration_secs),
            format!("  Peak CPU:    {:.1}%", m.peak_cpu_percent),
            format!("  Peak memory: {:.1}%", m.peak_memory_percent),
            format!("  Avg CPU:     {:.1}%", m.avg_cpu_percent),
            format!("  Avg memory:  {:.1}%", m.avg_memory_percent),
            format!(
                "  Network I/O: {:.2} MB",
                m.total_network_bytes as f64 / 1024.0 / 1024.0
            ),
        ];
        if m.error_count > 0 {
            lines.push(format!("  Errors:      {}", m.error_count));
        }
        Some(lines.join("\n"))
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some((token, _)) = self.system_task.get_mut().take() {
            token.cancel();
        }
        if let Ok(mut modules) = self.modules.try_lock() {
            for entry in modules.values_mut() {
                if let Some((token, _)) = entry.task.take() {
                    token.cancel();
                }
            }
        }
    }
}

async fn module_loop(
    module: ModuleName,
    sampler: SharedSampler,
    modules: Arc<Mutex<HashMap<ModuleName, ModuleEntry>>>,
    options: MonitorOptions,
    token: CancellationToken,
) {
    loop {
        let sample = take_sample(&sampler).await;
        let breaches = check_thresholds(&sample, &options.thresholds);
        if !breaches.is_empty() {
            warn!(module = %module, "Resource warning: {}", breaches.join(", "));
        }

        if let Some(entry) = modules.lock().await.get_mut(&module) {
            entry.metrics.record_sample(&sample);
            if !breaches.is_empty() {
                entry.metrics.threshold_warnings += 1;
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}

async fn system_loop(
    sampler: SharedSampler,
    history: Arc<Mutex<VecDeque<ResourceSample>>>,
    options: MonitorOptions,
    token: CancellationToken,
) {
    loop {
        let sample = take_sample(&sampler).await;
        for breach in check_thresholds(&sample, &options.thresholds) {
            warn!("System {}", breach);
        }

        {
            let mut history = history.lock().await;
            history.push_back(sample);
            while history.len() > options.history_size.max(1) {
                history.pop_front();
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(options.system_interval) => {}
        }
    }
}
