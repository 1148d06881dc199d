// File-backed session store

use super::{ModuleRecord, ModuleStatus, SessionError, SessionRecord, SessionResult};
use crate::utils::merge_json_objects;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SESSION_FILE: &str = "session.json";
const TARGET_SUBDIRS: [&str; 4] = ["raw", "processed", "temp", "logs"];
const MODULE_SUBDIRS: [&str; 3] = ["raw", "processed", "temp"];

/// Session state for one target, persisted after every change.
///
/// Layout:
/// ```text
/// <output>/<target>/session.json
/// <output>/<target>/{raw,processed,temp,logs}/
/// <output>/<target>/<module>/{raw,processed,temp}/
/// <output>/<target>/<module>/processed/<module>_results.json
/// ```
pub struct SessionStore {
    output_dir: PathBuf,
    root: PathBuf,
    target: String,
    record: Mutex<SessionRecord>,
    results: Mutex<HashMap<String, serde_json::Value>>,
}

impl SessionStore {
    /// Open the session for `target`, creating it if absent.
    ///
    /// A `session.json` that cannot be parsed is renamed aside and replaced
    /// with a fresh record. Modules left `running` by a previous process are
    /// rewritten as `interrupted`.
    pub async fn open(output_dir: impl Into<PathBuf>, target: &str) -> SessionResult<Self> {
        let output_dir = output_dir.into();
        let root = output_dir.join(target);
        create_subdirs(&root, &TARGET_SUBDIRS).await?;

        let session_path = root.join(SESSION_FILE);
        let mut record = match fs::read_to_string(&session_path).await {
            Ok(raw) => match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) => {
                    info!(domain = target, modules = record.modules.len(), "Resuming existing session");
                    record
                }
                Err(e) => {
                    let aside = root.join(format!(
                        "{}.corrupt-{}",
                        SESSION_FILE,
                        Utc::now().format("%Y%m%d_%H%M%S")
                    ));
                    warn!(
                        path = %session_path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "Session file is corrupt, starting a fresh session"
                    );
                    fs::rename(&session_path, &aside)
                        .await
                        .map_err(SessionError::io(&session_path))?;
                    SessionRecord::new(target)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionRecord::new(target),
            Err(e) => return Err(SessionError::io(&session_path)(e)),
        };

        for module in record.recover_interrupted() {
            warn!(module = %module, "Module was left running by a previous run, marked interrupted");
        }

        let store = Self {
            output_dir,
            root,
            target: target.to_string(),
            record: Mutex::new(record),
            results: Mutex::new(HashMap::new()),
        };
        store.save().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn session_path(&self) -> PathBuf {
        self.root.join(SESSION_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Conventional location of a module's results file.
    pub fn results_path(&self, module: &str) -> PathBuf {
        self.root
            .join(module)
            .join("processed")
            .join(format!("{}_results.json", module))
    }

    /// Persist `session.json`. Writes to a temporary file and renames it
    /// over the old one so a crash never leaves a half-written record.
    pub async fn save(&self) -> SessionResult<()> {
        let mut record = self.record.lock().await;
        record.last_updated = Utc::now();
        self.write_record(&record).await
    }

    async fn write_record(&self, record: &SessionRecord) -> SessionResult<()> {
        let path = self.session_path();
        let tmp = self.root.join(format!("{}.tmp", SESSION_FILE));
        let body = serde_json::to_string_pretty(record).map_err(SessionError::json(&path))?;
        fs::write(&tmp, body).await.map_err(SessionError::io(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(SessionError::io(&path))?;
        Ok(())
    }

    /// Apply `update` to the record and persist it under the same lock.
    async fn modify<F>(&self, update: F) -> SessionResult<()>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let mut record = self.record.lock().await;
        update(&mut record);
        record.last_updated = Utc::now();
        self.write_record(&record).await
    }

    /// Write a module's results and mark it completed.
    pub async fn save_results(&self, module: &str, results: &serde_json::Value) -> SessionResult<PathBuf> {
        let path = self.results_path(module);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(SessionError::io(parent))?;
        }
        let body = serde_json::to_string_pretty(results).map_err(SessionError::json(&path))?;
        fs::write(&path, body).await.map_err(SessionError::io(&path))?;

        self.results
            .lock()
            .await
            .insert(module.to_string(), results.clone());

        let results_file = path.clone();
        self.modify(|record| {
            let entry = record.modules.entry(module.to_string()).or_default();
            entry.status = ModuleStatus::Completed;
            entry.results_file = Some(results_file);
            entry.completed_at = Some(Utc::now());
            entry.error = None;
        })
        .await?;

        info!(module = module, path = %path.display(), "Saved module results");
        Ok(path)
    }

    /// Results of a module from memory or disk. `None` unless the record
    /// says the module's current results were saved; files left behind by
    /// a cleared session or an earlier attempt are ignored.
    pub async fn get_results(&self, module: &str) -> SessionResult<Option<serde_json::Value>> {
        let path = match self.record.lock().await.modules.get(module) {
            Some(m) => match &m.results_file {
                Some(file) => file.clone(),
                None if m.status == ModuleStatus::Completed => self.results_path(module),
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        if let Some(value) = self.results.lock().await.get(module) {
            return Ok(Some(value.clone()));
        }

        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::io(&path)(e)),
        };
        let value: serde_json::Value = serde_json::from_str(&raw).map_err(SessionError::json(&path))?;
        self.results
            .lock()
            .await
            .insert(module.to_string(), value.clone());
        debug!(module = module, path = %path.display(), "Loaded module results from disk");
        Ok(Some(value))
    }

    pub async fn update_module_status(&self, module: &str, status: ModuleStatus) -> SessionResult<()> {
        self.forget_results_on(module, status).await;
        self.modify(|record| {
            let entry = record.modules.entry(module.to_string()).or_default();
            apply_status(entry, status);
        })
        .await
    }

    /// Record a failed or interrupted module together with its error text.
    pub async fn record_failure(&self, module: &str, status: ModuleStatus, error: &str) -> SessionResult<()> {
        self.forget_results_on(module, status).await;
        self.modify(|record| {
            let entry = record.modules.entry(module.to_string()).or_default();
            apply_status(entry, status);
            entry.error = Some(error.to_string());
        })
        .await
    }

    /// A module that starts again, fails or is reset no longer has results.
    async fn forget_results_on(&self, module: &str, status: ModuleStatus) {
        if matches!(
            status,
            ModuleStatus::Pending | ModuleStatus::Running | ModuleStatus::Error | ModuleStatus::Interrupted
        ) {
            self.results.lock().await.remove(module);
        }
    }

    /// Merge `metrics` into the stored metrics of `module`.
    pub async fn update_metrics(&self, module: &str, metrics: serde_json::Value) -> SessionResult<()> {
        self.modify(|record| {
            let merged = match record.metrics.remove(module) {
                Some(existing) => merge_json_objects(existing, metrics),
                None => metrics,
            };
            record.metrics.insert(module.to_string(), merged);
        })
        .await
    }

    pub async fn module_status(&self, module: &str) -> ModuleStatus {
        self.record.lock().await.status_of(module)
    }

    pub async fn module_record(&self, module: &str) -> Option<ModuleRecord> {
        self.record.lock().await.modules.get(module).cloned()
    }

    /// Snapshot of the whole record.
    pub async fn record(&self) -> SessionRecord {
        self.record.lock().await.clone()
    }

    /// Forget all module state but keep files on disk.
    pub async fn clear(&self) -> SessionResult<()> {
        self.results.lock().await.clear();
        let mut record = self.record.lock().await;
        *record = SessionRecord::new(self.target.clone());
        self.write_record(&record).await?;
        info!(domain = %self.target, "Cleared session");
        Ok(())
    }

    /// Move the whole target directory to `<output>/archive/<target>_<timestamp>`
    /// and start a fresh session in its place. Returns the archive path.
    pub async fn archive(&self) -> SessionResult<PathBuf> {
        let mut record = self.record.lock().await;
        let archive_root = self.output_dir.join("archive");
        fs::create_dir_all(&archive_root)
            .await
            .map_err(SessionError::io(&archive_root))?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut destination = archive_root.join(format!("{}_{}", self.target, stamp));
        let mut n = 1;
        while fs::try_exists(&destination).await.unwrap_or(false) {
            destination = archive_root.join(format!("{}_{}_{}", self.target, stamp, n));
            n += 1;
        }

        fs::rename(&self.root, &destination)
            .await
            .map_err(SessionError::io(&self.root))?;
        create_subdirs(&self.root, &TARGET_SUBDIRS).await?;

        self.results.lock().await.clear();
        *record = SessionRecord::new(self.target.clone());
        self.write_record(&record).await?;

        info!(domain = %self.target, archive = %destination.display(), "Archived session");
        Ok(destination)
    }

    /// `<root>/<module>`, with its raw/processed/temp subdirectories created.
    pub async fn module_dir(&self, module: &str) -> SessionResult<PathBuf> {
        let dir = self.root.join(module);
        create_subdirs(&dir, &MODULE_SUBDIRS).await?;
        Ok(dir)
    }

    pub async fn raw_path(&self, module: &str, file: &str) -> SessionResult<PathBuf> {
        Ok(self.module_dir(module).await?.join("raw").join(file))
    }

    pub async fn processed_path(&self, module: &str, file: &str) -> SessionResult<PathBuf> {
        Ok(self.module_dir(module).await?.join("processed").join(file))
    }

    pub async fn temp_path(&self, module: &str, file: &str) -> SessionResult<PathBuf> {
        Ok(self.module_dir(module).await?.join("temp").join(file))
    }

    /// Delete a module's temporary directory.
    pub async fn remove_temp(&self, module: &str) -> SessionResult<()> {
        let dir = self.root.join(module).join("temp");
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::io(&dir)(e)),
        }
    }
}

fn apply_status(entry: &mut ModuleRecord, status: ModuleStatus) {
    entry.status = status;
    match status {
        ModuleStatus::Running => {
            entry.started_at = Some(Utc::now());
            entry.completed_at = None;
            entry.error = None;
            entry.results_file = None;
        }
        ModuleStatus::Error | ModuleStatus::Interrupted => {
            entry.completed_at = Some(Utc::now());
            entry.results_file = None;
        }
        ModuleStatus::Completed => {
            entry.completed_at = Some(Utc::now());
        }
        ModuleStatus::Pending => {
            entry.results_file = None;
        }
        ModuleStatus::Skipped => {}
    }
}

async fn create_subdirs(base: &Path, subdirs: &[&str]) -> SessionResult<()> {
    for sub in subdirs {
        let dir = base.join(sub);
        fs::create_dir_all(&dir).await.map_err(SessionError::io(&dir))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();

        for sub in TARGET_SUBDIRS {
            assert!(store.root().join(sub).is_dir(), "missing {sub}");
        }
        assert!(store.session_path().is_file());
        assert_eq!(store.target(), "example.com");
    }

    #[tokio::test]
    async fn test_results_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let results = json!({"subdomains": ["a.example.com", "b.example.com"]});

        {
            let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
            store.update_module_status("discovery", ModuleStatus::Running).await.unwrap();
            let path = store.save_results("discovery", &results).await.unwrap();
            assert!(path.ends_with("discovery/processed/discovery_results.json"));
        }

        let reopened = SessionStore::open(dir.path(), "example.com").await.unwrap();
        assert_eq!(reopened.module_status("discovery").await, ModuleStatus::Completed);
        assert_eq!(reopened.get_results("discovery").await.unwrap(), Some(results));

        let record = reopened.module_record("discovery").await.unwrap();
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_get_results_absent() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
        assert_eq!(store.get_results("never_ran").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_running_becomes_interrupted_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
            store.update_module_status("web_probing", ModuleStatus::Running).await.unwrap();
        }

        let reopened = SessionStore::open(dir.path(), "example.com").await.unwrap();
        assert_eq!(reopened.module_status("web_probing").await, ModuleStatus::Interrupted);

        // The rewrite is persisted, not just in memory.
        let raw = std::fs::read_to_string(reopened.session_path()).unwrap();
        assert!(raw.contains("\"interrupted\""));
    }

    #[tokio::test]
    async fn test_corrupt_session_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("example.com");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("session.json"), "{ not json").unwrap();

        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
        assert!(store.record().await.modules.is_empty());

        let moved: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("session.json.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_and_metrics_are_recorded() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();

        store
            .record_failure("dns_analysis", ModuleStatus::Error, "dnsx exited with code 2")
            .await
            .unwrap();
        store.update_metrics("dns_analysis", json!({"peak_cpu_percent": 12.5})).await.unwrap();
        store.update_metrics("dns_analysis", json!({"duration_secs": 3.0})).await.unwrap();

        let record = store.record().await;
        let module = &record.modules["dns_analysis"];
        assert_eq!(module.status, ModuleStatus::Error);
        assert_eq!(module.error.as_deref(), Some("dnsx exited with code 2"));
        assert_eq!(
            record.metrics["dns_analysis"],
            json!({"peak_cpu_percent": 12.5, "duration_secs": 3.0})
        );
    }

    #[tokio::test]
    async fn test_archive_moves_target_and_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
        store.save_results("discovery", &json!({"subdomains": []})).await.unwrap();

        let archived = store.archive().await.unwrap();
        assert!(archived.starts_with(dir.path().join("archive")));
        assert!(archived.join("discovery/processed/discovery_results.json").is_file());

        assert_eq!(store.module_status("discovery").await, ModuleStatus::Pending);
        assert_eq!(store.get_results("discovery").await.unwrap(), None);
        assert!(store.session_path().is_file());
        assert!(store.root().join("raw").is_dir());
    }

    #[tokio::test]
    async fn test_clear_keeps_files() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
        let path = store.save_results("discovery", &json!({"n": 1})).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.module_status("discovery").await, ModuleStatus::Pending);
        assert!(path.is_file());
        assert_eq!(store.get_results("discovery").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_module_does_not_expose_old_results() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();
        store.save_results("discovery", &json!({"old": true})).await.unwrap();

        store.clear().await.unwrap();
        store
            .record_failure("discovery", ModuleStatus::Error, "subfinder timed out")
            .await
            .unwrap();
        assert_eq!(store.module_status("discovery").await, ModuleStatus::Error);
        assert_eq!(store.get_results("discovery").await.unwrap(), None);

        // Failing after a successful save in the same process also drops them.
        store.save_results("dns_analysis", &json!({"count": 1})).await.unwrap();
        store.update_module_status("dns_analysis", ModuleStatus::Running).await.unwrap();
        store
            .record_failure("dns_analysis", ModuleStatus::Error, "dnsx exited with code 2")
            .await
            .unwrap();
        assert_eq!(store.get_results("dns_analysis").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_module_paths() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path(), "example.com").await.unwrap();

        let raw = store.raw_path("web_fuzzing", "ffuf.json").await.unwrap();
        assert!(raw.parent().unwrap().is_dir());
        assert!(raw.ends_with("web_fuzzing/raw/ffuf.json"));

        let temp = store.temp_path("web_fuzzing", "targets.txt").await.unwrap();
        std::fs::write(&temp, "x").unwrap();
        store.remove_temp("web_fuzzing").await.unwrap();
        assert!(!temp.exists());
        // Removing twice is fine.
        store.remove_temp("web_fuzzing").await.unwrap();

        let processed = store.processed_path("web_fuzzing", "out.json").await.unwrap();
        assert!(processed.ends_with("web_fuzzing/processed/out.json"));
    }
}
