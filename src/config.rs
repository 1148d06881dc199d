use crate::core::{RateLimitConfig, RetryPolicy};
use crate::error::ConfigurationError;
use crate::monitor::{MonitorOptions, Thresholds};
use crate::utils::merge_json_objects;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Everything a run can be tuned with. Every section falls back to its
/// defaults, so a config file only needs the keys it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub output: OutputConfig,
    pub execution: ExecutionConfig,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub monitor: MonitorSettings,
    pub wordlists: WordlistConfig,
    /// Per-tool overrides of the built-in catalog, keyed by binary name.
    pub tools: BTreeMap<String, ToolOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running tool processes.
    pub threads: usize,
    pub default_timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            default_timeout_secs: 30,
            retry_count: 3,
            retry_delay_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub calls_per_second: f64,
    pub burst_size: u32,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub starvation_boost: f64,
    pub monitor_interval_secs: u64,
    pub warn_throttle_ratio: f64,
    pub stats_window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            calls_per_second: 150.0,
            burst_size: 10,
            max_retries: 3,
            retry_delay_secs: 1.0,
            starvation_boost: 1.5,
            monitor_interval_secs: 60,
            warn_throttle_ratio: 0.2,
            stats_window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: f64,
    pub system_interval_secs: f64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    pub history_size: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 1.0,
            system_interval_secs: 5.0,
            cpu_threshold: 90.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            history_size: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WordlistConfig {
    /// Wordlist used for content discovery. Fuzzing is skipped when the
    /// file does not exist.
    pub web_content: PathBuf,
}

impl Default for WordlistConfig {
    fn default() -> Self {
        Self {
            web_content: PathBuf::from("/usr/share/seclists/Discovery/Web-Content/common.txt"),
        }
    }
}

/// Replaces individual fields of a catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOverride {
    pub version_args: Option<Vec<String>>,
    pub version_pattern: Option<String>,
    pub install_command: Option<String>,
    pub min_version: Option<String>,
}

impl RunConfig {
    /// Load the configuration from `explicit` or the first file found by
    /// [`resolve_config_path`], falling back to defaults when none exists.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => resolve_config_path(),
        };

        let Some(path) = path else {
            debug!("No config file found, using defaults");
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse a JSON document and merge it over the defaults.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let overlay = expand_env_in_value(serde_json::from_str(raw)?);
        let base = serde_json::to_value(Self::default())?;
        let merged = merge_json_objects(base, overlay);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let exec = &self.execution;
        if exec.threads == 0 {
            return Err(ConfigurationError::invalid("execution.threads", "must be at least 1"));
        }
        if exec.default_timeout_secs == 0 {
            return Err(ConfigurationError::invalid(
                "execution.default_timeout_secs",
                "must be greater than zero",
            ));
        }
        if exec.retry_count == 0 {
            return Err(ConfigurationError::invalid("execution.retry_count", "must be at least 1"));
        }
        check_seconds("execution.retry_delay_secs", exec.retry_delay_secs, 0.0)?;

        let rl = &self.rate_limit;
        if !(rl.calls_per_second.is_finite() && rl.calls_per_second > 0.0) {
            return Err(ConfigurationError::invalid(
                "rate_limit.calls_per_second",
                format!("must be positive, got {}", rl.calls_per_second),
            ));
        }
        if rl.burst_size == 0 {
            return Err(ConfigurationError::invalid("rate_limit.burst_size", "must be at least 1"));
        }
        check_seconds("rate_limit.retry_delay_secs", rl.retry_delay_secs, 0.0)?;
        if !(rl.starvation_boost.is_finite() && rl.starvation_boost >= 1.0) {
            return Err(ConfigurationError::invalid(
                "rate_limit.starvation_boost",
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&rl.warn_throttle_ratio) {
            return Err(ConfigurationError::invalid(
                "rate_limit.warn_throttle_ratio",
                "must be between 0 and 1",
            ));
        }
        if rl.monitor_interval_secs == 0 || rl.stats_window_secs == 0 {
            return Err(ConfigurationError::invalid(
                "rate_limit.monitor_interval_secs",
                "monitor interval and stats window must be greater than zero",
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(ConfigurationError::invalid("cache.ttl_secs", "must be greater than zero"));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigurationError::invalid("cache.max_entries", "must be at least 1"));
        }

        let mon = &self.monitor;
        for (field, value) in [
            ("monitor.interval_secs", mon.interval_secs),
            ("monitor.system_interval_secs", mon.system_interval_secs),
        ] {
            check_seconds(field, value, 0.001)?;
        }
        for (field, value) in [
            ("monitor.cpu_threshold", mon.cpu_threshold),
            ("monitor.memory_threshold", mon.memory_threshold),
            ("monitor.disk_threshold", mon.disk_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigurationError::invalid(
                    field,
                    format!("must be in (0, 100], got {}", value),
                ));
            }
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.default_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.execution.retry_count,
            Duration::from_secs_f64(self.execution.retry_delay_secs),
        )
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let rl = &self.rate_limit;
        RateLimitConfig {
            calls_per_second: rl.calls_per_second,
            burst_size: rl.burst_size,
            max_retries: rl.max_retries,
            retry_delay: Duration::from_secs_f64(rl.retry_delay_secs),
            starvation_boost: rl.starvation_boost,
            monitor_interval: Duration::from_secs(rl.monitor_interval_secs),
            warn_throttle_ratio: rl.warn_throttle_ratio,
            stats_window: Duration::from_secs(rl.stats_window_secs),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            cpu_percent: self.monitor.cpu_threshold,
            memory_percent: self.monitor.memory_threshold,
            disk_percent: self.monitor.disk_threshold,
        }
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            interval: Duration::from_secs_f64(self.monitor.interval_secs),
            system_interval: Duration::from_secs_f64(self.monitor.system_interval_secs),
            thresholds: self.thresholds(),
            history_size: self.monitor.history_size,
        }
    }
}

/// Longest delay or interval a config file may ask for, in seconds.
const MAX_SECONDS: f64 = 86_400.0;

fn check_seconds(field: &'static str, value: f64, min: f64) -> Result<(), ConfigurationError> {
    if (min..=MAX_SECONDS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            field,
            format!("must be between {} and {} seconds, got {}", min, MAX_SECONDS, value),
        ))
    }
}

/// Locate a config file: `RECON_CONFIG`, then
/// `<config dir>/recon-orchestrator/config.json` (`$XDG_CONFIG_HOME` or
/// `~/.config` on Linux), then `./recon.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    find_config_file(
        env::var_os("RECON_CONFIG").map(PathBuf::from),
        dirs::config_dir(),
        Path::new("."),
    )
}

fn find_config_file(
    from_env: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    working_dir: &Path,
) -> Option<PathBuf> {
    if from_env.is_some() {
        return from_env;
    }

    config_dir
        .map(|dir| dir.join("recon-orchestrator").join("config.json"))
        .into_iter()
        .chain([working_dir.join("recon.json")])
        .find(|candidate| candidate.is_file())
}

/// Expand `${VAR}` references inside every string of a parsed document.
fn expand_env_in_value(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(expand_env_vars(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(expand_env_in_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_env_in_value(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Expand `${VAR}` references. Unset variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.execution.threads, 10);
        assert_eq!(config.rate_limit.burst_size, 10);
        assert_eq!(config.rate_limit.starvation_boost, 1.5);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.thresholds().memory_percent, 85.0);
        assert_eq!(config.monitor_options().system_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let config = RunConfig::from_json_str(
            r#"{"rate_limit": {"burst_size": 5}, "execution": {"threads": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.burst_size, 5);
        assert_eq!(config.rate_limit.calls_per_second, 150.0);
        assert_eq!(config.execution.threads, 4);
        assert_eq!(config.execution.default_timeout_secs, 30);
    }

    #[test]
    fn test_tool_overrides() {
        let config = RunConfig::from_json_str(
            r#"{"tools": {"nuclei": {"min_version": "3.0.0"}}}"#,
        )
        .unwrap();
        let nuclei = &config.tools["nuclei"];
        assert_eq!(nuclei.min_version.as_deref(), Some("3.0.0"));
        assert!(nuclei.version_args.is_none());
    }

    #[test]
    fn test_env_expansion() {
        // SAFETY: test-local variable name, not read by other tests.
        unsafe { env::set_var("RECON_TEST_OUTPUT_DIR", "/tmp/recon-out") };
        let config =
            RunConfig::from_json_str(r#"{"output": {"directory": "${RECON_TEST_OUTPUT_DIR}"}}"#)
                .unwrap();
        assert_eq!(config.output.directory, PathBuf::from("/tmp/recon-out"));

        assert_eq!(expand_env_vars("${RECON_TEST_UNSET_VAR}/x"), "${RECON_TEST_UNSET_VAR}/x");
    }

    #[test]
    fn test_env_values_with_json_metacharacters() {
        // SAFETY: test-local variable names, not read by other tests.
        unsafe {
            env::set_var("RECON_TEST_WORDLIST", r"C:\lists\common.txt");
            env::set_var("RECON_TEST_QUOTED_DIR", r#"out"dir"#);
        }
        let config = RunConfig::from_json_str(
            r#"{"wordlists": {"web_content": "${RECON_TEST_WORDLIST}"},
                "output": {"directory": "${RECON_TEST_QUOTED_DIR}"}}"#,
        )
        .unwrap();
        assert_eq!(config.wordlists.web_content, PathBuf::from(r"C:\lists\common.txt"));
        assert_eq!(config.output.directory, PathBuf::from(r#"out"dir"#));
    }

    #[test]
    fn test_config_file_search_order() {
        let config_dir = tempfile::TempDir::new().unwrap();
        let cwd = tempfile::TempDir::new().unwrap();
        let user_file = config_dir.path().join("recon-orchestrator").join("config.json");

        assert_eq!(find_config_file(None, Some(config_dir.path().into()), cwd.path()), None);

        let local_file = cwd.path().join("recon.json");
        fs::write(&local_file, "{}").unwrap();
        assert_eq!(
            find_config_file(None, Some(config_dir.path().into()), cwd.path()),
            Some(local_file.clone())
        );

        fs::create_dir_all(user_file.parent().unwrap()).unwrap();
        fs::write(&user_file, "{}").unwrap();
        assert_eq!(
            find_config_file(None, Some(config_dir.path().into()), cwd.path()),
            Some(user_file)
        );

        let explicit = PathBuf::from("/etc/recon.json");
        assert_eq!(
            find_config_file(Some(explicit.clone()), Some(config_dir.path().into()), cwd.path()),
            Some(explicit)
        );
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = RunConfig::default();
        config.rate_limit.retry_delay_secs = 1e300;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.monitor.interval_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.execution.retry_delay_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recon.json");
        fs::write(&path, r#"{"cache": {"ttl_secs": 60}}"#).unwrap();

        let config = RunConfig::load(Some(&path)).unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(RunConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RunConfig::default();
        config.rate_limit.calls_per_second = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidSetting { field: "rate_limit.calls_per_second", .. })
        ));

        let mut config = RunConfig::default();
        config.rate_limit.burst_size = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.execution.default_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.monitor.disk_threshold = 120.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidSetting { field: "monitor.disk_threshold", .. })
        ));
    }

    #[test]
    fn test_conversions() {
        let config = RunConfig::default();
        let rl = config.rate_limit_config();
        assert_eq!(rl.retry_delay, Duration::from_secs(1));
        assert_eq!(rl.monitor_interval, Duration::from_secs(60));

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
    }
}
