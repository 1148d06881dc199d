//! Catalog of external tools the pipeline knows how to verify and install.
//!
//! Each entry says how to ask a tool for its version and how to install
//! it. Nothing outside this table hard-codes version flags.

use crate::config::ToolOverride;
use crate::types::ToolName;
use std::collections::BTreeMap;
use tracing::debug;

/// How to query and install one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: ToolName,
    /// Arguments that make the tool print its version.
    pub version_args: Vec<String>,
    /// Regex whose first capture group is the version. Falls back to the
    /// generic patterns when unset.
    pub version_pattern: Option<String>,
    /// Shell command that installs or updates the tool.
    pub install_command: Option<String>,
    pub min_version: Option<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<ToolName>) -> Self {
        Self {
            name: name.into(),
            version_args: vec!["--version".to_string()],
            version_pattern: None,
            install_command: None,
            min_version: None,
        }
    }

    pub fn version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn version_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.version_pattern = Some(pattern.into());
        self
    }

    pub fn install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    pub fn min_version(mut self, version: impl Into<String>) -> Self {
        self.min_version = Some(version.into());
        self
    }

    fn apply(&mut self, patch: &ToolOverride) {
        if let Some(args) = &patch.version_args {
            self.version_args = args.clone();
        }
        if let Some(pattern) = &patch.version_pattern {
            self.version_pattern = Some(pattern.clone());
        }
        if let Some(cmd) = &patch.install_command {
            self.install_command = Some(cmd.clone());
        }
        if let Some(min) = &patch.min_version {
            self.min_version = Some(min.clone());
        }
    }
}

/// Registry of tool specs keyed by binary name.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    specs: BTreeMap<ToolName, ToolSpec>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            specs: BTreeMap::new(),
        }
    }

    /// Catalog of every tool the built-in modules and checks know about.
    pub fn builtin() -> Self {
        fn go(path: &str) -> String {
            format!("go install -v {}@latest", path)
        }

        Self::new()
            .register(
                ToolSpec::new("subfinder")
                    .version_args(["-version"])
                    .install_command(go("github.com/projectdiscovery/subfinder/v2/cmd/subfinder"))
                    .min_version("2.6.0"),
            )
            .register(
                ToolSpec::new("amass")
                    .version_args(["-version"])
                    .install_command("go install -v github.com/owasp-amass/amass/v4/...@master")
                    .min_version("3.23.3"),
            )
            .register(ToolSpec::new("findomain").min_version("8.2.1"))
            .register(
                ToolSpec::new("naabu")
                    .version_args(["-version"])
                    .install_command(go("github.com/projectdiscovery/naabu/v2/cmd/naabu"))
                    .min_version("2.1.6"),
            )
            .register(
                ToolSpec::new("dnsx")
                    .version_args(["-version"])
                    .install_command(go("github.com/projectdiscovery/dnsx/cmd/dnsx")),
            )
            .register(
                ToolSpec::new("httpx")
                    .version_args(["-version"])
                    .install_command(go("github.com/projectdiscovery/httpx/cmd/httpx"))
                    .min_version("1.3.5"),
            )
            .register(
                ToolSpec::new("nuclei")
                    .version_args(["-version"])
                    .install_command(go("github.com/projectdiscovery/nuclei/v3/cmd/nuclei"))
                    .min_version("3.0.0"),
            )
            .register(
                ToolSpec::new("katana")
                    .version_args(["-version"])
                    .install_command(go("github.com/projectdiscovery/katana/cmd/katana"))
                    .min_version("1.0.4"),
            )
            .register(
                ToolSpec::new("ffuf")
                    .version_args(["-V"])
                    .install_command(go("github.com/ffuf/ffuf/v2"))
                    .min_version("2.1.0"),
            )
            .register(
                ToolSpec::new("gobuster")
                    .version_args(["version"])
                    .install_command(go("github.com/OJ/gobuster/v3"))
                    .min_version("3.6.0"),
            )
            .register(
                ToolSpec::new("wpscan")
                    .install_command("gem install wpscan")
                    .min_version("3.8.24"),
            )
            .register(
                ToolSpec::new("nikto")
                    .version_args(["-Version"])
                    .min_version("2.5.0"),
            )
            .register(ToolSpec::new("sqlmap").min_version("1.7.10"))
            .register(
                ToolSpec::new("dalfox")
                    .version_args(["version"])
                    .install_command(go("github.com/hahwul/dalfox/v2"))
                    .min_version("2.9.1"),
            )
            .register(
                ToolSpec::new("ghauri")
                    .install_command(go("github.com/r0oth3x49/ghauri"))
                    .min_version("1.0.0"),
            )
            .register(
                ToolSpec::new("kxss")
                    .install_command(go("github.com/Emoe/kxss"))
                    .min_version("1.0.0"),
            )
            .register(
                ToolSpec::new("crlfuzz")
                    .install_command(go("github.com/dwisiswant0/crlfuzz/cmd/crlfuzz"))
                    .min_version("1.5.0"),
            )
    }

    /// Register a tool spec, replacing any existing entry with the same name.
    pub fn register(mut self, spec: ToolSpec) -> Self {
        self.specs.insert(spec.name.clone(), spec);
        self
    }

    /// Apply per-tool configuration. Unknown tools get a fresh entry.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ToolOverride>) -> Self {
        for (name, patch) in overrides {
            debug!(tool = %name, "Applying tool override");
            self.specs
                .entry(ToolName::new(name.as_str()))
                .or_insert_with(|| ToolSpec::new(name.as_str()))
                .apply(patch);
        }
        self
    }

    /// Get a tool spec by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    /// List all registered tool names, sorted.
    pub fn list_names(&self) -> Vec<ToolName> {
        self.specs.keys().cloned().collect()
    }

    /// Check if a tool with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Return the number of registered tools.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Return `true` if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}
