//! NewType wrappers for strong typing throughout the orchestrator.
//!
//! These types keep module names, tool names and targets from being mixed
//! up as they travel between the scheduler, the session store and the
//! tool layer.

use crate::error::ConfigurationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of a pipeline module (e.g., "discovery", "dns_analysis").
    ///
    /// Module names key the dependency graph, the session record and the
    /// per-module output directories, so they must be unique within a run.
    ModuleName
);

newtype_string!(
    /// Name of an external command-line tool as it appears on the search
    /// path (e.g., "subfinder").
    ToolName
);

newtype_string!(
    /// The domain under reconnaissance.
    ///
    /// Use [`TargetDomain::parse`] for user input; `new` performs no
    /// validation and is meant for values read back from a session.
    TargetDomain
);

static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$")
        .expect("Invalid domain pattern")
});

impl TargetDomain {
    /// Validate and normalize a domain name given on the command line.
    pub fn parse(value: &str) -> Result<Self, ConfigurationError> {
        let trimmed = value.trim().trim_end_matches('.').to_ascii_lowercase();
        if DOMAIN_PATTERN.is_match(&trimmed) {
            Ok(Self(trimmed))
        } else {
            Err(ConfigurationError::InvalidTarget(value.to_string()))
        }
    }

    /// Returns `true` if `host` is the target itself or one of its subdomains.
    pub fn in_scope(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        host == self.0 || host.ends_with(&format!(".{}", self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_creation() {
        let name = ModuleName::new("discovery");
        assert_eq!(name.as_str(), "discovery");
        assert_eq!(name.to_string(), "discovery");
    }

    #[test]
    fn test_module_name_from_string() {
        let name: ModuleName = "dns_analysis".into();
        assert_eq!(name.as_str(), "dns_analysis");

        let name: ModuleName = String::from("web_probing").into();
        assert_eq!(name.into_inner(), "web_probing");
    }

    #[test]
    fn test_tool_name_serde() {
        let tool = ToolName::new("subfinder");
        let json = serde_json::to_string(&tool).unwrap();
        assert_eq!(json, "\"subfinder\"");

        let parsed: ToolName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tool);
    }

    #[test]
    fn test_names_order_for_btree_keys() {
        use std::collections::BTreeSet;

        let set: BTreeSet<ModuleName> = ["b", "a", "c"].into_iter().map(ModuleName::from).collect();
        let ordered: Vec<&str> = set.iter().map(|m| m.as_str()).collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_borrow_lookup() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(ModuleName::new("discovery"), 1);
        assert_eq!(map.get("discovery"), Some(&1));
    }

    #[test]
    fn test_target_parse_normalizes() {
        let target = TargetDomain::parse(" Example.COM. ").unwrap();
        assert_eq!(target.as_str(), "example.com");
    }

    #[test]
    fn test_target_parse_rejects_garbage() {
        assert!(TargetDomain::parse("not a domain").is_err());
        assert!(TargetDomain::parse("localhost").is_err());
        assert!(TargetDomain::parse("-bad.example.com").is_err());
    }

    #[test]
    fn test_target_scope() {
        let target = TargetDomain::parse("example.com").unwrap();
        assert!(target.in_scope("example.com"));
        assert!(target.in_scope("api.example.com"));
        assert!(target.in_scope("API.Example.com."));
        assert!(!target.in_scope("badexample.com"));
        assert!(!target.in_scope("example.com.evil.org"));
    }
}
