//! Registry of pipeline modules.
//!
//! Modules are kept in registration order, which is also the tie-break order
//! for modules that do not depend on each other.

use super::{
    DiscoveryModule, DnsAnalysisModule, ReconModule, VulnerabilityScanModule, WebFuzzingModule,
    WebProbingModule,
};
use crate::core::ModuleGraph;
use crate::error::ConfigurationError;
use crate::tools::compare_versions;
use crate::types::{ModuleName, ToolName};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn ReconModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five built-in stages: discovery, DNS analysis, web probing, web
    /// fuzzing and vulnerability scanning.
    pub fn builtin() -> Self {
        Self::new()
            .register_module(DiscoveryModule)
            .register_module(DnsAnalysisModule)
            .register_module(WebProbingModule)
            .register_module(WebFuzzingModule)
            .register_module(VulnerabilityScanModule)
    }

    pub fn register(mut self, module: Arc<dyn ReconModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn register_module<M: ReconModule + 'static>(self, module: M) -> Self {
        self.register(Arc::new(module))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ReconModule>> {
        self.modules
            .iter()
            .find(|m| m.name().as_str() == name)
            .cloned()
    }

    pub fn list_names(&self) -> Vec<ModuleName> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Build the dependency graph. Fails on duplicate names, unknown
    /// dependencies and cycles.
    pub fn graph(&self) -> Result<ModuleGraph, ConfigurationError> {
        let mut graph = ModuleGraph::new();
        for module in &self.modules {
            graph.add_module(module.name(), module.dependencies())?;
        }
        graph.compute_order()?;
        Ok(graph)
    }

    /// Union of every module's required tools. When two modules ask for
    /// different minimum versions the higher one wins.
    pub fn required_tools(&self) -> BTreeMap<ToolName, Option<String>> {
        let mut union: BTreeMap<ToolName, Option<String>> = BTreeMap::new();
        for module in &self.modules {
            for (tool, min) in module.required_tools() {
                let slot = union.entry(tool).or_insert(None);
                match (slot.as_deref(), min) {
                    (_, None) => {}
                    (None, Some(new)) => *slot = Some(new),
                    (Some(old), Some(new)) => {
                        if compare_versions(&new, old) == Ordering::Greater {
                            *slot = Some(new);
                        }
                    }
                }
            }
        }
        union
    }
}
