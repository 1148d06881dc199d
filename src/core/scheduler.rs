// Module dependency graph and execution ordering

use crate::error::ConfigurationError;
use crate::types::ModuleName;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

/// Directed graph of pipeline modules. Edges run from a dependency to the
/// module that depends on it.
///
/// Nodes remember their registration order; [`ModuleGraph::compute_order`]
/// uses it to break ties between independent modules so that the same set
/// of registrations always yields the same order.
#[derive(Debug, Default, Clone)]
pub struct ModuleGraph {
    nodes: Vec<ModuleName>,
    index: HashMap<ModuleName, usize>,
    declared: Vec<Vec<ModuleName>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with edges from each of `dependencies` to it.
    ///
    /// Dependencies may be registered later; they are resolved by
    /// [`ModuleGraph::compute_order`].
    pub fn add_module(
        &mut self,
        name: ModuleName,
        dependencies: impl IntoIterator<Item = ModuleName>,
    ) -> Result<(), ConfigurationError> {
        if self.index.contains_key(&name) {
            return Err(ConfigurationError::DuplicateModule(name.into_inner()));
        }

        let mut deps: Vec<ModuleName> = Vec::new();
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        debug!(module = %name, dependencies = ?deps, "Registered module in dependency graph");
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(name);
        self.declared.push(deps);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Modules in registration order.
    pub fn modules(&self) -> &[ModuleName] {
        &self.nodes
    }

    /// Direct dependencies of `name`, as declared.
    pub fn dependencies_of(&self, name: &str) -> &[ModuleName] {
        self.index
            .get(name)
            .map(|&i| self.declared[i].as_slice())
            .unwrap_or(&[])
    }

    /// Modules that directly depend on `name`, in registration order.
    pub fn dependents_of(&self, name: &str) -> Vec<ModuleName> {
        self.nodes
            .iter()
            .zip(&self.declared)
            .filter(|(_, deps)| deps.iter().any(|d| d.as_str() == name))
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Resolve every declared dependency to a node index.
    fn resolve_edges(&self) -> Result<Vec<BTreeSet<usize>>, ConfigurationError> {
        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        for (node, deps) in self.declared.iter().enumerate() {
            for dep in deps {
                let &from = self.index.get(dep).ok_or_else(|| {
                    ConfigurationError::UnknownDependency {
                        module: self.nodes[node].to_string(),
                        dependency: dep.to_string(),
                    }
                })?;
                dependents[from].insert(node);
            }
        }
        Ok(dependents)
    }

    /// Compute a total order in which every dependency precedes its
    /// dependents.
    ///
    /// Fails with [`ConfigurationError::UnknownDependency`] when a module
    /// names an unregistered dependency and with
    /// [`ConfigurationError::CyclicDependency`] when no order exists.
    pub fn compute_order(&self) -> Result<Vec<ModuleName>, ConfigurationError> {
        let dependents = self.resolve_edges()?;

        let mut in_degree: Vec<usize> = self.declared.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.nodes[node].clone());
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(ConfigurationError::CyclicDependency(self.find_cycle(&dependents)));
        }

        Ok(order)
    }

    /// Find one cycle for the error message. Only called when Kahn's
    /// algorithm left nodes unvisited, so a cycle is guaranteed to exist.
    fn find_cycle(&self, dependents: &[BTreeSet<usize>]) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }

        fn visit(
            node: usize,
            dependents: &[BTreeSet<usize>],
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::InStack;
            stack.push(node);
            for &next in &dependents[node] {
                match marks[next] {
                    Mark::InStack => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(next, dependents, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            let mut stack = Vec::new();
            if let Some(cycle) = visit(start, dependents, &mut marks, &mut stack) {
                return cycle
                    .into_iter()
                    .map(|i| self.nodes[i].to_string())
                    .collect();
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(order: &[ModuleName]) -> Vec<&str> {
        order.iter().map(|m| m.as_str()).collect()
    }

    fn graph(spec: &[(&str, &[&str])]) -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        for (name, deps) in spec {
            graph
                .add_module(
                    ModuleName::from(*name),
                    deps.iter().map(|d| ModuleName::from(*d)),
                )
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_linear_chain_order() {
        let g = graph(&[("A", &[]), ("B", &["A"]), ("C", &["A", "B"])]);
        let order = g.compute_order().unwrap();
        assert_eq!(names(&order), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_registration_order_does_not_matter_for_validity() {
        let g = graph(&[("C", &["A", "B"]), ("B", &["A"]), ("A", &[])]);
        let order = g.compute_order().unwrap();
        assert_eq!(names(&order), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_independent_modules_follow_registration_order() {
        let g = graph(&[("x", &[]), ("m", &[]), ("a", &[]), ("z", &["a"])]);
        let first = g.compute_order().unwrap();
        assert_eq!(names(&first), vec!["x", "m", "a", "z"]);

        // Deterministic across repeated calls.
        for _ in 0..10 {
            assert_eq!(g.compute_order().unwrap(), first);
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        match g.compute_order() {
            Err(ConfigurationError::CyclicDependency(path)) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("solo", &["solo"])]);
        assert!(matches!(
            g.compute_order(),
            Err(ConfigurationError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let g = graph(&[("root", &[]), ("p", &["root", "q"]), ("q", &["p"])]);
        match g.compute_order() {
            Err(ConfigurationError::CyclicDependency(path)) => {
                assert!(path.contains(&"p".to_string()));
                assert!(path.contains(&"q".to_string()));
                assert!(!path.contains(&"root".to_string()));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let g = graph(&[("web", &["dns"])]);
        match g.compute_order() {
            Err(ConfigurationError::UnknownDependency { module, dependency }) => {
                assert_eq!(module, "web");
                assert_eq!(dependency, "dns");
            }
            other => panic!("expected unknown dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_module_is_rejected() {
        let mut g = ModuleGraph::new();
        g.add_module("a".into(), Vec::new()).unwrap();
        let err = g.add_module("a".into(), Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateModule(name) if name == "a"));
    }

    #[test]
    fn test_duplicate_dependency_edges_collapse() {
        let g = graph(&[("a", &[]), ("b", &["a", "a"])]);
        assert_eq!(g.dependencies_of("b").len(), 1);
        assert_eq!(names(&g.compute_order().unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_dependents_of() {
        let g = graph(&[
            ("discovery", &[]),
            ("dns", &["discovery"]),
            ("probe", &["dns"]),
            ("vuln", &["probe"]),
            ("fuzz", &["probe"]),
        ]);
        let dependents = g.dependents_of("probe");
        assert_eq!(names(&dependents), vec!["vuln", "fuzz"]);
        assert!(g.dependents_of("vuln").is_empty());
        assert!(g.dependencies_of("missing").is_empty());
    }

    #[test]
    fn test_every_dag_orders_dependencies_first() {
        // Layered DAGs of varying shapes: node i may depend on any j < i.
        for seed in 1u64..40 {
            let mut state = seed;
            let mut next = || {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as usize
            };

            let size = 2 + next() % 9;
            let mut g = ModuleGraph::new();
            let mut edges = Vec::new();
            // Register in reverse so order cannot come from registration alone.
            for i in (0..size).rev() {
                let deps: Vec<ModuleName> = (0..i)
                    .filter(|_| next() % 3 == 0)
                    .map(|j| ModuleName::new(format!("m{j}")))
                    .collect();
                for d in &deps {
                    edges.push((d.clone(), ModuleName::new(format!("m{i}"))));
                }
                g.add_module(ModuleName::new(format!("m{i}")), deps).unwrap();
            }

            let order = g.compute_order().unwrap();
            assert_eq!(order.len(), size);
            let pos = |m: &ModuleName| order.iter().position(|o| o == m).unwrap();
            for (from, to) in &edges {
                assert!(pos(from) < pos(to), "{from} must precede {to}");
            }
        }
    }
}
