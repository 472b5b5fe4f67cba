//! Dependency graph over service descriptors

use crate::{Error, Result, ServiceDescriptor};
use std::collections::{HashMap, HashSet};

/// `uses` edges between the services of one start call.
///
/// Dependencies that are already running outside this call are satisfied
/// up front and do not appear as edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node names in descriptor order
    nodes: Vec<String>,
    /// dependency -> dependents
    edges: HashMap<String, Vec<String>>,
    /// dependent -> dependencies
    reverse_edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicates, unknown dependencies and cycles.
    ///
    /// `satisfied` names services that are already running and may be
    /// used without being part of `descriptors`.
    pub fn new(descriptors: &[ServiceDescriptor], satisfied: &HashSet<String>) -> Result<Self> {
        let mut nodes = Vec::with_capacity(descriptors.len());
        let mut seen = HashSet::new();
        for descriptor in descriptors {
            if !seen.insert(descriptor.name.as_str()) {
                return Err(Error::DuplicateService(descriptor.name.clone()));
            }
            nodes.push(descriptor.name.clone());
        }

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse_edges: HashMap<String, Vec<String>> = HashMap::new();
        for descriptor in descriptors {
            for dep in &descriptor.uses {
                if seen.contains(dep.as_str()) {
                    edges
                        .entry(dep.clone())
                        .or_default()
                        .push(descriptor.name.clone());
                    reverse_edges
                        .entry(descriptor.name.clone())
                        .or_default()
                        .push(dep.clone());
                } else if !satisfied.contains(dep) {
                    return Err(Error::UnknownDependency {
                        service: descriptor.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = Self {
            nodes,
            edges,
            reverse_edges,
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::DependencyCycle { cycle });
        }
        Ok(graph)
    }

    /// Number of services in the graph
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no services
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// In-graph dependencies of `name`
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.reverse_edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Services that use `name`
    pub fn dependents(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Nodes whose dependencies are all in `completed`
    pub fn get_ready_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !completed.contains(*n))
            .filter(|n| self.dependencies(n).iter().all(|d| completed.contains(d)))
            .cloned()
            .collect()
    }

    /// Partition into waves: every service in a wave depends only on
    /// services in earlier waves. Order within a wave follows descriptor
    /// order.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut completed = HashSet::new();
        let mut waves = Vec::new();
        while completed.len() < self.nodes.len() {
            let wave = self.get_ready_nodes(&completed);
            if wave.is_empty() {
                // unreachable: cycles are rejected in new()
                break;
            }
            completed.extend(wave.iter().cloned());
            waves.push(wave);
        }
        waves
    }

    /// A cycle as a path whose first and last element coincide
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            path.push(node);
            for dep in graph.dependencies(node) {
                if let Some(cycle) = visit(graph, dep, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        self.nodes
            .iter()
            .find_map(|n| visit(self, n, &mut marks, &mut path))
    }
}
