//! Attribute provider/consumer graph
//!
//! Steps never reference each other directly: the only edges in the system
//! run through attribute names. The graph maps each attribute to the steps
//! that provide it and the steps that consume it, and is rebuilt from the
//! step set on every change.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use argyll_domain::Step;

/// Providers and consumers of one attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEdges {
    /// Steps producing this attribute
    pub providers: BTreeSet<String>,

    /// Steps consuming this attribute
    pub consumers: BTreeSet<String>,
}

/// Attribute name -> provider/consumer sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeGraph {
    edges: BTreeMap<String, AttributeEdges>,
}

impl AttributeGraph {
    /// Build the graph over a set of steps.
    ///
    /// This is the pure helper shared by registration validation and plan
    /// generation; pass `extra` to see the graph that would result if one
    /// more step were admitted.
    #[must_use]
    pub fn build<'a>(steps: impl Iterator<Item = &'a Step>, extra: Option<&'a Step>) -> Self {
        let mut graph = Self::default();
        for step in steps.chain(extra) {
            graph.add_step(step);
        }
        graph
    }

    fn add_step(&mut self, step: &Step) {
        for (name, _) in step.inputs() {
            self.edges
                .entry(name.to_string())
                .or_default()
                .consumers
                .insert(step.id.clone());
        }
        for name in step.outputs() {
            self.edges
                .entry(name.to_string())
                .or_default()
                .providers
                .insert(step.id.clone());
        }
    }

    /// Edges for one attribute
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&AttributeEdges> {
        self.edges.get(attribute)
    }

    /// Steps providing an attribute
    #[must_use]
    pub fn providers_of(&self, attribute: &str) -> BTreeSet<String> {
        self.edges
            .get(attribute)
            .map(|e| e.providers.clone())
            .unwrap_or_default()
    }

    /// Steps consuming an attribute
    #[must_use]
    pub fn consumers_of(&self, attribute: &str) -> BTreeSet<String> {
        self.edges
            .get(attribute)
            .map(|e| e.consumers.clone())
            .unwrap_or_default()
    }

    /// Number of tracked attributes
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph tracks no attributes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Restrict the graph to the given step set (plan projection)
    #[must_use]
    pub fn project(&self, step_ids: &BTreeSet<String>) -> Self {
        let mut edges = BTreeMap::new();
        for (name, attr_edges) in &self.edges {
            let providers: BTreeSet<String> = attr_edges
                .providers
                .iter()
                .filter(|id| step_ids.contains(*id))
                .cloned()
                .collect();
            let consumers: BTreeSet<String> = attr_edges
                .consumers
                .iter()
                .filter(|id| step_ids.contains(*id))
                .cloned()
                .collect();
            if !providers.is_empty() || !consumers.is_empty() {
                edges.insert(
                    name.clone(),
                    AttributeEdges {
                        providers,
                        consumers,
                    },
                );
            }
        }
        Self { edges }
    }

    /// Detect a cycle among the step dependencies induced by this graph.
    ///
    /// Returns the step ids on a cycle, or an empty vec when the graph is
    /// acyclic. An edge runs from every provider of an attribute to every
    /// consumer of the same attribute.
    #[must_use]
    pub fn find_cycle(&self) -> Vec<String> {
        // A step consuming its own output is the degenerate cycle
        let self_loops: BTreeSet<String> = self
            .edges
            .values()
            .flat_map(|e| e.providers.intersection(&e.consumers))
            .cloned()
            .collect();
        if !self_loops.is_empty() {
            return self_loops.into_iter().collect();
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices = HashMap::new();

        for edges in self.edges.values() {
            for step_id in edges.providers.iter().chain(&edges.consumers) {
                indices
                    .entry(step_id.as_str())
                    .or_insert_with(|| graph.add_node(step_id.as_str()));
            }
        }

        for edges in self.edges.values() {
            for provider in &edges.providers {
                for consumer in &edges.consumers {
                    graph.add_edge(
                        indices[provider.as_str()],
                        indices[consumer.as_str()],
                        (),
                    );
                }
            }
        }

        if !algo::is_cyclic_directed(&graph) {
            return Vec::new();
        }

        // Name the cycle via strongly connected components
        algo::kosaraju_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1)
            .map(|scc| scc.iter().map(|&idx| graph[idx].to_string()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argyll_domain::{AttrType, AttributeSpec, ScriptSpec, StepBody, WorkConfig};

    fn step(id: &str, inputs: &[&str], outputs: &[&str]) -> Step {
        let mut attributes = BTreeMap::new();
        for name in inputs {
            attributes.insert(
                (*name).to_string(),
                AttributeSpec::required(AttrType::Any),
            );
        }
        for name in outputs {
            attributes.insert((*name).to_string(), AttributeSpec::output(AttrType::Any));
        }
        Step {
            id: id.to_string(),
            attributes,
            body: StepBody::Script {
                script: ScriptSpec::sexpr("nil"),
            },
            predicate: None,
            work: WorkConfig::default(),
            memoizable: false,
        }
    }

    #[test]
    fn test_build_edges() {
        let a = step("a", &[], &["x"]);
        let b = step("b", &["x"], &["y"]);
        let graph = AttributeGraph::build([&a, &b].into_iter(), None);

        assert_eq!(graph.providers_of("x"), ["a".to_string()].into());
        assert_eq!(graph.consumers_of("x"), ["b".to_string()].into());
        assert_eq!(graph.providers_of("y"), ["b".to_string()].into());
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle() {
        let a = step("a", &[], &["x"]);
        let b = step("b", &["x"], &["y"]);
        let c = step("c", &["x", "y"], &["z"]);
        let graph = AttributeGraph::build([&a, &b, &c].into_iter(), None);
        assert!(graph.find_cycle().is_empty());
    }

    #[test]
    fn test_two_step_cycle_detected() {
        let a = step("a", &["y"], &["x"]);
        let b = step("b", &["x"], &["y"]);
        let graph = AttributeGraph::build([&a, &b].into_iter(), None);

        let mut cycle = graph.find_cycle();
        cycle.sort();
        assert_eq!(cycle, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_self_loop_detected() {
        let a = step("a", &["x"], &["x"]);
        let graph = AttributeGraph::build([&a].into_iter(), None);
        assert_eq!(graph.find_cycle(), vec!["a".to_string()]);
    }

    #[test]
    fn test_extra_step_included() {
        let a = step("a", &[], &["x"]);
        let candidate = step("b", &["x"], &["y"]);
        let graph = AttributeGraph::build([&a].into_iter(), Some(&candidate));
        assert_eq!(graph.consumers_of("x"), ["b".to_string()].into());
    }

    #[test]
    fn test_projection() {
        let a = step("a", &[], &["x"]);
        let b = step("b", &["x"], &["y"]);
        let c = step("c", &["y"], &["z"]);
        let graph = AttributeGraph::build([&a, &b, &c].into_iter(), None);

        let kept: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let projected = graph.project(&kept);

        assert_eq!(projected.providers_of("x"), ["a".to_string()].into());
        assert!(projected.consumers_of("y").is_empty());
        assert!(projected.get("z").is_none());
    }
}
