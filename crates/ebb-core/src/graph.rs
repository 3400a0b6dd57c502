//! Job graph — the immutable DAG of vertices handed over at submission.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::types::{ExchangeMode, VertexId};

/// A compiled job: vertices plus the edges between them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobGraph {
    pub name: String,
    pub vertices: Vec<JobVertex>,
    #[serde(default)]
    pub edges: Vec<JobEdge>,
}

/// One computation stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobVertex {
    pub id: VertexId,
    /// Fixed parallelism set by the user; never changed by the scheduler.
    #[serde(default)]
    pub parallelism: Option<u32>,
    /// Per-vertex lower bound, overriding the configured auto-parallelism min.
    #[serde(default)]
    pub min_parallelism: Option<u32>,
    /// Per-vertex upper bound, overriding the configured auto-parallelism max.
    #[serde(default)]
    pub max_parallelism: Option<u32>,
}

/// A data dependency between two vertices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEdge {
    pub source: VertexId,
    pub target: VertexId,
    pub exchange: ExchangeMode,
}

impl JobVertex {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_parallelism = Some(min);
        self.max_parallelism = Some(max);
        self
    }
}

impl JobEdge {
    pub fn new(source: &str, target: &str, exchange: ExchangeMode) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            exchange,
        }
    }
}

impl JobGraph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vertices: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn vertex(mut self, vertex: JobVertex) -> Self {
        self.vertices.push(vertex);
        self
    }

    pub fn edge(mut self, source: &str, target: &str, exchange: ExchangeMode) -> Self {
        self.edges.push(JobEdge::new(source, target, exchange));
        self
    }

    /// Load a job graph from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Look up a vertex by id.
    pub fn get(&self, id: &str) -> Option<&JobVertex> {
        self.vertices.iter().find(|v| v.id == id)
    }

    /// Edges consumed by `id`, in declaration order.
    pub fn inputs_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a JobEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Edges produced by `id`, in declaration order.
    pub fn outputs_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a JobEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// A source vertex has no upstream edges.
    pub fn is_source(&self, id: &str) -> bool {
        self.inputs_of(id).next().is_none()
    }

    /// Check ids, edge endpoints and acyclicity.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order().map(|_| ())
    }

    /// Vertices in dependency order. Ties are broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<&JobVertex>, GraphError> {
        if self.vertices.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, v) in self.vertices.iter().enumerate() {
            if index.insert(v.id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateVertex(v.id.clone()));
            }
        }

        let mut in_degree = vec![0usize; self.vertices.len()];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.vertices.len()];
        for e in &self.edges {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| GraphError::UnknownVertex {
                    from: e.source.clone(),
                    to: e.target.clone(),
                    missing: id.to_string(),
                })
            };
            let s = lookup(&e.source)?;
            let t = lookup(&e.target)?;
            if s == t {
                return Err(GraphError::SelfLoop(e.source.clone()));
            }
            downstream[s].push(t);
            in_degree[t] += 1;
        }

        let mut ready: VecDeque<usize> = (0..self.vertices.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(i) = ready.pop_front() {
            order.push(&self.vertices[i]);
            let mut released: Vec<usize> = Vec::new();
            for &t in &downstream[i] {
                in_degree[t] -= 1;
                if in_degree[t] == 0 {
                    released.push(t);
                }
            }
            released.sort_unstable();
            ready.extend(released);
        }

        if order.len() != self.vertices.len() {
            let placed: HashSet<&str> = order.iter().map(|v| v.id.as_str()).collect();
            let stuck = self
                .vertices
                .iter()
                .filter(|v| !placed.contains(v.id.as_str()))
                .map(|v| v.id.clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> JobGraph {
        JobGraph::new("diamond")
            .vertex(JobVertex::new("src"))
            .vertex(JobVertex::new("left"))
            .vertex(JobVertex::new("right"))
            .vertex(JobVertex::new("sink"))
            .edge("src", "left", ExchangeMode::Blocking)
            .edge("src", "right", ExchangeMode::Hybrid)
            .edge("left", "sink", ExchangeMode::Blocking)
            .edge("right", "sink", ExchangeMode::Pipelined)
    }

    #[test]
    fn orders_diamond_by_dependencies() {
        let graph = diamond();
        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|v| v.id.as_str())
            .collect();
        assert_eq!(order, vec!["src", "left", "right", "sink"]);
    }

    #[test]
    fn sources_have_no_inputs() {
        let graph = diamond();
        assert!(graph.is_source("src"));
        assert!(!graph.is_source("sink"));
        assert_eq!(graph.inputs_of("sink").count(), 2);
        assert_eq!(graph.outputs_of("src").count(), 2);
    }

    #[test]
    fn rejects_cycles() {
        let graph = JobGraph::new("loop")
            .vertex(JobVertex::new("a"))
            .vertex(JobVertex::new("b"))
            .edge("a", "b", ExchangeMode::Blocking)
            .edge("b", "a", ExchangeMode::Blocking);
        assert!(matches!(graph.validate(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn rejects_unknown_and_duplicate_vertices() {
        let unknown = JobGraph::new("bad")
            .vertex(JobVertex::new("a"))
            .edge("a", "ghost", ExchangeMode::Blocking);
        assert_eq!(
            unknown.validate(),
            Err(GraphError::UnknownVertex {
                from: "a".to_string(),
                to: "ghost".to_string(),
                missing: "ghost".to_string(),
            })
        );

        let duplicate = JobGraph::new("dup")
            .vertex(JobVertex::new("a"))
            .vertex(JobVertex::new("a"));
        assert_eq!(
            duplicate.validate(),
            Err(GraphError::DuplicateVertex("a".to_string()))
        );
        assert_eq!(JobGraph::new("empty").validate(), Err(GraphError::Empty));
    }

    #[test]
    fn parses_json() {
        let json = r#"{
            "name": "wordcount",
            "vertices": [{"id": "read"}, {"id": "count", "max_parallelism": 16}],
            "edges": [{"source": "read", "target": "count", "exchange": "BLOCKING"}]
        }"#;
        let graph = JobGraph::from_json(json).unwrap();
        assert_eq!(graph.vertices.len(), 2);
        assert_eq!(graph.get("count").unwrap().max_parallelism, Some(16));
        assert_eq!(graph.edges[0].exchange, ExchangeMode::Blocking);
    }
}
