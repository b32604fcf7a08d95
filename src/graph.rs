//! The task graph.
//!
//! Tasks are stored in a [`petgraph::Graph`] where every edge points from a
//! prerequisite to the task that waits for it. There are two kinds of edges:
//!
//! * [`Edge::Dependency`]: a hard dependency. It pulls the prerequisite into
//!   every run of the dependent task, and a failed prerequisite fails the
//!   dependent.
//! * [`Edge::Ordering`]: a soft "must run after" constraint. It only orders two
//!   tasks that happen to be scheduled in the same run.
//!
//! Node indices follow registration order, which is what every deterministic
//! tie-break in this crate relies on.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::ArcStr;
use crate::error::GraphError;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Dependency,
    Ordering,
}

/// Named tasks and the edges between them.
#[derive(Debug, Default)]
pub struct TaskGraph {
    pub(crate) graph: Graph<Task, Edge>,
    names: HashMap<ArcStr, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Register a task. Its declared dependencies are wired later by
    /// [`TaskGraph::link_declared`], so tasks may be added in any order.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.names.contains_key(&task.name) {
            return Err(GraphError::DuplicateTask(task.name));
        }

        let name = task.name.clone();
        let index = self.graph.add_node(task);
        self.names.insert(name, index);

        Ok(())
    }

    /// Declare that `from` depends on `to`.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let (from, to) = (self.index(from)?, self.index(to)?);

        match self.graph.find_edge(to, from) {
            Some(edge) => self.graph[edge] = Edge::Dependency,
            None => {
                self.graph.add_edge(to, from, Edge::Dependency);
            }
        }

        Ok(())
    }

    /// Declare that `later` must run after `earlier` whenever both are scheduled.
    pub fn add_ordering(&mut self, later: &str, earlier: &str) -> Result<(), GraphError> {
        let (later, earlier) = (self.index(later)?, self.index(earlier)?);

        if self.graph.find_edge(earlier, later).is_none() {
            self.graph.add_edge(earlier, later, Edge::Ordering);
        }

        Ok(())
    }

    /// Wire the `depends_on` and `must_run_after` lists declared on every task.
    pub fn link_declared(&mut self) -> Result<(), GraphError> {
        let declared: Vec<_> = self
            .graph
            .node_weights()
            .map(|task| {
                (
                    task.name.clone(),
                    task.depends_on.clone(),
                    task.must_run_after.clone(),
                )
            })
            .collect();

        for (name, depends_on, must_run_after) in declared {
            for dependency in &depends_on {
                self.add_dependency(&name, dependency)?;
            }
            for earlier in &must_run_after {
                self.add_ordering(&name, earlier)?;
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.names.get(name).map(|&index| &self.graph[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// All tasks in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    pub(crate) fn index(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(name.into()))
    }

    /// Prerequisites of a node connected by the given edge kind, sorted by
    /// registration order.
    pub(crate) fn prerequisites(&self, index: NodeIndex, kind: Option<Edge>) -> Vec<NodeIndex> {
        let mut found: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .filter(|edge| kind.is_none_or(|kind| *edge.weight() == kind))
            .map(|edge| edge.source())
            .collect();

        found.sort_unstable();
        found.dedup();
        found
    }

    /// Names of the tasks `name` waits for through edges of the given kind.
    pub fn prerequisites_of(&self, name: &str, kind: Edge) -> Result<Vec<&str>, GraphError> {
        let index = self.index(name)?;
        Ok(self
            .prerequisites(index, Some(kind))
            .into_iter()
            .map(|dep| &*self.graph[dep].name)
            .collect())
    }

    /// Depth-first cycle check over both dependency and ordering edges.
    ///
    /// The reported members start at the task where the cycle was entered and
    /// follow the dependency direction, so `[a, b]` reads "a waits for b, b
    /// waits for a".
    pub fn validate(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Fresh,
            Active,
            Done,
        }

        let mut marks = vec![Mark::Fresh; self.graph.node_count()];
        // The active path, each entry with the prerequisites still to visit.
        let mut path: Vec<NodeIndex> = Vec::new();
        let mut pending: Vec<std::vec::IntoIter<NodeIndex>> = Vec::new();

        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Fresh {
                continue;
            }

            marks[root.index()] = Mark::Active;
            path.push(root);
            pending.push(self.prerequisites(root, None).into_iter());

            while let Some(next) = pending.last_mut().map(Iterator::next) {
                let Some(next) = next else {
                    pending.pop();
                    if let Some(done) = path.pop() {
                        marks[done.index()] = Mark::Done;
                    }
                    continue;
                };

                match marks[next.index()] {
                    Mark::Done => {}
                    Mark::Fresh => {
                        marks[next.index()] = Mark::Active;
                        path.push(next);
                        pending.push(self.prerequisites(next, None).into_iter());
                    }
                    Mark::Active => {
                        let start = path.iter().position(|&i| i == next).unwrap_or(0);
                        let members = path[start..]
                            .iter()
                            .map(|&i| self.graph[i].name.clone())
                            .collect();
                        return Err(GraphError::CycleDetected(members));
                    }
                }
            }
        }

        Ok(())
    }

    /// Deterministic topological order of every task.
    ///
    /// Whenever several tasks are ready at once, the one registered first goes
    /// first. Fails with [`GraphError::CycleDetected`] on a cyclic graph.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, GraphError> {
        self.validate()?;

        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| self.prerequisites(index, None).len())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);

            let mut dependents: Vec<_> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();
            dependents.sort_unstable();
            dependents.dedup();

            for dependent in dependents {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        Ok(order)
    }

    /// Names of all tasks in [`TaskGraph::topological_order`].
    pub fn topological_names(&self) -> Result<Vec<ArcStr>, GraphError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|index| self.graph[index].name.clone())
            .collect())
    }

    /// The requested tasks plus everything they transitively depend on.
    ///
    /// Ordering edges are not followed: they never pull a task into a run.
    pub fn closure<S: AsRef<str>>(&self, requested: &[S]) -> Result<HashSet<NodeIndex>, GraphError> {
        let mut seen = HashSet::new();
        let mut stack = Vec::new();

        for name in requested {
            stack.push(self.index(name.as_ref())?);
        }

        while let Some(index) = stack.pop() {
            if seen.insert(index) {
                stack.extend(self.prerequisites(index, Some(Edge::Dependency)));
            }
        }

        Ok(seen)
    }

    /// Render the graph as a Mermaid diagram. Ordering edges are dotted.
    pub fn to_mermaid(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");
            if task.enabled {
                writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
            } else {
                writeln!(f, "    {}[\"{} (disabled)\"]", index.index(), name)?;
            }
        }

        for edge in self.graph.edge_references() {
            let arrow = match edge.weight() {
                Edge::Dependency => "-->",
                Edge::Ordering => "-.->",
            };
            writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;

    fn noop(_: &mut TaskContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn graph_of(names: &[&str]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for name in names {
            graph.add_task(Task::new(*name, noop)).unwrap();
        }
        graph
    }

    fn names(graph: &TaskGraph, order: &[NodeIndex]) -> Vec<String> {
        order
            .iter()
            .map(|&i| graph.graph[i].name.to_string())
            .collect()
    }

    #[test]
    fn test_duplicate_task() {
        let mut graph = graph_of(&["a"]);
        let err = graph.add_task(Task::new("a", noop)).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask("a".into()));
    }

    #[test]
    fn test_unknown_dependency() {
        let mut graph = graph_of(&["a"]);
        assert_eq!(
            graph.add_dependency("a", "missing").unwrap_err(),
            GraphError::UnknownTask("missing".into())
        );
        assert_eq!(
            graph.add_dependency("missing", "a").unwrap_err(),
            GraphError::UnknownTask("missing".into())
        );
    }

    #[test]
    fn test_chain_order() {
        let mut graph = graph_of(&["a", "b", "c"]);
        graph.add_dependency("a", "b").unwrap();
        graph.add_dependency("b", "c").unwrap();

        let order = graph.topological_order().unwrap();
        assert_eq!(names(&graph, &order), ["c", "b", "a"]);
    }

    #[test]
    fn test_ties_follow_registration() {
        let mut graph = graph_of(&["z", "y", "x", "root"]);
        graph.add_dependency("root", "x").unwrap();
        graph.add_dependency("root", "z").unwrap();

        let order = graph.topological_order().unwrap();
        assert_eq!(names(&graph, &order), ["z", "y", "x", "root"]);
    }

    #[test]
    fn test_order_respects_every_edge() {
        let mut graph = graph_of(&["app", "lib", "core", "fmt", "lint", "test"]);
        for (from, to) in [
            ("app", "lib"),
            ("lib", "core"),
            ("test", "app"),
            ("lint", "core"),
            ("test", "lint"),
        ] {
            graph.add_dependency(from, to).unwrap();
        }
        graph.add_ordering("fmt", "lint").unwrap();

        let order = graph.topological_order().unwrap();
        let position: HashMap<_, _> = order.iter().enumerate().map(|(p, &i)| (i, p)).collect();

        for edge in graph.graph.edge_references() {
            assert!(position[&edge.source()] < position[&edge.target()]);
        }
        assert_eq!(order.len(), graph.len());
    }

    #[test]
    fn test_cycle_members_in_detected_order() {
        let mut graph = graph_of(&["a", "b", "c", "d"]);
        graph.add_dependency("a", "b").unwrap();
        graph.add_dependency("b", "c").unwrap();
        graph.add_dependency("c", "a").unwrap();
        graph.add_dependency("d", "a").unwrap();

        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected(vec!["a".into(), "b".into(), "c".into()])
        );
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_deep_chain_is_valid() {
        const DEPTH: usize = 200_000;

        // Each task waits for the one registered after it, so the walk from
        // the first task spans the whole chain.
        let mut graph = TaskGraph::new();
        for i in 0..DEPTH {
            graph.add_task(Task::new(format!("t{i}"), noop)).unwrap();
        }
        for i in 1..DEPTH {
            graph
                .add_dependency(&format!("t{}", i - 1), &format!("t{i}"))
                .unwrap();
        }

        assert!(graph.validate().is_ok());
        let order = graph.topological_order().unwrap();
        assert_eq!(graph.graph[order[0]].name.as_ref(), format!("t{}", DEPTH - 1));

        graph
            .add_dependency(&format!("t{}", DEPTH - 1), "t0")
            .unwrap();
        match graph.validate().unwrap_err() {
            GraphError::CycleDetected(members) => assert_eq!(members.len(), DEPTH),
            err => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut graph = graph_of(&["a"]);
        graph.add_dependency("a", "a").unwrap();
        assert_eq!(
            graph.validate().unwrap_err(),
            GraphError::CycleDetected(vec!["a".into()])
        );
    }

    #[test]
    fn test_ordering_edges_join_cycle_check() {
        let mut graph = graph_of(&["a", "b"]);
        graph.add_dependency("a", "b").unwrap();
        graph.add_ordering("b", "a").unwrap();
        assert!(matches!(
            graph.validate(),
            Err(GraphError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_closure_skips_ordering_edges() {
        let mut graph = graph_of(&["a", "b", "c", "other"]);
        graph.add_dependency("a", "b").unwrap();
        graph.add_dependency("b", "c").unwrap();
        graph.add_ordering("a", "other").unwrap();

        let closure = graph.closure(&["a"]).unwrap();
        let mut found: Vec<_> = closure
            .iter()
            .map(|&i| graph.graph[i].name.to_string())
            .collect();
        found.sort();
        assert_eq!(found, ["a", "b", "c"]);

        assert_eq!(
            graph.closure(&["nope"]).unwrap_err(),
            GraphError::UnknownTask("nope".into())
        );
    }

    #[test]
    fn test_link_declared() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("test", noop).depends_on("compile"))
            .unwrap();
        graph.add_task(Task::new("compile", noop)).unwrap();
        graph.link_declared().unwrap();

        let expected: Vec<ArcStr> = vec!["compile".into(), "test".into()];
        assert_eq!(graph.topological_names().unwrap(), expected);

        let mut broken = TaskGraph::new();
        broken
            .add_task(Task::new("test", noop).depends_on("ghost"))
            .unwrap();
        assert_eq!(
            broken.link_declared().unwrap_err(),
            GraphError::UnknownTask("ghost".into())
        );
    }

    #[test]
    fn test_dependency_upgrades_ordering_edge() {
        let mut graph = graph_of(&["a", "b"]);
        graph.add_ordering("a", "b").unwrap();
        graph.add_dependency("a", "b").unwrap();
        assert_eq!(graph.graph.edge_count(), 1);

        let closure = graph.closure(&["a"]).unwrap();
        assert_eq!(closure.len(), 2);
    }

    #[test]
    fn test_prerequisites_of() {
        let mut graph = graph_of(&["compile", "lint", "format"]);
        graph.add_dependency("lint", "compile").unwrap();
        graph.add_ordering("lint", "format").unwrap();

        assert_eq!(graph.prerequisites_of("lint", Edge::Dependency).unwrap(), ["compile"]);
        assert_eq!(graph.prerequisites_of("lint", Edge::Ordering).unwrap(), ["format"]);
        assert!(graph.prerequisites_of("compile", Edge::Dependency).unwrap().is_empty());
    }

    #[test]
    fn test_mermaid() {
        let mut graph = graph_of(&["compile", "lint"]);
        graph.add_dependency("lint", "compile").unwrap();
        let mermaid = graph.to_mermaid();
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("0[\"compile\"]"));
        assert!(mermaid.contains("0 --> 1"));
    }
}
