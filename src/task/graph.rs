use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::{FETCH_TOKEN_TASK, Selector, TaskAction, TaskRegistry};
use crate::error::{GraphloadError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Must-precede relation over task names. `from -> to` means `from`
/// depends on `to`.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the full graph for a registry: declared dependencies,
    /// aggregate members, then the token edges.
    pub fn build(registry: &TaskRegistry) -> Result<Self> {
        let mut graph = Self::declared(registry)?;
        let added = graph.insert_token_edges(registry)?;
        debug!("Added {} implicit '{}' edges", added, FETCH_TOKEN_TASK);
        Ok(graph)
    }

    /// Graph with declared and aggregate edges only.
    pub fn declared(registry: &TaskRegistry) -> Result<Self> {
        let mut graph = Self::new();
        for task in registry.iter() {
            graph.add_node(&task.name);
        }

        for task in registry.iter() {
            for dep in &task.dependencies {
                graph.add_edge(&task.name, dep)?;
            }
        }

        for task in registry.iter() {
            let TaskAction::Aggregate(selector) = &task.action else {
                continue;
            };

            let members: Vec<&str> = match selector {
                Selector::Prefix(prefix) => registry
                    .find_by_prefix(prefix)
                    .map(|member| member.name.as_str())
                    .collect(),
                Selector::Tag(tag) => registry
                    .find_by_tag(tag)
                    .map(|member| member.name.as_str())
                    .collect(),
            };

            for member in members.into_iter().filter(|member| *member != task.name) {
                graph.add_edge(&task.name, member)?;
            }
        }

        Ok(graph)
    }

    /// Makes every network task depend on the token-fetch task.
    ///
    /// Walks the whole registry rather than trusting each task to declare
    /// the dependency. Returns the number of edges added.
    pub fn insert_token_edges(&mut self, registry: &TaskRegistry) -> Result<usize> {
        let mut added = 0;
        for task in registry.iter().filter(|task| task.action.is_network()) {
            if self.add_edge(&task.name, FETCH_TOKEN_TASK)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn add_node(&mut self, name: &str) {
        if !self.contains(name) {
            self.nodes.push(name.to_string());
            self.edges.insert(name.to_string(), Vec::new());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// Declares that `from` depends on `to`.
    ///
    /// Returns `false` if the edge already existed. On error the graph is
    /// left unchanged.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<bool> {
        if !self.contains(to) {
            return Err(GraphloadError::UnknownTask(to.to_string()));
        }
        if !self.contains(from) {
            return Err(GraphloadError::UnknownTask(from.to_string()));
        }

        if self.depends_on(from, to) {
            return Ok(false);
        }

        if from == to {
            return Err(GraphloadError::Cycle(vec![from.to_string(), to.to_string()]));
        }

        if let Some(path) = self.path_between(to, from) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(from.to_string());
            cycle.extend(path);
            return Err(GraphloadError::Cycle(cycle));
        }

        if let Some(deps) = self.edges.get_mut(from) {
            deps.push(to.to_string());
        }
        Ok(true)
    }

    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn depends_on(&self, from: &str, to: &str) -> bool {
        self.dependencies(from).iter().any(|dep| dep == to)
    }

    /// Every task reachable from `roots`, each after all of its
    /// dependencies.
    ///
    /// Roots are expanded in the order given and dependencies in the order
    /// they were declared, so tasks named earlier run earlier when nothing
    /// forces otherwise.
    pub fn topo_order<S: AsRef<str>>(&self, roots: &[S]) -> Result<Vec<String>> {
        Ok(self.topo_segments(roots)?.concat())
    }

    /// Same walk as [`topo_order`](Self::topo_order), split per root: each
    /// segment holds the tasks first reached from that root. Segments never
    /// share a task and a segment only depends on itself and earlier ones.
    pub fn topo_segments<S: AsRef<str>>(&self, roots: &[S]) -> Result<Vec<Vec<String>>> {
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut segments: Vec<Vec<String>> = Vec::with_capacity(roots.len());

        for root in roots {
            let root = root.as_ref();
            if !self.contains(root) {
                return Err(GraphloadError::UnknownTask(root.to_string()));
            }
            let mut segment = Vec::new();
            self.visit(root, &mut marks, &mut path, &mut segment)?;
            if !segment.is_empty() {
                segments.push(segment);
            }
        }

        Ok(segments)
    }

    fn visit(
        &self,
        task_id: &str,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(task_id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|id| id == task_id).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(task_id.to_string());
                return Err(GraphloadError::Cycle(cycle));
            }
            None => {}
        }

        marks.insert(task_id.to_string(), Mark::Visiting);
        path.push(task_id.to_string());

        for dep in self.dependencies(task_id) {
            self.visit(dep, marks, path, order)?;
        }

        path.pop();
        marks.insert(task_id.to_string(), Mark::Done);
        order.push(task_id.to_string());
        Ok(())
    }

    fn path_between(&self, start: &str, goal: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.find_path(start, goal, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn find_path(
        &self,
        current: &str,
        goal: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if !visited.insert(current.to_string()) {
            return false;
        }

        path.push(current.to_string());

        if current == goal {
            return true;
        }

        for dep in self.dependencies(current) {
            if self.find_path(dep, goal, visited, path) {
                return true;
            }
        }

        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{DELETE_TOKEN_TASK, GsqlScript, GsqlSource, Task};

    fn gsql(name: &str) -> Task {
        Task::new(
            name,
            TaskAction::Gsql(GsqlScript {
                source: GsqlSource::Command("ls".to_string()),
                use_global: false,
            }),
        )
    }

    fn aggregate(name: &str, prefix: &str) -> Task {
        Task::new(name, TaskAction::Aggregate(Selector::Prefix(prefix.to_string())))
    }

    fn position(order: &[String], name: &str) -> usize {
        order
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("{name} missing from {order:?}"))
    }

    fn workflow() -> TaskRegistry {
        let mut registry = TaskRegistry::with_builtins().unwrap();
        registry.register(gsql("createSchema")).unwrap();
        registry
            .register(gsql("createLoadOrganisation").depends_on("createSchema"))
            .unwrap();
        registry
            .register(gsql("createLoadFinanciers").depends_on("createSchema"))
            .unwrap();
        registry
            .register(Task::new("loadOrganisation", TaskAction::Version))
            .unwrap();
        registry
            .register(Task::new("loadFinanciers", TaskAction::Version))
            .unwrap();
        registry
            .register(Task::new("getVersion", TaskAction::Version))
            .unwrap();
        registry.register(aggregate("allCreateLoad", "createLoad")).unwrap();
        registry.register(aggregate("allLoad", "load")).unwrap();
        registry
    }

    #[test]
    fn test_topo_order_respects_dependencies() {
        let registry = workflow();
        let graph = DependencyGraph::build(&registry).unwrap();
        let all: Vec<&str> = registry.iter().map(|t| t.name.as_str()).collect();
        let order = graph.topo_order(&all).unwrap();

        assert_eq!(order.len(), registry.len());
        for task in registry.iter() {
            for dep in graph.dependencies(&task.name) {
                assert!(
                    position(&order, dep) < position(&order, &task.name),
                    "{dep} should run before {}",
                    task.name
                );
            }
        }
    }

    #[test]
    fn test_topo_order_only_includes_reachable_tasks() {
        let graph = DependencyGraph::build(&workflow()).unwrap();
        let order = graph.topo_order(&["createLoadFinanciers"]).unwrap();
        assert_eq!(order, vec!["createSchema", "createLoadFinanciers"]);
    }

    #[test]
    fn test_topo_segments_split_by_root() {
        let registry = workflow();
        let graph = DependencyGraph::build(&registry).unwrap();
        let segments = graph
            .topo_segments(&["createLoadFinanciers", "createSchema", "getVersion"])
            .unwrap();

        // createSchema was already reached through the first root.
        assert_eq!(segments.len(), 2);
        assert!(segments[0].contains(&"createSchema".to_string()));
        assert_eq!(segments[0].last().map(String::as_str), Some("createLoadFinanciers"));
        assert_eq!(segments[1].last().map(String::as_str), Some("getVersion"));
        assert_eq!(
            segments.concat(),
            graph
                .topo_order(&["createLoadFinanciers", "createSchema", "getVersion"])
                .unwrap()
        );
    }

    #[test]
    fn test_topo_order_unknown_root() {
        let graph = DependencyGraph::build(&workflow()).unwrap();
        assert!(matches!(
            graph.topo_order(&["nukeEverything"]),
            Err(GraphloadError::UnknownTask(ref name)) if name == "nukeEverything"
        ));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut graph = DependencyGraph::new();
        for name in ["a", "b", "c"] {
            graph.add_node(name);
        }
        graph.add_edge("a", "b").unwrap();
        graph.add_edge("b", "c").unwrap();

        let err = graph.add_edge("c", "a").unwrap_err();
        match err {
            GraphloadError::Cycle(members) => assert_eq!(members, vec!["c", "a", "b", "c"]),
            other => panic!("expected cycle, got {other}"),
        }

        assert!(graph.dependencies("c").is_empty());
        assert_eq!(graph.topo_order(&["a"]).unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_node("a");
        assert!(matches!(
            graph.add_edge("a", "a"),
            Err(GraphloadError::Cycle(_))
        ));
        assert!(graph.dependencies("a").is_empty());
    }

    #[test]
    fn test_unknown_declared_dependency() {
        let mut registry = TaskRegistry::with_builtins().unwrap();
        registry
            .register(gsql("createLoadOrganisation").depends_on("createSchema"))
            .unwrap();

        assert!(matches!(
            DependencyGraph::build(&registry),
            Err(GraphloadError::UnknownTask(ref name)) if name == "createSchema"
        ));
    }

    #[test]
    fn test_duplicate_edge_is_ignored() {
        let mut graph = DependencyGraph::new();
        graph.add_node("a");
        graph.add_node("b");
        assert!(graph.add_edge("a", "b").unwrap());
        assert!(!graph.add_edge("a", "b").unwrap());
        assert_eq!(graph.dependencies("a").len(), 1);
    }

    #[test]
    fn test_token_edges_cover_every_network_task() {
        let registry = workflow();

        // Without the pass, network tasks have no route to the token.
        let declared = DependencyGraph::declared(&registry).unwrap();
        let missing: Vec<&str> = registry
            .iter()
            .filter(|task| task.action.is_network())
            .filter(|task| !declared.depends_on(&task.name, FETCH_TOKEN_TASK))
            .map(|task| task.name.as_str())
            .collect();
        assert_eq!(missing, vec!["loadOrganisation", "loadFinanciers", "getVersion"]);

        let graph = DependencyGraph::build(&registry).unwrap();
        for task in registry.iter() {
            let has_edge = graph.depends_on(&task.name, FETCH_TOKEN_TASK);
            assert_eq!(
                has_edge,
                task.action.is_network(),
                "token edge mismatch for {}",
                task.name
            );
        }
        assert!(!graph.depends_on(DELETE_TOKEN_TASK, FETCH_TOKEN_TASK));
    }

    #[test]
    fn test_token_edges_need_token_task() {
        let mut registry = TaskRegistry::new();
        registry
            .register(Task::new("getVersion", TaskAction::Version))
            .unwrap();
        assert!(matches!(
            DependencyGraph::build(&registry),
            Err(GraphloadError::UnknownTask(ref name)) if name == FETCH_TOKEN_TASK
        ));
    }

    #[test]
    fn test_aggregate_runs_members_before_later_roots() {
        let graph = DependencyGraph::build(&workflow()).unwrap();
        let order = graph.topo_order(&["allCreateLoad", "allLoad"]).unwrap();

        let org = position(&order, "createLoadOrganisation");
        let fin = position(&order, "createLoadFinanciers");
        for load in ["loadOrganisation", "loadFinanciers"] {
            assert!(org < position(&order, load));
            assert!(fin < position(&order, load));
            assert!(position(&order, FETCH_TOKEN_TASK) < position(&order, load));
        }
        assert!(position(&order, "allCreateLoad") < position(&order, "allLoad"));
        assert!(!order.contains(&"getVersion".to_string()));
    }

    #[test]
    fn test_aggregate_by_tag_ignores_name() {
        let mut registry = TaskRegistry::with_builtins().unwrap();
        registry
            .register(Task::new("loadOrganisation", TaskAction::Version).with_tag("load"))
            .unwrap();
        registry
            .register(Task::new("loader_notes", TaskAction::Version))
            .unwrap();
        registry
            .register(Task::new(
                "allLoad",
                TaskAction::Aggregate(Selector::Tag("load".to_string())),
            ))
            .unwrap();

        let graph = DependencyGraph::build(&registry).unwrap();
        assert_eq!(graph.dependencies("allLoad"), ["loadOrganisation"]);
    }

    #[test]
    fn test_aggregate_does_not_include_itself() {
        let mut registry = TaskRegistry::with_builtins().unwrap();
        registry.register(aggregate("loadAll", "load")).unwrap();
        registry
            .register(Task::new("loadOrganisation", TaskAction::Version))
            .unwrap();

        let graph = DependencyGraph::build(&registry).unwrap();
        assert_eq!(graph.dependencies("loadAll"), ["loadOrganisation"]);
    }
}
