//! Concrete DAGs.
//!
//! A [`ConcreteDag`] is the result of a concretization: every node has one
//! version, a value for each of its applicable variants, a compiler and an
//! architecture, and edges carry their dependency kinds and the virtuals
//! they satisfy. Nodes are kept sorted by `(name, build_for)` and carry a
//! content hash that covers their whole dependency sub-DAG.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sha2::{Digest, Sha256};

use crate::error::InvariantViolationError;
use crate::spec::{Arch, Compiler, DepKinds, DependencySpec, Spec};
use crate::variant::VariantValue;
use crate::version::Version;
use crate::version_match::VersionConstraint;

/// Hex digits kept from the SHA-256 digest.
const HASH_LEN: usize = 32;

/// An edge to another node of the same DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Index of the target in [`ConcreteDag::nodes`].
    pub target: usize,
    pub kinds: DepKinds,
    /// Virtuals this edge satisfies.
    pub virtuals: BTreeSet<String>,
}

/// A fully decided package instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteNode {
    pub name: String,
    pub version: Version,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: Compiler,
    pub arch: Arch,
    /// Set for a private copy reached only by build-only edges of one
    /// package.
    pub build_for: Option<String>,
    pub dependencies: Vec<DependencyEdge>,
    pub hash: String,
}

impl ConcreteNode {
    /// The node part as an exact spec: `zlib@=1.3 +shared %gcc@=12.1.0 arch=...`.
    pub fn spec(&self) -> Spec {
        Spec {
            name: Some(self.name.clone()),
            versions: VersionConstraint::exact(self.version.clone()),
            variants: self.variants.clone(),
            compiler: Some(self.compiler.to_spec()),
            arch: self.arch.to_spec(),
            dependencies: Vec::new(),
            propagated: BTreeSet::new(),
        }
    }

    /// Short form for logs and error messages.
    pub fn label(&self) -> String {
        match &self.build_for {
            Some(parent) => format!("{}@{} (built for {parent})", self.name, self.version),
            None => format!("{}@{}", self.name, self.version),
        }
    }

    /// Canonical text covered by the hash, without dependencies.
    fn canonical(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.spec().write_node(&mut out);
        if let Some(parent) = &self.build_for {
            out.push_str(" build_for=");
            out.push_str(parent);
        }
        out
    }
}

impl fmt::Display for ConcreteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.spec().write_node(f)?;
        if let Some(parent) = &self.build_for {
            write!(f, " (built for {parent})")?;
        }
        Ok(())
    }
}

/// A concrete, acyclic dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConcreteDag {
    nodes: Vec<ConcreteNode>,
    roots: Vec<usize>,
}

impl ConcreteDag {
    /// Assemble a DAG from nodes whose edges index into `nodes`.
    ///
    /// Nodes are re-sorted, edges re-indexed and hashes recomputed; the
    /// incoming `hash` fields are ignored. Fails on a cycle.
    pub fn from_parts(
        mut nodes: Vec<ConcreteNode>,
        roots: Vec<usize>,
    ) -> Result<Self, InvariantViolationError> {
        for node in &nodes {
            if let Some(edge) = node.dependencies.iter().find(|e| e.target >= nodes.len()) {
                return Err(InvariantViolationError::new(
                    node.label(),
                    format!("edge to missing node #{}", edge.target),
                ));
            }
        }
        if let Some(&root) = roots.iter().find(|&&r| r >= nodes.len()) {
            return Err(InvariantViolationError::new(
                "<roots>",
                format!("root #{root} does not exist"),
            ));
        }

        // Phase 1: canonical node order.
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by(|&a, &b| {
            (&nodes[a].name, &nodes[a].build_for).cmp(&(&nodes[b].name, &nodes[b].build_for))
        });
        let mut position = vec![0; nodes.len()];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }
        let mut slots: Vec<Option<ConcreteNode>> = nodes.drain(..).map(Some).collect();
        let mut sorted = Vec::with_capacity(slots.len());
        for &old in &order {
            if let Some(mut node) = slots[old].take() {
                for edge in &mut node.dependencies {
                    edge.target = position[edge.target];
                }
                node.dependencies.sort_by_key(|e| e.target);
                sorted.push(node);
            }
        }

        let mut dag = Self {
            nodes: sorted,
            roots: roots.into_iter().map(|r| position[r]).collect(),
        };

        // Phase 2: acyclicity, then hashes bottom-up.
        let install = dag.topological_order().map_err(|index| {
            let label = dag.nodes[index].label();
            InvariantViolationError::new(label.clone(), format!("dependency cycle through {label}"))
        })?;
        for index in install {
            let hash = dag.compute_hash(index);
            dag.nodes[index].hash = hash;
        }
        Ok(dag)
    }

    pub fn nodes(&self) -> &[ConcreteNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &ConcreteNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Indices of the root nodes, in request order.
    pub fn root_indices(&self) -> &[usize] {
        &self.roots
    }

    pub fn roots(&self) -> impl Iterator<Item = &ConcreteNode> {
        self.roots.iter().map(|&i| &self.nodes[i])
    }

    /// The unified node of `name`.
    pub fn find(&self, name: &str) -> Option<&ConcreteNode> {
        self.position(name, None).map(|i| &self.nodes[i])
    }

    /// Index of the node `(name, build_for)`.
    pub fn position(&self, name: &str, build_for: Option<&str>) -> Option<usize> {
        self.nodes
            .binary_search_by(|n| (n.name.as_str(), n.build_for.as_deref()).cmp(&(name, build_for)))
            .ok()
    }

    /// Edges into `index`, as `(source, edge)` pairs.
    pub fn dependents(&self, index: usize) -> impl Iterator<Item = (usize, &DependencyEdge)> {
        self.nodes.iter().enumerate().flat_map(move |(source, node)| {
            node.dependencies
                .iter()
                .filter(move |e| e.target == index)
                .map(move |e| (source, e))
        })
    }

    /// Nodes reachable from `index`, itself included, in index order.
    pub fn reachable_from(&self, index: usize) -> BTreeSet<usize> {
        self.reachable_from_all(&[index])
    }

    /// Nodes reachable from any of `from`, themselves included.
    pub fn reachable_from_all(&self, from: &[usize]) -> BTreeSet<usize> {
        reachable(&self.graph(), from)
    }

    /// Every node, dependencies before their dependents.
    ///
    /// The order only depends on the DAG, so it is deterministic.
    pub fn install_order(&self) -> Vec<usize> {
        // Acyclic by construction.
        self.topological_order().unwrap_or_default()
    }

    /// Edges point from dependent to dependency; node `i` is `NodeIndex(i)`.
    fn graph(&self) -> DiGraph<(), ()> {
        dependency_graph(&self.nodes)
    }

    /// Dependencies first. On a cycle, returns one node on it.
    fn topological_order(&self) -> Result<Vec<usize>, usize> {
        let graph = self.graph();
        let mut order = toposort(&graph, None).map_err(|cycle| cycle.node_id().index())?;
        order.reverse();
        Ok(order.into_iter().map(NodeIndex::index).collect())
    }

    /// Hash of the node's canonical form plus its dependencies' hashes.
    /// Dependency hashes must already be set.
    fn compute_hash(&self, index: usize) -> String {
        let node = &self.nodes[index];
        let mut edges: Vec<String> = node
            .dependencies
            .iter()
            .map(|e| {
                let virtuals: Vec<&str> = e.virtuals.iter().map(String::as_str).collect();
                format!(
                    "{} {} {}",
                    self.nodes[e.target].hash,
                    e.kinds,
                    virtuals.join(",")
                )
            })
            .collect();
        edges.sort();

        let mut hasher = Sha256::new();
        hasher.update(node.canonical().as_bytes());
        for edge in edges {
            hasher.update(b"\n");
            hasher.update(edge.as_bytes());
        }
        let mut hash = hex::encode(hasher.finalize());
        hash.truncate(HASH_LEN);
        hash
    }

    /// The `position`-th root as a fully constrained spec.
    ///
    /// Every unified node reachable from the root is listed as a `^`
    /// dependency, with `[virtuals=...]` when it was reached as a provider.
    /// Concretizing the result against the same catalog and configuration
    /// reproduces the same DAG.
    pub fn root_spec(&self, position: usize) -> Option<Spec> {
        let &root = self.roots.get(position)?;
        let mut spec = self.nodes[root].spec();

        let reachable = self.reachable_from(root);
        for &index in &reachable {
            let node = &self.nodes[index];
            if index == root || node.build_for.is_some() {
                continue;
            }
            let virtuals: BTreeSet<&String> = self
                .dependents(index)
                .filter(|(source, _)| reachable.contains(source))
                .flat_map(|(_, e)| e.virtuals.iter())
                .collect();
            spec.dependencies.push(DependencySpec {
                spec: node.spec(),
                kinds: None,
                virtuals: virtuals.into_iter().cloned().collect(),
            });
        }
        Some(spec)
    }

    /// [`ConcreteDag::root_spec`] as text.
    pub fn format_root(&self, position: usize) -> Option<String> {
        self.root_spec(position).map(|s| s.to_string())
    }

    fn write_tree(
        &self,
        f: &mut fmt::Formatter<'_>,
        index: usize,
        depth: usize,
        seen: &mut BTreeSet<usize>,
    ) -> fmt::Result {
        let node = &self.nodes[index];
        let short = &node.hash[..node.hash.len().min(7)];
        let pad = " ".repeat(depth * 4);
        let marker = if depth == 0 { "" } else { "^" };
        writeln!(f, "{short}  {pad}{marker}{node}")?;
        if !seen.insert(index) {
            return Ok(());
        }
        for edge in &node.dependencies {
            if !seen.contains(&edge.target) {
                self.write_tree(f, edge.target, depth + 1, seen)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConcreteDag {
    /// One tree per root; shared nodes are printed once.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen = BTreeSet::new();
        for &root in &self.roots {
            self.write_tree(f, root, 0, &mut seen)?;
        }
        Ok(())
    }
}

/// The dependency graph of `nodes`, whose edges index into the slice.
pub(crate) fn dependency_graph(nodes: &[ConcreteNode]) -> DiGraph<(), ()> {
    let mut graph = DiGraph::with_capacity(nodes.len(), 0);
    for _ in nodes {
        graph.add_node(());
    }
    for (source, node) in nodes.iter().enumerate() {
        for edge in &node.dependencies {
            graph.update_edge(NodeIndex::new(source), NodeIndex::new(edge.target), ());
        }
    }
    graph
}

/// Indices reachable from `from` in `graph`, starting points included.
pub(crate) fn reachable(graph: &DiGraph<(), ()>, from: &[usize]) -> BTreeSet<usize> {
    let mut dfs = Dfs::empty(graph);
    dfs.stack.extend(from.iter().map(|&i| NodeIndex::new(i)));
    let mut seen = BTreeSet::new();
    while let Some(index) = dfs.next(graph) {
        seen.insert(index.index());
    }
    seen
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn node(name: &str, version: &str, deps: &[(usize, &str)]) -> ConcreteNode {
        ConcreteNode {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            variants: BTreeMap::new(),
            compiler: "gcc@12.1.0".parse().unwrap(),
            arch: "linux-ubuntu22.04-x86_64".parse().unwrap(),
            build_for: None,
            dependencies: deps
                .iter()
                .map(|&(target, kinds)| DependencyEdge {
                    target,
                    kinds: kinds.parse().unwrap(),
                    virtuals: BTreeSet::new(),
                })
                .collect(),
            hash: String::new(),
        }
    }

    #[test]
    fn nodes_are_sorted_and_edges_reindexed() {
        let dag = ConcreteDag::from_parts(
            vec![
                node("zlib", "1.3", &[]),
                node("cmake", "3.27", &[(0, "build,link")]),
                node("app", "1.0", &[(1, "build"), (0, "link")]),
            ],
            vec![2],
        )
        .unwrap();
        let names: Vec<&str> = dag.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["app", "cmake", "zlib"]);
        assert_eq!(dag.root_indices(), [0]);
        let app = dag.find("app").unwrap();
        assert_eq!(app.dependencies[0].target, 1);
        assert_eq!(app.dependencies[1].target, 2);
        assert_eq!(dag.position("zlib", None), Some(2));
        assert_eq!(dag.position("zlib", Some("app")), None);
    }

    #[test]
    fn install_order_puts_dependencies_first() {
        let dag = ConcreteDag::from_parts(
            vec![
                node("app", "1.0", &[(1, "link"), (2, "build")]),
                node("zlib", "1.3", &[]),
                node("cmake", "3.27", &[(1, "link")]),
            ],
            vec![0],
        )
        .unwrap();
        let order: Vec<&str> = dag
            .install_order()
            .into_iter()
            .map(|i| dag.node(i).name.as_str())
            .collect();
        assert_eq!(order, ["zlib", "cmake", "app"]);
    }

    #[test]
    fn reachability_follows_edges_only() {
        let dag = ConcreteDag::from_parts(
            vec![
                node("app", "1.0", &[(1, "link")]),
                node("zlib", "1.3", &[]),
                node("tool", "2.0", &[(1, "run")]),
            ],
            vec![0, 2],
        )
        .unwrap();
        let app = dag.position("app", None).unwrap();
        let tool = dag.position("tool", None).unwrap();
        let zlib = dag.position("zlib", None).unwrap();
        assert_eq!(dag.reachable_from(app), BTreeSet::from([app, zlib]));
        assert_eq!(dag.reachable_from(zlib), BTreeSet::from([zlib]));
        assert_eq!(dag.reachable_from_all(&[app, tool]).len(), 3);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = ConcreteDag::from_parts(
            vec![node("a", "1.0", &[(1, "link")]), node("b", "1.0", &[(0, "link")])],
            vec![0],
        )
        .unwrap_err();
        assert!(err.message.contains("cycle"), "{err}");

        let looped = ConcreteDag::from_parts(vec![node("a", "1.0", &[(0, "link")])], vec![0]);
        assert!(looped.unwrap_err().message.contains("cycle through a@1.0"));

        let dangling = ConcreteDag::from_parts(vec![node("a", "1.0", &[(3, "link")])], vec![0]);
        assert!(dangling.is_err());
    }

    #[test]
    fn hashes_cover_dependencies() {
        let base = ConcreteDag::from_parts(
            vec![node("app", "1.0", &[(1, "link")]), node("zlib", "1.3", &[])],
            vec![0],
        )
        .unwrap();
        let bumped = ConcreteDag::from_parts(
            vec![node("app", "1.0", &[(1, "link")]), node("zlib", "1.2", &[])],
            vec![0],
        )
        .unwrap();
        let relinked = ConcreteDag::from_parts(
            vec![node("app", "1.0", &[(1, "build")]), node("zlib", "1.3", &[])],
            vec![0],
        )
        .unwrap();
        let app = |d: &ConcreteDag| d.find("app").unwrap().hash.clone();
        assert_eq!(app(&base).len(), HASH_LEN);
        assert_ne!(app(&base), app(&bumped));
        assert_ne!(app(&base), app(&relinked));

        let again = ConcreteDag::from_parts(
            vec![node("zlib", "1.3", &[]), node("app", "1.0", &[(0, "link")])],
            vec![1],
        )
        .unwrap();
        assert_eq!(base, again);
    }

    #[test]
    fn root_spec_lists_unified_nodes_with_virtuals() {
        let mut app = node("app", "1.0", &[(1, "build,link"), (2, "build")]);
        app.variants
            .insert("shared".to_string(), VariantValue::Bool(true));
        app.dependencies[0].virtuals.insert("mpi".to_string());
        let mut cmake = node("cmake", "3.27", &[]);
        cmake.build_for = Some("app".to_string());
        let dag = ConcreteDag::from_parts(
            vec![app, node("mpich", "3.0", &[]), cmake],
            vec![0],
        )
        .unwrap();
        assert_eq!(
            dag.format_root(0).unwrap(),
            "app@=1.0+shared %gcc@=12.1.0 arch=linux-ubuntu22.04-x86_64 \
             ^[virtuals=mpi] mpich@=3.0 %gcc@=12.1.0 arch=linux-ubuntu22.04-x86_64"
        );
        assert_eq!(dag.format_root(1), None);
        assert!(dag.to_string().contains("^cmake@=3.27"));
    }
}
