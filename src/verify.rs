//! Structural checks on concrete DAGs.
//!
//! [`verify`] re-derives, from the catalog alone, everything a concrete DAG
//! must satisfy. It runs on every concretization result and on every DAG
//! read from a lock file. Conditions are evaluated with the same meaning
//! the constraint model gives them: node parts apply to the node itself,
//! `^pkg` to the unified node of `pkg` when the node depends on it, and
//! `^virtual` to the provider when the node or one of its dependencies has
//! an edge satisfying the virtual.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::catalog::{Catalog, RequirePolicy, RequirementRule};
use crate::dag::ConcreteDag;
use crate::error::InvariantViolationError;
use crate::facts::{Facts, PackageFacts};
use crate::spec::{DepKinds, DependencySpec, Spec};

/// Check `dag` against `catalog`.
pub fn verify(dag: &ConcreteDag, catalog: &dyn Catalog) -> Result<(), InvariantViolationError> {
    let checker = Checker::new(dag, catalog)?;
    checker.check_identities()?;
    for index in 0..dag.len() {
        checker.check_node(index)?;
        checker.check_edges(index)?;
        checker.check_declarations(index)?;
        checker.check_conflicts(index)?;
        checker.check_requirements(index)?;
    }
    checker.check_virtuals()?;
    debug!(nodes = dag.len(), "verified concrete DAG");
    Ok(())
}

/// Whether node `index` of `dag` satisfies `spec`, `^` clauses included.
///
/// A propagated variant (`++x`, `~~x`, `k==v`) must also hold on every
/// dependency of the node that has the variant.
pub fn satisfies(
    dag: &ConcreteDag,
    index: usize,
    spec: &Spec,
    catalog: &dyn Catalog,
) -> Result<bool, InvariantViolationError> {
    let checker = Checker::new(dag, catalog)?;
    Ok(checker.holds(spec, index) && checker.propagated_holds(spec, index))
}

struct Checker<'a> {
    dag: &'a ConcreteDag,
    catalog: &'a dyn Catalog,
    /// Facts of each node's package, by node index.
    packages: Vec<PackageFacts>,
    /// Nodes each node depends on, directly or not.
    below: Vec<BTreeSet<usize>>,
}

impl<'a> Checker<'a> {
    fn new(dag: &'a ConcreteDag, catalog: &'a dyn Catalog) -> Result<Self, InvariantViolationError> {
        let mut facts = Facts::new();
        let mut packages = Vec::with_capacity(dag.len());
        for node in dag.nodes() {
            facts.load(catalog, &node.name);
            let Some(package) = facts.get(&node.name) else {
                return Err(InvariantViolationError::new(
                    node.label(),
                    "package is not in the catalog",
                ));
            };
            packages.push(package.clone());
        }
        let below = (0..dag.len())
            .map(|i| {
                let mut reached = dag.reachable_from(i);
                reached.remove(&i);
                reached
            })
            .collect();
        Ok(Self {
            dag,
            catalog,
            packages,
            below,
        })
    }

    fn facts_of(&self, index: usize) -> &PackageFacts {
        &self.packages[index]
    }

    fn violation(&self, index: usize, message: impl Into<String>) -> InvariantViolationError {
        InvariantViolationError::new(self.dag.node(index).label(), message)
    }

    // --- condition evaluation ---

    /// Whether the node part of `spec` holds for node `index`.
    fn node_holds(&self, spec: &Spec, index: usize) -> bool {
        let node = self.dag.node(index);
        let facts = self.facts_of(index);
        if spec.name.as_ref().is_some_and(|name| *name != node.name) {
            return false;
        }
        if !spec.versions.contains(&node.version) {
            return false;
        }
        for (name, value) in &spec.variants {
            let Ok(wanted) = facts.normalize_variant(name, value) else {
                return false;
            };
            if !node.variants.get(name).is_some_and(|have| have.satisfies(&wanted)) {
                return false;
            }
        }
        if let Some(compiler) = &spec.compiler {
            if !compiler.satisfied_by(&node.compiler) {
                return false;
            }
        }
        spec.arch.satisfied_by(&node.arch)
    }

    fn holds(&self, spec: &Spec, index: usize) -> bool {
        self.node_holds(spec, index)
            && spec
                .dependencies
                .iter()
                .all(|d| self.dependency_holds(d, index))
    }

    /// `^dep` seen from node `subject`.
    fn dependency_holds(&self, dep: &DependencySpec, subject: usize) -> bool {
        let name = dep.spec.name();
        if self.catalog.has_package(name) {
            return self.dag.position(name, None).is_some_and(|target| {
                self.below[subject].contains(&target)
                    && self.node_holds(&dep.spec, target)
                    && dep.virtuals.iter().all(|v| self.provider_of(v) == Some(target))
            });
        }
        std::iter::once(subject)
            .chain(self.below[subject].iter().copied())
            .flat_map(|n| self.dag.node(n).dependencies.iter())
            .find(|e| e.virtuals.contains(name))
            .is_some_and(|e| self.provides(e.target, name, &dep.spec))
    }

    fn propagated_holds(&self, spec: &Spec, index: usize) -> bool {
        spec.propagated.iter().all(|name| {
            let Some(value) = spec.variants.get(name) else {
                return true;
            };
            self.below[index].iter().all(|&n| {
                let Some(wanted) = self
                    .facts_of(n)
                    .variant(name)
                    .and_then(|decl| value.normalize(decl).ok())
                else {
                    return true;
                };
                self.dag
                    .node(n)
                    .variants
                    .get(name)
                    .is_none_or(|have| have.satisfies(&wanted))
            })
        })
    }

    /// The node edges name as the provider of `virtual_name`.
    fn provider_of(&self, virtual_name: &str) -> Option<usize> {
        self.dag
            .nodes()
            .iter()
            .flat_map(|n| n.dependencies.iter())
            .find(|e| e.virtuals.contains(virtual_name))
            .map(|e| e.target)
    }

    /// Whether node `index` has an active provision of `virtual_name` whose
    /// versions meet `request`.
    fn provides(&self, index: usize, virtual_name: &str, request: &Spec) -> bool {
        self.facts_of(index).provides.iter().any(|p| {
            p.name == virtual_name
                && p.versions.intersects(&request.versions)
                && self.holds(&p.when, index)
        })
    }

    // --- checks ---

    fn check_identities(&self) -> Result<(), InvariantViolationError> {
        let nodes = self.dag.nodes();
        for (index, pair) in nodes.windows(2).enumerate() {
            if pair[0].name == pair[1].name && pair[0].build_for == pair[1].build_for {
                return Err(self.violation(index + 1, "package appears twice"));
            }
        }
        if let Some(first) = nodes.first() {
            if let Some(index) = nodes.iter().position(|n| n.arch != first.arch) {
                return Err(self.violation(
                    index,
                    format!("architecture {} differs from {}", nodes[index].arch, first.arch),
                ));
            }
        }
        for (index, node) in nodes.iter().enumerate() {
            let Some(parent) = &node.build_for else {
                continue;
            };
            let mut incoming = self.dag.dependents(index).peekable();
            if incoming.peek().is_none() {
                return Err(self.violation(index, "separate build with no dependent"));
            }
            for (source, edge) in incoming {
                if self.dag.node(source).name != *parent || !edge.kinds.is_build_only() {
                    return Err(self.violation(
                        index,
                        format!(
                            "reached from {} by a {} edge",
                            self.dag.node(source).label(),
                            edge.kinds
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_node(&self, index: usize) -> Result<(), InvariantViolationError> {
        let node = self.dag.node(index);
        let facts = self.facts_of(index);
        if facts.version_index(&node.version).is_none() {
            return Err(self.violation(index, "version is not declared"));
        }
        for (name, value) in &node.variants {
            let Some(decl) = facts.variant(name) else {
                return Err(self.violation(index, format!("undeclared variant `{name}`")));
            };
            if value.normalize(decl).as_ref() != Ok(value) {
                return Err(self.violation(index, format!("invalid value `{value}` for `{name}`")));
            }
            if !self.holds(&decl.when, index) {
                return Err(self.violation(
                    index,
                    format!("variant `{name}` only applies when `{}`", decl.when),
                ));
            }
        }
        for decl in &facts.variants {
            if !node.variants.contains_key(&decl.name) && self.holds(&decl.when, index) {
                return Err(self.violation(index, format!("variant `{}` is unset", decl.name)));
            }
        }
        Ok(())
    }

    fn check_edges(&self, index: usize) -> Result<(), InvariantViolationError> {
        let node = self.dag.node(index);
        let facts = self.facts_of(index);
        for edge in &node.dependencies {
            let target = self.dag.node(edge.target);
            let mut justified = DepKinds::empty();
            for decl in &facts.dependencies {
                if !self.holds(&decl.when, index) {
                    continue;
                }
                let wanted = decl.target.name();
                let matches = if edge.virtuals.contains(wanted) {
                    self.provides(edge.target, wanted, &decl.target)
                } else {
                    wanted == target.name && self.node_holds(&decl.target, edge.target)
                };
                if matches {
                    justified = justified.union(decl.kinds);
                }
            }
            if justified.is_empty() {
                return Err(self.violation(
                    index,
                    format!("no active declaration explains the edge to {}", target.label()),
                ));
            }
            if !justified.covers(edge.kinds) {
                return Err(self.violation(
                    index,
                    format!(
                        "edge to {} is {} but only {} is declared",
                        target.label(),
                        edge.kinds,
                        justified
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_declarations(&self, index: usize) -> Result<(), InvariantViolationError> {
        let node = self.dag.node(index);
        for decl in &self.facts_of(index).dependencies {
            let required = decl.kinds.without(DepKinds::TEST);
            if required.is_empty() || !self.holds(&decl.when, index) {
                continue;
            }
            let wanted = decl.target.name();
            let is_package = self.catalog.has_package(wanted);
            let met = node.dependencies.iter().any(|edge| {
                edge.kinds.covers(required)
                    && if is_package {
                        self.dag.node(edge.target).name == wanted
                            && self.node_holds(&decl.target, edge.target)
                    } else {
                        edge.virtuals.contains(wanted)
                            && self.provides(edge.target, wanted, &decl.target)
                    }
            });
            if !met {
                return Err(self.violation(
                    index,
                    format!("dependency `{}` ({required}) is not met", decl.target),
                ));
            }
        }
        Ok(())
    }

    fn check_conflicts(&self, index: usize) -> Result<(), InvariantViolationError> {
        for rule in &self.facts_of(index).conflicts {
            if self.holds(&rule.when, index) && self.holds(&rule.conflict, index) {
                let mut message = format!("conflicts with `{}`", rule.conflict);
                if let Some(reason) = &rule.message {
                    message.push_str(": ");
                    message.push_str(reason);
                }
                return Err(self.violation(index, message));
            }
        }
        Ok(())
    }

    fn check_requirements(&self, index: usize) -> Result<(), InvariantViolationError> {
        for rule in &self.facts_of(index).requirements {
            if !self.holds(&rule.when, index) {
                continue;
            }
            let matched = rule
                .alternatives
                .iter()
                .filter(|alternative| self.holds(alternative, index))
                .count();
            let met = match rule.policy {
                RequirePolicy::OneOf => matched == 1,
                RequirePolicy::AnyOf => matched > 0,
            };
            if !met {
                return Err(self.violation(index, unmet(rule, matched)));
            }
        }
        Ok(())
    }

    /// One provider package per virtual.
    fn check_virtuals(&self) -> Result<(), InvariantViolationError> {
        let mut providers: BTreeMap<&str, usize> = BTreeMap::new();
        for node in self.dag.nodes() {
            for edge in &node.dependencies {
                for virtual_name in &edge.virtuals {
                    let provider = *providers.entry(virtual_name.as_str()).or_insert(edge.target);
                    if self.dag.node(provider).name != self.dag.node(edge.target).name {
                        return Err(self.violation(
                            edge.target,
                            format!(
                                "`{virtual_name}` is also provided by {}",
                                self.dag.node(provider).label()
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn unmet(rule: &RequirementRule, matched: usize) -> String {
    let alternatives: Vec<String> = rule.alternatives.iter().map(Spec::to_string).collect();
    let mut message = match (rule.policy, alternatives.len()) {
        (_, 1) => format!("requires `{}`", alternatives[0]),
        (RequirePolicy::OneOf, _) => format!(
            "requires exactly one of `{}`, {matched} match",
            alternatives.join("`, `")
        ),
        (RequirePolicy::AnyOf, _) => format!("requires one of `{}`", alternatives.join("`, `")),
    };
    if let Some(reason) = &rule.message {
        message.push_str(": ");
        message.push_str(reason);
    }
    message
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::dag::tests::node;
    use crate::dag::ConcreteNode;
    use crate::recipe::PackageRecipe;
    use crate::variant::VariantValue;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_recipes([
            PackageRecipe::new("app")
                .version("1.0")
                .variant("mpi", true)
                .depends_on_when("mpi", "build,link", "+mpi")
                .depends_on("cmake", "build")
                .conflicts_msg("%gcc@:4", "", Some("needs C++17")),
            PackageRecipe::new("cmake").version("3.27"),
            PackageRecipe::new("mpich").version("3.0").provides("mpi@3"),
            PackageRecipe::new("openmpi").version("4.1").provides("mpi@3"),
        ])
        .unwrap()
    }

    fn app(mpi: bool) -> ConcreteNode {
        let mut app = node("app", "1.0", &[(1, "build")]);
        app.variants.insert("mpi".to_string(), VariantValue::Bool(mpi));
        if mpi {
            app.dependencies.push(crate::dag::DependencyEdge {
                target: 2,
                kinds: "build,link".parse().unwrap(),
                virtuals: BTreeSet::from(["mpi".to_string()]),
            });
        }
        app
    }

    fn dag(nodes: Vec<ConcreteNode>) -> Result<ConcreteDag, InvariantViolationError> {
        ConcreteDag::from_parts(nodes, vec![0])
    }

    #[test]
    fn valid_dag_passes() {
        let catalog = catalog();
        let dag = dag(vec![app(true), node("cmake", "3.27", &[]), node("mpich", "3.0", &[])]).unwrap();
        verify(&dag, &catalog).unwrap();

        let root = dag.root_indices()[0];
        let check = |s: &str| satisfies(&dag, root, &Spec::parse(s).unwrap(), &catalog).unwrap();
        assert!(check("app+mpi ^mpich"));
        assert!(check("app ^mpi@3"));
        assert!(check("app ^[virtuals=mpi] mpich"));
        assert!(!check("app~mpi"));
        assert!(!check("app ^openmpi"));

        let no_mpi = ConcreteDag::from_parts(vec![app(false), node("cmake", "3.27", &[])], vec![0]).unwrap();
        verify(&no_mpi, &catalog).unwrap();
    }

    #[test]
    fn missing_dependency_is_reported() {
        let catalog = catalog();
        let mut root = app(true);
        root.dependencies.retain(|e| e.target != 1);
        let dag = dag(vec![root, node("cmake", "3.27", &[]), node("mpich", "3.0", &[])]).unwrap();
        let err = verify(&dag, &catalog).unwrap_err();
        assert!(err.message.contains("cmake"), "{err}");
    }

    #[test]
    fn unjustified_edges_are_reported() {
        let catalog = catalog();
        let mut root = app(true);
        root.dependencies[0].kinds = "build,run".parse().unwrap();
        let dag = dag(vec![root, node("cmake", "3.27", &[]), node("mpich", "3.0", &[])]).unwrap();
        assert!(verify(&dag, &catalog).is_err());

        // `~mpi` deactivates the mpi declaration, so the edge is unexplained.
        let mut root = app(true);
        root.variants.insert("mpi".to_string(), VariantValue::Bool(false));
        let dag2 = ConcreteDag::from_parts(
            vec![root, node("cmake", "3.27", &[]), node("mpich", "3.0", &[])],
            vec![0],
        )
        .unwrap();
        assert!(verify(&dag2, &catalog).is_err());
    }

    #[test]
    fn conflicts_and_variants_are_checked() {
        let catalog = catalog();
        let mut old = app(false);
        old.compiler = "gcc@4.2.0".parse().unwrap();
        let dag1 = dag(vec![old, node("cmake", "3.27", &[])]).unwrap();
        let err = verify(&dag1, &catalog).unwrap_err();
        assert!(err.message.contains("needs C++17"), "{err}");

        let mut unset = app(false);
        unset.variants.clear();
        let dag2 = dag(vec![unset, node("cmake", "3.27", &[])]).unwrap();
        assert!(verify(&dag2, &catalog).unwrap_err().message.contains("unset"));

        let mut bogus = app(false);
        bogus
            .variants
            .insert("debug".to_string(), VariantValue::Bool(true));
        let dag3 = dag(vec![bogus, node("cmake", "3.27", &[])]).unwrap();
        assert!(verify(&dag3, &catalog).is_err());

        let dag4 = dag(vec![app(false), node("cmake", "2.0", &[])]).unwrap();
        assert!(verify(&dag4, &catalog).unwrap_err().message.contains("not declared"));
    }

    #[test]
    fn forks_need_build_only_edges_from_their_parent() {
        let catalog = catalog();
        let mut cmake = node("cmake", "3.27", &[]);
        cmake.build_for = Some("app".to_string());
        let dag1 = dag(vec![app(false), cmake.clone()]).unwrap();
        verify(&dag1, &catalog).unwrap();

        cmake.build_for = Some("mpich".to_string());
        let dag2 = dag(vec![app(false), cmake]).unwrap();
        assert!(verify(&dag2, &catalog).is_err());
    }

    #[test]
    fn dependency_clauses_are_relative_to_the_node() {
        let catalog = catalog();
        let dag = dag(vec![app(true), node("cmake", "3.27", &[]), node("mpich", "3.0", &[])]).unwrap();
        let at = |name: &str, s: &str| {
            let index = dag.position(name, None).unwrap();
            satisfies(&dag, index, &Spec::parse(s).unwrap(), &catalog).unwrap()
        };
        assert!(at("app", "app ^cmake"));
        assert!(!at("mpich", "mpich ^cmake"));
        assert!(!at("cmake", "cmake ^mpi"));
    }

    #[test]
    fn requirements_are_checked() {
        let catalog = InMemoryCatalog::from_recipes([
            PackageRecipe::new("a")
                .version("1.0")
                .variant("x", false)
                .requires(&["%clang"], "+x"),
            PackageRecipe::new("b")
                .version("1.0")
                .requires_any_of(&["%gcc", "%clang"], ""),
        ])
        .unwrap();
        let mut a = node("a", "1.0", &[]);
        a.variants.insert("x".to_string(), VariantValue::Bool(false));
        verify(&dag(vec![a.clone()]).unwrap(), &catalog).unwrap();

        a.variants.insert("x".to_string(), VariantValue::Bool(true));
        let err = verify(&dag(vec![a]).unwrap(), &catalog).unwrap_err();
        assert!(err.message.contains("requires `%clang`"), "{err}");

        verify(&dag(vec![node("b", "1.0", &[])]).unwrap(), &catalog).unwrap();
    }

    #[test]
    fn propagated_variants_reach_dependencies() {
        let catalog = InMemoryCatalog::from_recipes([
            PackageRecipe::new("top")
                .version("1.0")
                .variant("debug", false)
                .depends_on("lib", "build,link")
                .depends_on("tool", "build"),
            PackageRecipe::new("lib").version("1.0").variant("debug", false),
            PackageRecipe::new("tool").version("1.0"),
        ])
        .unwrap();
        let mut top = node("top", "1.0", &[(1, "build,link"), (2, "build")]);
        top.variants.insert("debug".to_string(), VariantValue::Bool(true));
        let mut lib = node("lib", "1.0", &[]);
        lib.variants.insert("debug".to_string(), VariantValue::Bool(false));
        let dag = dag(vec![top, lib, node("tool", "1.0", &[])]).unwrap();

        let root = dag.root_indices()[0];
        let check = |s: &str| satisfies(&dag, root, &Spec::parse(s).unwrap(), &catalog).unwrap();
        assert!(check("top+debug ^lib~debug"));
        assert!(!check("top++debug"));
    }

    #[test]
    fn unknown_packages_fail() {
        let catalog = catalog();
        let dag = dag(vec![node("zlib", "1.3", &[])]).unwrap();
        assert!(verify(&dag, &catalog).unwrap_err().message.contains("catalog"));
    }
}
