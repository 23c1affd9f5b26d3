//! DAG assembly from a solver assignment.
//!
//! The solver hands back one selected candidate per present choice.
//! [`assemble`] reads node versions, compilers and variant values off that
//! assignment, re-evaluates every dependency declaration against it to lay
//! the edges, and drops whatever the roots do not reach.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use resolvo::{NameId, SolvableId};
use tracing::debug;

use crate::builder::{ConstraintModel, EdgeRule, Target};
use crate::dag::{ConcreteDag, ConcreteNode, DependencyEdge, dependency_graph, reachable};
use crate::error::{ConcretizeError, InvariantViolationError};
use crate::pool::{CandidateValue, Choice, EdgeMode, NodeKey};
use crate::spec::DepKinds;
use crate::variant::{VariantKind, VariantValue};

/// Turn a solution of `model` into a concrete DAG.
pub(crate) fn assemble(
    model: &ConstraintModel,
    solution: &[SolvableId],
) -> Result<ConcreteDag, ConcretizeError> {
    let assignment = Assignment::new(model, solution);
    let arch = match assignment.value(&Choice::Arch) {
        Some(CandidateValue::Arch(arch)) => arch.clone(),
        _ => return Err(InvariantViolationError::new("<dag>", "no architecture selected").into()),
    };

    // Phase 1: one node per present node choice.
    let mut keys: Vec<NodeKey> = Vec::new();
    let mut nodes: Vec<ConcreteNode> = Vec::new();
    for (_, choice) in model.pool.choice_ids() {
        let Choice::Node(key) = choice else {
            continue;
        };
        let Some(CandidateValue::Version(version)) = assignment.value(choice) else {
            continue;
        };
        let compiler = match assignment.value(&Choice::Compiler(key.clone())) {
            Some(CandidateValue::Compiler(compiler)) => compiler.clone(),
            _ => return Err(violation(key, "no compiler selected")),
        };
        nodes.push(ConcreteNode {
            name: key.package.clone(),
            version: version.clone(),
            variants: assignment.variants(key)?,
            compiler,
            arch: arch.clone(),
            build_for: key.build_for.clone(),
            dependencies: Vec::new(),
            hash: String::new(),
        });
        keys.push(key.clone());
    }
    let index: HashMap<&NodeKey, usize> = keys.iter().enumerate().map(|(i, k)| (k, i)).collect();

    // Phase 2: edges from the declarations active under the assignment.
    for (i, key) in keys.iter().enumerate() {
        let Some(rules) = model.edges.get(key) else {
            continue;
        };
        let mut merged: BTreeMap<usize, (DepKinds, BTreeSet<String>)> = BTreeMap::new();
        for rule in rules {
            if !rule
                .condition
                .iter()
                .all(|literal| literal.holds(assignment.value(&literal.choice)))
            {
                continue;
            }
            let (target, virtual_name) = assignment.target(key, rule)?;
            let Some(&t) = index.get(&target) else {
                return Err(violation(key, format!("dependency {target} was not selected")));
            };
            let entry = merged
                .entry(t)
                .or_insert_with(|| (DepKinds::empty(), BTreeSet::new()));
            entry.0 = entry.0.union(rule.kinds);
            entry.1.extend(virtual_name);
        }
        nodes[i].dependencies = merged
            .into_iter()
            .map(|(target, (kinds, virtuals))| DependencyEdge {
                target,
                kinds,
                virtuals,
            })
            .collect();
    }

    // Phase 3: roots. A `^pkg` of the request is already reachable from
    // its root, the model requires it.
    let mut roots = Vec::with_capacity(model.roots.len());
    for key in &model.roots {
        match index.get(key) {
            Some(&i) => roots.push(i),
            None => return Err(violation(key, "requested package was not selected")),
        }
    }

    // Phase 4: drop nodes the roots do not reach.
    let keep = reachable(&dependency_graph(&nodes), &roots);
    if keep.len() < nodes.len() {
        debug!(dropped = nodes.len() - keep.len(), "dropping unreachable nodes");
    }
    let remap: HashMap<usize, usize> = keep.iter().enumerate().map(|(new, &old)| (old, new)).collect();
    let kept: Vec<ConcreteNode> = nodes
        .into_iter()
        .enumerate()
        .filter(|(i, _)| remap.contains_key(i))
        .map(|(_, mut node)| {
            for edge in &mut node.dependencies {
                edge.target = remap[&edge.target];
            }
            node
        })
        .collect();
    let roots = roots.iter().map(|r| remap[r]).collect();

    Ok(ConcreteDag::from_parts(kept, roots)?)
}

fn violation(key: &NodeKey, message: impl Into<String>) -> ConcretizeError {
    InvariantViolationError::new(key.to_string(), message).into()
}

/// The selected candidate of every present choice.
struct Assignment<'a> {
    model: &'a ConstraintModel,
    selected: HashMap<NameId, SolvableId>,
}

impl<'a> Assignment<'a> {
    fn new(model: &'a ConstraintModel, solution: &[SolvableId]) -> Self {
        let selected = solution
            .iter()
            .map(|&sid| (model.pool.candidate_choice(sid), sid))
            .collect();
        Self { model, selected }
    }

    fn value_of(&self, name: NameId) -> Option<&'a CandidateValue> {
        let sid = self.selected.get(&name)?;
        Some(&self.model.pool.resolve_candidate(*sid).value)
    }

    /// The value of `choice`, or `None` when it is absent.
    fn value(&self, choice: &Choice) -> Option<&'a CandidateValue> {
        self.value_of(self.model.pool.lookup_choice(choice)?)
    }

    fn variants(&self, key: &NodeKey) -> Result<BTreeMap<String, VariantValue>, ConcretizeError> {
        let package = self.model.facts.package(&key.package)?;
        let mut out = BTreeMap::new();
        for decl in &package.variants {
            match decl.kind {
                VariantKind::Bool | VariantKind::Single => {
                    let choice = Choice::Variant(key.clone(), decl.name.clone());
                    if let Some(CandidateValue::Value(value)) = self.value(&choice) {
                        out.insert(decl.name.clone(), value.clone());
                    }
                }
                VariantKind::Multi => {
                    let on: BTreeSet<String> = decl
                        .allowed
                        .iter()
                        .filter(|value| {
                            let choice = Choice::VariantMember(
                                key.clone(),
                                decl.name.clone(),
                                (*value).clone(),
                            );
                            matches!(self.value(&choice), Some(CandidateValue::Member(true)))
                        })
                        .cloned()
                        .collect();
                    if !on.is_empty() {
                        out.insert(decl.name.clone(), VariantValue::Values(on));
                    }
                }
            }
        }
        Ok(out)
    }

    /// The node an active declaration of `key` points at, and the virtual
    /// the edge satisfies if any.
    fn target(
        &self,
        key: &NodeKey,
        rule: &EdgeRule,
    ) -> Result<(NodeKey, Option<String>), ConcretizeError> {
        match &rule.target {
            Target::Node(target) => Ok((target.clone(), None)),
            Target::BuildOnly { edge, shared, fork } => match self.value_of(*edge) {
                Some(CandidateValue::Edge(EdgeMode::Converge)) => Ok((shared.clone(), None)),
                Some(CandidateValue::Edge(EdgeMode::Fork)) => Ok((fork.clone(), None)),
                _ => Err(violation(
                    key,
                    format!("build dependency #{} is undecided", rule.declaration),
                )),
            },
            Target::Virtual(name) => match self.value(&Choice::Provider(name.clone())) {
                Some(CandidateValue::Provision { package, .. }) => {
                    Ok((NodeKey::unified(package), Some(name.clone())))
                }
                _ => Err(violation(key, format!("no provider selected for `{name}`"))),
            },
            Target::Missing(name) => {
                Err(violation(key, format!("depends on unknown package `{name}`")))
            }
        }
    }
}
