//! Constraint Model Builder.
//!
//! [`ModelBuilder`] turns a request plus catalog facts into a
//! [`ConstraintModel`]: resolvo choices (see [`crate::pool`]), their ranked
//! candidates, and the hard constraints between them. Every constraint that
//! comes from the user's request or from a catalog conflict rule carries a
//! [`Tag`], so the solver can switch it off while explaining a failure.
//!
//! Encoding summary, per node `K` in the closure:
//!
//! - each version candidate of `K` requires the architecture, a compiler for
//!   `K`, every variant of `K` whose `when` holds, and the targets of every
//!   dependency declaration whose `when` holds;
//! - a variant value requires `K` and the variant's `when`;
//! - a build-only dependency goes through an edge choice: converge on the
//!   unified node of the target, or fork a copy built for `K`'s package;
//! - a virtual dependency requires a provision of the virtual's provider
//!   choice, and each provision requires its package and its `when`;
//! - a conflict rule `¬(L1 ∧ … ∧ Ln)` is encoded by its size: excluded
//!   candidates (n = 0), a forbidding `constrains` (n = 1), a `constrains`
//!   hung on the candidates matching a local literal (n = 2), or a
//!   requirement of an empty set under the whole conjunction (otherwise);
//! - a `requires` rule requires, under its `when`, an alternative choice
//!   whose candidates each require one alternative;
//! - `K depends on T` is a reach choice: present exactly when some active
//!   edge of `K` lands on `T` or on a node that depends on `T`. Only the
//!   pairs some constraint mentions are encoded, and a node that could
//!   depend on itself is forbidden to.
//!
//! A resolvo condition on a version set holds vacuously while the set's
//! choice is absent, unless the set matches every candidate. Conditions
//! therefore pair each literal with the presence of its choice.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use resolvo::{
    ArenaId, Condition, ConditionId, ConditionalRequirement, LogicalOperator, NameId, Requirement,
    SolvableId, StringId, VersionSetId,
};
use tracing::{debug, info, trace};

use crate::catalog::{
    Catalog, ConflictRule, DependencyDeclaration, RequirePolicy, RequirementRule,
    VersionDeclaration,
};
use crate::condition::{Literal, Scope, may_hold, reaches, variant_literals};
use crate::config::{PackagePreferences, SolverConfig, TestDeps};
use crate::error::CatalogLookupError;
use crate::facts::{Facts, PackageFacts};
use crate::dag::reachable;
use crate::pool::{
    Candidate, CandidateValue, Choice, EdgeMode, ModelPool, NodeKey, Predicate, Reachable,
};
use crate::spec::{DepKinds, Spec};
use crate::variant::{VariantKind, VariantValue};
use crate::version::Version;
use crate::version_match::VersionConstraint;

/// Where a hard constraint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    /// The n-th constraint of the request, see [`ConstraintModel::label`].
    User(usize),
    /// The n-th catalog rule: a conflict, a requirement, or the ban on a
    /// node depending on itself.
    Rule(usize),
}

/// A requirement or constraint with its origin. Untagged items are
/// structural and never switched off.
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    pub item: T,
    pub tag: Option<Tag>,
}

impl<T> Tagged<T> {
    fn structural(item: T) -> Self {
        Self { item, tag: None }
    }

    fn tagged(item: T, tag: Tag) -> Self {
        Self {
            item,
            tag: Some(tag),
        }
    }
}

/// Requirements and constrains of one candidate.
#[derive(Debug, Clone, Default)]
pub struct TaggedDependencies {
    pub requirements: Vec<Tagged<ConditionalRequirement>>,
    pub constrains: Vec<Tagged<VersionSetId>>,
}

/// How an active dependency declaration finds its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(NodeKey),
    /// Resolved by the edge choice to `shared` or `fork`.
    BuildOnly {
        edge: NameId,
        shared: NodeKey,
        fork: NodeKey,
    },
    Virtual(String),
    /// Neither a package nor a provided virtual.
    Missing(String),
}

/// A dependency declaration of one node, as the assembler re-evaluates it.
#[derive(Debug, Clone)]
pub struct EdgeRule {
    /// Index into the package's dependency declarations.
    pub declaration: usize,
    pub condition: Vec<Literal>,
    pub kinds: DepKinds,
    pub target: Target,
}

/// What a [`Tag::Rule`] was created for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum RuleOrigin {
    Conflict(String, usize),
    Requirement(String, usize),
    Cycle(NodeKey),
}

/// The solver input: choices, candidates, hard constraints, rankings.
pub struct ConstraintModel {
    pub(crate) pool: ModelPool,
    pub(crate) candidates: HashMap<NameId, Vec<SolvableId>>,
    pub(crate) dependencies: HashMap<SolvableId, TaggedDependencies>,
    pub(crate) excluded: HashMap<NameId, Vec<(SolvableId, StringId, Tag)>>,
    pub(crate) requirements: Vec<Tagged<ConditionalRequirement>>,
    pub(crate) constraints: Vec<Tagged<VersionSetId>>,
    pub(crate) labels: Vec<String>,
    pub(crate) rules: Vec<String>,
    pub(crate) order: Vec<NameId>,
    pub(crate) facts: Facts,
    pub(crate) edges: BTreeMap<NodeKey, Vec<EdgeRule>>,
    pub(crate) roots: Vec<NodeKey>,
    /// Exclusion reason for candidates beyond an optimization bound.
    pub(crate) outranked: StringId,
}

impl ConstraintModel {
    pub fn choice_count(&self) -> usize {
        self.pool.choice_count()
    }

    pub fn candidate_count(&self) -> usize {
        self.pool.candidate_count()
    }

    /// Human-readable origin of a tagged constraint.
    pub fn label(&self, tag: Tag) -> &str {
        match tag {
            Tag::User(i) => &self.labels[i],
            Tag::Rule(i) => &self.rules[i],
        }
    }

    /// Tags of the request's constraints, in request order.
    pub fn user_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        (0..self.labels.len()).map(Tag::User)
    }

    /// Tags of the catalog rules that were encoded.
    pub fn rule_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        (0..self.rules.len()).map(Tag::Rule)
    }

    /// Choices in canonical order: those of root nodes first, then by key.
    pub fn order(&self) -> &[NameId] {
        &self.order
    }

    pub(crate) fn candidates_of(&self, name: NameId) -> &[SolvableId] {
        self.candidates
            .get(&name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn facts(&self) -> &Facts {
        &self.facts
    }
}

/// Compiles a request and catalog facts into a [`ConstraintModel`].
pub struct ModelBuilder<'a> {
    catalog: &'a dyn Catalog,
    config: &'a SolverConfig,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(catalog: &'a dyn Catalog, config: &'a SolverConfig) -> Self {
        Self { catalog, config }
    }

    /// Build the model for `roots`.
    ///
    /// Fails when the request names a package, variant, value, version,
    /// compiler or architecture that does not exist.
    pub fn build(&self, roots: &[Spec]) -> Result<ConstraintModel, CatalogLookupError> {
        let mut facts = Facts::new();

        // Phase 1: check the request's names against the catalog.
        for root in roots {
            self.check_request(&mut facts, root)?;
        }

        // Phase 2: the maximal possibly-relevant closure.
        let (keys, virtuals) = self.closure(&mut facts, roots);
        debug!(
            nodes = keys.len(),
            virtuals = virtuals.len(),
            "computed closure"
        );

        let mut encoder = Encoder::new(self.config, facts, keys, virtuals, roots);

        // Phase 3: choices and ranked candidates.
        encoder.declare_choices();

        // Phase 4: structure, variants, dependencies.
        encoder.encode_nodes();

        // Phase 5: catalog conflict rules.
        encoder.encode_conflicts();

        // Phase 6: catalog requirements.
        encoder.encode_requirements();

        // Phase 7: the request itself.
        encoder.encode_request(roots)?;

        // Phase 8: every reach choice mentioned so far.
        encoder.encode_reachability();

        let model = encoder.finish();
        info!(
            choices = model.choice_count(),
            candidates = model.candidate_count(),
            user_constraints = model.labels.len(),
            rules = model.rules.len(),
            "built constraint model"
        );
        Ok(model)
    }

    fn check_request(&self, facts: &mut Facts, root: &Spec) -> Result<(), CatalogLookupError> {
        let name = root
            .name
            .as_deref()
            .ok_or_else(|| CatalogLookupError::UnknownPackage("<anonymous>".to_string()))?;
        if !facts.load(self.catalog, name) {
            if !facts.load_providers(self.catalog, name).is_empty() {
                return Err(CatalogLookupError::VirtualRoot(name.to_string()));
            }
            return Err(CatalogLookupError::UnknownPackage(name.to_string()));
        }
        for dep in &root.dependencies {
            let dep_name = dep.spec.name();
            if !facts.load(self.catalog, dep_name)
                && facts.load_providers(self.catalog, dep_name).is_empty()
            {
                return Err(CatalogLookupError::UnknownPackage(dep_name.to_string()));
            }
            for virtual_name in &dep.virtuals {
                if facts.load_providers(self.catalog, virtual_name).is_empty() {
                    return Err(CatalogLookupError::UnknownPackage(virtual_name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Breadth-first walk over every declaration that might apply.
    fn closure(
        &self,
        facts: &mut Facts,
        roots: &[Spec],
    ) -> (BTreeSet<NodeKey>, BTreeSet<String>) {
        let root_names: BTreeSet<&str> = roots.iter().map(Spec::name).collect();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut virtuals = BTreeSet::new();

        for root in roots {
            enqueue(&mut seen, &mut queue, NodeKey::unified(root.name()));
            for dep in &root.dependencies {
                let name = dep.spec.name();
                if facts.get(name).is_some() {
                    enqueue(&mut seen, &mut queue, NodeKey::unified(name));
                }
            }
        }

        while let Some(key) = queue.pop_front() {
            let Some(package) = facts.get(&key.package) else {
                continue;
            };
            let is_root = !key.is_fork() && root_names.contains(key.package.as_str());
            let declarations = package.dependencies.clone();
            for decl in declarations {
                let Some(kinds) = effective_kinds(self.config.tests, decl.kinds, is_root) else {
                    continue;
                };
                if !may_hold(&decl.when, facts, &key.package, self.config) {
                    continue;
                }
                let target = decl.target.name();
                if facts.load(self.catalog, target) {
                    enqueue(&mut seen, &mut queue, NodeKey::unified(target));
                    if kinds.is_build_only() {
                        enqueue(&mut seen, &mut queue, NodeKey::fork(target, &key.package));
                    }
                    continue;
                }
                let providers = facts.load_providers(self.catalog, target).to_vec();
                if providers.is_empty() {
                    trace!(package = %key, target, "dependency on unknown package");
                    continue;
                }
                virtuals.insert(target.to_string());
                for provider in providers {
                    facts.load(self.catalog, &provider);
                    enqueue(&mut seen, &mut queue, NodeKey::unified(provider));
                }
            }
        }

        (seen, virtuals)
    }
}

fn enqueue(seen: &mut BTreeSet<NodeKey>, queue: &mut VecDeque<NodeKey>, key: NodeKey) {
    if seen.insert(key.clone()) {
        queue.push_back(key);
    }
}

/// Dependency kinds that take part under the test policy, or `None` when the
/// declaration is dropped entirely.
pub(crate) fn effective_kinds(policy: TestDeps, kinds: DepKinds, is_root: bool) -> Option<DepKinds> {
    let kinds = match policy {
        TestDeps::All => kinds,
        TestDeps::Roots if is_root => kinds,
        _ => kinds.without(DepKinds::TEST),
    };
    (!kinds.is_empty()).then_some(kinds)
}

/// Mutable state of one model build.
struct Encoder<'a> {
    config: &'a SolverConfig,
    facts: Facts,
    keys: BTreeSet<NodeKey>,
    unified: BTreeSet<String>,
    virtuals: BTreeSet<String>,
    root_names: Vec<String>,
    pool: ModelPool,
    candidates: HashMap<NameId, Vec<SolvableId>>,
    dependencies: HashMap<SolvableId, TaggedDependencies>,
    excluded: HashMap<NameId, Vec<(SolvableId, StringId, Tag)>>,
    conditions: HashMap<Vec<VersionSetId>, ConditionId>,
    requirements: Vec<Tagged<ConditionalRequirement>>,
    constraints: Vec<Tagged<VersionSetId>>,
    labels: Vec<String>,
    rules: Vec<String>,
    rule_ids: BTreeMap<RuleOrigin, usize>,
    edges: BTreeMap<NodeKey, Vec<EdgeRule>>,
    /// Reach choices referenced by a version set, and those not encoded yet.
    reach_seen: BTreeSet<(NodeKey, Reachable)>,
    reach_pending: Vec<(NodeKey, Reachable)>,
}

impl<'a> Encoder<'a> {
    fn new(
        config: &'a SolverConfig,
        facts: Facts,
        keys: BTreeSet<NodeKey>,
        virtuals: BTreeSet<String>,
        roots: &[Spec],
    ) -> Self {
        let unified = keys
            .iter()
            .filter(|k| !k.is_fork())
            .map(|k| k.package.clone())
            .collect();
        Self {
            config,
            facts,
            keys,
            unified,
            virtuals,
            root_names: roots.iter().map(|r| r.name().to_string()).collect(),
            pool: ModelPool::new(),
            candidates: HashMap::new(),
            dependencies: HashMap::new(),
            excluded: HashMap::new(),
            conditions: HashMap::new(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            labels: Vec::new(),
            rules: Vec::new(),
            rule_ids: BTreeMap::new(),
            edges: BTreeMap::new(),
            reach_seen: BTreeSet::new(),
            reach_pending: Vec::new(),
        }
    }

    fn scope(&self) -> Scope<'_> {
        Scope {
            facts: &self.facts,
            config: self.config,
            unified: &self.unified,
            virtuals: &self.virtuals,
        }
    }

    /// Compile a condition; `None` when it can never hold.
    fn condition_literals(
        &self,
        spec: &Spec,
        subject: &NodeKey,
        self_version: Option<&Version>,
    ) -> Option<Vec<Literal>> {
        match self.scope().literals(spec, subject, self_version) {
            Ok(literals) => literals,
            Err(e) => {
                trace!(subject = %subject, condition = %spec, "condition never holds: {e}");
                None
            }
        }
    }

    fn package(&self, name: &str) -> Option<PackageFacts> {
        self.facts.get(name).cloned()
    }

    fn is_root(&self, key: &NodeKey) -> bool {
        !key.is_fork() && self.root_names.contains(&key.package)
    }

    // --- interning helpers ---

    fn add_candidate(&mut self, choice: NameId, value: CandidateValue, rank: u32) -> SolvableId {
        let sid = self.pool.add_candidate(choice, Candidate { value, rank });
        self.candidates.entry(choice).or_default().push(sid);
        sid
    }

    fn literal_set(&mut self, literal: &Literal, inverted: bool) -> VersionSetId {
        if let Choice::Reach(source, target) = &literal.choice {
            let pair = (source.clone(), target.clone());
            if self.reach_seen.insert(pair.clone()) {
                self.reach_pending.push(pair);
            }
        }
        let name = self.pool.intern_choice(literal.choice.clone());
        self.pool
            .intern_version_set(name, literal.predicate.clone(), inverted)
    }

    fn any_of(&mut self, choice: Choice) -> VersionSetId {
        self.literal_set(&Literal::new(choice, Predicate::Any), false)
    }

    /// A set no candidate matches. Requiring it forbids the condition it
    /// is required under.
    fn impossible(&mut self, key: &NodeKey) -> VersionSetId {
        self.literal_set(
            &Literal::new(
                Choice::Node(key.clone()),
                Predicate::Versions(VersionConstraint::none()),
            ),
            false,
        )
    }

    /// Conjunction of `literals` as a resolvo condition; `None` if empty.
    fn condition(&mut self, literals: &[Literal]) -> Option<ConditionId> {
        let mut sets: Vec<VersionSetId> = Vec::with_capacity(literals.len());
        for literal in literals {
            sets.push(self.literal_set(literal, false));
            if literal.predicate != Predicate::Any {
                sets.push(self.any_of(literal.choice.clone()));
            }
        }
        sets.sort_by_key(|s| s.to_usize());
        sets.dedup();
        let (&first, rest) = sets.split_first()?;
        if let Some(&id) = self.conditions.get(&sets) {
            return Some(id);
        }
        let mut id = self.pool.intern_condition(Condition::Requirement(first));
        for &set in rest {
            let next = self.pool.intern_condition(Condition::Requirement(set));
            id = self
                .pool
                .intern_condition(Condition::Binary(LogicalOperator::And, id, next));
        }
        self.conditions.insert(sets, id);
        Some(id)
    }

    fn require(&mut self, sid: SolvableId, condition: Option<ConditionId>, requirement: Requirement) {
        self.dependencies
            .entry(sid)
            .or_default()
            .requirements
            .push(Tagged::structural(ConditionalRequirement {
                condition,
                requirement,
            }));
    }

    fn require_literals(&mut self, sid: SolvableId, literals: &[Literal]) {
        for literal in literals {
            let set = self.literal_set(literal, false);
            self.require(sid, None, Requirement::Single(set));
        }
    }

    fn require_tagged(
        &mut self,
        sid: SolvableId,
        condition: Option<ConditionId>,
        set: VersionSetId,
        tag: Tag,
    ) {
        self.dependencies
            .entry(sid)
            .or_default()
            .requirements
            .push(Tagged::tagged(
                ConditionalRequirement {
                    condition,
                    requirement: Requirement::Single(set),
                },
                tag,
            ));
    }

    /// The version candidates of `key`'s node.
    fn versions_of(&mut self, key: &NodeKey) -> Vec<(SolvableId, Version)> {
        let node = self.pool.intern_choice(Choice::Node(key.clone()));
        self.candidates_of(node)
            .into_iter()
            .filter_map(|sid| match &self.pool.resolve_candidate(sid).value {
                CandidateValue::Version(v) => Some((sid, v.clone())),
                _ => None,
            })
            .collect()
    }

    // --- phase 3 ---

    fn declare_choices(&mut self) {
        let config = self.config;
        let arch = self.pool.intern_choice(Choice::Arch);
        for (rank, a) in config.arches.iter().cloned().enumerate() {
            self.add_candidate(arch, CandidateValue::Arch(a), rank as u32);
        }

        for key in self.keys.clone() {
            let Some(package) = self.package(&key.package) else {
                continue;
            };
            let prefs = config.package(&key.package);

            let node = self.pool.intern_choice(Choice::Node(key.clone()));
            let ranks = version_ranks(&package.versions, prefs);
            for (decl, rank) in package.versions.iter().zip(ranks) {
                self.add_candidate(node, CandidateValue::Version(decl.version.clone()), rank);
            }

            let compiler = self.pool.intern_choice(Choice::Compiler(key.clone()));
            for (rank, c) in config.compilers.iter().cloned().enumerate() {
                let sid = self.add_candidate(compiler, CandidateValue::Compiler(c), rank as u32);
                let node_set = self.any_of(Choice::Node(key.clone()));
                self.require(sid, None, Requirement::Single(node_set));
            }

            for decl in &package.variants {
                let Some(when) = self.condition_literals(&decl.when, &key, None) else {
                    continue;
                };
                let preferred = prefs
                    .and_then(|p| p.variants.variants.get(&decl.name))
                    .and_then(|v| v.normalize(decl).ok())
                    .unwrap_or_else(|| decl.default.clone());

                let mut valued: Vec<(NameId, CandidateValue, u32)> = Vec::new();
                match decl.kind {
                    VariantKind::Bool | VariantKind::Single => {
                        let choice = self
                            .pool
                            .intern_choice(Choice::Variant(key.clone(), decl.name.clone()));
                        let mut domain = decl.domain();
                        domain.sort_by_key(|v| *v != preferred);
                        for (rank, value) in domain.into_iter().enumerate() {
                            valued.push((choice, CandidateValue::Value(value), rank as u32));
                        }
                    }
                    VariantKind::Multi => {
                        let VariantValue::Values(on_by_default) = &preferred else {
                            continue;
                        };
                        for value in &decl.allowed {
                            let choice = self.pool.intern_choice(Choice::VariantMember(
                                key.clone(),
                                decl.name.clone(),
                                value.clone(),
                            ));
                            let on = on_by_default.contains(value);
                            valued.push((choice, CandidateValue::Member(on), 0));
                            valued.push((choice, CandidateValue::Member(!on), 1));
                        }
                    }
                }
                for (choice, value, rank) in valued {
                    let sid = self.add_candidate(choice, value, rank);
                    let node_set = self.any_of(Choice::Node(key.clone()));
                    self.require(sid, None, Requirement::Single(node_set));
                    self.require_literals(sid, &when);
                }
            }
        }

        for virtual_name in self.virtuals.clone() {
            let choice = self
                .pool
                .intern_choice(Choice::Provider(virtual_name.clone()));
            let mut providers: Vec<String> = config
                .preferred_providers(&virtual_name)
                .iter()
                .filter(|p| self.facts.providers_of(&virtual_name).contains(p))
                .cloned()
                .collect();
            for p in self.facts.providers_of(&virtual_name) {
                if !providers.contains(p) {
                    providers.push(p.clone());
                }
            }
            let mut rank = 0;
            for provider in providers {
                let Some(package) = self.package(&provider) else {
                    continue;
                };
                let key = NodeKey::unified(&provider);
                for (index, provision) in package.provides.iter().enumerate() {
                    if provision.name != virtual_name {
                        continue;
                    }
                    let Some(when) = self.condition_literals(&provision.when, &key, None) else {
                        continue;
                    };
                    let sid = self.add_candidate(
                        choice,
                        CandidateValue::Provision {
                            package: provider.clone(),
                            index,
                            versions: provision.versions.clone(),
                        },
                        rank,
                    );
                    rank += 1;
                    let node_set = self.any_of(Choice::Node(key.clone()));
                    self.require(sid, None, Requirement::Single(node_set));
                    self.require_literals(sid, &when);
                }
            }
        }
    }

    // --- phase 4 ---

    fn encode_nodes(&mut self) {
        for key in self.keys.clone() {
            let Some(package) = self.package(&key.package) else {
                continue;
            };
            let versions = self.versions_of(&key);

            // Targets do not depend on the version, only activation does.
            let is_root = self.is_root(&key);
            let mut targets: Vec<Option<(DepKinds, Vec<Requirement>)>> = Vec::new();
            let mut rules = Vec::new();
            for (index, decl) in package.dependencies.iter().enumerate() {
                let Some(kinds) = effective_kinds(self.config.tests, decl.kinds, is_root) else {
                    targets.push(None);
                    continue;
                };
                let (target, requirements) = self.dependency_target(&key, index, decl, kinds);
                if let Some(condition) = self.condition_literals(&decl.when, &key, None) {
                    rules.push(EdgeRule {
                        declaration: index,
                        condition,
                        kinds,
                        target,
                    });
                }
                targets.push(Some((kinds, requirements)));
            }
            self.edges.insert(key.clone(), rules);

            let arch = self.any_of(Choice::Arch);
            let compiler = self.any_of(Choice::Compiler(key.clone()));
            for (sid, version) in versions {
                self.require(sid, None, Requirement::Single(arch));
                self.require(sid, None, Requirement::Single(compiler));
                self.encode_variant_existence(sid, &key, &version, &package);

                for (decl, target) in package.dependencies.iter().zip(&targets) {
                    let Some((_, requirements)) = target else {
                        continue;
                    };
                    let Some(when) = self.condition_literals(&decl.when, &key, Some(&version))
                    else {
                        continue;
                    };
                    let condition = self.condition(&when);
                    for requirement in requirements.iter().cloned() {
                        self.require(sid, condition, requirement);
                    }
                }
            }
        }
    }

    fn candidates_of(&self, name: NameId) -> Vec<SolvableId> {
        self.candidates.get(&name).cloned().unwrap_or_default()
    }

    /// The edges `key` may lay, one hop per possible landing node.
    fn hops(&self, key: &NodeKey) -> Vec<Hop> {
        let mut out = Vec::new();
        for rule in self.edges.get(key).into_iter().flatten() {
            let hop = |via: Vec<Literal>, to: &NodeKey, provides: Option<&String>| Hop {
                declaration: rule.declaration,
                condition: rule.condition.clone(),
                via,
                to: to.clone(),
                provides: provides.cloned(),
            };
            match &rule.target {
                Target::Node(to) => out.push(hop(Vec::new(), to, None)),
                Target::BuildOnly { shared, fork, .. } => {
                    for (mode, to) in [(EdgeMode::Converge, shared), (EdgeMode::Fork, fork)] {
                        let via = Literal::new(
                            Choice::Edge(key.clone(), rule.declaration),
                            Predicate::Edge(mode),
                        );
                        out.push(hop(vec![via], to, None));
                    }
                }
                Target::Virtual(name) => {
                    for provider in self.facts.providers_of(name) {
                        if !self.unified.contains(provider) {
                            continue;
                        }
                        let via = Literal::new(
                            Choice::Provider(name.clone()),
                            Predicate::Provision {
                                package: Some(provider.clone()),
                                versions: VersionConstraint::any(),
                            },
                        );
                        out.push(hop(vec![via], &NodeKey::unified(provider), Some(name)));
                    }
                }
                Target::Missing(_) => {}
            }
        }
        out
    }

    /// A node requires each of its variants while the variant's `when` holds.
    fn encode_variant_existence(
        &mut self,
        sid: SolvableId,
        key: &NodeKey,
        version: &Version,
        package: &PackageFacts,
    ) {
        for decl in &package.variants {
            let Some(when) = self.condition_literals(&decl.when, key, Some(version)) else {
                continue;
            };
            match decl.kind {
                VariantKind::Bool | VariantKind::Single => {
                    let choice = Choice::Variant(key.clone(), decl.name.clone());
                    if self.pool.lookup_choice(&choice).is_none() {
                        continue;
                    }
                    let condition = self.condition(&when);
                    let set = self.any_of(choice);
                    self.require(sid, condition, Requirement::Single(set));
                }
                VariantKind::Multi => {
                    let condition = self.condition(&when);
                    let mut on_sets = Vec::new();
                    for value in &decl.allowed {
                        let choice =
                            Choice::VariantMember(key.clone(), decl.name.clone(), value.clone());
                        if self.pool.lookup_choice(&choice).is_none() {
                            continue;
                        }
                        let any = self.any_of(choice.clone());
                        self.require(sid, condition, Requirement::Single(any));
                        on_sets.push(
                            self.literal_set(&Literal::new(choice, Predicate::Member(true)), false),
                        );
                    }
                    if !on_sets.is_empty() {
                        let union = self.pool.intern_version_set_union(on_sets);
                        self.require(sid, condition, Requirement::Union(union));
                    }
                }
            }
        }
    }

    /// Resolve a dependency declaration to its target and the requirements
    /// an active declaration imposes.
    fn dependency_target(
        &mut self,
        key: &NodeKey,
        index: usize,
        decl: &DependencyDeclaration,
        kinds: DepKinds,
    ) -> (Target, Vec<Requirement>) {
        let name = decl.target.name().to_string();
        if self.unified.contains(&name) {
            let shared = NodeKey::unified(&name);
            if !kinds.is_build_only() {
                let requirements = self.target_requirements(&decl.target, &shared);
                return (Target::Node(shared), requirements);
            }
            let fork = NodeKey::fork(&name, &key.package);
            let edge = self.pool.intern_choice(Choice::Edge(key.clone(), index));
            if self.candidates_of(edge).is_empty() {
                let converge = self.add_candidate(edge, CandidateValue::Edge(EdgeMode::Converge), 0);
                for requirement in self.target_requirements(&decl.target, &shared) {
                    self.require(converge, None, requirement);
                }
                let separate = self.add_candidate(edge, CandidateValue::Edge(EdgeMode::Fork), 1);
                for requirement in self.target_requirements(&decl.target, &fork) {
                    self.require(separate, None, requirement);
                }
            }
            let set = self.any_of(Choice::Edge(key.clone(), index));
            return (
                Target::BuildOnly { edge, shared, fork },
                vec![Requirement::Single(set)],
            );
        }
        if self.virtuals.contains(&name) {
            let set = self.literal_set(
                &Literal::new(
                    Choice::Provider(name.clone()),
                    Predicate::Provision {
                        package: None,
                        versions: decl.target.versions.clone(),
                    },
                ),
                false,
            );
            return (Target::Virtual(name), vec![Requirement::Single(set)]);
        }
        let set = self.any_of(Choice::Node(NodeKey::unified(&name)));
        (Target::Missing(name), vec![Requirement::Single(set)])
    }

    fn target_requirements(&mut self, spec: &Spec, target: &NodeKey) -> Vec<Requirement> {
        match self.scope().target_literals(spec, target) {
            Ok(literals) => literals
                .iter()
                .map(|l| Requirement::Single(self.literal_set(l, false)))
                .collect(),
            Err(e) => {
                debug!(target = %target, spec = %spec, "dependency can never be met: {e}");
                vec![Requirement::Single(self.impossible(target))]
            }
        }
    }

    // --- phase 5 ---

    fn encode_conflicts(&mut self) {
        for key in self.keys.clone() {
            let Some(package) = self.package(&key.package) else {
                continue;
            };
            let versions = self.versions_of(&key);

            for (index, rule) in package.conflicts.iter().enumerate() {
                let origin = RuleOrigin::Conflict(key.package.clone(), index);
                let tag = self.rule_tag(origin, || describe_conflict(&key.package, rule));
                let versioned = !rule.when.versions.is_any() || !rule.conflict.versions.is_any();
                if versioned {
                    for (sid, version) in &versions {
                        if let Some(literals) = self.rule_literals(rule, &key, Some(version)) {
                            self.forbid_on(*sid, &key, &literals, tag);
                        }
                    }
                    continue;
                }
                let Some(literals) = self.rule_literals(rule, &key, None) else {
                    continue;
                };
                let local = literals.iter().position(|l| l.is_local_to(&key));
                match (literals.len(), local) {
                    (2, Some(i)) => {
                        let trigger = &literals[i];
                        let other = &literals[1 - i];
                        self.forbid_on_matching(trigger, other, tag);
                    }
                    _ => {
                        for (sid, _) in &versions {
                            self.forbid_on(*sid, &key, &literals, tag);
                        }
                    }
                }
            }
        }
    }

    fn rule_tag(&mut self, origin: RuleOrigin, describe: impl FnOnce() -> String) -> Tag {
        if let Some(&id) = self.rule_ids.get(&origin) {
            return Tag::Rule(id);
        }
        let id = self.rules.len();
        self.rules.push(describe());
        self.rule_ids.insert(origin, id);
        Tag::Rule(id)
    }

    fn rule_literals(
        &self,
        rule: &ConflictRule,
        key: &NodeKey,
        version: Option<&Version>,
    ) -> Option<Vec<Literal>> {
        let mut literals = self.condition_literals(&rule.when, key, version)?;
        literals.extend(self.condition_literals(&rule.conflict, key, version)?);
        literals.dedup();
        Some(literals)
    }

    /// Forbid `literals` from all holding while candidate `sid` is selected.
    fn forbid_on(&mut self, sid: SolvableId, key: &NodeKey, literals: &[Literal], tag: Tag) {
        match literals {
            [] => {
                let text = format!("conflict: {}", self.label(tag));
                let reason = self.pool.intern_string(text);
                let name = self.pool.candidate_choice(sid);
                self.excluded.entry(name).or_default().push((sid, reason, tag));
            }
            [literal] => {
                let set = self.literal_set(literal, true);
                self.dependencies
                    .entry(sid)
                    .or_default()
                    .constrains
                    .push(Tagged::tagged(set, tag));
            }
            _ => {
                let condition = self.condition(literals);
                let impossible = self.impossible(key);
                self.require_tagged(sid, condition, impossible, tag);
            }
        }
    }

    /// Every candidate matching `trigger` forbids `other`.
    fn forbid_on_matching(&mut self, trigger: &Literal, other: &Literal, tag: Tag) {
        let Some(choice) = self.pool.lookup_choice(&trigger.choice) else {
            return;
        };
        let set = self.literal_set(other, true);
        for sid in self.candidates_of(choice) {
            if trigger
                .predicate
                .matches(&self.pool.resolve_candidate(sid).value)
            {
                self.dependencies
                    .entry(sid)
                    .or_default()
                    .constrains
                    .push(Tagged::tagged(set, tag));
            }
        }
    }

    fn label(&self, tag: Tag) -> &str {
        match tag {
            Tag::User(i) => &self.labels[i],
            Tag::Rule(i) => &self.rules[i],
        }
    }

    // --- phase 6 ---

    fn encode_requirements(&mut self) {
        for key in self.keys.clone() {
            let Some(package) = self.package(&key.package) else {
                continue;
            };
            if package.requirements.is_empty() {
                continue;
            }
            let versions = self.versions_of(&key);
            for (index, rule) in package.requirements.iter().enumerate() {
                let origin = RuleOrigin::Requirement(key.package.clone(), index);
                let tag = self.rule_tag(origin, || describe_requirement(&key.package, rule));
                self.encode_requirement(&key, index, rule, &versions, tag);
            }
        }
    }

    fn encode_requirement(
        &mut self,
        key: &NodeKey,
        index: usize,
        rule: &RequirementRule,
        versions: &[(SolvableId, Version)],
        tag: Tag,
    ) {
        let alternatives: Vec<Vec<Literal>> = rule
            .alternatives
            .iter()
            .filter_map(|spec| self.condition_literals(spec, key, None))
            .collect();
        let choice = self
            .pool
            .intern_choice(Choice::Alternative(key.clone(), index));
        for (i, literals) in alternatives.iter().enumerate() {
            let sid = self.add_candidate(choice, CandidateValue::Alternative(i), i as u32);
            let node_set = self.any_of(Choice::Node(key.clone()));
            self.require(sid, None, Requirement::Single(node_set));
            self.require_literals(sid, literals);
        }

        for (sid, version) in versions {
            let Some(when) = self.condition_literals(&rule.when, key, Some(version)) else {
                continue;
            };
            if alternatives.is_empty() {
                trace!(package = %key, requirement = index, "no alternative can hold");
                self.forbid_on(*sid, key, &when, tag);
                continue;
            }
            let condition = self.condition(&when);
            let set = self.any_of(Choice::Alternative(key.clone(), index));
            self.require_tagged(*sid, condition, set, tag);

            if rule.policy == RequirePolicy::OneOf {
                for (i, first) in alternatives.iter().enumerate() {
                    for second in &alternatives[i + 1..] {
                        let mut both = when.clone();
                        both.extend(first.iter().cloned());
                        both.extend(second.iter().cloned());
                        self.forbid_on(*sid, key, &both, tag);
                    }
                }
            }
        }
    }

    // --- phase 7 ---

    fn encode_request(&mut self, roots: &[Spec]) -> Result<(), CatalogLookupError> {
        for root in roots {
            let name = root.name().to_string();
            let key = NodeKey::unified(&name);
            self.require_user(name.clone(), vec![Literal::new(Choice::Node(key.clone()), Predicate::Any)]);
            self.pin_node(&key, root, &name, true)?;
            self.propagate(&key, root, &name);

            for dep in &root.dependencies {
                let dep_name = dep.spec.name().to_string();
                if !self.unified.contains(&dep_name) {
                    let label = format!("{name} ^{}", dep.spec);
                    if !self.virtuals.contains(&dep_name) {
                        // Nothing in the closure needs it, so nothing below
                        // the root can provide it.
                        let never = Literal::new(
                            Choice::Node(key.clone()),
                            Predicate::Versions(VersionConstraint::none()),
                        );
                        self.require_user(label, vec![never]);
                        continue;
                    }
                    let tag = self.require_user(
                        label,
                        vec![reaches(&key, Reachable::Virtual(dep_name.clone()))],
                    );
                    let set = self.literal_set(
                        &Literal::new(
                            Choice::Provider(dep_name.clone()),
                            Predicate::Provision {
                                package: None,
                                versions: dep.spec.versions.clone(),
                            },
                        ),
                        false,
                    );
                    self.constraints.push(Tagged::tagged(set, tag));
                    continue;
                }

                let dep_key = NodeKey::unified(&dep_name);
                let prefix = format!("{name} ^{dep_name}");
                self.require_user(
                    prefix.clone(),
                    vec![reaches(&key, Reachable::Node(dep_key.clone()))],
                );
                self.pin_node(&dep_key, &dep.spec, &prefix, false)?;
                self.propagate(&dep_key, &dep.spec, &prefix);

                let provided: Vec<String> = if dep.virtuals.is_empty() {
                    let package = self.facts.package(&dep_name)?;
                    self.virtuals
                        .iter()
                        .filter(|v| package.provides_virtual(v))
                        .cloned()
                        .collect()
                } else {
                    dep.virtuals.clone()
                };
                for virtual_name in provided {
                    if !self.virtuals.contains(&virtual_name) {
                        continue;
                    }
                    let set = self.literal_set(
                        &Literal::new(
                            Choice::Provider(virtual_name.clone()),
                            Predicate::Provision {
                                package: Some(dep_name.clone()),
                                versions: VersionConstraint::any(),
                            },
                        ),
                        false,
                    );
                    let tag = self.user_tag(format!("{name} ^[virtuals={virtual_name}] {dep_name}"));
                    self.constraints.push(Tagged::tagged(set, tag));
                }
            }
        }
        Ok(())
    }

    fn user_tag(&mut self, label: String) -> Tag {
        self.labels.push(label);
        Tag::User(self.labels.len() - 1)
    }

    fn require_user(&mut self, label: String, literals: Vec<Literal>) -> Tag {
        let tag = self.user_tag(label);
        for literal in &literals {
            let set = self.literal_set(literal, false);
            self.requirements.push(Tagged::tagged(
                ConditionalRequirement {
                    condition: None,
                    requirement: Requirement::Single(set),
                },
                tag,
            ));
        }
        tag
    }

    /// Require the node part of `spec` on `key`, one tag per attribute.
    ///
    /// With `exact`, multi-valued variants get exactly the listed values.
    fn pin_node(
        &mut self,
        key: &NodeKey,
        spec: &Spec,
        prefix: &str,
        exact: bool,
    ) -> Result<(), CatalogLookupError> {
        let mut parts: Vec<(String, Spec)> = Vec::new();
        if !spec.versions.is_any() {
            parts.push((
                format!("{prefix}@{}", spec.versions),
                Spec::anonymous().with_versions(spec.versions.clone()),
            ));
        }
        for (name, value) in &spec.variants {
            let mut label = prefix.to_string();
            if !matches!(value, VariantValue::Bool(_)) {
                label.push(' ');
            }
            // Writing into a String cannot fail.
            let _ = value.write_assignment(name, spec.propagated.contains(name), &mut label);
            parts.push((
                label,
                Spec::anonymous().with_variant(name.clone(), value.clone()),
            ));
        }
        if let Some(compiler) = &spec.compiler {
            parts.push((
                format!("{prefix}%{compiler}"),
                Spec {
                    compiler: Some(compiler.clone()),
                    ..Spec::anonymous()
                },
            ));
        }
        if !spec.arch.is_empty() {
            parts.push((
                format!("{prefix} {}", spec.arch),
                Spec {
                    arch: spec.arch.clone(),
                    ..Spec::anonymous()
                },
            ));
        }

        for (label, part) in parts {
            let mut literals = self
                .scope()
                .literals(&part, key, None)?
                .unwrap_or_default();
            if exact {
                literals.extend(self.excluded_members(key, &part)?);
            }
            self.require_user(label, literals);
        }
        Ok(())
    }

    /// Each variant of `spec` written `++x`, `~~x` or `k==v` also holds on
    /// every node below `key` that has the variant, one tag per variant.
    fn propagate(&mut self, key: &NodeKey, spec: &Spec, prefix: &str) {
        for name in &spec.propagated {
            let Some(value) = spec.variants.get(name) else {
                continue;
            };
            let mut label = prefix.to_string();
            if !matches!(value, VariantValue::Bool(_)) {
                label.push(' ');
            }
            // Writing into a String cannot fail.
            let _ = value.write_assignment(name, true, &mut label);
            label.push_str(" (propagated)");

            let mut tag = None;
            for target in self.keys.clone() {
                if target == *key {
                    continue;
                }
                let Some(decl) = self.facts.get(&target.package).and_then(|p| p.variant(name)) else {
                    continue;
                };
                let Ok(normalized) = value.normalize(decl) else {
                    continue;
                };
                let literals = variant_literals(decl.kind, &target, name, &normalized);
                if literals
                    .iter()
                    .any(|l| self.pool.lookup_choice(&l.choice).is_none())
                {
                    continue;
                }
                let mut when = vec![reaches(key, Reachable::Node(target.clone()))];
                when.extend(
                    literals
                        .iter()
                        .map(|l| Literal::new(l.choice.clone(), Predicate::Any)),
                );
                let condition = self.condition(&when);
                let tag = *tag.get_or_insert_with(|| self.user_tag(label.clone()));
                for literal in &literals {
                    let set = self.literal_set(literal, false);
                    self.requirements.push(Tagged::tagged(
                        ConditionalRequirement {
                            condition,
                            requirement: Requirement::Single(set),
                        },
                        tag,
                    ));
                }
            }
        }
    }

    /// `off` literals for the members a multi-valued assignment leaves out.
    fn excluded_members(&self, key: &NodeKey, part: &Spec) -> Result<Vec<Literal>, CatalogLookupError> {
        let mut out = Vec::new();
        let package = self.facts.package(&key.package)?;
        for (name, value) in &part.variants {
            let Some(decl) = package.variant(name) else {
                continue;
            };
            if decl.kind != VariantKind::Multi {
                continue;
            }
            let VariantValue::Values(listed) = package.normalize_variant(name, value)? else {
                continue;
            };
            for value in decl.allowed.iter().filter(|v| !listed.contains(*v)) {
                out.push(Literal::new(
                    Choice::VariantMember(key.clone(), name.clone(), value.clone()),
                    Predicate::Member(false),
                ));
            }
        }
        Ok(out)
    }

    // --- phase 8 ---

    fn encode_reachability(&mut self) {
        let graph = StaticGraph::new(self);

        for (i, key) in graph.keys.iter().enumerate() {
            if !graph.below[i].contains(&i) {
                continue;
            }
            let tag = self.rule_tag(RuleOrigin::Cycle(key.clone()), || {
                format!("{key} cannot depend on itself")
            });
            let set = self.literal_set(&reaches(key, Reachable::Node(key.clone())), true);
            self.constraints.push(Tagged::tagged(set, tag));
        }

        let mut encoded = 0;
        while let Some((source, target)) = self.reach_pending.pop() {
            self.encode_reach(&graph, &source, &target);
            encoded += 1;
        }
        debug!(choices = encoded, "encoded reachability");
    }

    /// One candidate per first hop from `source` that can lead to `target`.
    /// Each requires its hop to be taken; each taken hop requires the
    /// choice.
    fn encode_reach(&mut self, graph: &StaticGraph, source: &NodeKey, target: &Reachable) {
        let Some(hops) = graph.hops_of(source) else {
            return;
        };
        let choice = self
            .pool
            .intern_choice(Choice::Reach(source.clone(), target.clone()));
        let versions = self.versions_of(source);
        let mut rank = 0;
        for hop in hops {
            let lands = hop.lands_on(target);
            if !lands && !graph.can_reach(&hop.to, target) {
                continue;
            }
            let mut literals = hop.condition.clone();
            literals.extend(hop.via.iter().cloned());
            if !lands {
                literals.push(reaches(&hop.to, target.clone()));
            }

            let sid = self.add_candidate(
                choice,
                CandidateValue::Via {
                    declaration: hop.declaration,
                    to: hop.to.clone(),
                },
                rank,
            );
            rank += 1;
            let node_set = self.any_of(Choice::Node(source.clone()));
            self.require(sid, None, Requirement::Single(node_set));
            self.require_literals(sid, &literals);

            let condition = self.condition(&literals);
            let set = self.any_of(Choice::Reach(source.clone(), target.clone()));
            for (version, _) in &versions {
                self.require(*version, condition, Requirement::Single(set));
            }
        }
    }

    fn finish(mut self) -> ConstraintModel {
        let root_count = self.root_names.len();
        let mut order: Vec<(usize, Choice, NameId)> = self
            .pool
            .choice_ids()
            .filter(|(id, _)| self.candidates.get(id).is_some_and(|c| !c.is_empty()))
            .map(|(id, choice)| {
                let group = choice
                    .owner()
                    .filter(|k| !k.is_fork())
                    .and_then(|k| self.root_names.iter().position(|r| *r == k.package))
                    .unwrap_or(root_count);
                (group, choice.clone(), id)
            })
            .collect();
        order.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        let outranked = self
            .pool
            .intern_string("ruled out by a better-ranked decision".to_string());

        ConstraintModel {
            pool: self.pool,
            candidates: self.candidates,
            dependencies: self.dependencies,
            excluded: self.excluded,
            requirements: self.requirements,
            constraints: self.constraints,
            labels: self.labels,
            rules: self.rules,
            order: order.into_iter().map(|(_, _, id)| id).collect(),
            facts: self.facts,
            edges: self.edges,
            roots: self
                .root_names
                .iter()
                .map(NodeKey::unified)
                .collect(),
            outranked,
        }
    }
}

/// `"a +x requires %gcc"` or `"a requires one of %gcc, %clang"`, plus the
/// rule's message if any.
fn describe_requirement(package: &str, rule: &RequirementRule) -> String {
    let mut out = package.to_string();
    if !rule.when.is_unconstrained() {
        out.push(' ');
        out.push_str(&rule.when.to_string());
    }
    out.push_str(" requires ");
    if rule.alternatives.len() > 1 {
        out.push_str(match rule.policy {
            RequirePolicy::OneOf => "one of ",
            RequirePolicy::AnyOf => "any of ",
        });
    }
    let alternatives: Vec<String> = rule.alternatives.iter().map(Spec::to_string).collect();
    out.push_str(&alternatives.join(", "));
    if let Some(message) = &rule.message {
        out.push_str(": ");
        out.push_str(message);
    }
    out
}

/// `"a +x conflicts with %gcc@:4"`, plus the rule's message if any.
fn describe_conflict(package: &str, rule: &ConflictRule) -> String {
    let mut out = package.to_string();
    if !rule.when.is_unconstrained() {
        out.push(' ');
        out.push_str(&rule.when.to_string());
    }
    out.push_str(" conflicts with ");
    out.push_str(&rule.conflict.to_string());
    if let Some(message) = &rule.message {
        out.push_str(": ");
        out.push_str(message);
    }
    out
}

/// One way out of a node: an edge a dependency declaration may lay.
#[derive(Debug, Clone)]
struct Hop {
    declaration: usize,
    /// The declaration's `when`.
    condition: Vec<Literal>,
    /// What else must hold for the edge to land on `to`.
    via: Vec<Literal>,
    to: NodeKey,
    /// The virtual the edge satisfies, if any.
    provides: Option<String>,
}

impl Hop {
    fn lands_on(&self, target: &Reachable) -> bool {
        match target {
            Reachable::Node(key) => self.to == *key,
            Reachable::Virtual(name) => self.provides.as_deref() == Some(name.as_str()),
        }
    }
}

/// Every edge the model could lay, whatever the conditions.
struct StaticGraph {
    keys: Vec<NodeKey>,
    position: HashMap<NodeKey, usize>,
    hops: Vec<Vec<Hop>>,
    /// Indices reachable from each node through at least one edge.
    below: Vec<BTreeSet<usize>>,
}

impl StaticGraph {
    fn new(encoder: &Encoder<'_>) -> Self {
        let keys: Vec<NodeKey> = encoder.keys.iter().cloned().collect();
        let position: HashMap<NodeKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();
        let hops: Vec<Vec<Hop>> = keys.iter().map(|k| encoder.hops(k)).collect();

        let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(keys.len(), 0);
        for _ in &keys {
            graph.add_node(());
        }
        for (source, out) in hops.iter().enumerate() {
            for hop in out {
                if let Some(&to) = position.get(&hop.to) {
                    graph.update_edge(NodeIndex::new(source), NodeIndex::new(to), ());
                }
            }
        }
        let below = (0..keys.len())
            .map(|i| {
                let next: Vec<usize> = graph
                    .neighbors(NodeIndex::new(i))
                    .map(NodeIndex::index)
                    .collect();
                reachable(&graph, &next)
            })
            .collect();

        Self {
            keys,
            position,
            hops,
            below,
        }
    }

    fn hops_of(&self, key: &NodeKey) -> Option<&[Hop]> {
        self.position.get(key).map(|&i| self.hops[i].as_slice())
    }

    /// Whether some path of at least one edge leads from `from` to `target`.
    fn can_reach(&self, from: &NodeKey, target: &Reachable) -> bool {
        let Some(&i) = self.position.get(from) else {
            return false;
        };
        match target {
            Reachable::Node(key) => self
                .position
                .get(key)
                .is_some_and(|t| self.below[i].contains(t)),
            Reachable::Virtual(_) => std::iter::once(i)
                .chain(self.below[i].iter().copied())
                .any(|n| self.hops[n].iter().any(|hop| hop.lands_on(target))),
        }
    }
}

/// Rank of each declared version, in declaration order.
///
/// Order: configured preferences, then versions flagged preferred, then
/// regular releases newest first, then infinity versions (`develop`, ...),
/// then git references in catalog order, then deprecated versions.
fn version_ranks(versions: &[VersionDeclaration], prefs: Option<&PackagePreferences>) -> Vec<u32> {
    let configured = |v: &Version| -> usize {
        prefs
            .and_then(|p| p.version.iter().position(|c| c.contains(v)))
            .unwrap_or(usize::MAX)
    };
    let class = |d: &VersionDeclaration| -> u8 {
        if d.deprecated {
            4
        } else if d.preferred {
            0
        } else if d.version.is_git() {
            3
        } else if d.version.is_infinity() {
            2
        } else {
            1
        }
    };
    let mut indices: Vec<usize> = (0..versions.len()).collect();
    indices.sort_by(|&a, &b| {
        let (da, db) = (&versions[a], &versions[b]);
        configured(&da.version)
            .cmp(&configured(&db.version))
            .then_with(|| class(da).cmp(&class(db)))
            .then_with(|| match (da.version.standard(), db.version.standard()) {
                (Some(x), Some(y)) if class(da) < 3 => y.cmp(x),
                _ => Ordering::Equal,
            })
            .then_with(|| a.cmp(&b))
    });
    let mut ranks = vec![0; versions.len()];
    for (rank, index) in indices.into_iter().enumerate() {
        ranks[index] = rank as u32;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::recipe::PackageRecipe;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_recipes([
            PackageRecipe::new("a")
                .version("1.0")
                .variant("x", false)
                .depends_on("mpi", "build,link")
                .depends_on("cmake", "build")
                .conflicts("%gcc@:4", "+x"),
            PackageRecipe::new("cmake").version("3.27").version("3.20"),
            PackageRecipe::new("openmpi").version("4.1").provides("mpi@3"),
            PackageRecipe::new("mpich").version("3.0").provides("mpi@3"),
        ])
        .unwrap()
    }

    fn config() -> SolverConfig {
        let mut config = SolverConfig::default();
        config.compilers.push("gcc@4.2.0".parse().unwrap());
        config.validated().unwrap()
    }

    fn build(catalog: &InMemoryCatalog, request: &str) -> Result<ConstraintModel, CatalogLookupError> {
        let config = config();
        let roots = crate::parser::parse_specs(request).unwrap();
        ModelBuilder::new(catalog, &config).build(&roots)
    }

    #[test]
    fn closure_covers_providers_and_forks() {
        let catalog = catalog();
        let model = build(&catalog, "a").unwrap();
        let nodes: Vec<String> = model
            .pool
            .choices
            .iter()
            .filter_map(|c| match c {
                Choice::Node(k) => Some(k.to_string()),
                _ => None,
            })
            .collect();
        for expected in ["a", "cmake", "cmake (built for a)", "mpich", "openmpi"] {
            assert!(nodes.contains(&expected.to_string()), "{expected} in {nodes:?}");
        }
        assert!(
            model
                .pool
                .lookup_choice(&Choice::Provider("mpi".to_string()))
                .is_some()
        );
        assert!(model.edges[&NodeKey::unified("a")].iter().any(|e| matches!(
            e.target,
            Target::BuildOnly { .. }
        )));
    }

    #[test]
    fn canonical_order_puts_roots_first() {
        let catalog = catalog();
        let model = build(&catalog, "a").unwrap();
        let first = model.pool.resolve_choice(model.order()[0]);
        assert_eq!(first.owner(), Some(&NodeKey::unified("a")));
    }

    #[test]
    fn request_constraints_are_labelled() {
        let catalog = catalog();
        let model = build(&catalog, "a+x %gcc@4.2 ^mpich").unwrap();
        let labels: Vec<&str> = model.user_tags().map(|t| model.label(t)).collect();
        assert_eq!(
            labels,
            ["a", "a+x", "a%gcc@4.2", "a ^mpich", "a ^[virtuals=mpi] mpich"]
        );
        assert_eq!(model.constraints.len(), 1);

        // `^mpich` asks for `a` to depend on it, not merely for its presence.
        let pinned: Vec<&Choice> = model
            .requirements
            .iter()
            .filter(|r| r.tag == Some(Tag::User(3)))
            .filter_map(|r| match r.item.requirement {
                Requirement::Single(set) => {
                    Some(model.pool.resolve_choice(model.pool.version_set_choice(set)))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            pinned,
            [&Choice::Reach(
                NodeKey::unified("a"),
                Reachable::Node(NodeKey::unified("mpich"))
            )]
        );
        let reach = model.pool.lookup_choice(pinned[0]).unwrap();
        let hops: Vec<String> = model
            .candidates_of(reach)
            .iter()
            .map(|sid| model.pool.resolve_candidate(*sid).value.to_string())
            .collect();
        assert_eq!(hops, ["via dependency #0 on mpich"]);
    }

    #[test]
    fn possible_cycles_are_banned() {
        let catalog = InMemoryCatalog::from_recipes([
            PackageRecipe::new("a")
                .version("1.0")
                .variant("x", true)
                .depends_on_when("b", "build,link", "+x"),
            PackageRecipe::new("b").version("1.0").depends_on("a", "build,link"),
            PackageRecipe::new("c").version("1.0"),
        ])
        .unwrap();
        let model = build(&catalog, "a c").unwrap();
        let rules: Vec<&str> = model.rule_tags().map(|t| model.label(t)).collect();
        assert_eq!(rules, ["a cannot depend on itself", "b cannot depend on itself"]);
        assert_eq!(model.constraints.len(), 2);
        assert!(
            model
                .pool
                .lookup_choice(&Choice::Reach(
                    NodeKey::unified("c"),
                    Reachable::Node(NodeKey::unified("c"))
                ))
                .is_none()
        );
    }

    #[test]
    fn long_conflicts_forbid_the_whole_conjunction() {
        let catalog = InMemoryCatalog::from_recipes([
            PackageRecipe::new("a")
                .version("1.0")
                .variant("gpu", false)
                .variant_when("cuda", true, "+gpu")
                .depends_on("b", "build,link")
                .depends_on("c", "build,link")
                .conflicts("^b", "+cuda ^c"),
            PackageRecipe::new("b").version("1.0"),
            PackageRecipe::new("c").version("1.0"),
        ])
        .unwrap();
        let model = build(&catalog, "a").unwrap();
        let a = model
            .pool
            .lookup_choice(&Choice::Node(NodeKey::unified("a")))
            .unwrap();
        let forbidden: Vec<VersionSetId> = model
            .candidates_of(a)
            .iter()
            .filter_map(|sid| model.dependencies.get(sid))
            .flat_map(|d| &d.requirements)
            .filter(|r| r.tag == Some(Tag::Rule(0)))
            .filter_map(|r| match r.item.requirement {
                Requirement::Single(set) if r.item.condition.is_some() => Some(set),
                _ => None,
            })
            .collect();
        assert_eq!(forbidden.len(), 1);
        let set = model.pool.resolve_version_set(forbidden[0]);
        let choice = model.pool.version_set_choice(forbidden[0]);
        assert!(
            model
                .candidates_of(choice)
                .iter()
                .all(|sid| !set.matches(&model.pool.resolve_candidate(*sid).value))
        );
    }

    #[test]
    fn requirements_are_tagged_and_described() {
        let catalog = InMemoryCatalog::from_recipes([
            PackageRecipe::new("a")
                .version("1.0")
                .variant("x", false)
                .requires(&["%gcc"], "+x")
                .requires(&["%gcc", "%clang"], ""),
        ])
        .unwrap();
        let model = build(&catalog, "a").unwrap();
        let rules: Vec<&str> = model.rule_tags().map(|t| model.label(t)).collect();
        assert_eq!(rules, ["a +x requires %gcc", "a requires one of %gcc, %clang"]);

        // `%clang` is not configured: one alternative left in the second rule.
        let alternatives = |index: usize| {
            let choice = model
                .pool
                .lookup_choice(&Choice::Alternative(NodeKey::unified("a"), index))
                .unwrap();
            model.candidates_of(choice).len()
        };
        assert_eq!(alternatives(0), 1);
        assert_eq!(alternatives(1), 1);
    }

    #[test]
    fn conflict_rules_are_tagged_and_described() {
        let catalog = catalog();
        let model = build(&catalog, "a").unwrap();
        let rules: Vec<&str> = model.rule_tags().map(|t| model.label(t)).collect();
        assert_eq!(rules, ["a +x conflicts with %gcc@:4"]);

        // Two literals, one local: hung on the `+x` candidate.
        let x = model
            .pool
            .lookup_choice(&Choice::Variant(NodeKey::unified("a"), "x".to_string()))
            .unwrap();
        let tagged: usize = model
            .candidates_of(x)
            .iter()
            .map(|sid| {
                model
                    .dependencies
                    .get(sid)
                    .map_or(0, |d| d.constrains.iter().filter(|c| c.tag.is_some()).count())
            })
            .sum();
        assert_eq!(tagged, 1);
    }

    #[test]
    fn request_errors() {
        let catalog = catalog();
        assert!(matches!(
            build(&catalog, "zlib"),
            Err(CatalogLookupError::UnknownPackage(_))
        ));
        assert!(matches!(
            build(&catalog, "mpi"),
            Err(CatalogLookupError::VirtualRoot(_))
        ));
        assert!(matches!(
            build(&catalog, "a+y"),
            Err(CatalogLookupError::UnknownVariant { .. })
        ));
        assert!(matches!(
            build(&catalog, "a x=maybe"),
            Err(CatalogLookupError::InvalidVariantValue { .. })
        ));
        assert!(matches!(
            build(&catalog, "a@2:"),
            Err(CatalogLookupError::NoMatchingVersion { .. })
        ));
        assert!(matches!(
            build(&catalog, "a%clang"),
            Err(CatalogLookupError::NoMatchingCompiler(_))
        ));
        assert!(matches!(
            build(&catalog, "a arch=darwin-sonoma-m1"),
            Err(CatalogLookupError::NoMatchingArch(_))
        ));
        assert!(matches!(
            build(&catalog, "a ^zlib"),
            Err(CatalogLookupError::UnknownPackage(_))
        ));
    }

    #[test]
    fn test_policy() {
        let dk = |s: &str| s.parse::<DepKinds>().unwrap();
        assert_eq!(effective_kinds(TestDeps::None, dk("test"), true), None);
        assert_eq!(
            effective_kinds(TestDeps::None, dk("build,test"), true),
            Some(dk("build"))
        );
        assert_eq!(
            effective_kinds(TestDeps::Roots, dk("test"), true),
            Some(dk("test"))
        );
        assert_eq!(effective_kinds(TestDeps::Roots, dk("test"), false), None);
        assert_eq!(
            effective_kinds(TestDeps::All, dk("test"), false),
            Some(dk("test"))
        );
    }

    #[test]
    fn version_ranking() {
        let decl = |v: &str, preferred: bool, deprecated: bool| VersionDeclaration {
            version: Version::parse(v).unwrap(),
            preferred,
            deprecated,
        };
        let versions = vec![
            decl("develop", false, false),
            decl("1.2", false, false),
            decl("2.0", false, true),
            decl("1.10", false, false),
            decl("1.0", true, false),
            decl("git.feature", false, false),
        ];
        assert_eq!(version_ranks(&versions, None), vec![3, 2, 5, 1, 0, 4]);

        let prefs = PackagePreferences {
            version: vec!["1.2".parse().unwrap()],
            ..PackagePreferences::default()
        };
        assert_eq!(version_ranks(&versions, Some(&prefs)), vec![3, 0, 5, 2, 1, 4]);
    }
}
