//! resolvo's [`DependencyProvider`](resolvo::DependencyProvider) over a
//! [`ConstraintModel`].
//!
//! A [`ModelProvider`] serves one solver run. The model is shared by every
//! run of a concretization; what changes between runs is passed in
//! alongside it:
//!
//! - rank *bounds* per choice, applied as candidate exclusions, which is how
//!   the lexicographic optimization narrows the search;
//! - the set of *disabled* [`Tag`]s, whose requirements, constrains and
//!   exclusions are dropped, which is how explanations test subsets of the
//!   request and of the conflict rules.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use resolvo::{
    Candidates, Condition, ConditionId, ConditionalRequirement, Dependencies,
    HintDependenciesAvailable, KnownDependencies, NameId, SolvableId, SolverCache, StringId,
    VersionSetId, VersionSetUnionId,
};

use crate::builder::{ConstraintModel, Tag};
use crate::error::ResourceLimit;
use crate::pool::{CandidateValue, Choice, ModelPool};

/// Dependency provider for one run over a [`ConstraintModel`].
pub struct ModelProvider<'a> {
    model: &'a ConstraintModel,
    bounds: &'a HashMap<NameId, u32>,
    disabled: &'a BTreeSet<Tag>,
    steps: Cell<u64>,
    max_steps: u64,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> ModelProvider<'a> {
    pub fn new(
        model: &'a ConstraintModel,
        bounds: &'a HashMap<NameId, u32>,
        disabled: &'a BTreeSet<Tag>,
    ) -> Self {
        Self {
            model,
            bounds,
            disabled,
            steps: Cell::new(0),
            max_steps: u64::MAX,
            cancel: None,
        }
    }

    /// Stop the run after `max_steps` steps, or once `cancel` is raised.
    pub fn with_budget(mut self, max_steps: u64, cancel: Option<&'a AtomicBool>) -> Self {
        self.max_steps = max_steps;
        self.cancel = cancel;
        self
    }

    pub fn model(&self) -> &ConstraintModel {
        self.model
    }

    pub fn pool(&self) -> &ModelPool {
        &self.model.pool
    }

    fn enabled(&self, tag: Option<Tag>) -> bool {
        tag.is_none_or(|t| !self.disabled.contains(&t))
    }

    /// Root requirements of the request that are still enabled.
    pub fn requirements(&self) -> Vec<ConditionalRequirement> {
        self.model
            .requirements
            .iter()
            .filter(|r| self.enabled(r.tag))
            .map(|r| r.item.clone())
            .collect()
    }

    /// Root constraints of the request that are still enabled.
    pub fn constraints(&self) -> Vec<VersionSetId> {
        self.model
            .constraints
            .iter()
            .filter(|c| self.enabled(c.tag))
            .map(|c| c.item)
            .collect()
    }

    /// Steps taken so far in this run.
    pub fn steps(&self) -> u64 {
        self.steps.get()
    }
}

// --- Display wrappers ---

struct DisplaySolvable<'a>(&'a ModelPool, SolvableId);

impl fmt::Display for DisplaySolvable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let choice = self.0.resolve_choice(self.0.candidate_choice(self.1));
        let value = &self.0.resolve_candidate(self.1).value;
        match (choice, value) {
            (Choice::Node(key), CandidateValue::Version(v)) => write!(f, "{key}@{v}"),
            (Choice::Variant(key, name), CandidateValue::Value(v)) => {
                write!(f, "{key} ")?;
                v.write_assignment(name, false, f)
            }
            (Choice::VariantMember(key, name, member), CandidateValue::Member(on)) => {
                let state = if *on { "with" } else { "without" };
                write!(f, "{key} {state} {name}={member}")
            }
            (Choice::Compiler(key), CandidateValue::Compiler(c)) => write!(f, "{key}%{c}"),
            (Choice::Provider(name), CandidateValue::Provision { .. }) => {
                write!(f, "{value} as {name}")
            }
            (Choice::Edge(key, _), CandidateValue::Edge(_)) => {
                write!(f, "{key} build dependency on a {value}")
            }
            (choice, value) => write!(f, "{choice} {value}"),
        }
    }
}

struct DisplayName<'a>(&'a ModelPool, NameId);

impl fmt::Display for DisplayName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_choice(self.1))
    }
}

struct DisplayVersionSet<'a>(&'a ModelPool, VersionSetId);

impl fmt::Display for DisplayVersionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_version_set(self.1))
    }
}

struct DisplayString<'a>(&'a ModelPool, StringId);

impl fmt::Display for DisplayString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_string(self.1))
    }
}

// --- Interner ---

impl resolvo::Interner for ModelProvider<'_> {
    fn display_solvable(&self, solvable: SolvableId) -> impl fmt::Display + '_ {
        DisplaySolvable(self.pool(), solvable)
    }

    fn display_name(&self, name: NameId) -> impl fmt::Display + '_ {
        DisplayName(self.pool(), name)
    }

    fn display_version_set(&self, version_set: VersionSetId) -> impl fmt::Display + '_ {
        DisplayVersionSet(self.pool(), version_set)
    }

    fn display_string(&self, string_id: StringId) -> impl fmt::Display + '_ {
        DisplayString(self.pool(), string_id)
    }

    fn version_set_name(&self, version_set: VersionSetId) -> NameId {
        self.pool().version_set_choice(version_set)
    }

    fn solvable_name(&self, solvable: SolvableId) -> NameId {
        self.pool().candidate_choice(solvable)
    }

    fn version_sets_in_union(
        &self,
        version_set_union: VersionSetUnionId,
    ) -> impl Iterator<Item = VersionSetId> {
        self.pool()
            .resolve_version_set_union(version_set_union)
            .iter()
            .copied()
    }

    fn resolve_condition(&self, condition: ConditionId) -> Condition {
        self.pool().resolve_condition(condition).clone()
    }
}

// --- DependencyProvider ---

impl resolvo::DependencyProvider for ModelProvider<'_> {
    async fn get_candidates(&self, name: NameId) -> Option<Candidates> {
        let solvables = self.model.candidates.get(&name)?;
        let mut excluded = Vec::new();
        if let Some(&bound) = self.bounds.get(&name) {
            for &sid in solvables {
                if self.pool().resolve_candidate(sid).rank > bound {
                    excluded.push((sid, self.model.outranked));
                }
            }
        }
        for &(sid, reason, tag) in self.model.excluded.get(&name).into_iter().flatten() {
            if self.enabled(Some(tag)) && !excluded.iter().any(|(s, _)| *s == sid) {
                excluded.push((sid, reason));
            }
        }
        Some(Candidates {
            candidates: solvables.clone(),
            favored: None,
            locked: None,
            hint_dependencies_available: HintDependenciesAvailable::All,
            excluded,
        })
    }

    async fn sort_candidates(&self, _solver: &SolverCache<Self>, solvables: &mut [SolvableId]) {
        // Best rank first, so the first solution found is already good.
        solvables.sort_by_key(|&sid| self.pool().resolve_candidate(sid).rank);
    }

    async fn filter_candidates(
        &self,
        candidates: &[SolvableId],
        version_set: VersionSetId,
        inverse: bool,
    ) -> Vec<SolvableId> {
        let set = self.pool().resolve_version_set(version_set);

        candidates
            .iter()
            .copied()
            .filter(|&sid| {
                // An inverted set flips the match first, so a `constrains`
                // entry (which resolvo applies with `inverse`) forbids the
                // candidates matching the predicate. See [`VersionSet`].
                let matches = set.matches(&self.pool().resolve_candidate(sid).value);
                if inverse { !matches } else { matches }
            })
            .collect()
    }

    async fn get_dependencies(&self, solvable: SolvableId) -> Dependencies {
        let Some(deps) = self.model.dependencies.get(&solvable) else {
            return Dependencies::Known(KnownDependencies {
                requirements: Vec::new(),
                constrains: Vec::new(),
            });
        };
        Dependencies::Known(KnownDependencies {
            requirements: deps
                .requirements
                .iter()
                .filter(|r| self.enabled(r.tag))
                .map(|r| r.item.clone())
                .collect(),
            constrains: deps
                .constrains
                .iter()
                .filter(|c| self.enabled(c.tag))
                .map(|c| c.item)
                .collect(),
        })
    }

    fn should_cancel_with_value(&self) -> Option<Box<dyn std::any::Any>> {
        let steps = self.steps.get() + 1;
        self.steps.set(steps);
        if self.cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Some(Box::new(ResourceLimit::Cancelled));
        }
        if steps > self.max_steps {
            return Some(Box::new(ResourceLimit::Steps(self.max_steps)));
        }
        None
    }
}
