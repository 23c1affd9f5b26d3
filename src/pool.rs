//! Arena-based pool mapping resolvo IDs to concretization choices.
//!
//! [`ModelPool`] provides the storage behind every resolvo identifier used
//! by the constraint model. A resolvo *name* ([`NameId`]) is one decision
//! variable, a [`Choice`]; each *solvable* ([`SolvableId`]) is one value that
//! choice can take, a [`Candidate`]; a *version set* ([`VersionSetId`]) is a
//! [`Predicate`] over the candidates of one choice. Selecting no solvable
//! for a name means the choice is absent (the node does not exist, the
//! variant does not apply, ...).

use std::collections::HashMap;
use std::fmt;

use resolvo::{
    ArenaId, Condition, ConditionId, NameId, SolvableId, StringId, VersionSetId,
    VersionSetUnionId,
};

use crate::config::Criterion;
use crate::spec::{Arch, ArchSpec, Compiler, CompilerSpec};
use crate::variant::VariantValue;
use crate::version::Version;
use crate::version_match::VersionConstraint;

/// Identity of a node while solving.
///
/// Every package has at most one *unified* node (`build_for == None`) that
/// all link, run and test edges converge on. A build-only edge may instead
/// target a private copy built for the declaring package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub package: String,
    pub build_for: Option<String>,
}

impl NodeKey {
    pub fn unified(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            build_for: None,
        }
    }

    pub fn fork(package: impl Into<String>, build_for: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            build_for: Some(build_for.into()),
        }
    }

    pub fn is_fork(&self) -> bool {
        self.build_for.is_some()
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.package)?;
        if let Some(parent) = &self.build_for {
            write!(f, " (built for {parent})")?;
        }
        Ok(())
    }
}

/// How a build-only edge is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeMode {
    /// Use the unified node.
    Converge,
    /// Use a private copy.
    Fork,
}

/// What a [`Choice::Reach`] looks for below its node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reachable {
    Node(NodeKey),
    /// Whichever package provides the virtual on some edge.
    Virtual(String),
}

impl fmt::Display for Reachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachable::Node(key) => write!(f, "{key}"),
            Reachable::Virtual(name) => write!(f, "{name}"),
        }
    }
}

/// One decision variable of the constraint model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Choice {
    /// The version of a node. Absent when the node is not in the DAG.
    Node(NodeKey),
    /// A boolean or single-valued variant.
    Variant(NodeKey, String),
    /// One value of a multi-valued variant: on or off.
    VariantMember(NodeKey, String, String),
    Compiler(NodeKey),
    /// The architecture, shared by the whole DAG.
    Arch,
    /// Which provision implements a virtual, shared by the whole DAG.
    Provider(String),
    /// Converge or fork, for one build-only dependency declaration.
    Edge(NodeKey, usize),
    /// Present iff the target is reachable from the node through at least
    /// one edge. Each candidate is one first hop.
    Reach(NodeKey, Reachable),
    /// Which alternative of a `requires` rule of the node holds.
    Alternative(NodeKey, usize),
}

impl Choice {
    /// The criterion that ranks this choice's candidates. Bookkeeping
    /// choices are not optimized.
    pub fn criterion(&self) -> Option<Criterion> {
        match self {
            Choice::Node(_) => Some(Criterion::Versions),
            Choice::Variant(..) | Choice::VariantMember(..) => Some(Criterion::VariantDefaults),
            Choice::Compiler(_) => Some(Criterion::Compilers),
            Choice::Arch => Some(Criterion::Targets),
            Choice::Provider(_) => Some(Criterion::Providers),
            Choice::Edge(..) => Some(Criterion::Duplicates),
            Choice::Reach(..) | Choice::Alternative(..) => None,
        }
    }

    /// The node this choice belongs to, if it belongs to a single node.
    pub fn owner(&self) -> Option<&NodeKey> {
        match self {
            Choice::Node(key)
            | Choice::Variant(key, _)
            | Choice::VariantMember(key, _, _)
            | Choice::Compiler(key)
            | Choice::Edge(key, _)
            | Choice::Reach(key, _)
            | Choice::Alternative(key, _) => Some(key),
            Choice::Arch | Choice::Provider(_) => None,
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Node(key) => write!(f, "{key}"),
            Choice::Variant(key, name) => write!(f, "{key} variant '{name}'"),
            Choice::VariantMember(key, name, value) => {
                write!(f, "{key} variant '{name}' value '{value}'")
            }
            Choice::Compiler(key) => write!(f, "{key} compiler"),
            Choice::Arch => write!(f, "architecture"),
            Choice::Provider(name) => write!(f, "provider of {name}"),
            Choice::Edge(key, index) => write!(f, "{key} build dependency #{index}"),
            Choice::Reach(key, target) => write!(f, "{key} depends on {target}"),
            Choice::Alternative(key, index) => write!(f, "{key} requirement #{index}"),
        }
    }
}

/// A value one [`Choice`] can take.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateValue {
    Version(Version),
    Value(VariantValue),
    Member(bool),
    Compiler(Compiler),
    Arch(Arch),
    /// The `index`-th provision of `package`.
    Provision {
        package: String,
        index: usize,
        versions: VersionConstraint,
    },
    Edge(EdgeMode),
    /// A first hop towards a [`Reachable`]: the edge of dependency
    /// declaration `declaration` that lands on `to`.
    Via { declaration: usize, to: NodeKey },
    /// The `i`-th alternative of a requirement.
    Alternative(usize),
}

impl fmt::Display for CandidateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateValue::Version(v) => write!(f, "@{v}"),
            CandidateValue::Value(v) => write!(f, "={v}"),
            CandidateValue::Member(true) => write!(f, "on"),
            CandidateValue::Member(false) => write!(f, "off"),
            CandidateValue::Compiler(c) => write!(f, "%{c}"),
            CandidateValue::Arch(a) => write!(f, "arch={a}"),
            CandidateValue::Provision {
                package, versions, ..
            } => {
                write!(f, "{package}")?;
                if !versions.is_any() {
                    write!(f, " (provides @{versions})")?;
                }
                Ok(())
            }
            CandidateValue::Edge(EdgeMode::Converge) => write!(f, "shared node"),
            CandidateValue::Edge(EdgeMode::Fork) => write!(f, "separate build"),
            CandidateValue::Via { declaration, to } => {
                write!(f, "via dependency #{declaration} on {to}")
            }
            CandidateValue::Alternative(i) => write!(f, "alternative #{i}"),
        }
    }
}

/// A candidate and its preference rank. Rank 0 is best; ranks are distinct
/// within a choice.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: CandidateValue,
    pub rank: u32,
}

/// A filter over the candidates of one choice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Predicate {
    Any,
    Versions(VersionConstraint),
    /// Variant value meets the constraint (inclusion for value sets).
    Value(VariantValue),
    Member(bool),
    Compiler(CompilerSpec),
    Arch(ArchSpec),
    /// A provision, optionally of one package, whose capability versions
    /// intersect `versions`.
    Provision {
        package: Option<String>,
        versions: VersionConstraint,
    },
    Edge(EdgeMode),
}

impl Predicate {
    pub fn matches(&self, value: &CandidateValue) -> bool {
        match (self, value) {
            (Predicate::Any, _) => true,
            (Predicate::Versions(c), CandidateValue::Version(v)) => c.contains(v),
            (Predicate::Value(want), CandidateValue::Value(have)) => have.satisfies(want),
            (Predicate::Member(want), CandidateValue::Member(have)) => want == have,
            (Predicate::Compiler(spec), CandidateValue::Compiler(c)) => spec.satisfied_by(c),
            (Predicate::Arch(spec), CandidateValue::Arch(a)) => spec.satisfied_by(a),
            (
                Predicate::Provision { package, versions },
                CandidateValue::Provision {
                    package: have,
                    versions: offered,
                    ..
                },
            ) => {
                package.as_ref().is_none_or(|p| p == have) && versions.intersects(offered)
            }
            (Predicate::Edge(want), CandidateValue::Edge(have)) => want == have,
            _ => false,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Any => write!(f, "*"),
            Predicate::Versions(c) => write!(f, "@{c}"),
            Predicate::Value(v) => write!(f, "={v}"),
            Predicate::Member(true) => write!(f, "on"),
            Predicate::Member(false) => write!(f, "off"),
            Predicate::Compiler(c) => write!(f, "%{c}"),
            Predicate::Arch(a) => write!(f, "{a}"),
            Predicate::Provision { package, versions } => {
                if !versions.is_any() {
                    write!(f, "@{versions}")?;
                }
                if let Some(package) = package {
                    write!(f, " from {package}")?;
                }
                Ok(())
            }
            Predicate::Edge(EdgeMode::Converge) => write!(f, "shared node"),
            Predicate::Edge(EdgeMode::Fork) => write!(f, "separate build"),
        }
    }
}

/// A version set: a predicate, optionally inverted.
///
/// Requirements use plain predicates. Conflict rules use `inverted = true`:
/// resolvo forbids the candidates that `filter_candidates(.., inverse=true)`
/// returns for a `constrains` entry, so flipping the match result first
/// means the net effect is "forbid candidates that **match** the
/// predicate". An inverted version set used as a requirement selects the
/// complement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionSet {
    pub predicate: Predicate,
    pub inverted: bool,
}

impl VersionSet {
    pub fn matches(&self, value: &CandidateValue) -> bool {
        self.predicate.matches(value) != self.inverted
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "not ")?;
        }
        write!(f, "{}", self.predicate)
    }
}

/// Arena-based storage for all resolvo-interned objects.
///
/// Every resolvo ID type is backed by a `Vec` here, indexed by the ID's
/// inner `usize`. Reverse-lookup `HashMap`s prevent duplicate interning.
#[derive(Default)]
pub struct ModelPool {
    // NameId arena
    pub(crate) choices: Vec<Choice>,
    pub(crate) choices_rev: HashMap<Choice, NameId>,

    // SolvableId arena
    pub(crate) candidates: Vec<Candidate>,
    pub(crate) candidate_choices: Vec<NameId>,

    // VersionSetId arena
    pub(crate) version_sets: Vec<VersionSet>,
    pub(crate) version_set_choices: Vec<NameId>,
    pub(crate) version_sets_rev: HashMap<(NameId, VersionSet), VersionSetId>,

    // VersionSetUnionId arena
    pub(crate) version_set_unions: Vec<Vec<VersionSetId>>,

    // ConditionId arena
    pub(crate) conditions: Vec<Condition>,

    // StringId arena
    pub(crate) strings: Vec<String>,
}

impl ModelPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    // --- NameId ---

    /// Intern a choice, returning the existing ID if already interned.
    pub fn intern_choice(&mut self, choice: Choice) -> NameId {
        if let Some(&id) = self.choices_rev.get(&choice) {
            return id;
        }
        let id = NameId::from_usize(self.choices.len());
        self.choices_rev.insert(choice.clone(), id);
        self.choices.push(choice);
        id
    }

    /// Look up an interned choice without interning it.
    pub fn lookup_choice(&self, choice: &Choice) -> Option<NameId> {
        self.choices_rev.get(choice).copied()
    }

    pub fn resolve_choice(&self, id: NameId) -> &Choice {
        &self.choices[id.to_usize()]
    }

    pub fn choice_count(&self) -> usize {
        self.choices.len()
    }

    /// Every interned choice with its ID, in interning order.
    pub fn choice_ids(&self) -> impl Iterator<Item = (NameId, &Choice)> {
        self.choices
            .iter()
            .enumerate()
            .map(|(i, c)| (NameId::from_usize(i), c))
    }

    // --- SolvableId ---

    /// Add a candidate value to a choice.
    pub fn add_candidate(&mut self, choice: NameId, candidate: Candidate) -> SolvableId {
        let id = SolvableId::from_usize(self.candidates.len());
        self.candidates.push(candidate);
        self.candidate_choices.push(choice);
        id
    }

    pub fn resolve_candidate(&self, id: SolvableId) -> &Candidate {
        &self.candidates[id.to_usize()]
    }

    pub fn candidate_choice(&self, id: SolvableId) -> NameId {
        self.candidate_choices[id.to_usize()]
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    // --- VersionSetId ---

    /// Intern a predicate over `choice`, deduplicating by value.
    pub fn intern_version_set(
        &mut self,
        choice: NameId,
        predicate: Predicate,
        inverted: bool,
    ) -> VersionSetId {
        let set = VersionSet {
            predicate,
            inverted,
        };
        if let Some(&id) = self.version_sets_rev.get(&(choice, set.clone())) {
            return id;
        }
        let id = VersionSetId::from_usize(self.version_sets.len());
        self.version_sets_rev.insert((choice, set.clone()), id);
        self.version_sets.push(set);
        self.version_set_choices.push(choice);
        id
    }

    pub fn resolve_version_set(&self, id: VersionSetId) -> &VersionSet {
        &self.version_sets[id.to_usize()]
    }

    pub fn version_set_choice(&self, id: VersionSetId) -> NameId {
        self.version_set_choices[id.to_usize()]
    }

    // --- VersionSetUnionId ---

    /// Intern a union (OR) of version sets.
    pub fn intern_version_set_union(&mut self, sets: Vec<VersionSetId>) -> VersionSetUnionId {
        let id = VersionSetUnionId::from_usize(self.version_set_unions.len());
        self.version_set_unions.push(sets);
        id
    }

    pub fn resolve_version_set_union(&self, id: VersionSetUnionId) -> &[VersionSetId] {
        &self.version_set_unions[id.to_usize()]
    }

    // --- ConditionId ---

    pub fn intern_condition(&mut self, condition: Condition) -> ConditionId {
        let id = ConditionId::from_usize(self.conditions.len());
        self.conditions.push(condition);
        id
    }

    pub fn resolve_condition(&self, id: ConditionId) -> &Condition {
        &self.conditions[id.to_usize()]
    }

    // --- StringId ---

    /// Intern a string (used for exclusion reasons).
    pub fn intern_string(&mut self, s: String) -> StringId {
        let id = StringId::from_usize(self.strings.len());
        self.strings.push(s);
        id
    }

    pub fn resolve_string(&self, id: StringId) -> &str {
        &self.strings[id.to_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_choice_dedup() {
        let mut pool = ModelPool::new();
        let a = pool.intern_choice(Choice::Node(NodeKey::unified("zlib")));
        let b = pool.intern_choice(Choice::Node(NodeKey::unified("zlib")));
        let c = pool.intern_choice(Choice::Node(NodeKey::fork("zlib", "cmake")));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.choice_count(), 2);
        assert_eq!(pool.resolve_choice(c).to_string(), "zlib (built for cmake)");
        assert_eq!(
            pool.lookup_choice(&Choice::Node(NodeKey::unified("zlib"))),
            Some(a)
        );
        assert_eq!(pool.lookup_choice(&Choice::Arch), None);
    }

    #[test]
    fn reachability_choices_are_not_optimized() {
        let reach = Choice::Reach(
            NodeKey::unified("hdf5"),
            Reachable::Virtual("mpi".to_string()),
        );
        assert_eq!(reach.criterion(), None);
        assert_eq!(reach.owner(), Some(&NodeKey::unified("hdf5")));
        assert_eq!(reach.to_string(), "hdf5 depends on mpi");
        assert_eq!(
            Choice::Node(NodeKey::unified("hdf5")).criterion(),
            Some(Criterion::Versions)
        );

        let hop = CandidateValue::Via {
            declaration: 2,
            to: NodeKey::fork("cmake", "hdf5"),
        };
        assert_eq!(hop.to_string(), "via dependency #2 on cmake (built for hdf5)");
        assert!(Predicate::Any.matches(&hop));
    }

    #[test]
    fn candidates_belong_to_their_choice() {
        let mut pool = ModelPool::new();
        let name = pool.intern_choice(Choice::Compiler(NodeKey::unified("zlib")));
        let sid = pool.add_candidate(
            name,
            Candidate {
                value: CandidateValue::Compiler("gcc@12.1.0".parse().unwrap()),
                rank: 0,
            },
        );
        assert_eq!(pool.candidate_choice(sid), name);
        assert_eq!(pool.resolve_candidate(sid).rank, 0);
        assert_eq!(pool.candidate_count(), 1);
    }

    #[test]
    fn version_sets_dedup_per_choice_and_polarity() {
        let mut pool = ModelPool::new();
        let zlib = pool.intern_choice(Choice::Node(NodeKey::unified("zlib")));
        let bzip = pool.intern_choice(Choice::Node(NodeKey::unified("bzip2")));
        let range: VersionConstraint = "1.2:".parse().unwrap();
        let a = pool.intern_version_set(zlib, Predicate::Versions(range.clone()), false);
        let b = pool.intern_version_set(zlib, Predicate::Versions(range.clone()), false);
        let c = pool.intern_version_set(zlib, Predicate::Versions(range.clone()), true);
        let d = pool.intern_version_set(bzip, Predicate::Versions(range), false);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(pool.version_set_choice(d), bzip);
        assert_eq!(pool.resolve_version_set(c).to_string(), "not @1.2:");
    }

    #[test]
    fn predicates_match_their_candidate_kind() {
        let version = CandidateValue::Version(Version::parse("1.2.13").unwrap());
        assert!(Predicate::Versions("1.2".parse().unwrap()).matches(&version));
        assert!(!Predicate::Versions("1.3:".parse().unwrap()).matches(&version));
        assert!(!Predicate::Member(true).matches(&version));
        assert!(Predicate::Any.matches(&version));

        let provision = CandidateValue::Provision {
            package: "mpich".to_string(),
            index: 0,
            versions: "3".parse().unwrap(),
        };
        let any_mpi3 = Predicate::Provision {
            package: None,
            versions: "3:".parse().unwrap(),
        };
        let openmpi = Predicate::Provision {
            package: Some("openmpi".to_string()),
            versions: VersionConstraint::any(),
        };
        assert!(any_mpi3.matches(&provision));
        assert!(!openmpi.matches(&provision));

        let inverted = VersionSet {
            predicate: Predicate::Edge(EdgeMode::Fork),
            inverted: true,
        };
        assert!(inverted.matches(&CandidateValue::Edge(EdgeMode::Converge)));
        assert!(!inverted.matches(&CandidateValue::Edge(EdgeMode::Fork)));
    }

    #[test]
    fn intern_string_roundtrip() {
        let mut pool = ModelPool::new();
        let id = pool.intern_string("hello".into());
        assert_eq!(pool.resolve_string(id), "hello");
    }
}
