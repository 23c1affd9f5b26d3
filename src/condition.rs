//! Structured conditions.
//!
//! Every `when=` clause, conflict and dependency target in the catalog is an
//! anonymous [`Spec`]. Before encoding, such a spec is compiled against a
//! subject node into a conjunction of [`Literal`]s, each a [`Predicate`] on
//! one [`Choice`]. The compiled form is what the builder hands to resolvo
//! and what the assembler evaluates on the final assignment.
//!
//! Semantics of the spec parts relative to the subject node:
//!
//! - `@1.2:`, `+x`, `x=a`, `%gcc`, `arch=...` constrain the subject itself;
//!   architecture is global.
//! - `^pkg...` holds when the unified node of `pkg` is a dependency of the
//!   subject, direct or transitive, and matches the node part. Build-only
//!   copies are walked through but never match.
//! - `^virtual@2:` holds when the subject depends on some provider of the
//!   virtual, and constrains the provider choice; `^[virtuals=v] pkg`
//!   requires `pkg` to be that provider.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::SolverConfig;
use crate::error::CatalogLookupError;
use crate::facts::{Facts, PackageFacts};
use crate::pool::{CandidateValue, Choice, NodeKey, Predicate, Reachable};
use crate::spec::Spec;
use crate::variant::{VariantKind, VariantValue};
use crate::version::Version;

/// One atomic fact: the choice is present and its value matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    pub choice: Choice,
    pub predicate: Predicate,
}

impl Literal {
    pub fn new(choice: Choice, predicate: Predicate) -> Self {
        Self { choice, predicate }
    }

    /// Whether the literal holds given the value assigned to its choice.
    pub fn holds(&self, value: Option<&CandidateValue>) -> bool {
        value.is_some_and(|v| self.predicate.matches(v))
    }

    /// Whether the literal's choice is decided by the subject node alone.
    pub fn is_local_to(&self, subject: &NodeKey) -> bool {
        !matches!(self.choice, Choice::Reach(..)) && self.choice.owner() == Some(subject)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.choice, &self.predicate) {
            (Choice::Node(key), Predicate::Any) => write!(f, "{key}"),
            (Choice::Node(key), p) => write!(f, "{key}{p}"),
            (Choice::Variant(key, name), Predicate::Value(v)) => {
                let mut out = String::new();
                v.write_assignment(name, false, &mut out)?;
                write!(f, "{key} {out}")
            }
            (Choice::VariantMember(key, name, value), Predicate::Member(on)) => {
                let sign = if *on { "" } else { "not " };
                write!(f, "{key} {sign}{name}={value}")
            }
            (Choice::Provider(name), p) => write!(f, "{name}{p}"),
            (Choice::Reach(..), Predicate::Any) => write!(f, "{}", self.choice),
            (choice, p) => write!(f, "{choice} {p}"),
        }
    }
}

/// What a condition may refer to during one invocation.
pub struct Scope<'a> {
    pub facts: &'a Facts,
    pub config: &'a SolverConfig,
    /// Packages that have a unified node in the model.
    pub unified: &'a BTreeSet<String>,
    /// Virtuals that have a provider choice in the model.
    pub virtuals: &'a BTreeSet<String>,
}

impl Scope<'_> {
    /// Compile `spec` into literals about `subject`.
    ///
    /// `self_version` is the subject's version when it is already fixed (the
    /// condition is being specialized for one version candidate). Returns
    /// `Ok(None)` when the spec can never hold for that version, and an error
    /// when it refers to something that does not exist.
    pub fn literals(
        &self,
        spec: &Spec,
        subject: &NodeKey,
        self_version: Option<&Version>,
    ) -> Result<Option<Vec<Literal>>, CatalogLookupError> {
        let mut out = Vec::new();
        if !self.node_literals(spec, subject, self_version, &mut out)? {
            return Ok(None);
        }
        for dep in &spec.dependencies {
            let name = dep.spec.name();
            if self.facts.get(name).is_some() {
                if !self.unified.contains(name) {
                    return Err(CatalogLookupError::UnknownPackage(name.to_string()));
                }
                let key = NodeKey::unified(name);
                out.push(reaches(subject, Reachable::Node(key.clone())));
                self.node_literals(&dep.spec, &key, None, &mut out)?;
                for virtual_name in &dep.virtuals {
                    if !self.virtuals.contains(virtual_name) {
                        return Err(CatalogLookupError::UnknownPackage(virtual_name.clone()));
                    }
                    out.push(Literal::new(
                        Choice::Provider(virtual_name.clone()),
                        Predicate::Provision {
                            package: Some(name.to_string()),
                            versions: Default::default(),
                        },
                    ));
                }
            } else if self.virtuals.contains(name) {
                out.push(reaches(subject, Reachable::Virtual(name.to_string())));
                if !dep.spec.versions.is_any() {
                    out.push(Literal::new(
                        Choice::Provider(name.to_string()),
                        Predicate::Provision {
                            package: None,
                            versions: dep.spec.versions.clone(),
                        },
                    ));
                }
            } else {
                return Err(CatalogLookupError::UnknownPackage(name.to_string()));
            }
        }
        Ok(Some(out))
    }

    /// Literals a dependency target must satisfy: presence of `target`, the
    /// target spec's own constraints, and its `^` clauses relative to the
    /// target.
    pub fn target_literals(
        &self,
        spec: &Spec,
        target: &NodeKey,
    ) -> Result<Vec<Literal>, CatalogLookupError> {
        let mut target_only = spec.clone();
        target_only.dependencies.clear();
        let mut out = vec![Literal::new(
            Choice::Node(target.clone()),
            Predicate::Any,
        )];
        self.node_literals(&target_only, target, None, &mut out)?;
        if let Some(extra) = self.literals(
            &Spec {
                dependencies: spec.dependencies.clone(),
                ..Spec::anonymous()
            },
            target,
            None,
        )? {
            out.extend(extra);
        }
        Ok(out)
    }

    /// Append literals for the node part of `spec`. Returns `false` when
    /// `self_version` rules the spec out.
    fn node_literals(
        &self,
        spec: &Spec,
        subject: &NodeKey,
        self_version: Option<&Version>,
        out: &mut Vec<Literal>,
    ) -> Result<bool, CatalogLookupError> {
        let facts = self.facts.package(&subject.package)?;

        if !spec.versions.is_any() {
            match self_version {
                Some(version) => {
                    if !spec.versions.contains(version) {
                        return Ok(false);
                    }
                }
                None => {
                    if !facts
                        .versions
                        .iter()
                        .any(|v| spec.versions.contains(&v.version))
                    {
                        return Err(CatalogLookupError::NoMatchingVersion {
                            package: subject.package.clone(),
                            constraint: spec.versions.to_string(),
                        });
                    }
                    out.push(Literal::new(
                        Choice::Node(subject.clone()),
                        Predicate::Versions(spec.versions.clone()),
                    ));
                }
            }
        }

        for (name, value) in &spec.variants {
            let value = facts.normalize_variant(name, value)?;
            out.extend(variant_literals(facts_kind(facts, name), subject, name, &value));
        }

        if let Some(compiler) = &spec.compiler {
            if !self.config.compilers.iter().any(|c| compiler.satisfied_by(c)) {
                return Err(CatalogLookupError::NoMatchingCompiler(compiler.to_string()));
            }
            out.push(Literal::new(
                Choice::Compiler(subject.clone()),
                Predicate::Compiler(compiler.clone()),
            ));
        }

        if !spec.arch.is_empty() {
            if !self.config.arches.iter().any(|a| spec.arch.satisfied_by(a)) {
                return Err(CatalogLookupError::NoMatchingArch(spec.arch.to_string()));
            }
            out.push(Literal::new(Choice::Arch, Predicate::Arch(spec.arch.clone())));
        }

        Ok(true)
    }
}

/// `subject` depends on `target`, directly or not.
pub fn reaches(subject: &NodeKey, target: Reachable) -> Literal {
    Literal::new(Choice::Reach(subject.clone(), target), Predicate::Any)
}

fn facts_kind(facts: &PackageFacts, name: &str) -> VariantKind {
    facts
        .variant(name)
        .map(|d| d.kind)
        .unwrap_or(VariantKind::Single)
}

/// Literals stating that `subject` has variant `name` set to (at least)
/// `value`. Multi-valued variants become one literal per required member.
pub fn variant_literals(
    kind: VariantKind,
    subject: &NodeKey,
    name: &str,
    value: &VariantValue,
) -> Vec<Literal> {
    match (kind, value) {
        (VariantKind::Multi, VariantValue::Values(values)) => values
            .iter()
            .map(|v| {
                Literal::new(
                    Choice::VariantMember(subject.clone(), name.to_string(), v.clone()),
                    Predicate::Member(true),
                )
            })
            .collect(),
        _ => vec![Literal::new(
            Choice::Variant(subject.clone(), name.to_string()),
            Predicate::Value(value.clone()),
        )],
    }
}

/// Cheap over-approximation used while the closure is still growing:
/// whether `spec` could hold for some node of `package`. Only the node part
/// is checked; `^` clauses are assumed satisfiable.
pub fn may_hold(spec: &Spec, facts: &Facts, package: &str, config: &SolverConfig) -> bool {
    let Some(facts) = facts.get(package) else {
        return false;
    };
    if !spec.versions.is_any()
        && !facts
            .versions
            .iter()
            .any(|v| spec.versions.contains(&v.version))
    {
        return false;
    }
    if spec
        .variants
        .iter()
        .any(|(name, value)| facts.normalize_variant(name, value).is_err())
    {
        return false;
    }
    if let Some(compiler) = &spec.compiler {
        if !config.compilers.iter().any(|c| compiler.satisfied_by(c)) {
            return false;
        }
    }
    spec.arch.is_empty() || config.arches.iter().any(|a| spec.arch.satisfied_by(a))
}
