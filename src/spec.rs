//! Abstract specs: what a user or a recipe asks for.
//!
//! A [`Spec`] is a conjunction of constraints on one package node plus
//! constraints on packages anywhere below it (`^name...`). With no name it
//! is an *anonymous* spec, which is how recipe conditions (`when="+mpi"`) are
//! written.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MalformedSpecError, VersionError};
use crate::variant::VariantValue;
use crate::version::Version;
use crate::version_match::VersionConstraint;

/// The phase a dependency is needed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKind {
    Build,
    Link,
    Run,
    Test,
}

impl DepKind {
    pub const ALL: [DepKind; 4] = [DepKind::Build, DepKind::Link, DepKind::Run, DepKind::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            DepKind::Build => "build",
            DepKind::Link => "link",
            DepKind::Run => "run",
            DepKind::Test => "test",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DepKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A set of [`DepKind`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepKinds(u8);

impl DepKinds {
    pub const BUILD: DepKinds = DepKinds(1);
    pub const LINK: DepKinds = DepKinds(2);
    pub const RUN: DepKinds = DepKinds(4);
    pub const TEST: DepKinds = DepKinds(8);
    /// What a dependency declaration gets when it names no kinds.
    pub const DEFAULT: DepKinds = DepKinds(1 | 2);

    pub fn empty() -> Self {
        DepKinds(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: DepKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn union(self, other: DepKinds) -> DepKinds {
        DepKinds(self.0 | other.0)
    }

    pub fn without(self, other: DepKinds) -> DepKinds {
        DepKinds(self.0 & !other.0)
    }

    /// Whether every kind in `other` is also in `self`.
    pub fn covers(self, other: DepKinds) -> bool {
        self.0 & other.0 == other.0
    }

    /// Build-only edges may resolve to a separate node of the same package.
    pub fn is_build_only(self) -> bool {
        self == DepKinds::BUILD
    }

    pub fn iter(self) -> impl Iterator<Item = DepKind> {
        DepKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<DepKind> for DepKinds {
    fn from(kind: DepKind) -> Self {
        DepKinds(kind.bit())
    }
}

impl FromIterator<DepKind> for DepKinds {
    fn from_iter<I: IntoIterator<Item = DepKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(DepKinds::empty(), |acc, k| acc.union(k.into()))
    }
}

impl fmt::Display for DepKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{kind}")?;
        }
        Ok(())
    }
}

impl FromStr for DepKinds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(|k| k.trim().parse::<DepKind>())
            .collect::<Result<DepKinds, _>>()
    }
}

/// A constraint on the compiler used to build a node: `%gcc@12:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilerSpec {
    pub name: String,
    pub versions: VersionConstraint,
}

impl CompilerSpec {
    pub fn satisfied_by(&self, compiler: &Compiler) -> bool {
        self.name == compiler.name && self.versions.contains(&compiler.version)
    }
}

impl fmt::Display for CompilerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        Ok(())
    }
}

/// A concrete compiler: `gcc@12.1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Compiler {
    pub name: String,
    pub version: Version,
}

impl Compiler {
    /// The spec that matches exactly this compiler.
    pub fn to_spec(&self) -> CompilerSpec {
        CompilerSpec {
            name: self.name.clone(),
            versions: VersionConstraint::exact(self.version.clone()),
        }
    }
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for Compiler {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s.split_once('@').ok_or(VersionError::Empty)?;
        Ok(Self {
            name: name.trim().to_string(),
            version: Version::parse(version)?,
        })
    }
}

impl TryFrom<String> for Compiler {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Compiler> for String {
    fn from(compiler: Compiler) -> Self {
        compiler.to_string()
    }
}

/// A constraint on the platform/os/target triple. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ArchSpec {
    pub platform: Option<String>,
    pub os: Option<String>,
    pub target: Option<String>,
}

impl ArchSpec {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }

    pub fn satisfied_by(&self, arch: &Arch) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }
        field(&self.platform, &arch.platform)
            && field(&self.os, &arch.os)
            && field(&self.target, &arch.target)
    }

    /// Parse the value of `arch=platform-os-target`.
    pub fn from_triple(triple: &str) -> Option<Self> {
        let mut parts = triple.splitn(3, '-');
        let field = |p: Option<&str>| p.filter(|s| !s.is_empty()).map(String::from);
        let spec = Self {
            platform: field(parts.next()),
            os: field(parts.next()),
            target: field(parts.next()),
        };
        (!spec.is_empty()).then_some(spec)
    }
}

impl fmt::Display for ArchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.platform, &self.os, &self.target) {
            (Some(p), Some(o), Some(t)) => write!(f, "arch={p}-{o}-{t}"),
            (platform, os, target) => {
                let mut sep = "";
                for (key, value) in [("platform", platform), ("os", os), ("target", target)] {
                    if let Some(value) = value {
                        write!(f, "{sep}{key}={value}")?;
                        sep = " ";
                    }
                }
                Ok(())
            }
        }
    }
}

/// A concrete architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Arch {
    pub platform: String,
    pub os: String,
    pub target: String,
}

impl Arch {
    pub fn to_spec(&self) -> ArchSpec {
        ArchSpec {
            platform: Some(self.platform.clone()),
            os: Some(self.os.clone()),
            target: Some(self.target.clone()),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.platform, self.os, self.target)
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match ArchSpec::from_triple(s) {
            Some(ArchSpec {
                platform: Some(platform),
                os: Some(os),
                target: Some(target),
            }) => Ok(Self {
                platform,
                os,
                target,
            }),
            _ => Err(format!("`{s}` is not a platform-os-target triple")),
        }
    }
}

impl TryFrom<String> for Arch {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Arch> for String {
    fn from(arch: Arch) -> Self {
        arch.to_string()
    }
}

/// A `^` dependency constraint, with the optional `[virtuals=... deptypes=...]`
/// edge properties.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencySpec {
    pub spec: Spec,
    pub kinds: Option<DepKinds>,
    pub virtuals: Vec<String>,
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^")?;
        if self.kinds.is_some() || !self.virtuals.is_empty() {
            write!(f, "[")?;
            let mut sep = "";
            if let Some(kinds) = self.kinds {
                write!(f, "deptypes={kinds}")?;
                sep = " ";
            }
            if !self.virtuals.is_empty() {
                write!(f, "{sep}virtuals={}", self.virtuals.join(","))?;
            }
            write!(f, "] ")?;
        }
        write!(f, "{}", self.spec)
    }
}

/// An abstract spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Spec {
    pub name: Option<String>,
    pub versions: VersionConstraint,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: Option<CompilerSpec>,
    pub arch: ArchSpec,
    pub dependencies: Vec<DependencySpec>,
    /// Variants written `++x`, `~~x` or `k==v`: they also apply to every
    /// dependency that has them.
    pub propagated: BTreeSet<String>,
}

impl Spec {
    /// A spec with no name and no constraints. As a condition it always holds.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Parse exactly one spec, see [`crate::parser`].
    pub fn parse(input: &str) -> Result<Self, MalformedSpecError> {
        crate::parser::parse_spec(input)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Whether this spec constrains nothing.
    pub fn is_unconstrained(&self) -> bool {
        self.versions.is_any()
            && self.variants.is_empty()
            && self.compiler.is_none()
            && self.arch.is_empty()
            && self.dependencies.is_empty()
    }

    /// The `^name` constraint on `name`, if any.
    pub fn dependency(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|d| d.spec.name() == name)
    }

    /// Builder: add a version constraint.
    pub fn with_versions(mut self, versions: VersionConstraint) -> Self {
        self.versions = versions;
        self
    }

    /// Builder: add a variant constraint.
    pub fn with_variant(mut self, name: impl Into<String>, value: VariantValue) -> Self {
        self.variants.insert(name.into(), value);
        self
    }

    /// Write the node part (no `^` dependencies).
    pub fn write_node(&self, f: &mut impl fmt::Write) -> fmt::Result {
        let mut started = false;
        if let Some(name) = &self.name {
            write!(f, "{name}")?;
            started = true;
        }
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
            started = true;
        }
        for (name, value) in &self.variants {
            if let VariantValue::Bool(_) = value {
                value.write_assignment(name, self.propagated.contains(name), f)?;
                started = true;
            }
        }
        for (name, value) in &self.variants {
            if let VariantValue::Values(_) = value {
                space(f, &mut started)?;
                value.write_assignment(name, self.propagated.contains(name), f)?;
            }
        }
        if let Some(compiler) = &self.compiler {
            space(f, &mut started)?;
            write!(f, "%{compiler}")?;
        }
        if !self.arch.is_empty() {
            space(f, &mut started)?;
            write!(f, "{}", self.arch)?;
        }
        Ok(())
    }
}

fn space(f: &mut impl fmt::Write, started: &mut bool) -> fmt::Result {
    if std::mem::replace(started, true) {
        f.write_str(" ")
    } else {
        Ok(())
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut node = String::new();
        self.write_node(&mut node)?;
        f.write_str(&node)?;
        let mut sep = if node.is_empty() { "" } else { " " };
        for dep in &self.dependencies {
            write!(f, "{sep}{dep}")?;
            sep = " ";
        }
        Ok(())
    }
}

impl FromStr for Spec {
    type Err = MalformedSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Spec::parse(s)
    }
}

impl TryFrom<String> for Spec {
    type Error = MalformedSpecError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Spec::parse(&s)
    }
}

impl From<Spec> for String {
    fn from(spec: Spec) -> Self {
        spec.to_string()
    }
}
