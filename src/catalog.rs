//! Catalog facts interface.
//!
//! [`Catalog`] is the read-only surface the concretizer queries for package
//! facts. Every declaration is plain data: a payload plus an anonymous
//! [`Spec`] condition that the engine evaluates itself.
//! [`InMemoryCatalog`] is a simple implementation backed by a `BTreeMap`,
//! filled from [`PackageRecipe`]s.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::CatalogError;
use crate::recipe::{PackageRecipe, RecipeSet};
use crate::spec::{DepKinds, Spec};
use crate::variant::VariantDeclaration;
use crate::version::Version;
use crate::version_match::VersionConstraint;

/// A version a package can be built at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDeclaration {
    pub version: Version,
    /// Chosen ahead of newer versions.
    pub preferred: bool,
    /// Chosen only when nothing else works.
    pub deprecated: bool,
}

impl VersionDeclaration {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            preferred: false,
            deprecated: false,
        }
    }
}

/// A `depends_on` fact.
///
/// `target` names a package or a virtual and carries the constraints the
/// chosen node must meet.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDeclaration {
    pub target: Spec,
    pub kinds: DepKinds,
    pub when: Spec,
}

impl DependencyDeclaration {
    pub fn new(target: Spec, kinds: DepKinds) -> Self {
        Self {
            target,
            kinds,
            when: Spec::anonymous(),
        }
    }

    pub fn when(mut self, when: Spec) -> Self {
        self.when = when;
        self
    }
}

/// A `provides` fact: the package implements `name` at capability `versions`.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualProvision {
    pub name: String,
    pub versions: VersionConstraint,
    pub when: Spec,
}

/// A `conflicts` fact: nodes matching both `conflict` and `when` are invalid.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRule {
    pub conflict: Spec,
    pub when: Spec,
    pub message: Option<String>,
}

/// How many alternatives of a `requires` rule may hold at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequirePolicy {
    /// Exactly one.
    #[default]
    OneOf,
    /// At least one.
    AnyOf,
}

/// A `requires` fact: nodes matching `when` must match one of the
/// `alternatives`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequirementRule {
    pub alternatives: Vec<Spec>,
    pub policy: RequirePolicy,
    pub when: Spec,
    pub message: Option<String>,
}

/// Every fact one package declares, already parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageDefinition {
    pub name: String,
    pub versions: Vec<VersionDeclaration>,
    pub variants: Vec<VariantDeclaration>,
    pub dependencies: Vec<DependencyDeclaration>,
    pub provides: Vec<VirtualProvision>,
    pub conflicts: Vec<ConflictRule>,
    pub requirements: Vec<RequirementRule>,
}

/// Read-only package catalog.
pub trait Catalog {
    /// Return all package names in the catalog.
    fn all_packages(&self) -> Vec<String>;

    /// Whether `name` is a real (non-virtual) package.
    fn has_package(&self, name: &str) -> bool {
        self.all_packages().iter().any(|p| p == name)
    }

    /// Versions of `package`, in catalog order.
    fn versions(&self, package: &str) -> Vec<VersionDeclaration>;

    fn variants(&self, package: &str) -> Vec<VariantDeclaration>;

    fn dependencies(&self, package: &str) -> Vec<DependencyDeclaration>;

    fn provides(&self, package: &str) -> Vec<VirtualProvision>;

    fn conflicts(&self, package: &str) -> Vec<ConflictRule>;

    fn requirements(&self, _package: &str) -> Vec<RequirementRule> {
        Vec::new()
    }

    /// Packages with at least one provision of `virtual_name`, sorted by name.
    fn providers_of(&self, virtual_name: &str) -> Vec<String> {
        let mut providers: Vec<String> = self
            .all_packages()
            .into_iter()
            .filter(|p| self.provides(p).iter().any(|v| v.name == virtual_name))
            .collect();
        providers.sort();
        providers
    }

    /// Whether `name` is a virtual: not a package, but provided by one.
    fn is_virtual(&self, name: &str) -> bool {
        !self.has_package(name) && !self.providers_of(name).is_empty()
    }
}

/// In-memory catalog of package definitions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    packages: BTreeMap<String, PackageDefinition>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse, flatten and add a set of recipes.
    pub fn from_recipes(
        recipes: impl IntoIterator<Item = PackageRecipe>,
    ) -> Result<Self, CatalogError> {
        let mut set = RecipeSet::new();
        for recipe in recipes {
            set.add(recipe);
        }
        set.build()
    }

    /// Parse a TOML catalog (`[packages.<name>]` tables).
    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        RecipeSet::from_toml_str(text)?.build()
    }

    /// Read and parse a TOML catalog file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        RecipeSet::load(path)?.build()
    }

    /// Add a definition, replacing any previous one of the same name.
    pub fn add(&mut self, definition: PackageDefinition) {
        self.packages.insert(definition.name.clone(), definition);
    }

    pub fn definition(&self, package: &str) -> Option<&PackageDefinition> {
        self.packages.get(package)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl Catalog for InMemoryCatalog {
    fn all_packages(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    fn has_package(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    fn versions(&self, package: &str) -> Vec<VersionDeclaration> {
        self.definition(package)
            .map(|r| r.versions.clone())
            .unwrap_or_default()
    }

    fn variants(&self, package: &str) -> Vec<VariantDeclaration> {
        self.definition(package)
            .map(|r| r.variants.clone())
            .unwrap_or_default()
    }

    fn dependencies(&self, package: &str) -> Vec<DependencyDeclaration> {
        self.definition(package)
            .map(|r| r.dependencies.clone())
            .unwrap_or_default()
    }

    fn provides(&self, package: &str) -> Vec<VirtualProvision> {
        self.definition(package)
            .map(|r| r.provides.clone())
            .unwrap_or_default()
    }

    fn conflicts(&self, package: &str) -> Vec<ConflictRule> {
        self.definition(package)
            .map(|r| r.conflicts.clone())
            .unwrap_or_default()
    }

    fn requirements(&self, package: &str) -> Vec<RequirementRule> {
        self.definition(package)
            .map(|r| r.requirements.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_recipes([
            PackageRecipe::new("openmpi").version("4.1").provides("mpi@3"),
            PackageRecipe::new("mpich").version("3.0").provides("mpi@3"),
            PackageRecipe::new("zlib").version("1.3").version("1.2.13"),
        ])
        .unwrap()
    }

    #[test]
    fn in_memory_add_and_query() {
        let catalog = catalog();
        assert_eq!(catalog.all_packages(), vec!["mpich", "openmpi", "zlib"]);
        let versions = catalog.versions("zlib");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, Version::parse("1.3").unwrap());
    }

    #[test]
    fn versions_for_unknown_package() {
        let catalog = catalog();
        assert!(catalog.versions("cmake").is_empty());
        assert!(!catalog.has_package("cmake"));
    }

    #[test]
    fn virtual_providers() {
        let catalog = catalog();
        assert_eq!(catalog.providers_of("mpi"), vec!["mpich", "openmpi"]);
        assert!(catalog.is_virtual("mpi"));
        assert!(!catalog.is_virtual("zlib"));
        assert!(!catalog.is_virtual("blas"));
    }
}
