//! Per-invocation snapshot of catalog facts.
//!
//! The builder pulls every package it reaches out of the [`Catalog`] exactly
//! once into [`Facts`]. Everything after that (encoding, search, assembly)
//! reads the snapshot only, so the catalog is never queried while solving
//! and a mutable catalog cannot change underneath one invocation.

use std::collections::BTreeMap;

use tracing::trace;

use crate::catalog::{
    Catalog, ConflictRule, DependencyDeclaration, RequirementRule, VersionDeclaration,
    VirtualProvision,
};
use crate::error::CatalogLookupError;
use crate::variant::{VariantDeclaration, VariantValue};
use crate::version::Version;

/// Every fact of one package, as it was when first loaded.
#[derive(Debug, Clone)]
pub struct PackageFacts {
    pub name: String,
    pub versions: Vec<VersionDeclaration>,
    /// One declaration per variant name, first one wins.
    pub variants: Vec<VariantDeclaration>,
    pub dependencies: Vec<DependencyDeclaration>,
    pub provides: Vec<VirtualProvision>,
    pub conflicts: Vec<ConflictRule>,
    pub requirements: Vec<RequirementRule>,
}

impl PackageFacts {
    fn query(catalog: &dyn Catalog, name: &str) -> Self {
        let mut variants: Vec<VariantDeclaration> = Vec::new();
        for decl in catalog.variants(name) {
            if !variants.iter().any(|v| v.name == decl.name) {
                variants.push(decl);
            }
        }
        Self {
            name: name.to_string(),
            versions: catalog.versions(name),
            variants,
            dependencies: catalog.dependencies(name),
            provides: catalog.provides(name),
            conflicts: catalog.conflicts(name),
            requirements: catalog.requirements(name),
        }
    }

    pub fn variant(&self, name: &str) -> Option<&VariantDeclaration> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Position of `version` in the declared version list.
    pub fn version_index(&self, version: &Version) -> Option<usize> {
        self.versions.iter().position(|v| &v.version == version)
    }

    /// Whether this package declares a provision of `virtual_name`.
    pub fn provides_virtual(&self, virtual_name: &str) -> bool {
        self.provides.iter().any(|p| p.name == virtual_name)
    }

    /// Normalize a written variant value against this package's declaration.
    pub fn normalize_variant(
        &self,
        variant: &str,
        value: &VariantValue,
    ) -> Result<VariantValue, CatalogLookupError> {
        let decl = self
            .variant(variant)
            .ok_or_else(|| CatalogLookupError::UnknownVariant {
                package: self.name.clone(),
                variant: variant.to_string(),
            })?;
        value
            .normalize(decl)
            .map_err(|value| CatalogLookupError::InvalidVariantValue {
                package: self.name.clone(),
                variant: variant.to_string(),
                value,
            })
    }
}

/// Facts of every package and virtual one invocation has touched.
#[derive(Debug, Clone, Default)]
pub struct Facts {
    packages: BTreeMap<String, PackageFacts>,
    providers: BTreeMap<String, Vec<String>>,
}

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `name` from the catalog unless already loaded. Returns whether
    /// `name` is a real package.
    pub fn load(&mut self, catalog: &dyn Catalog, name: &str) -> bool {
        if self.packages.contains_key(name) {
            return true;
        }
        if !catalog.has_package(name) {
            return false;
        }
        let facts = PackageFacts::query(catalog, name);
        trace!(
            package = name,
            versions = facts.versions.len(),
            dependencies = facts.dependencies.len(),
            "loaded package facts"
        );
        self.packages.insert(name.to_string(), facts);
        true
    }

    /// Providers of `virtual_name`, sorted by name. Cached.
    pub fn load_providers(&mut self, catalog: &dyn Catalog, virtual_name: &str) -> &[String] {
        self.providers
            .entry(virtual_name.to_string())
            .or_insert_with(|| catalog.providers_of(virtual_name))
    }

    pub fn get(&self, name: &str) -> Option<&PackageFacts> {
        self.packages.get(name)
    }

    /// Like [`Facts::get`], for names that must be known packages.
    pub fn package(&self, name: &str) -> Result<&PackageFacts, CatalogLookupError> {
        self.packages
            .get(name)
            .ok_or_else(|| CatalogLookupError::UnknownPackage(name.to_string()))
    }

    /// Providers recorded by [`Facts::load_providers`].
    pub fn providers_of(&self, virtual_name: &str) -> &[String] {
        self.providers
            .get(virtual_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether `name` was loaded as a virtual with at least one provider.
    pub fn is_virtual(&self, name: &str) -> bool {
        !self.packages.contains_key(name) && !self.providers_of(name).is_empty()
    }

    /// Loaded packages, sorted by name.
    pub fn packages(&self) -> impl Iterator<Item = &PackageFacts> {
        self.packages.values()
    }

    /// Virtuals seen so far, sorted by name.
    pub fn virtuals(&self) -> impl Iterator<Item = &str> {
        self.providers
            .iter()
            .filter(|(_, providers)| !providers.is_empty())
            .map(|(name, _)| name.as_str())
    }
}
