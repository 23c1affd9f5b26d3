//! Declarative package recipes.
//!
//! A [`PackageRecipe`] is the raw, string-typed form of a package's facts, as
//! written in a TOML catalog or built in code:
//!
//! ```toml
//! [packages.hdf5]
//! inherits = ["cmake-package"]
//! version = ["1.14.3", { version = "1.12.2", preferred = true }]
//!
//! [[packages.hdf5.variant]]
//! name = "mpi"
//! default = true
//!
//! [[packages.hdf5.depends_on]]
//! spec = "mpi"
//! when = "+mpi"
//!
//! [[packages.hdf5.conflicts]]
//! spec = "%gcc@:4"
//! when = "+mpi"
//! msg = "needs C11 atomics"
//!
//! [[packages.hdf5.requires]]
//! spec = ["%gcc", "%clang"]
//! policy = "any_of"
//! when = "+fortran"
//! ```
//!
//! A [`RecipeSet`] resolves `inherits` once, base declarations first, and
//! turns every recipe into a typed [`PackageDefinition`]. Recipes marked
//! `base = true` only exist to be inherited from and never become packages.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{
    ConflictRule, DependencyDeclaration, InMemoryCatalog, PackageDefinition, RequirePolicy,
    RequirementRule, VersionDeclaration, VirtualProvision,
};
use crate::error::CatalogError;
use crate::parser::parse_spec;
use crate::spec::{DepKind, DepKinds, Spec};
use crate::variant::{VariantDeclaration, VariantKind, VariantValue};
use crate::version::Version;

/// A `version` entry: a bare string or a table with flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionEntry {
    Plain(String),
    Detailed {
        version: String,
        #[serde(default)]
        preferred: bool,
        #[serde(default)]
        deprecated: bool,
    },
}

impl VersionEntry {
    fn text(&self) -> &str {
        match self {
            VersionEntry::Plain(v) => v,
            VersionEntry::Detailed { version, .. } => version,
        }
    }
}

/// The `default` of a variant entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantDefault {
    Bool(bool),
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantEntry {
    pub name: String,
    pub default: VariantDefault,
    /// Allowed values; absent for boolean variants.
    #[serde(default)]
    pub values: Option<Vec<String>>,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependsOnEntry {
    pub spec: String,
    /// Dependency kinds; `["build", "link"]` when absent.
    #[serde(default, rename = "type")]
    pub kinds: Option<Vec<String>>,
    #[serde(default)]
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidesEntry {
    pub spec: String,
    #[serde(default)]
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConflictEntry {
    pub spec: String,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub msg: Option<String>,
}

/// The `spec` of a requires entry: one spec or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequiredSpecs {
    One(String),
    Any(Vec<String>),
}

impl RequiredSpecs {
    fn texts(&self) -> &[String] {
        match self {
            RequiredSpecs::One(spec) => std::slice::from_ref(spec),
            RequiredSpecs::Any(specs) => specs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequiresEntry {
    pub spec: RequiredSpecs,
    /// `one_of` (the default) or `any_of`.
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub msg: Option<String>,
}

/// The raw facts of one package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageRecipe {
    #[serde(skip)]
    pub name: String,
    pub base: bool,
    pub inherits: Vec<String>,
    #[serde(rename = "version")]
    pub versions: Vec<VersionEntry>,
    #[serde(rename = "variant")]
    pub variants: Vec<VariantEntry>,
    pub depends_on: Vec<DependsOnEntry>,
    pub provides: Vec<ProvidesEntry>,
    pub conflicts: Vec<ConflictEntry>,
    pub requires: Vec<RequiresEntry>,
}

impl PackageRecipe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Mark the recipe as inheritable only.
    pub fn base(mut self) -> Self {
        self.base = true;
        self
    }

    pub fn inherits(mut self, base: &str) -> Self {
        self.inherits.push(base.to_string());
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.versions.push(VersionEntry::Plain(version.to_string()));
        self
    }

    pub fn preferred_version(mut self, version: &str) -> Self {
        self.versions.push(VersionEntry::Detailed {
            version: version.to_string(),
            preferred: true,
            deprecated: false,
        });
        self
    }

    pub fn deprecated_version(mut self, version: &str) -> Self {
        self.versions.push(VersionEntry::Detailed {
            version: version.to_string(),
            preferred: false,
            deprecated: true,
        });
        self
    }

    /// A boolean variant.
    pub fn variant(self, name: &str, default: bool) -> Self {
        self.variant_entry(VariantEntry {
            name: name.to_string(),
            default: VariantDefault::Bool(default),
            values: None,
            multi: false,
            when: String::new(),
            description: None,
        })
    }

    /// A single-valued variant.
    pub fn variant_values(self, name: &str, default: &str, values: &[&str]) -> Self {
        self.variant_entry(VariantEntry {
            name: name.to_string(),
            default: VariantDefault::One(default.to_string()),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
            multi: false,
            when: String::new(),
            description: None,
        })
    }

    /// A multi-valued variant.
    pub fn multi_variant(self, name: &str, default: &[&str], values: &[&str]) -> Self {
        self.variant_entry(VariantEntry {
            name: name.to_string(),
            default: VariantDefault::Many(default.iter().map(|v| v.to_string()).collect()),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
            multi: true,
            when: String::new(),
            description: None,
        })
    }

    /// A boolean variant that only exists when `when` holds.
    pub fn variant_when(self, name: &str, default: bool, when: &str) -> Self {
        self.variant_entry(VariantEntry {
            name: name.to_string(),
            default: VariantDefault::Bool(default),
            values: None,
            multi: false,
            when: when.to_string(),
            description: None,
        })
    }

    pub fn variant_entry(mut self, entry: VariantEntry) -> Self {
        self.variants.push(entry);
        self
    }

    /// `kinds` is a comma-separated list such as `"build,link"`; empty means
    /// the default kinds.
    pub fn depends_on(self, spec: &str, kinds: &str) -> Self {
        self.depends_on_when(spec, kinds, "")
    }

    pub fn depends_on_when(mut self, spec: &str, kinds: &str, when: &str) -> Self {
        let kinds = (!kinds.is_empty())
            .then(|| kinds.split(',').map(|k| k.trim().to_string()).collect());
        self.depends_on.push(DependsOnEntry {
            spec: spec.to_string(),
            kinds,
            when: when.to_string(),
        });
        self
    }

    /// `spec` is `virtual[@capability-versions]`.
    pub fn provides(self, spec: &str) -> Self {
        self.provides_when(spec, "")
    }

    pub fn provides_when(mut self, spec: &str, when: &str) -> Self {
        self.provides.push(ProvidesEntry {
            spec: spec.to_string(),
            when: when.to_string(),
        });
        self
    }

    pub fn conflicts(self, spec: &str, when: &str) -> Self {
        self.conflicts_msg(spec, when, None)
    }

    pub fn conflicts_msg(mut self, spec: &str, when: &str, msg: Option<&str>) -> Self {
        self.conflicts.push(ConflictEntry {
            spec: spec.to_string(),
            when: when.to_string(),
            msg: msg.map(String::from),
        });
        self
    }

    /// Nodes matching `when` must match exactly one of `specs`.
    pub fn requires(self, specs: &[&str], when: &str) -> Self {
        self.requires_entry(RequiresEntry {
            spec: RequiredSpecs::Any(specs.iter().map(|s| s.to_string()).collect()),
            policy: None,
            when: when.to_string(),
            msg: None,
        })
    }

    /// Nodes matching `when` must match at least one of `specs`.
    pub fn requires_any_of(self, specs: &[&str], when: &str) -> Self {
        self.requires_entry(RequiresEntry {
            spec: RequiredSpecs::Any(specs.iter().map(|s| s.to_string()).collect()),
            policy: Some("any_of".to_string()),
            when: when.to_string(),
            msg: None,
        })
    }

    pub fn requires_entry(mut self, entry: RequiresEntry) -> Self {
        self.requires.push(entry);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    packages: BTreeMap<String, PackageRecipe>,
}

/// A set of recipes to be flattened into a catalog.
#[derive(Debug, Clone, Default)]
pub struct RecipeSet {
    recipes: BTreeMap<String, PackageRecipe>,
}

impl RecipeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, recipe: PackageRecipe) {
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(text)?;
        let mut set = Self::new();
        for (name, mut recipe) in file.packages {
            recipe.name = name;
            set.add(recipe);
        }
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Flatten inheritance, parse every entry and collect the non-base
    /// recipes into a catalog.
    pub fn build(&self) -> Result<InMemoryCatalog, CatalogError> {
        let mut catalog = InMemoryCatalog::new();
        for recipe in self.recipes.values().filter(|r| !r.base) {
            let flat = self.flatten(&recipe.name, &mut BTreeSet::new())?;
            catalog.add(definition(&recipe.name, &flat)?);
        }
        debug!(packages = catalog.len(), "built catalog from recipes");
        Ok(catalog)
    }

    /// The recipe with every inherited entry prepended, bases in order.
    fn flatten(
        &self,
        name: &str,
        visiting: &mut BTreeSet<String>,
    ) -> Result<PackageRecipe, CatalogError> {
        if !visiting.insert(name.to_string()) {
            return Err(CatalogError::InheritanceCycle(name.to_string()));
        }
        let recipe = &self.recipes[name];
        let mut flat = PackageRecipe::new(name);
        for base in &recipe.inherits {
            if !self.recipes.contains_key(base) {
                return Err(CatalogError::UnknownBase {
                    package: name.to_string(),
                    base: base.clone(),
                });
            }
            let inherited = self.flatten(base, visiting)?;
            flat.versions.extend(inherited.versions);
            flat.variants.extend(inherited.variants);
            flat.depends_on.extend(inherited.depends_on);
            flat.provides.extend(inherited.provides);
            flat.conflicts.extend(inherited.conflicts);
            flat.requires.extend(inherited.requires);
        }
        visiting.remove(name);

        flat.versions.extend(recipe.versions.iter().cloned());
        // A variant redeclared by the package replaces the inherited one.
        flat.variants
            .retain(|v| !recipe.variants.iter().any(|own| own.name == v.name));
        flat.variants.extend(recipe.variants.iter().cloned());
        flat.depends_on.extend(recipe.depends_on.iter().cloned());
        flat.provides.extend(recipe.provides.iter().cloned());
        flat.conflicts.extend(recipe.conflicts.iter().cloned());
        flat.requires.extend(recipe.requires.iter().cloned());
        Ok(flat)
    }
}

fn condition(package: &str, text: &str) -> Result<Spec, CatalogError> {
    parse_spec(text).map_err(|source| CatalogError::Condition {
        package: package.to_string(),
        condition: text.to_string(),
        source,
    })
}

fn invalid(package: &str, message: String) -> CatalogError {
    CatalogError::Invalid {
        package: package.to_string(),
        message,
    }
}

fn definition(name: &str, recipe: &PackageRecipe) -> Result<PackageDefinition, CatalogError> {
    let mut def = PackageDefinition {
        name: name.to_string(),
        ..PackageDefinition::default()
    };

    for entry in &recipe.versions {
        let version = Version::parse(entry.text()).map_err(|source| CatalogError::Version {
            package: name.to_string(),
            version: entry.text().to_string(),
            source,
        })?;
        if def.versions.iter().any(|d| d.version == version) {
            continue;
        }
        let (preferred, deprecated) = match entry {
            VersionEntry::Plain(_) => (false, false),
            VersionEntry::Detailed {
                preferred,
                deprecated,
                ..
            } => (*preferred, *deprecated),
        };
        def.versions.push(VersionDeclaration {
            version,
            preferred,
            deprecated,
        });
    }

    for entry in &recipe.variants {
        def.variants.push(variant(name, entry)?);
    }

    for entry in &recipe.depends_on {
        let target = condition(name, &entry.spec)?;
        if target.name.is_none() {
            return Err(invalid(name, format!("dependency `{}` names no package", entry.spec)));
        }
        let kinds = match &entry.kinds {
            None => DepKinds::DEFAULT,
            Some(kinds) => kinds
                .iter()
                .map(|k| k.parse::<DepKind>())
                .collect::<Result<DepKinds, _>>()
                .map_err(|k| invalid(name, format!("unknown dependency type `{k}`")))?,
        };
        if kinds.is_empty() {
            return Err(invalid(name, format!("dependency `{}` has no type", entry.spec)));
        }
        def.dependencies.push(DependencyDeclaration {
            target,
            kinds,
            when: condition(name, &entry.when)?,
        });
    }

    for entry in &recipe.provides {
        let spec = condition(name, &entry.spec)?;
        let Some(virtual_name) = spec.name.clone() else {
            return Err(invalid(name, format!("provision `{}` names no virtual", entry.spec)));
        };
        def.provides.push(VirtualProvision {
            name: virtual_name,
            versions: spec.versions,
            when: condition(name, &entry.when)?,
        });
    }

    for entry in &recipe.conflicts {
        let conflict = own_condition(name, &entry.spec, "conflict")?;
        def.conflicts.push(ConflictRule {
            conflict,
            when: condition(name, &entry.when)?,
            message: entry.msg.clone(),
        });
    }

    for entry in &recipe.requires {
        let texts = entry.spec.texts();
        if texts.is_empty() {
            return Err(invalid(name, "requirement lists no spec".to_string()));
        }
        let alternatives = texts
            .iter()
            .map(|text| own_condition(name, text, "requirement"))
            .collect::<Result<Vec<_>, _>>()?;
        let policy = match entry.policy.as_deref() {
            None | Some("one_of") => RequirePolicy::OneOf,
            Some("any_of") => RequirePolicy::AnyOf,
            Some(other) => {
                return Err(invalid(name, format!("unknown requirement policy `{other}`")));
            }
        };
        def.requirements.push(RequirementRule {
            alternatives,
            policy,
            when: condition(name, &entry.when)?,
            message: entry.msg.clone(),
        });
    }

    Ok(def)
}

/// A condition on the package itself, optionally written with its own name
/// as in `conflicts("pkg+x")`.
fn own_condition(package: &str, text: &str, what: &str) -> Result<Spec, CatalogError> {
    let mut spec = condition(package, text)?;
    if spec.name.as_deref() == Some(package) {
        spec.name = None;
    }
    if spec.name.is_some() {
        return Err(invalid(
            package,
            format!("{what} `{text}` must constrain the package itself"),
        ));
    }
    Ok(spec)
}

fn variant(package: &str, entry: &VariantEntry) -> Result<VariantDeclaration, CatalogError> {
    let (kind, default) = match (&entry.values, &entry.default, entry.multi) {
        (None, VariantDefault::Bool(b), _) => (VariantKind::Bool, VariantValue::Bool(*b)),
        (Some(_), VariantDefault::One(v), false) => {
            (VariantKind::Single, VariantValue::single(v.clone()))
        }
        (Some(_), VariantDefault::One(v), true) => {
            (VariantKind::Multi, VariantValue::single(v.clone()))
        }
        (Some(_), VariantDefault::Many(vs), true) => (
            VariantKind::Multi,
            VariantValue::Values(vs.iter().cloned().collect()),
        ),
        _ => {
            return Err(invalid(
                package,
                format!("variant `{}` has an inconsistent default", entry.name),
            ));
        }
    };
    let decl = VariantDeclaration {
        name: entry.name.clone(),
        kind,
        default,
        allowed: entry.values.clone().unwrap_or_default(),
        when: condition(package, &entry.when)?,
        description: entry.description.clone(),
    };
    decl.default.normalize(&decl).map_err(|bad| {
        invalid(
            package,
            format!("default `{bad}` of variant `{}` is not allowed", entry.name),
        )
    })?;
    Ok(decl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn builder_recipe_to_definition() {
        let catalog = InMemoryCatalog::from_recipes([PackageRecipe::new("A")
            .version("2.0")
            .preferred_version("1.0")
            .variant("x", false)
            .depends_on("B@:1.0", "build")
            .depends_on_when("mpi", "", "+x")
            .conflicts_msg("%gcc@:4", "+x", Some("x needs a newer compiler"))])
        .unwrap();

        let def = catalog.definition("A").unwrap();
        assert_eq!(def.versions.len(), 2);
        assert!(def.versions[1].preferred);
        assert_eq!(def.dependencies[0].kinds, DepKinds::BUILD);
        assert_eq!(def.dependencies[1].kinds, DepKinds::DEFAULT);
        assert_eq!(def.dependencies[1].when.variants["x"], VariantValue::Bool(true));
        assert_eq!(
            def.conflicts[0].message.as_deref(),
            Some("x needs a newer compiler")
        );
    }

    #[test]
    fn toml_catalog() {
        let text = r#"
            [packages.openmpi]
            version = ["4.1.5", { version = "4.0.7", deprecated = true }]

            [[packages.openmpi.provides]]
            spec = "mpi@3"

            [[packages.openmpi.variant]]
            name = "fabrics"
            default = ["auto"]
            values = ["auto", "ucx", "ofi"]
            multi = true

            [[packages.openmpi.depends_on]]
            spec = "ucx"
            type = ["build", "link"]
            when = "fabrics=ucx"

            [packages.ucx]
            version = ["1.15"]
        "#;
        let catalog = InMemoryCatalog::from_toml_str(text).unwrap();
        assert_eq!(catalog.all_packages(), vec!["openmpi", "ucx"]);
        let versions = catalog.versions("openmpi");
        assert!(versions[1].deprecated);
        let variants = catalog.variants("openmpi");
        assert_eq!(variants[0].kind, VariantKind::Multi);
        assert_eq!(catalog.providers_of("mpi"), vec!["openmpi"]);
    }

    #[test]
    fn inheritance_flattens_base_first() {
        let catalog = InMemoryCatalog::from_recipes([
            PackageRecipe::new("cmake-package")
                .base()
                .variant("shared", true)
                .depends_on("cmake", "build"),
            PackageRecipe::new("zlib-ng")
                .inherits("cmake-package")
                .version("2.1")
                .variant("shared", false),
            PackageRecipe::new("cmake").version("3.27"),
        ])
        .unwrap();

        assert!(!catalog.has_package("cmake-package"));
        let variants = catalog.variants("zlib-ng");
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].default, VariantValue::Bool(false));
        let deps = catalog.dependencies("zlib-ng");
        assert_eq!(deps[0].target.name(), "cmake");
    }

    #[test]
    fn inheritance_errors() {
        let cycle = InMemoryCatalog::from_recipes([
            PackageRecipe::new("a").inherits("b"),
            PackageRecipe::new("b").inherits("a"),
        ]);
        assert!(matches!(cycle, Err(CatalogError::InheritanceCycle(_))));

        let missing = InMemoryCatalog::from_recipes([PackageRecipe::new("a").inherits("nope")]);
        assert!(matches!(missing, Err(CatalogError::UnknownBase { .. })));
    }

    #[test]
    fn invalid_entries() {
        let bad_default = InMemoryCatalog::from_recipes([PackageRecipe::new("a")
            .version("1")
            .variant_values("mode", "fast", &["slow", "safe"])]);
        assert!(matches!(bad_default, Err(CatalogError::Invalid { .. })));

        let bad_condition = InMemoryCatalog::from_recipes([PackageRecipe::new("a")
            .version("1")
            .depends_on_when("b", "", "+x +")]);
        assert!(matches!(bad_condition, Err(CatalogError::Condition { .. })));

        let bad_kind = InMemoryCatalog::from_recipes([PackageRecipe::new("a")
            .version("1")
            .depends_on("b", "install")]);
        assert!(matches!(bad_kind, Err(CatalogError::Invalid { .. })));

        let foreign = InMemoryCatalog::from_recipes([PackageRecipe::new("a")
            .version("1")
            .requires(&["b+x"], "")]);
        assert!(matches!(foreign, Err(CatalogError::Invalid { .. })));
    }

    #[test]
    fn requirements_from_builder_and_toml() {
        let catalog = InMemoryCatalog::from_recipes([PackageRecipe::new("a")
            .version("1")
            .variant("x", false)
            .requires(&["a%gcc", "%clang"], "+x")
            .requires_any_of(&["@1"], "")])
        .unwrap();
        let rules = catalog.requirements("a");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].policy, RequirePolicy::OneOf);
        assert_eq!(rules[0].alternatives[0].name, None);
        assert_eq!(rules[0].alternatives[1].to_string(), "%clang");
        assert_eq!(rules[1].policy, RequirePolicy::AnyOf);

        let text = r#"
            [packages.hdf5]
            version = ["1.14"]

            [[packages.hdf5.variant]]
            name = "fortran"
            default = false

            [[packages.hdf5.requires]]
            spec = "%gcc"
            when = "+fortran"
            msg = "only gfortran is supported"

            [[packages.hdf5.requires]]
            spec = ["%gcc", "%clang"]
            policy = "any_of"
        "#;
        let catalog = InMemoryCatalog::from_toml_str(text).unwrap();
        let rules = catalog.requirements("hdf5");
        assert_eq!(rules[0].alternatives.len(), 1);
        assert_eq!(rules[0].message.as_deref(), Some("only gfortran is supported"));
        assert_eq!(rules[1].alternatives.len(), 2);
        assert_eq!(rules[1].policy, RequirePolicy::AnyOf);

        let bad = InMemoryCatalog::from_toml_str(
            r#"
            [packages.a]
            version = ["1"]

            [[packages.a.requires]]
            spec = "@1"
            policy = "some_of"
        "#,
        );
        assert!(matches!(bad, Err(CatalogError::Invalid { .. })));
    }
}
