//! Spack-style concretization on top of the [`resolvo`] solver.
//!
//! An abstract spec such as `hdf5+mpi %gcc@12 ^mpich` names a package and
//! constrains its version, variants, compiler, architecture and
//! dependencies. Concretization turns one or more of them into a
//! [`ConcreteDag`]: every node fully decided, every edge tagged with the
//! phases (build, link, run, test) it is needed in.
//!
//! The pipeline:
//!
//! 1. [`parse_specs`] reads the request.
//! 2. [`ModelBuilder`] pulls the relevant catalog facts out of a
//!    [`Catalog`] and compiles them into a [`ConstraintModel`].
//! 3. [`Concretizer`] searches the model with resolvo, optimizing the soft
//!    preferences of the [`SolverConfig`] lexicographically, or explains
//!    why no solution exists.
//! 4. The assignment is assembled into a [`ConcreteDag`], which is checked
//!    by [`verify`] and can be persisted as a [`Lock`].

mod assemble;
mod builder;
mod catalog;
mod condition;
mod config;
mod dag;
mod error;
mod facts;
mod lock;
mod parser;
mod pool;
mod provider;
mod recipe;
mod solver;
mod spec;
mod variant;
mod verify;
mod version;
mod version_match;

pub use builder::{ConstraintModel, ModelBuilder, Tag};
pub use catalog::{
    Catalog, ConflictRule, DependencyDeclaration, InMemoryCatalog, PackageDefinition,
    RequirePolicy, RequirementRule, VersionDeclaration, VirtualProvision,
};
pub use config::{Criterion, Limits, PackagePreferences, SolverConfig, TestDeps};
pub use dag::{ConcreteDag, ConcreteNode, DependencyEdge};
pub use error::{
    CatalogError, CatalogLookupError, ConcretizeError, ConfigError, InvariantViolationError,
    LockError, MalformedSpecError, ResourceError, ResourceLimit, UnsatisfiableError, VersionError,
};
pub use facts::{Facts, PackageFacts};
pub use lock::{LOCKFILE_VERSION, Lock};
pub use parser::{parse_spec, parse_specs};
pub use pool::{CandidateValue, Choice, EdgeMode, NodeKey, Reachable};
pub use provider::ModelProvider;
pub use recipe::{
    ConflictEntry, DependsOnEntry, PackageRecipe, ProvidesEntry, RecipeSet, RequiredSpecs,
    RequiresEntry, VariantDefault, VariantEntry, VersionEntry,
};
pub use solver::Concretizer;
pub use spec::{Arch, ArchSpec, Compiler, CompilerSpec, DepKind, DepKinds, DependencySpec, Spec};
pub use variant::{VariantDeclaration, VariantKind, VariantValue};
pub use verify::{satisfies, verify};
pub use version::{GitVersion, StandardVersion, Version};
pub use version_match::{VersionConstraint, VersionItem};
