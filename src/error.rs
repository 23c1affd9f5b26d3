//! Error taxonomy for parsing, catalog lookups and concretization.
//!
//! Every failure is a typed value. [`ConcretizeError`] is what
//! [`Concretizer::concretize`](crate::Concretizer::concretize) returns and
//! wraps one variant per failure kind so callers can tell "no solution exists"
//! apart from "the search ran out of budget".

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A version string or version range could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,

    #[error("invalid characters in version `{0}`")]
    InvalidCharacters(String),

    #[error("numeric component in version `{0}` is too large")]
    ComponentOverflow(String),

    #[error("`{0}` is an empty version range")]
    EmptyRange(String),
}

/// A spec request string is syntactically invalid.
///
/// `position` is the byte offset of `token` inside `input`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}: `{token}` at column {} of `{input}`", .position + 1)]
pub struct MalformedSpecError {
    pub message: String,
    pub token: String,
    pub position: usize,
    pub input: String,
}

/// A request references something the catalog or configuration does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogLookupError {
    #[error("unknown package `{0}`")]
    UnknownPackage(String),

    #[error("`{0}` is a virtual package and cannot be requested directly")]
    VirtualRoot(String),

    #[error("package `{package}` has no variant `{variant}`")]
    UnknownVariant { package: String, variant: String },

    #[error("`{value}` is not a valid value for variant `{variant}` of `{package}`")]
    InvalidVariantValue {
        package: String,
        variant: String,
        value: String,
    },

    #[error("no version of `{package}` matches `@{constraint}`")]
    NoMatchingVersion { package: String, constraint: String },

    #[error("no configured compiler matches `%{0}`")]
    NoMatchingCompiler(String),

    #[error("no configured architecture matches `{0}`")]
    NoMatchingArch(String),
}

/// Invalid package recipe data handed to a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("recipe `{package}`: invalid condition `{condition}`: {source}")]
    Condition {
        package: String,
        condition: String,
        #[source]
        source: MalformedSpecError,
    },

    #[error("recipe `{package}`: invalid version `{version}`: {source}")]
    Version {
        package: String,
        version: String,
        #[source]
        source: VersionError,
    },

    #[error("recipe `{package}`: {message}")]
    Invalid { package: String, message: String },

    #[error("recipe `{package}` inherits from unknown recipe `{base}`")]
    UnknownBase { package: String, base: String },

    #[error("inheritance cycle through recipe `{0}`")]
    InheritanceCycle(String),

    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The hard constraints of a request contradict each other.
///
/// `constraints` lists the user-supplied constraints of a minimal
/// contradicting subset, `conflicts` the catalog rules (conflicts,
/// requirements, bans on cycles) that take part in the contradiction and
/// `detail` the solver's derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiableError {
    pub constraints: Vec<String>,
    pub conflicts: Vec<String>,
    pub detail: String,
}

impl fmt::Display for UnsatisfiableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot satisfy")?;
        if !self.constraints.is_empty() {
            write!(f, " {}", self.constraints.join(", "))?;
        }
        for conflict in &self.conflicts {
            write!(f, "\n  conflict: {conflict}")?;
        }
        if !self.detail.is_empty() {
            write!(f, "\n{}", self.detail.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for UnsatisfiableError {}

/// Which caller-supplied bound stopped the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    /// More solver invocations than `limits.max_runs`.
    Runs(u64),
    /// More search steps than `limits.max_steps` in a single invocation.
    Steps(u64),
    /// The caller raised the cancellation flag.
    Cancelled,
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimit::Runs(n) => write!(f, "budget of {n} solver runs exhausted"),
            ResourceLimit::Steps(n) => write!(f, "step budget of {n} search steps exhausted"),
            ResourceLimit::Cancelled => write!(f, "cancelled by caller"),
        }
    }
}

/// The search stopped before it could prove or disprove satisfiability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("concretization did not finish: {limit}")]
pub struct ResourceError {
    pub limit: ResourceLimit,
}

/// A produced or loaded DAG breaks one of the structural invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invariant violated at `{node}`: {message}")]
pub struct InvariantViolationError {
    pub node: String,
    pub message: String,
}

impl InvariantViolationError {
    pub(crate) fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Everything [`Concretizer::concretize`](crate::Concretizer::concretize) can fail with.
#[derive(Debug, Error)]
pub enum ConcretizeError {
    #[error(transparent)]
    Malformed(#[from] MalformedSpecError),

    #[error(transparent)]
    CatalogLookup(#[from] CatalogLookupError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Unsatisfiable(#[from] UnsatisfiableError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolationError),
}

/// Solver configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config entry `{entry}`: {message}")]
    Invalid { entry: String, message: String },
}

/// A lock file could not be written, read or trusted.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode lock file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported lock file version {0}")]
    UnsupportedVersion(u32),

    #[error("malformed lock entry `{entry}`: {message}")]
    Malformed { entry: String, message: String },

    #[error("lock entry `{recorded}` hashes to `{computed}`")]
    HashMismatch { recorded: String, computed: String },

    #[error(transparent)]
    Lookup(#[from] CatalogLookupError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_spec_points_at_column() {
        let err = MalformedSpecError {
            message: "unexpected token".into(),
            token: "@@".into(),
            position: 4,
            input: "zlib@@1.2".into(),
        };
        assert_eq!(
            err.to_string(),
            "unexpected token: `@@` at column 5 of `zlib@@1.2`"
        );
    }

    #[test]
    fn unsatisfiable_lists_constraints_and_conflicts() {
        let err = UnsatisfiableError {
            constraints: vec!["A+x".into(), "A%gcc@4.2".into()],
            conflicts: vec!["A: %gcc@:4 conflicts with +x".into()],
            detail: String::new(),
        };
        let text = err.to_string();
        assert!(text.starts_with("cannot satisfy A+x, A%gcc@4.2"));
        assert!(text.contains("conflict: A: %gcc@:4 conflicts with +x"));
    }

    #[test]
    fn resource_error_is_distinct_from_unsat() {
        let err: ConcretizeError = ResourceError {
            limit: ResourceLimit::Cancelled,
        }
        .into();
        assert!(matches!(err, ConcretizeError::Resource(_)));
        assert!(err.to_string().contains("cancelled"));
    }
}
