//! Solver configuration.
//!
//! [`SolverConfig`] holds everything that is site policy rather than package
//! data: which compilers and architectures exist, which providers and
//! versions are preferred, the order of the optimization criteria and the
//! search budgets. It deserializes from TOML:
//!
//! ```toml
//! compilers = ["gcc@12.1.0", "clang@16.0.0"]
//! arches = ["linux-ubuntu22.04-x86_64"]
//! criteria = ["duplicates", "versions", "variant-defaults", "providers", "compilers", "targets"]
//! tests = "roots"
//!
//! [providers]
//! mpi = ["openmpi", "mpich"]
//!
//! [packages.zlib]
//! version = ["1.2.13"]
//! variants = "+shared"
//!
//! [limits]
//! max_runs = 5000
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::spec::{Arch, Compiler, Spec};
use crate::version_match::VersionConstraint;

/// One optimization criterion. Criteria are optimized lexicographically in
/// the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criterion {
    /// Prefer converging build-only edges onto the shared node over
    /// building a separate copy.
    Duplicates,
    /// Prefer preferred, then newer, non-deprecated versions.
    Versions,
    /// Prefer declared (or configured) variant defaults.
    VariantDefaults,
    /// Prefer configured virtual providers.
    Providers,
    /// Prefer compilers earlier in the configured list.
    Compilers,
    /// Prefer architectures earlier in the configured list.
    Targets,
}

impl Criterion {
    pub const DEFAULT_ORDER: [Criterion; 6] = [
        Criterion::Duplicates,
        Criterion::Versions,
        Criterion::VariantDefaults,
        Criterion::Providers,
        Criterion::Compilers,
        Criterion::Targets,
    ];
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Criterion::Duplicates => "duplicates",
            Criterion::Versions => "versions",
            Criterion::VariantDefaults => "variant-defaults",
            Criterion::Providers => "providers",
            Criterion::Compilers => "compilers",
            Criterion::Targets => "targets",
        };
        f.write_str(name)
    }
}

/// Which `test` dependencies take part in concretization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestDeps {
    /// Test-only dependencies are ignored, and `test` is dropped from mixed
    /// kinds.
    #[default]
    None,
    /// Only the roots get their test dependencies.
    Roots,
    /// Every node gets its test dependencies.
    All,
}

/// Search budgets. Exceeding one is a resource error, never an
/// unsatisfiability claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Solver invocations allowed for one concretization, explanation
    /// included.
    pub max_runs: u64,
    /// Search steps allowed inside a single solver invocation.
    pub max_steps: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_runs: 10_000,
            max_steps: 1_000_000,
        }
    }
}

/// Per-package preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagePreferences {
    /// Versions to try first, best first.
    pub version: Vec<VersionConstraint>,
    /// Preferred variant settings as an anonymous spec, e.g. `+shared~debug`.
    pub variants: Spec,
}

/// Site policy for one or more concretizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Available compilers, most preferred first.
    pub compilers: Vec<Compiler>,
    /// Available architectures, most preferred first.
    pub arches: Vec<Arch>,
    pub criteria: Vec<Criterion>,
    pub tests: TestDeps,
    /// Preferred providers per virtual, most preferred first.
    pub providers: BTreeMap<String, Vec<String>>,
    pub packages: BTreeMap<String, PackagePreferences>,
    pub limits: Limits,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            compilers: "gcc@12.1.0".parse::<Compiler>().into_iter().collect(),
            arches: vec![Arch {
                platform: "linux".to_string(),
                os: "ubuntu22.04".to_string(),
                target: "x86_64".to_string(),
            }],
            criteria: Criterion::DEFAULT_ORDER.to_vec(),
            tests: TestDeps::None,
            providers: BTreeMap::new(),
            packages: BTreeMap::new(),
            limits: Limits::default(),
        }
    }
}

impl SolverConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SolverConfig = toml::from_str(text)?;
        config.validated()
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration and complete the criteria list.
    ///
    /// Criteria not listed are appended in their default order, so every
    /// choice is still decided deterministically.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.compilers.is_empty() {
            return Err(ConfigError::Invalid {
                entry: "compilers".to_string(),
                message: "at least one compiler is required".to_string(),
            });
        }
        if self.arches.is_empty() {
            return Err(ConfigError::Invalid {
                entry: "arches".to_string(),
                message: "at least one architecture is required".to_string(),
            });
        }
        let mut seen = Vec::new();
        for criterion in &self.criteria {
            if seen.contains(criterion) {
                return Err(ConfigError::Invalid {
                    entry: "criteria".to_string(),
                    message: format!("`{criterion}` is listed twice"),
                });
            }
            seen.push(*criterion);
        }
        for criterion in Criterion::DEFAULT_ORDER {
            if !self.criteria.contains(&criterion) {
                self.criteria.push(criterion);
            }
        }
        for (package, prefs) in &self.packages {
            if prefs.variants.name.is_some() || !prefs.variants.dependencies.is_empty() {
                return Err(ConfigError::Invalid {
                    entry: format!("packages.{package}.variants"),
                    message: "expected variant settings only, like `+shared~debug`".to_string(),
                });
            }
        }
        Ok(self)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Invalid {
            entry: "<config>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn package(&self, name: &str) -> Option<&PackagePreferences> {
        self.packages.get(name)
    }

    /// Configured providers for `virtual_name`, most preferred first.
    pub fn preferred_providers(&self, virtual_name: &str) -> &[String] {
        self.providers
            .get(virtual_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::VariantValue;

    #[test]
    fn default_config_is_valid() {
        let config = SolverConfig::default().validated().unwrap();
        assert_eq!(config.compilers[0].to_string(), "gcc@12.1.0");
        assert_eq!(config.arches[0].to_string(), "linux-ubuntu22.04-x86_64");
        assert_eq!(config.criteria, Criterion::DEFAULT_ORDER.to_vec());
    }

    #[test]
    fn parse_full_document() {
        let config = SolverConfig::from_toml_str(
            r#"
            compilers = ["clang@16.0.0", "gcc@12.1.0"]
            arches = ["linux-rhel9-zen3"]
            criteria = ["versions", "duplicates"]
            tests = "roots"

            [providers]
            mpi = ["mpich", "openmpi"]

            [packages.zlib]
            version = ["1.2.13", "1.3:"]
            variants = "+shared build_type=Release"

            [limits]
            max_runs = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.compilers[0].name, "clang");
        assert_eq!(config.arches[0].target, "zen3");
        assert_eq!(config.tests, TestDeps::Roots);
        assert_eq!(config.preferred_providers("mpi"), ["mpich", "openmpi"]);
        assert!(config.preferred_providers("blas").is_empty());
        assert_eq!(config.limits.max_runs, 50);
        assert_eq!(config.limits.max_steps, Limits::default().max_steps);

        // Missing criteria are appended in default order.
        assert_eq!(
            config.criteria,
            vec![
                Criterion::Versions,
                Criterion::Duplicates,
                Criterion::VariantDefaults,
                Criterion::Providers,
                Criterion::Compilers,
                Criterion::Targets,
            ]
        );

        let zlib = config.package("zlib").unwrap();
        assert_eq!(zlib.version.len(), 2);
        assert_eq!(
            zlib.variants.variants.get("shared"),
            Some(&VariantValue::Bool(true))
        );
    }

    #[test]
    fn rejects_bad_entries() {
        assert!(matches!(
            SolverConfig::from_toml_str("compilers = []"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SolverConfig::from_toml_str(r#"criteria = ["versions", "versions"]"#),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SolverConfig::from_toml_str(r#"compilers = ["gcc"]"#),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            SolverConfig::from_toml_str("[packages.zlib]\nvariants = \"zlib+shared\""),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SolverConfig::from_toml_str("colour = true"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solver.toml");
        std::fs::write(&path, "arches = [\"darwin-sonoma-m1\"]\n").unwrap();
        let config = SolverConfig::load(&path).unwrap();
        assert_eq!(config.arches[0].platform, "darwin");

        let missing = SolverConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = SolverConfig::default();
        config
            .providers
            .insert("mpi".to_string(), vec!["mpich".to_string()]);
        let text = config.to_toml_string().unwrap();
        let back = SolverConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
