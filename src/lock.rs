//! Persisted lock form.
//!
//! A [`Lock`] is a concrete DAG plus the requests it was concretized from,
//! serialized as JSON:
//!
//! ```json
//! {
//!   "_meta": { "lockfile-version": 1 },
//!   "roots": [ { "hash": "3f2a...", "spec": "hdf5+mpi" } ],
//!   "concrete_specs": {
//!     "3f2a...": {
//!       "name": "hdf5",
//!       "version": "1.14.3",
//!       "variants": { "mpi": true, "api": ["v18"] },
//!       "compiler": "gcc@12.1.0",
//!       "arch": "linux-ubuntu22.04-x86_64",
//!       "dependencies": [
//!         { "name": "mpich", "hash": "9c1e...", "deptypes": ["build", "link"], "virtuals": ["mpi"] }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Loading never re-runs the solver. It rebuilds the DAG, recomputes every
//! hash and checks it against the recorded one, then verifies the DAG
//! against the catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::dag::{ConcreteDag, ConcreteNode, DependencyEdge};
use crate::error::{InvariantViolationError, LockError};
use crate::spec::{Arch, Compiler, DepKind, DepKinds, Spec};
use crate::variant::VariantValue;
use crate::verify::{satisfies, verify};
use crate::version::Version;

pub const LOCKFILE_VERSION: u32 = 1;

// --- On-disk format ---

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    #[serde(rename = "_meta")]
    meta: Meta,
    roots: Vec<RootEntry>,
    concrete_specs: BTreeMap<String, NodeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    #[serde(rename = "lockfile-version")]
    lockfile_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RootEntry {
    hash: String,
    spec: Spec,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeEntry {
    name: String,
    version: String,
    #[serde(default)]
    variants: BTreeMap<String, VariantEntry>,
    compiler: Compiler,
    arch: Arch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build_for: Option<String>,
    #[serde(default)]
    dependencies: Vec<EdgeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum VariantEntry {
    Bool(bool),
    Values(Vec<String>),
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeEntry {
    name: String,
    hash: String,
    deptypes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    virtuals: Vec<String>,
}

/// A concrete DAG and the root requests it satisfies.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    requests: Vec<Spec>,
    dag: ConcreteDag,
}

impl Lock {
    /// Pair `dag` with the requests it was concretized from, one per root.
    pub fn new(requests: Vec<Spec>, dag: ConcreteDag) -> Result<Self, LockError> {
        if requests.len() != dag.root_indices().len() {
            return Err(LockError::Malformed {
                entry: "roots".to_string(),
                message: format!(
                    "{} requests for {} roots",
                    requests.len(),
                    dag.root_indices().len()
                ),
            });
        }
        Ok(Self { requests, dag })
    }

    pub fn requests(&self) -> &[Spec] {
        &self.requests
    }

    pub fn dag(&self) -> &ConcreteDag {
        &self.dag
    }

    pub fn into_dag(self) -> ConcreteDag {
        self.dag
    }

    pub fn to_json(&self) -> Result<String, LockError> {
        let nodes = self.dag.nodes();
        let concrete_specs = nodes
            .iter()
            .map(|node| {
                let entry = NodeEntry {
                    name: node.name.clone(),
                    version: node.version.to_string(),
                    variants: node
                        .variants
                        .iter()
                        .map(|(name, value)| {
                            let entry = match value {
                                VariantValue::Bool(on) => VariantEntry::Bool(*on),
                                VariantValue::Values(values) => {
                                    VariantEntry::Values(values.iter().cloned().collect())
                                }
                            };
                            (name.clone(), entry)
                        })
                        .collect(),
                    compiler: node.compiler.clone(),
                    arch: node.arch.clone(),
                    build_for: node.build_for.clone(),
                    dependencies: node
                        .dependencies
                        .iter()
                        .map(|edge| EdgeEntry {
                            name: nodes[edge.target].name.clone(),
                            hash: nodes[edge.target].hash.clone(),
                            deptypes: edge.kinds.iter().map(|k| k.to_string()).collect(),
                            virtuals: edge.virtuals.iter().cloned().collect(),
                        })
                        .collect(),
                };
                (node.hash.clone(), entry)
            })
            .collect();
        let file = LockFile {
            meta: Meta {
                lockfile_version: LOCKFILE_VERSION,
            },
            roots: self
                .requests
                .iter()
                .zip(self.dag.roots())
                .map(|(spec, root)| RootEntry {
                    hash: root.hash.clone(),
                    spec: spec.clone(),
                })
                .collect(),
            concrete_specs,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Decode and check a lock against `catalog`.
    pub fn from_json(text: &str, catalog: &dyn Catalog) -> Result<Self, LockError> {
        let file: LockFile = serde_json::from_str(text)?;
        if file.meta.lockfile_version != LOCKFILE_VERSION {
            return Err(LockError::UnsupportedVersion(file.meta.lockfile_version));
        }

        // Phase 1: nodes in hash order, edges by hash.
        let index: BTreeMap<&str, usize> = file
            .concrete_specs
            .keys()
            .enumerate()
            .map(|(i, hash)| (hash.as_str(), i))
            .collect();
        let mut nodes = Vec::with_capacity(file.concrete_specs.len());
        for (hash, entry) in &file.concrete_specs {
            nodes.push(decode_node(hash, entry, &index)?);
        }
        let mut roots = Vec::with_capacity(file.roots.len());
        for root in &file.roots {
            let &i = index
                .get(root.hash.as_str())
                .ok_or_else(|| malformed(&root.hash, "root is not a concrete spec"))?;
            roots.push(i);
        }

        // Phase 2: rebuild and compare hashes.
        let dag = ConcreteDag::from_parts(nodes, roots)?;
        for (recorded, entry) in &file.concrete_specs {
            let position = dag
                .position(&entry.name, entry.build_for.as_deref())
                .ok_or_else(|| malformed(recorded, "node lost while rebuilding"))?;
            let computed = &dag.node(position).hash;
            if computed != recorded {
                return Err(LockError::HashMismatch {
                    recorded: recorded.clone(),
                    computed: computed.clone(),
                });
            }
        }
        debug!(nodes = dag.len(), "lock hashes match");

        // Phase 3: invariants, and each root still meets its request.
        verify(&dag, catalog)?;
        let requests: Vec<Spec> = file.roots.into_iter().map(|r| r.spec).collect();
        for (request, &root) in requests.iter().zip(dag.root_indices()) {
            if !satisfies(&dag, root, request, catalog)? {
                return Err(InvariantViolationError::new(
                    dag.node(root).label(),
                    format!("does not satisfy the request `{request}`"),
                )
                .into());
            }
        }
        Self::new(requests, dag)
    }

    pub fn save(&self, path: &Path) -> Result<(), LockError> {
        let text = self.to_json()?;
        fs::write(path, text).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), nodes = self.dag.len(), "wrote lock file");
        Ok(())
    }

    pub fn load(path: &Path, catalog: &dyn Catalog) -> Result<Self, LockError> {
        let text = fs::read_to_string(path).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let lock = Self::from_json(&text, catalog)?;
        info!(path = %path.display(), nodes = lock.dag.len(), "loaded lock file");
        Ok(lock)
    }
}

// --- helpers ---

fn malformed(entry: &str, message: impl Into<String>) -> LockError {
    LockError::Malformed {
        entry: entry.to_string(),
        message: message.into(),
    }
}

fn decode_node(
    hash: &str,
    entry: &NodeEntry,
    index: &BTreeMap<&str, usize>,
) -> Result<ConcreteNode, LockError> {
    let version = Version::parse(&entry.version).map_err(|e| malformed(hash, e.to_string()))?;
    let variants = entry
        .variants
        .iter()
        .map(|(name, value)| {
            let value = match value {
                VariantEntry::Bool(on) => VariantValue::Bool(*on),
                VariantEntry::Values(values) if !values.is_empty() => {
                    VariantValue::Values(values.iter().cloned().collect())
                }
                VariantEntry::Values(_) => {
                    return Err(malformed(hash, format!("variant `{name}` has no value")));
                }
            };
            Ok((name.clone(), value))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let mut dependencies = Vec::with_capacity(entry.dependencies.len());
    for edge in &entry.dependencies {
        let &target = index
            .get(edge.hash.as_str())
            .ok_or_else(|| malformed(hash, format!("dependency `{}` is not in the lock", edge.hash)))?;
        let kinds = edge
            .deptypes
            .iter()
            .map(|k| k.parse::<DepKind>())
            .collect::<Result<DepKinds, _>>()
            .map_err(|k| malformed(hash, format!("unknown dependency type `{k}`")))?;
        if kinds.is_empty() {
            return Err(malformed(hash, format!("edge to `{}` has no type", edge.name)));
        }
        dependencies.push(DependencyEdge {
            target,
            kinds,
            virtuals: edge.virtuals.iter().cloned().collect::<BTreeSet<_>>(),
        });
    }

    Ok(ConcreteNode {
        name: entry.name.clone(),
        version,
        variants,
        compiler: entry.compiler.clone(),
        arch: entry.arch.clone(),
        build_for: entry.build_for.clone(),
        dependencies,
        hash: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::SolverConfig;
    use crate::parser::parse_specs;
    use crate::recipe::PackageRecipe;
    use crate::solver::Concretizer;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_recipes([
            PackageRecipe::new("hdf5")
                .version("1.14.3")
                .variant("mpi", true)
                .multi_variant("api", &["v18"], &["v16", "v18"])
                .depends_on_when("mpi", "build,link", "+mpi")
                .depends_on("cmake", "build"),
            PackageRecipe::new("cmake").version("3.27.7"),
            PackageRecipe::new("mpich").version("3.0").provides("mpi@3"),
        ])
        .unwrap()
    }

    fn lock(catalog: &InMemoryCatalog) -> Lock {
        let requests = parse_specs("hdf5+mpi").unwrap();
        let dag = Concretizer::new(catalog, &SolverConfig::default())
            .concretize(&requests)
            .unwrap();
        Lock::new(requests, dag).unwrap()
    }

    #[test]
    fn json_round_trip() {
        let catalog = catalog();
        let lock = lock(&catalog);
        let text = lock.to_json().unwrap();
        assert!(text.contains("\"lockfile-version\": 1"), "{text}");
        assert!(text.contains("\"virtuals\""), "{text}");

        let loaded = Lock::from_json(&text, &catalog).unwrap();
        assert_eq!(loaded, lock);
        assert_eq!(loaded.to_json().unwrap(), text);
    }

    #[test]
    fn file_round_trip() {
        let catalog = catalog();
        let lock = lock(&catalog);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.lock");
        lock.save(&path).unwrap();
        assert_eq!(Lock::load(&path, &catalog).unwrap(), lock);

        let missing = dir.path().join("missing.lock");
        assert!(matches!(
            Lock::load(&missing, &catalog),
            Err(LockError::Io { .. })
        ));
    }

    #[test]
    fn tampering_is_detected() {
        let catalog = catalog();
        let text = lock(&catalog).to_json().unwrap();

        let edited = text.replace("\"3.27.7\"", "\"3.28\"");
        assert!(matches!(
            Lock::from_json(&edited, &catalog),
            Err(LockError::HashMismatch { .. })
        ));

        let future = text.replace("\"lockfile-version\": 1", "\"lockfile-version\": 7");
        assert!(matches!(
            Lock::from_json(&future, &catalog),
            Err(LockError::UnsupportedVersion(7))
        ));

        let mut json: serde_json::Value = serde_json::from_str(&text).unwrap();
        json["roots"][0]["hash"] = serde_json::Value::from("nope");
        assert!(matches!(
            Lock::from_json(&json.to_string(), &catalog),
            Err(LockError::Malformed { .. })
        ));
    }

    #[test]
    fn catalog_drift_is_an_invariant_error() {
        let catalog = catalog();
        let text = lock(&catalog).to_json().unwrap();
        let newer = InMemoryCatalog::from_recipes([
            PackageRecipe::new("hdf5")
                .version("1.14.3")
                .variant("mpi", true)
                .multi_variant("api", &["v18"], &["v16", "v18"])
                .depends_on_when("mpi", "build,link", "+mpi")
                .depends_on("cmake", "build"),
            PackageRecipe::new("cmake").version("3.28"),
            PackageRecipe::new("mpich").version("3.0").provides("mpi@3"),
        ])
        .unwrap();
        assert!(matches!(
            Lock::from_json(&text, &newer),
            Err(LockError::Invariant(_))
        ));
    }

    #[test]
    fn request_count_must_match_roots() {
        let catalog = catalog();
        let dag = lock(&catalog).into_dag();
        assert!(matches!(
            Lock::new(Vec::new(), dag),
            Err(LockError::Malformed { .. })
        ));
    }
}
