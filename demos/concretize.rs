//! Example: concretize a request against a small HPC-flavoured catalog.
//!
//! The catalog is written in the TOML recipe format: an MPI virtual with two
//! providers, a CMake build tool shared through a `cmake-package` base
//! recipe, and conditional dependencies and variants.
//!
//! Pass a request on the command line (default: `hdf5+mpi ^mpich`). Set
//! `RUST_LOG=spec_concretizer=debug` to watch the optimization.
//!
//! ```sh
//! cargo run --example concretize -- "hdf5~mpi api=v16"
//! ```

use std::error::Error;

use spec_concretizer::{Concretizer, InMemoryCatalog, Lock, SolverConfig, parse_specs};
use tracing_subscriber::EnvFilter;

const CATALOG: &str = r#"
[packages.cmake-package]
base = true

[[packages.cmake-package.depends_on]]
spec = "cmake@3.20:"
type = ["build"]

[packages.cmake]
version = ["3.27.7", "3.26.5", "3.20.6"]

[[packages.cmake.depends_on]]
spec = "zlib"

[packages.zlib]
version = ["1.3", "1.2.13"]

[[packages.zlib.variant]]
name = "shared"
default = true

[packages.hdf5]
inherits = ["cmake-package"]
version = ["1.14.3", { version = "1.12.2", preferred = true }, "develop"]

[[packages.hdf5.variant]]
name = "mpi"
default = true

[[packages.hdf5.variant]]
name = "api"
default = ["default"]
values = ["default", "v16", "v18", "v110"]
multi = true

[[packages.hdf5.depends_on]]
spec = "mpi"
when = "+mpi"

[[packages.hdf5.depends_on]]
spec = "zlib@1.2.13:"

[[packages.hdf5.conflicts]]
spec = "api=v16"
when = "@1.14:"
msg = "the 1.6 API was dropped in 1.14"

[packages.openmpi]
version = ["4.1.5", { version = "4.0.7", deprecated = true }]

[[packages.openmpi.provides]]
spec = "mpi@3"

[packages.mpich]
inherits = ["cmake-package"]
version = ["4.1.2", "3.4.3"]

[[packages.mpich.provides]]
spec = "mpi@3"
when = "@4:"

[[packages.mpich.provides]]
spec = "mpi@2"
when = "@3"
"#;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = if args.is_empty() {
        "hdf5+mpi ^mpich".to_string()
    } else {
        args.join(" ")
    };

    let catalog = InMemoryCatalog::from_toml_str(CATALOG)?;
    let mut config = SolverConfig::default();
    config
        .providers
        .insert("mpi".to_string(), vec!["openmpi".to_string()]);

    let roots = parse_specs(&request)?;
    let dag = Concretizer::new(&catalog, &config).concretize(&roots)?;

    println!("=== {request} ===");
    print!("{dag}");

    println!("\n--- install order ---");
    for index in dag.install_order() {
        let node = dag.node(index);
        println!("  {}  {}", &node.hash[..7], node.label());
    }

    println!("\n--- concrete roots ---");
    for position in 0..dag.root_indices().len() {
        if let Some(root) = dag.format_root(position) {
            println!("  {root}");
        }
    }

    println!("\n--- lock ---");
    println!("{}", Lock::new(roots, dag)?.to_json()?);
    Ok(())
}
