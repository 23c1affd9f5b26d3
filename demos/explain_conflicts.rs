//! Example: what the concretizer reports when a request cannot be met.
//!
//! Each request below contradicts the catalog in a different way. The error
//! names the smallest set of request constraints that still contradict, the
//! catalog conflict rules involved, and the solver's own derivation.

use spec_concretizer::{Concretizer, ConcretizeError, PackageRecipe, RecipeSet, SolverConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut recipes = RecipeSet::new();
    recipes.add(
        PackageRecipe::new("app")
            .version("2.0")
            .version("1.0")
            .variant("cxx17", false)
            .depends_on("mpi@3:", "build,link")
            .depends_on_when("boost@1.80:", "build,link", "+cxx17")
            .conflicts_msg("%gcc@:6", "+cxx17", Some("C++17 needs gcc 7 or newer")),
    );
    recipes.add(
        PackageRecipe::new("boost")
            .version("1.83.0")
            .version("1.79.0")
            .conflicts("@1.83:", "%gcc@:9"),
    );
    recipes.add(PackageRecipe::new("openmpi").version("4.1.5").provides("mpi@3"));
    recipes.add(PackageRecipe::new("mpich").version("3.4.3").provides("mpi@2"));
    let catalog = match recipes.build() {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("invalid recipes: {e}");
            return;
        }
    };

    let mut config = SolverConfig::default();
    config.compilers = ["gcc@12.3.0", "gcc@8.5.0", "gcc@6.5.0"]
        .iter()
        .filter_map(|c| c.parse().ok())
        .collect();
    let concretizer = Concretizer::new(&catalog, &config);

    let requests = [
        // A conflict rule of `app` itself.
        "app+cxx17 %gcc@6.5.0",
        // Through a dependency: boost@1.83 needs gcc 10, +cxx17 needs 1.80.
        "app+cxx17 ^boost %gcc@8.5.0",
        // mpich only provides mpi@2.
        "app ^mpich",
        // Not a contradiction at all.
        "app+cxx17",
    ];

    for request in requests {
        println!("=== {request} ===");
        match concretizer.concretize_str(request) {
            Ok(dag) => print!("{dag}"),
            Err(ConcretizeError::Unsatisfiable(err)) => {
                println!("unsatisfiable");
                for constraint in &err.constraints {
                    println!("  requested: {constraint}");
                }
                for conflict in &err.conflicts {
                    println!("  conflict:  {conflict}");
                }
                println!("  derivation:");
                for line in err.detail.lines() {
                    println!("    {line}");
                }
            }
            Err(e) => println!("error: {e}"),
        }
        println!();
    }
}
