//! Concretization benchmarks.
//!
//! Measures:
//! - Parsing requests of growing size
//! - Concretizing a linear dependency chain
//! - Concretizing a catalog with competing virtual providers
//!
//! Run with: `cargo bench --bench concretize`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use spec_concretizer::{Concretizer, InMemoryCatalog, PackageRecipe, SolverConfig, parse_specs};

/// `pkg0 -> pkg1 -> ... -> pkg{len-1}`, each with three versions and a
/// variant that pulls in a build-only tool.
fn chain_catalog(len: usize) -> InMemoryCatalog {
    let mut recipes = vec![
        PackageRecipe::new("tool")
            .version("2.0")
            .version("1.0"),
    ];
    for i in 0..len {
        let mut recipe = PackageRecipe::new(format!("pkg{i}"))
            .version("3.0")
            .version("2.0")
            .version("1.0")
            .variant("docs", false)
            .depends_on_when("tool@1.0:", "build", "+docs");
        if i + 1 < len {
            recipe = recipe.depends_on(&format!("pkg{}@2.0:", i + 1), "build,link");
        }
        recipes.push(recipe);
    }
    InMemoryCatalog::from_recipes(recipes).unwrap()
}

/// `app` depends on `width` libraries, each of which needs `mpi`; three
/// packages provide it.
fn provider_catalog(width: usize) -> InMemoryCatalog {
    let mut app = PackageRecipe::new("app").version("1.0");
    let mut recipes = Vec::new();
    for i in 0..width {
        app = app.depends_on(&format!("lib{i}"), "build,link");
        recipes.push(
            PackageRecipe::new(format!("lib{i}"))
                .version("1.1")
                .version("1.0")
                .depends_on("mpi@3:", "build,link"),
        );
    }
    recipes.push(app);
    recipes.push(PackageRecipe::new("openmpi").version("4.1.5").provides("mpi@3"));
    recipes.push(
        PackageRecipe::new("mpich")
            .version("4.1.2")
            .version("3.4.3")
            .provides_when("mpi@3", "@4:")
            .provides_when("mpi@2", "@3"),
    );
    recipes.push(PackageRecipe::new("mvapich").version("2.3.7").provides("mpi@3"));
    InMemoryCatalog::from_recipes(recipes).unwrap()
}

/// Benchmark request parsing.
///
/// Each request is `count` packages with versions, variants, a compiler and
/// one pinned dependency.
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for count in [1, 10, 100] {
        let request: Vec<String> = (0..count)
            .map(|i| format!("pkg{i}@1.2:2.0 +docs api=v16,v18 %gcc@12 ^zlib@1.3"))
            .collect();
        let request = request.join(" ");
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &request, |b, request| {
            b.iter(|| parse_specs(request).unwrap())
        });
    }

    group.finish();
}

/// Benchmark concretizing the root of a dependency chain.
///
/// The optimization runs grow with the number of choices in the model.
fn bench_chain(c: &mut Criterion) {
    let config = SolverConfig::default();
    let mut group = c.benchmark_group("concretize_chain");
    group.sample_size(20);

    for len in [2, 8, 16] {
        let catalog = chain_catalog(len);
        let concretizer = Concretizer::new(&catalog, &config);
        group.bench_with_input(BenchmarkId::new("pkg0", len), &len, |b, _| {
            b.iter(|| concretizer.concretize_str("pkg0").unwrap())
        });
        group.bench_with_input(BenchmarkId::new("pkg0+docs", len), &len, |b, _| {
            b.iter(|| concretizer.concretize_str("pkg0+docs").unwrap())
        });
    }

    group.finish();
}

/// Benchmark provider selection with and without a requested provider.
fn bench_providers(c: &mut Criterion) {
    let mut config = SolverConfig::default();
    config
        .providers
        .insert("mpi".to_string(), vec!["mpich".to_string()]);
    let mut group = c.benchmark_group("concretize_providers");
    group.sample_size(20);

    for width in [1, 4, 8] {
        let catalog = provider_catalog(width);
        let concretizer = Concretizer::new(&catalog, &config);
        group.bench_with_input(BenchmarkId::new("preferred", width), &width, |b, _| {
            b.iter(|| concretizer.concretize_str("app").unwrap())
        });
        group.bench_with_input(BenchmarkId::new("requested", width), &width, |b, _| {
            b.iter(|| concretizer.concretize_str("app ^openmpi").unwrap())
        });
    }

    group.finish();
}

/// Benchmark explaining an unsatisfiable request.
fn bench_explain(c: &mut Criterion) {
    let config = SolverConfig::default();
    let catalog = provider_catalog(4);
    let concretizer = Concretizer::new(&catalog, &config);

    c.bench_function("explain_unsatisfiable", |b| {
        b.iter(|| concretizer.concretize_str("app ^mpich@3.4.3").unwrap_err())
    });
}

criterion_group!(
    benches,
    bench_parse,
    bench_chain,
    bench_providers,
    bench_explain
);
criterion_main!(benches);
