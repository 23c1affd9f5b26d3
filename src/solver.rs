//! The concretizer.
//!
//! [`Concretizer`] drives one concretization end to end: build the
//! constraint model, search it, assemble and check the DAG.
//!
//! The search runs resolvo repeatedly. resolvo finds a feasible
//! assignment, trying best-ranked candidates first; it does not optimize. Optimization is layered on top: for each criterion in the
//! configured order, and for each of that criterion's choices in canonical
//! order, binary-search the smallest rank bound that keeps the problem
//! feasible, then keep the bound. Every bound is kept for the later
//! criteria, so a lower-priority preference never costs a higher-priority
//! one.
//!
//! When the first run fails, the request is unsatisfiable and the search
//! switches to explaining: deletion-minimize the request's constraints,
//! then find the conflict rules without which the rest is feasible.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use resolvo::{NameId, Problem, SolvableId, Solver, UnsolvableOrCancelled};
use tracing::{debug, info, info_span, trace, warn};

use crate::assemble::assemble;
use crate::builder::{ConstraintModel, ModelBuilder, Tag};
use crate::catalog::Catalog;
use crate::config::{Criterion, Limits, SolverConfig};
use crate::dag::ConcreteDag;
use crate::error::{
    ConcretizeError, InvariantViolationError, ResourceError, ResourceLimit, UnsatisfiableError,
};
use crate::parser::parse_specs;
use crate::provider::ModelProvider;
use crate::spec::Spec;
use crate::verify::{satisfies, verify};

/// Resolves abstract specs into concrete DAGs against one catalog.
///
/// A `Concretizer` holds no state between calls; independent requests may
/// be concretized from different threads with separate instances.
pub struct Concretizer<'c> {
    catalog: &'c dyn Catalog,
    config: SolverConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'c> Concretizer<'c> {
    pub fn new(catalog: &'c dyn Catalog, config: &SolverConfig) -> Self {
        Self {
            catalog,
            config: config.clone(),
            cancel: None,
        }
    }

    /// Abandon the search once `flag` is raised. The flag is checked
    /// between runs and between search steps.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Parse `request` (one or more root specs) and concretize it.
    pub fn concretize_str(&self, request: &str) -> Result<ConcreteDag, ConcretizeError> {
        let roots = parse_specs(request)?;
        self.concretize(&roots)
    }

    /// Concretize `roots` together into one DAG.
    pub fn concretize(&self, roots: &[Spec]) -> Result<ConcreteDag, ConcretizeError> {
        let span = info_span!("concretize", roots = roots.len());
        let _enter = span.enter();
        if roots.is_empty() {
            return Ok(ConcreteDag::default());
        }

        let model = ModelBuilder::new(self.catalog, &self.config).build(roots)?;
        let mut search = Search::new(&model, self.config.limits, self.cancel.as_deref());
        let solution = match search.optimize(&self.config.criteria)? {
            Outcome::Solved(solution) => solution,
            Outcome::Unsolvable(detail) => return Err(search.explain(detail)),
        };

        let dag = assemble(&model, &solution)?;
        verify(&dag, self.catalog)?;
        for (root, &index) in roots.iter().zip(dag.root_indices()) {
            if !satisfies(&dag, index, root, self.catalog)? {
                return Err(InvariantViolationError::new(
                    dag.node(index).label(),
                    format!("does not satisfy the request `{root}`"),
                )
                .into());
            }
        }
        info!(nodes = dag.len(), runs = search.runs, "concretized");
        Ok(dag)
    }
}

/// Outcome of one solver run.
#[derive(Debug)]
enum Outcome {
    Solved(Vec<SolvableId>),
    /// resolvo's derivation of the contradiction.
    Unsolvable(String),
}

/// Repeated solver runs over one model.
struct Search<'m> {
    model: &'m ConstraintModel,
    limits: Limits,
    cancel: Option<&'m AtomicBool>,
    runs: u64,
}

impl<'m> Search<'m> {
    fn new(model: &'m ConstraintModel, limits: Limits, cancel: Option<&'m AtomicBool>) -> Self {
        Self {
            model,
            limits,
            cancel,
            runs: 0,
        }
    }

    fn run(
        &mut self,
        bounds: &HashMap<NameId, u32>,
        disabled: &BTreeSet<Tag>,
    ) -> Result<Outcome, ResourceError> {
        if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(ResourceError {
                limit: ResourceLimit::Cancelled,
            });
        }
        if self.runs >= self.limits.max_runs {
            return Err(ResourceError {
                limit: ResourceLimit::Runs(self.limits.max_runs),
            });
        }
        self.runs += 1;

        let provider = ModelProvider::new(self.model, bounds, disabled)
            .with_budget(self.limits.max_steps, self.cancel);
        let problem = Problem::new()
            .requirements(provider.requirements())
            .constraints(provider.constraints());
        let mut solver = Solver::new(provider);
        match solver.solve(problem) {
            Ok(solution) => {
                trace!(run = self.runs, steps = solver.provider().steps(), "feasible");
                Ok(Outcome::Solved(solution))
            }
            Err(UnsolvableOrCancelled::Unsolvable(conflict)) => {
                trace!(run = self.runs, "infeasible");
                Ok(Outcome::Unsolvable(
                    conflict.display_user_friendly(&solver).to_string(),
                ))
            }
            Err(UnsolvableOrCancelled::Cancelled(value)) => {
                let limit = value
                    .downcast_ref::<ResourceLimit>()
                    .copied()
                    .unwrap_or(ResourceLimit::Cancelled);
                Err(ResourceError { limit })
            }
        }
    }

    /// Rank of the candidate `solution` selects for `choice`.
    fn rank(&self, solution: &[SolvableId], choice: NameId) -> Option<u32> {
        let pool = &self.model.pool;
        solution
            .iter()
            .find(|&&sid| pool.candidate_choice(sid) == choice)
            .map(|&sid| pool.resolve_candidate(sid).rank)
    }

    /// Find the lexicographically best assignment.
    fn optimize(&mut self, criteria: &[Criterion]) -> Result<Outcome, ResourceError> {
        let disabled = BTreeSet::new();
        let mut bounds: HashMap<NameId, u32> = HashMap::new();
        let mut best = match self.run(&bounds, &disabled)? {
            Outcome::Solved(solution) => solution,
            unsolvable => return Ok(unsolvable),
        };

        for &criterion in criteria {
            let choices: Vec<NameId> = self
                .model
                .order()
                .iter()
                .copied()
                .filter(|&c| self.model.pool.resolve_choice(c).criterion() == Some(criterion))
                .collect();
            for choice in choices {
                let current = self.rank(&best, choice).unwrap_or(0);
                let (mut lo, mut hi) = (0, current);
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    bounds.insert(choice, mid);
                    match self.run(&bounds, &disabled)? {
                        Outcome::Solved(solution) => {
                            hi = self.rank(&solution, choice).unwrap_or(0);
                            best = solution;
                        }
                        Outcome::Unsolvable(_) => lo = mid + 1,
                    }
                }
                bounds.insert(choice, hi);
                if current != hi {
                    debug!(
                        %criterion,
                        choice = %self.model.pool.resolve_choice(choice),
                        from = current,
                        to = hi,
                        "improved"
                    );
                }
            }
        }
        debug!(runs = self.runs, "optimization finished");
        Ok(Outcome::Solved(best))
    }

    /// Explain why the model has no solution.
    fn explain(&mut self, detail: String) -> ConcretizeError {
        match self.minimize() {
            Ok(error) => error.into(),
            Err(ResourceError {
                limit: ResourceLimit::Cancelled,
            }) => ResourceError {
                limit: ResourceLimit::Cancelled,
            }
            .into(),
            Err(e) => {
                // Unsatisfiability is already proven; only the explanation
                // is cut short.
                warn!("explanation incomplete: {e}");
                UnsatisfiableError {
                    constraints: self
                        .model
                        .user_tags()
                        .map(|t| self.model.label(t).to_string())
                        .collect(),
                    conflicts: Vec::new(),
                    detail,
                }
                .into()
            }
        }
    }

    fn minimize(&mut self) -> Result<UnsatisfiableError, ResourceError> {
        let bounds = HashMap::new();
        let mut disabled: BTreeSet<Tag> = BTreeSet::new();

        // Phase 1: drop each request constraint the contradiction survives
        // without.
        let user: Vec<Tag> = self.model.user_tags().collect();
        for &tag in &user {
            disabled.insert(tag);
            if let Outcome::Solved(_) = self.run(&bounds, &disabled)? {
                disabled.remove(&tag);
            }
        }

        // Phase 2: the conflict rules the contradiction needs.
        let mut conflicts = Vec::new();
        let rules: Vec<Tag> = self.model.rule_tags().collect();
        for tag in rules {
            disabled.insert(tag);
            if let Outcome::Solved(_) = self.run(&bounds, &disabled)? {
                disabled.remove(&tag);
                conflicts.push(self.model.label(tag).to_string());
            }
        }

        let detail = match self.run(&bounds, &disabled)? {
            Outcome::Unsolvable(detail) => detail,
            Outcome::Solved(_) => String::new(),
        };
        let constraints: Vec<String> = user
            .into_iter()
            .filter(|tag| !disabled.contains(tag))
            .map(|tag| self.model.label(tag).to_string())
            .collect();
        info!(
            constraints = constraints.len(),
            conflicts = conflicts.len(),
            runs = self.runs,
            "explained unsatisfiable request"
        );
        Ok(UnsatisfiableError {
            constraints,
            conflicts,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::recipe::PackageRecipe;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_recipes([
            PackageRecipe::new("a")
                .version("2.0")
                .version("1.0")
                .variant("x", false)
                .depends_on("b", "build,link")
                .conflicts("^b@1.2", "@1.0"),
            PackageRecipe::new("b")
                .version("1.2")
                .version("1.1")
                .version("1.0"),
        ])
        .unwrap()
    }

    #[test]
    fn optimization_prefers_newest_then_recovers() {
        let catalog = catalog();
        let config = SolverConfig::default();
        let concretizer = Concretizer::new(&catalog, &config);

        let dag = concretizer.concretize_str("a").unwrap();
        assert_eq!(dag.find("a").unwrap().version.to_string(), "2.0");
        assert_eq!(dag.find("b").unwrap().version.to_string(), "1.2");

        // b@1.2 is ruled out under a@1.0; the next best is taken.
        let dag = concretizer.concretize_str("a@1.0").unwrap();
        assert_eq!(dag.find("b").unwrap().version.to_string(), "1.1");
    }

    #[test]
    fn empty_request_gives_empty_dag() {
        let catalog = catalog();
        let config = SolverConfig::default();
        let dag = Concretizer::new(&catalog, &config).concretize(&[]).unwrap();
        assert!(dag.is_empty());
    }

    #[test]
    fn explanation_is_minimal() {
        let catalog = catalog();
        let config = SolverConfig::default();
        let err = Concretizer::new(&catalog, &config)
            .concretize_str("a@1.0+x ^b@1.2")
            .unwrap_err();
        let ConcretizeError::Unsatisfiable(err) = err else {
            panic!("expected unsatisfiable, got {err}");
        };
        assert!(err.constraints.contains(&"a@1.0".to_string()), "{err}");
        assert!(err.constraints.contains(&"a ^b@1.2".to_string()), "{err}");
        assert!(!err.constraints.contains(&"a+x".to_string()), "{err}");
        assert_eq!(err.conflicts.len(), 1, "{err}");
        assert_eq!(err.conflicts, ["a @1.0 conflicts with ^b@1.2"], "{err}");
    }

    #[test]
    fn run_budget_is_a_resource_error() {
        let catalog = catalog();
        let mut config = SolverConfig::default();
        config.limits.max_runs = 1;
        let err = Concretizer::new(&catalog, &config)
            .concretize_str("a@1.0")
            .unwrap_err();
        assert!(
            matches!(
                err,
                ConcretizeError::Resource(ResourceError {
                    limit: ResourceLimit::Runs(1)
                })
            ),
            "{err}"
        );
    }

    #[test]
    fn raised_flag_cancels() {
        let catalog = catalog();
        let config = SolverConfig::default();
        let flag = Arc::new(AtomicBool::new(true));
        let err = Concretizer::new(&catalog, &config)
            .with_cancel_flag(flag)
            .concretize_str("a")
            .unwrap_err();
        assert!(matches!(
            err,
            ConcretizeError::Resource(ResourceError {
                limit: ResourceLimit::Cancelled
            })
        ));
    }
}
