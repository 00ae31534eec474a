use crate::coefficients::{simulate_coefficients, CoefficientPolicy};
use crate::error::{check_tolerance, LineageError};
use crate::programs::{draw_branch_programs, ProgramParams};
use crate::tree::{BranchId, TreeReader};

use log::{debug, info};
use matrix_util::ndarray_stat::pearson_correlation;
use ndarray::{Array1, Array2};
use rand::Rng;
use std::collections::BTreeMap;

/// Parameters for `simulate_lineage`
#[derive(Debug, Clone)]
pub struct LineageParams {
    /// Correlation cut-off between programs of the same branch
    pub intra_branch_tol: f64,
    /// Parallel branches must correlate below this in their net change
    pub inter_branch_tol: f64,
    /// `None` warns and uses gamma coefficients with shape 0.05
    pub coefficients: Option<CoefficientPolicy>,
    pub max_loops: usize,
    pub max_restarts: usize,
    /// Re-draw rounds allowed per group of parallel branches
    pub max_divergence_attempts: usize,
}

impl Default for LineageParams {
    fn default() -> Self {
        let programs = ProgramParams::default();
        Self {
            intra_branch_tol: 0.4,
            inter_branch_tol: 0.5,
            coefficients: None,
            max_loops: programs.max_loops,
            max_restarts: programs.max_restarts,
            max_divergence_attempts: 1000,
        }
    }
}

impl LineageParams {
    fn program_params(&self) -> ProgramParams {
        ProgramParams {
            cutoff: self.intra_branch_tol,
            max_loops: self.max_loops,
            max_restarts: self.max_restarts,
        }
    }
}

/// Everything drawn for one lineage tree
#[derive(Debug, Clone)]
pub struct LineageSimulation {
    /// Relative mean expression (T × G) per branch, continuous across
    /// branch points
    pub relative_means: BTreeMap<BranchId, Array2<f64>>,
    /// Expression programs (T × K) per branch
    pub programs: BTreeMap<BranchId, Array2<f64>>,
    /// Program-to-gene weights (K × G)
    pub coefficients: Array2<f64>,
}

/// Simulate relative gene expression at every (pseudotime, branch)
/// point of the tree.
///
/// Programs within a branch are kept below `intra_branch_tol`
/// correlation; branches that start together are re-drawn until their
/// expression changes diverge (see `diverging_parallel`). Finally each
/// child branch is shifted to start where its parent ends.
pub fn simulate_lineage<T>(
    tree: &T,
    params: &LineageParams,
    rng: &mut impl Rng,
) -> anyhow::Result<LineageSimulation>
where
    T: TreeReader + ?Sized,
{
    check_tolerance("intra_branch_tol", params.intra_branch_tol)?;
    check_tolerance("inter_branch_tol", params.inter_branch_tol)?;

    let lengths = tree.branch_lengths();
    let branches = tree.branches();
    if lengths.len() != branches.len() || branches.iter().any(|b| !lengths.contains_key(b)) {
        return Err(LineageError::InsufficientTreeSpecification {
            branches: branches.len(),
            lengths: lengths.len(),
        }
        .into());
    }

    let coefficients = simulate_coefficients(tree, params.coefficients, rng)?;
    let mut programs = draw_branch_programs(tree, branches, &params.program_params(), rng)?;

    let mut relative_means = correct_parallel(tree, &mut programs, &coefficients, params, rng)?;

    for (parent, child) in stitching_order(tree) {
        let adjusted = match (relative_means.get(&child), relative_means.get(&parent)) {
            (Some(cm), Some(pm)) => bifurcation_adjust(cm, pm),
            _ => continue,
        };
        relative_means.insert(child, adjusted);
    }

    info!(
        "simulated relative means on {} branches ({} programs, {} genes)",
        relative_means.len(),
        tree.num_modules(),
        tree.num_genes()
    );

    Ok(LineageSimulation {
        relative_means,
        programs,
        coefficients,
    })
}

/// `(parent, child)` edges ordered by the parent's start, so every
/// parent is final before its children are matched to it
fn stitching_order<T>(tree: &T) -> Vec<(BranchId, BranchId)>
where
    T: TreeReader + ?Sized,
{
    let bt = tree.branch_times();
    let mut edges = tree.topology().to_vec();
    edges.sort_by_key(|(parent, _)| bt.get(parent).map(|&(start, _)| start));
    edges
}

/// Relative mean expression `W · H` for every branch
pub fn calc_relative_means(
    programs: &BTreeMap<BranchId, Array2<f64>>,
    coefficients: &Array2<f64>,
) -> BTreeMap<BranchId, Array2<f64>> {
    programs
        .iter()
        .map(|(&b, ww)| (b, ww.dot(coefficients)))
        .collect()
}

/// Re-draw the programs of parallel branches until they diverge.
///
/// A failing group is re-drawn as a whole, not only the offending pair.
/// Returns the relative means of all branches (not yet stitched).
pub fn correct_parallel<T>(
    tree: &T,
    programs: &mut BTreeMap<BranchId, Array2<f64>>,
    coefficients: &Array2<f64>,
    params: &LineageParams,
    rng: &mut impl Rng,
) -> anyhow::Result<BTreeMap<BranchId, Array2<f64>>>
where
    T: TreeReader + ?Sized,
{
    let mut relative_means = calc_relative_means(programs, coefficients);
    let program_params = params.program_params();

    for (start, group) in tree.parallel_branches() {
        let mut attempts = 0;
        while !diverging_parallel(&group, &relative_means, params.inter_branch_tol)
            .into_iter()
            .all(|d| d)
        {
            if attempts >= params.max_divergence_attempts {
                return Err(LineageError::NotConverged {
                    what: "parallel branch divergence",
                    attempts,
                }
                .into());
            }
            attempts += 1;

            let redrawn = draw_branch_programs(tree, &group, &program_params, rng)?;
            for (b, ww) in redrawn {
                relative_means.insert(b, ww.dot(coefficients));
                programs.insert(b, ww);
            }
        }
        debug!(
            "branches {:?} starting at {} diverge after {} re-draws",
            group, start, attempts
        );
    }

    Ok(relative_means)
}

/// Net change of every gene along a branch: last row minus first row
fn net_change(means: &Array2<f64>) -> Array1<f64> {
    match means.nrows() {
        0 => Array1::zeros(means.ncols()),
        n => &means.row(n - 1) - &means.row(0),
    }
}

/// Whether `b1` and `b2` move their genes in sufficiently different
/// directions: the correlation of the per-gene net changes must stay
/// below `tol`.
pub fn diverging_pair(b1: &Array2<f64>, b2: &Array2<f64>, tol: f64) -> bool {
    let r: f64 = pearson_correlation(&net_change(b1), &net_change(b2));
    r < tol
}

/// Divergence test for every pair of `branches`, in
/// `(0,1), (0,2), ..., (1,2), ...` order. Pairs with a branch missing
/// from `means` count as failing.
pub fn diverging_parallel(
    branches: &[BranchId],
    means: &BTreeMap<BranchId, Array2<f64>>,
    tol: f64,
) -> Vec<bool> {
    let mut diverges = vec![];
    for (i, b1) in branches.iter().enumerate() {
        for b2 in &branches[(i + 1)..] {
            diverges.push(match (means.get(b1), means.get(b2)) {
                (Some(m1), Some(m2)) => diverging_pair(m1, m2, tol),
                _ => false,
            });
        }
    }
    diverges
}

/// Shift `child` so that it starts exactly where `parent` ends
pub fn bifurcation_adjust(child: &Array2<f64>, parent: &Array2<f64>) -> Array2<f64> {
    if child.nrows() == 0 || parent.nrows() == 0 {
        return child.clone();
    }
    let parent_end = parent.row(parent.nrows() - 1);
    let shift = &child.row(0) - &parent_end;

    let mut adjusted = child - &shift;
    adjusted.row_mut(0).assign(&parent_end);
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LineageTree;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn adjust_matches_parent_end() {
        let parent = array![[1.0, 2.0], [3.0, 5.0]];
        let child = array![[0.0, 0.0], [1.0, -1.0], [2.0, 4.0]];
        let adjusted = bifurcation_adjust(&child, &parent);

        assert_eq!(adjusted.row(0), parent.row(1));
        assert_abs_diff_eq!(adjusted, array![[3.0, 5.0], [4.0, 4.0], [5.0, 9.0]]);
    }

    #[test]
    fn opposite_changes_diverge() {
        let up = array![[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]];
        let down = array![[0.0, 0.0, 0.0], [-1.0, -2.0, -3.0]];
        assert!(diverging_pair(&up, &down, 0.5));
        assert!(!diverging_pair(&up, &up, 0.5));
    }

    #[test]
    fn pairs_in_order() {
        let m = array![[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]];
        let means = BTreeMap::from([(1, m.clone()), (2, m.clone()), (3, -m)]);
        assert_eq!(
            diverging_parallel(&[1, 2, 3], &means, 0.5),
            vec![false, true, true]
        );
    }

    #[test]
    fn single_branch_lineage() -> anyhow::Result<()> {
        let tree = LineageTree::new(vec![], BTreeMap::from([(0, 15)]), 2, 6)?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let sim = simulate_lineage(&tree, &LineageParams::default(), &mut rng)?;

        assert_eq!(sim.relative_means[&0].dim(), (15, 6));
        assert_eq!(sim.programs[&0].dim(), (15, 2));
        assert_eq!(sim.coefficients.dim(), (2, 6));
        assert_abs_diff_eq!(
            sim.relative_means[&0],
            sim.programs[&0].dot(&sim.coefficients),
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn bad_inter_branch_tol_fails_fast() {
        let tree = LineageTree::new(vec![], BTreeMap::from([(0, 15)]), 2, 6).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let params = LineageParams {
            inter_branch_tol: -0.1,
            ..Default::default()
        };
        let err = simulate_lineage(&tree, &params, &mut rng).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LineageError>(),
            Some(&LineageError::InvalidTolerance {
                name: "inter_branch_tol",
                value: -0.1
            })
        );
    }

    #[test]
    fn missing_branch_length_is_reported() {
        // branch 1 appears only in the topology
        let tree = LineageTree::new(vec![(0, 1)], BTreeMap::from([(0, 10)]), 2, 4).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let err = simulate_lineage(&tree, &LineageParams::default(), &mut rng).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LineageError>(),
            Some(&LineageError::InsufficientTreeSpecification {
                branches: 2,
                lengths: 1
            })
        );
    }

    #[test]
    fn divergence_budget_is_enforced() {
        // one program: net changes of two branches are perfectly
        // correlated or anti-correlated, so a zero tolerance fails half
        // the time
        let time = BTreeMap::from([(0, 10), (1, 10), (2, 10)]);
        let tree = LineageTree::new(vec![(0, 1), (0, 2)], time, 1, 10).unwrap();
        let params = LineageParams {
            inter_branch_tol: 0.0,
            max_divergence_attempts: 0,
            coefficients: Some(CoefficientPolicy::Gamma { shape: 1.0 }),
            ..Default::default()
        };

        let mut failures = 0;
        for seed in 0..20 {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            match simulate_lineage(&tree, &params, &mut rng) {
                Ok(sim) => {
                    let means = &sim.relative_means;
                    assert!(diverging_pair(&means[&1], &means[&2], 0.0));
                }
                Err(err) => {
                    assert!(matches!(
                        err.downcast_ref::<LineageError>(),
                        Some(LineageError::NotConverged { attempts: 0, .. })
                    ));
                    failures += 1;
                }
            }
        }
        assert!(failures > 0);
    }
}
