use crate::diffusion::diffusion;
use crate::error::{check_tolerance, LineageError};
use crate::tree::{BranchId, TreeReader};

use log::debug;
use matrix_util::traits::CorrelationOps;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Retry policy for drawing decorrelated expression programs
#[derive(Debug, Clone)]
pub struct ProgramParams {
    /// Largest absolute correlation tolerated between two programs
    pub cutoff: f64,
    /// Rejections of a single program before starting the branch over
    pub max_loops: usize,
    /// Branch restarts before giving up
    pub max_restarts: usize,
}

impl Default for ProgramParams {
    fn default() -> Self {
        Self {
            cutoff: 0.5,
            max_loops: 100,
            max_restarts: 1000,
        }
    }
}

/// Draw `modules` diffusion processes of length `steps` for one branch
/// of the lineage tree, as a `steps × modules` matrix `W`.
///
/// Each column is a relative expression program: from 0 (silent) to a
/// small positive value (a few times the baseline). A new column is
/// kept only if its absolute correlation with every column before it
/// stays within `params.cutoff`; otherwise it is drawn again. After
/// more than `params.max_loops` failures on the same column the whole
/// matrix is discarded and drawn from scratch, at most
/// `params.max_restarts` times.
///
/// High `modules` or a strict cutoff make restarts likely.
pub fn sim_expr_branch(
    steps: usize,
    modules: usize,
    params: &ProgramParams,
    rng: &mut impl Rng,
) -> anyhow::Result<Array2<f64>> {
    let mut ww = Array2::<f64>::zeros((modules, steps));

    for restart in 0..=params.max_restarts {
        if fill_programs(&mut ww, params, rng)? {
            return Ok(ww.reversed_axes());
        }
        debug!(
            "restarting a {} x {} program matrix ({} restarts so far)",
            steps,
            modules,
            restart + 1
        );
    }

    Err(LineageError::NotConverged {
        what: "expression program decorrelation",
        attempts: params.max_restarts + 1,
    }
    .into())
}

/// One pass over all rows of `ww` (modules × steps). `false` if some
/// row kept correlating for too long.
fn fill_programs(
    ww: &mut Array2<f64>,
    params: &ProgramParams,
    rng: &mut impl Rng,
) -> anyhow::Result<bool> {
    let (modules, steps) = ww.dim();
    ww.fill(0.0);

    let mut k = 0;
    let mut loops = 0;
    while k < modules {
        ww.row_mut(k).assign(&diffusion(steps, rng)?);

        if ww.max_abs_correlation_upto(k) > params.cutoff {
            loops += 1;
            if loops > params.max_loops {
                return Ok(false);
            }
        } else {
            loops = 0;
            k += 1;
        }
    }
    Ok(true)
}

/// Relative expression of all programs on every branch of the tree
///
/// * `tree` - lineage tree
/// * `tol` - correlation cut-off between programs of the same branch
pub fn simulate_expression_programs<T>(
    tree: &T,
    tol: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<BTreeMap<BranchId, Array2<f64>>>
where
    T: TreeReader + ?Sized,
{
    check_tolerance("tol", tol)?;
    let params = ProgramParams {
        cutoff: tol,
        ..Default::default()
    };
    draw_branch_programs(tree, tree.branches(), &params, rng)
}

/// Draw a program matrix for each of `branches`.
///
/// Branches are simulated in parallel. Each gets its own generator
/// seeded from `rng` in the order of `branches`, so the result does not
/// depend on thread scheduling.
pub fn draw_branch_programs<T>(
    tree: &T,
    branches: &[BranchId],
    params: &ProgramParams,
    rng: &mut impl Rng,
) -> anyhow::Result<BTreeMap<BranchId, Array2<f64>>>
where
    T: TreeReader + ?Sized,
{
    let modules = tree.num_modules();

    let jobs = branches
        .iter()
        .map(|&b| -> anyhow::Result<(BranchId, usize, u64)> {
            let steps = tree.branch_length(b).ok_or(
                LineageError::InsufficientTreeSpecification {
                    branches: tree.branches().len(),
                    lengths: tree.branch_lengths().len(),
                },
            )?;
            Ok((b, steps, rng.random::<u64>()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    jobs.into_par_iter()
        .map(|(b, steps, seed)| -> anyhow::Result<(BranchId, Array2<f64>)> {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            Ok((b, sim_expr_branch(steps, modules, params, &mut rng)?))
        })
        .collect()
}
