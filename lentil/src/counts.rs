use crate::error::LineageError;
use crate::tree::{BranchId, TreeReader};

use indicatif::ParallelProgressIterator;
use log::{info, warn};
use ndarray::{Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, LogNormal, Normal, Poisson};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// A count-model parameter that is either shared by all genes or given
/// gene by gene
#[derive(Debug, Clone, PartialEq)]
pub enum GeneParam {
    Shared(f64),
    PerGene(Vec<f64>),
}

impl From<f64> for GeneParam {
    fn from(x: f64) -> Self {
        GeneParam::Shared(x)
    }
}

impl From<Vec<f64>> for GeneParam {
    fn from(xx: Vec<f64>) -> Self {
        GeneParam::PerGene(xx)
    }
}

impl GeneParam {
    /// One value per gene
    pub fn expand(&self, genes: usize) -> anyhow::Result<Vec<f64>> {
        match self {
            GeneParam::Shared(x) => Ok(vec![*x; genes]),
            GeneParam::PerGene(xx) if xx.len() == genes => Ok(xx.clone()),
            GeneParam::PerGene(xx) => Err(LineageError::InvalidParameter(format!(
                "expected {} per-gene values, got {}",
                genes,
                xx.len()
            ))
            .into()),
        }
    }
}

/// Parameters of the count-drawing stage
#[derive(Debug, Clone)]
pub struct CountParams {
    /// Quadratic term of the variance, `var = α μ² + β μ`
    pub alpha: GeneParam,
    /// Linear term of the variance
    pub beta: GeneParam,
    /// Apply a cell-specific library size factor
    pub scale: bool,
    /// Spread (log scale) of the library size factors
    pub scale_v: f64,
    /// Show a progress bar
    pub verbose: bool,
}

impl Default for CountParams {
    fn default() -> Self {
        Self {
            alpha: GeneParam::Shared(0.3),
            beta: GeneParam::Shared(2.0),
            scale: true,
            scale_v: 0.7,
            verbose: false,
        }
    }
}

/// Parameters `(p, r)` of a negative binomial count distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegBinParams {
    pub p: f64,
    pub r: f64,
}

/// Turns a target mean into one sampled count
pub trait CountModel: Sync {
    /// Distribution parameters for mean `mu` of a gene with variance
    /// coefficients `alpha`, `beta`
    fn params(&self, mu: f64, alpha: f64, beta: f64) -> NegBinParams;

    fn draw<R: Rng>(&self, params: NegBinParams, rng: &mut R) -> u64;
}

/// Largest Poisson rate drawn from; `rand_distr` rejects rates near
/// `u64::MAX`
pub const MAX_POISSON_RATE: f64 = 1.0e19;

/// Negative binomial UMI counts with `var = α μ² + β μ`
#[derive(Debug, Clone, Copy, Default)]
pub struct NegativeBinomialUmi;

/// Negative binomial parameters for mean `m` and variance
/// `s = a m² + b m`:
///
/// ```text
/// p = (s - m) / s,    r = m² / (s - m)
/// ```
///
/// A non-positive mean (or no overdispersion) gives `r = 0`, which
/// always draws zero.
pub fn get_pr_umi(a: f64, b: f64, m: f64) -> NegBinParams {
    let s = a * m * m + b * m;
    if !(m > 0.0) || !(s > m) || !s.is_finite() {
        return NegBinParams { p: 0.0, r: 0.0 };
    }
    NegBinParams {
        p: (s - m) / s,
        r: m * m / (s - m),
    }
}

impl CountModel for NegativeBinomialUmi {
    fn params(&self, mu: f64, alpha: f64, beta: f64) -> NegBinParams {
        get_pr_umi(alpha, beta, mu)
    }

    /// Gamma-Poisson mixture: `λ ~ Gamma(r, p/(1-p))`, `y ~ Poisson(λ)`
    ///
    /// `λ` is capped at `MAX_POISSON_RATE`; a capped or undefined rate is
    /// logged.
    fn draw<R: Rng>(&self, params: NegBinParams, rng: &mut R) -> u64 {
        let NegBinParams { p, r } = params;
        if !(r > 0.0) || !(p > 0.0) || !(p < 1.0) {
            return 0;
        }

        let lambda = match Gamma::new(r, p / (1.0 - p)) {
            Ok(gamma) => gamma.sample(rng),
            Err(e) => {
                warn!("no gamma rate for r={}, p={}: {}; drawing 0", r, p, e);
                return 0;
            }
        };

        let lambda = if lambda > MAX_POISSON_RATE {
            warn!(
                "poisson rate {:e} capped at {:e} (r={:e}, p={})",
                lambda, MAX_POISSON_RATE, r, p
            );
            MAX_POISSON_RATE
        } else {
            lambda
        };

        match Poisson::new(lambda) {
            Ok(pois) => pois.sample(rng) as u64,
            Err(e) => {
                if lambda != 0.0 {
                    warn!("no poisson draw for rate {}: {}; drawing 0", lambda, e);
                }
                0
            }
        }
    }
}

/// Per-gene variance coefficients drawn log-normally around the given
/// means; `β` is shifted by one so that every gene is overdispersed
///
/// * `genes` - number of genes
/// * `mean_alpha` - typical `α`
/// * `mean_beta` - typical `β - 1`
pub fn generate_negbin_params(
    genes: usize,
    mean_alpha: f64,
    mean_beta: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
    const SPREAD: f64 = 1.5;

    if !(mean_alpha > 0.0) || !(mean_beta > 0.0) {
        return Err(LineageError::InvalidParameter(format!(
            "count model means must be positive (alpha={}, beta={})",
            mean_alpha, mean_beta
        ))
        .into());
    }

    let ln_alpha = Normal::new(mean_alpha.ln(), SPREAD.ln())?;
    let ln_beta = Normal::new(mean_beta.ln(), SPREAD.ln())?;

    let alphas = (0..genes).map(|_| ln_alpha.sample(rng).exp()).collect();
    let betas = (0..genes).map(|_| ln_beta.sample(rng).exp() + 1.0).collect();
    Ok((alphas, betas))
}

/// Library size factor for each of `n` cells: `exp(N(0, scale_v))`, or
/// all ones when `scale` is off
pub fn calc_scalings(
    n: usize,
    scale: bool,
    scale_v: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<Vec<f64>> {
    if !scale {
        return Ok(vec![1.0; n]);
    }
    let lognormal = LogNormal::new(0.0, scale_v)?;
    Ok((0..n).map(|_| lognormal.sample(rng)).collect())
}

/// Assign every pseudotime to one of the branches present at that
/// time, uniformly at random
pub fn pick_branches<T>(
    tree: &T,
    pseudotime: &[usize],
    rng: &mut impl Rng,
) -> anyhow::Result<Vec<BranchId>>
where
    T: TreeReader + ?Sized,
{
    let mut candidates: BTreeMap<usize, Vec<BranchId>> = BTreeMap::new();
    pseudotime
        .iter()
        .map(|&t| {
            let possible = candidates.entry(t).or_insert_with(|| tree.branches_at(t));
            if possible.is_empty() {
                return Err(LineageError::NoBranchAtPseudotime(t).into());
            }
            Ok(possible[rng.random_range(0..possible.len())])
        })
        .collect()
}

/// A row of precomputed means, flagged when the pseudotime ran past the
/// end of the trajectory and the last row was used instead
#[derive(Debug, Clone, PartialEq)]
pub enum MeanLookup<'a> {
    Exact(ArrayView1<'a, f64>),
    Clamped(ArrayView1<'a, f64>),
}

impl<'a> MeanLookup<'a> {
    pub fn row(&self) -> ArrayView1<'a, f64> {
        match self {
            MeanLookup::Exact(row) | MeanLookup::Clamped(row) => row.clone(),
        }
    }

    pub fn is_clamped(&self) -> bool {
        matches!(self, MeanLookup::Clamped(_))
    }
}

/// Mean expression of the branch whose trajectory `means` starts at
/// pseudotime `start`, looked up at pseudotime `t`
///
/// `means` needs at least one row.
pub fn lookup_mean_row(means: &Array2<f64>, start: usize, t: usize) -> MeanLookup<'_> {
    match t.checked_sub(start) {
        Some(offset) if offset < means.nrows() => MeanLookup::Exact(means.row(offset)),
        _ => MeanLookup::Clamped(means.row(means.nrows().saturating_sub(1))),
    }
}

/// Cells sampled from the lineage tree
#[derive(Debug, Clone)]
pub struct SampledCells {
    /// UMI counts, cells × genes
    pub counts: Array2<u64>,
    pub pseudotime: Vec<usize>,
    pub branches: Vec<BranchId>,
    /// Library size factor of each cell
    pub scalings: Vec<f64>,
}

/// Sample cells at the given pseudotimes. Cells without a branch
/// assignment are put on a random branch present at their pseudotime.
///
/// * `tree` - lineage tree with mean expression (`add_genes`)
/// * `pseudotime` - pseudotime of each cell
/// * `branches` - optional branch of each cell
/// * `params` - count model and library size parameters
/// * `model` - count distribution
pub fn sample_data_at_times<T, M>(
    tree: &T,
    pseudotime: Vec<usize>,
    branches: Option<Vec<BranchId>>,
    params: &CountParams,
    model: &M,
    rng: &mut impl Rng,
) -> anyhow::Result<SampledCells>
where
    T: TreeReader + ?Sized,
    M: CountModel,
{
    let gg = tree.num_genes();
    let alpha = params.alpha.expand(gg)?;
    let beta = params.beta.expand(gg)?;

    if let Some((a, b)) = alpha
        .iter()
        .copied()
        .zip(beta.iter().copied())
        .find(|&(a, b)| !(a >= 0.0) || !(b >= 1.0) || (a == 0.0 && b == 1.0))
    {
        return Err(LineageError::InvalidParameter(format!(
            "count model needs alpha >= 0 and beta >= 1, and not both at the boundary (alpha={}, beta={})",
            a, b
        ))
        .into());
    }

    let branches = match branches {
        Some(bb) if bb.len() == pseudotime.len() => bb,
        Some(bb) => {
            return Err(LineageError::InvalidParameter(format!(
                "{} branch assignments for {} cells",
                bb.len(),
                pseudotime.len()
            ))
            .into())
        }
        None => pick_branches(tree, &pseudotime, rng)?,
    };

    let scalings = calc_scalings(pseudotime.len(), params.scale, params.scale_v, rng)?;

    let counts = draw_counts(
        tree,
        &pseudotime,
        &branches,
        &scalings,
        &alpha,
        &beta,
        model,
        params.verbose,
        rng,
    )?;

    Ok(SampledCells {
        counts,
        pseudotime,
        branches,
        scalings,
    })
}

/// UMI counts of every gene for every cell given by its pseudotime,
/// branch and library size factor
///
/// Cells are drawn in parallel, each from its own generator seeded
/// from `rng`, so the matrix does not depend on thread scheduling.
#[allow(clippy::too_many_arguments)]
pub fn draw_counts<T, M>(
    tree: &T,
    pseudotime: &[usize],
    branches: &[BranchId],
    scalings: &[f64],
    alpha: &[f64],
    beta: &[f64],
    model: &M,
    verbose: bool,
    rng: &mut impl Rng,
) -> anyhow::Result<Array2<u64>>
where
    T: TreeReader + ?Sized,
    M: CountModel,
{
    let nn = branches.len();
    let gg = tree.num_genes();
    let bt = tree.branch_times();

    // borrow everything a cell needs before going parallel
    let mut cells = Vec::with_capacity(nn);
    for (n, (&t, &b)) in pseudotime.iter().zip(branches.iter()).enumerate() {
        let (start, _) = *bt.get(&b).ok_or(LineageError::UnknownBranch(b))?;
        let means = tree.means(b).ok_or(LineageError::MissingMeans(b))?;
        if means.nrows() == 0 || means.ncols() != gg {
            return Err(LineageError::InvalidParameter(format!(
                "means of branch {} have shape {:?}, expected (_, {})",
                b,
                means.dim(),
                gg
            ))
            .into());
        }
        cells.push((n, t, b, start, means));
    }

    let seed = rng.random::<u64>();

    let draw_cell = |&(n, t, b, start, means): &(usize, usize, BranchId, usize, &Array2<f64>)| {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(n as u64));
        let lookup = lookup_mean_row(means, start, t);
        if lookup.is_clamped() {
            warn!(
                "pseudotime {} is outside branch {} (start {}, {} points): using its last row",
                t,
                b,
                start,
                means.nrows()
            );
        }
        let mu_g = lookup.row();
        let y_g: Vec<u64> = (0..gg)
            .map(|g| {
                let params = model.params(mu_g[g] * scalings[n], alpha[g], beta[g]);
                model.draw(params, &mut rng)
            })
            .collect();
        (y_g, lookup.is_clamped())
    };

    let rows: Vec<(Vec<u64>, bool)> = if verbose {
        cells
            .par_iter()
            .progress_count(nn as u64)
            .map(draw_cell)
            .collect()
    } else {
        cells.par_iter().map(draw_cell).collect()
    };

    let nclamped = rows.iter().filter(|(_, clamped)| *clamped).count();
    if nclamped > 0 {
        warn!("{} of {} cells fell outside their branch", nclamped, nn);
    }

    let data: Vec<u64> = rows.into_iter().flat_map(|(y_g, _)| y_g).collect();
    let counts = Array2::from_shape_vec((nn, gg), data)?;

    info!(
        "sampled {} cells x {} genes ({} non-zero counts)",
        nn,
        gg,
        counts.iter().filter(|&&y| y > 0).count()
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LineageTree;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tree_with_means() -> LineageTree {
        let time = BTreeMap::from([(0, 3), (1, 2), (2, 2)]);
        let mut tree = LineageTree::new(vec![(0, 1), (0, 2)], time, 2, 2).unwrap();
        tree.add_genes(BTreeMap::from([
            (0, array![[1.0, 2.0], [1.0, 2.0], [1.0, 2.0]]),
            (1, array![[5.0, 0.0], [50.0, 0.0]]),
            (2, array![[0.0, 5.0], [0.0, 50.0]]),
        ]));
        tree
    }

    #[test]
    fn pr_recovers_mean_and_variance() {
        let (a, b, m) = (0.3, 2.0, 10.0);
        let NegBinParams { p, r } = get_pr_umi(a, b, m);
        // mean r p/(1-p), variance r p/(1-p)^2
        assert_abs_diff_eq!(r * p / (1.0 - p), m, epsilon = 1e-9);
        assert_abs_diff_eq!(r * p / (1.0 - p).powi(2), a * m * m + b * m, epsilon = 1e-9);
    }

    #[test]
    fn zero_mean_draws_zero() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let model = NegativeBinomialUmi;
        for _ in 0..10 {
            assert_eq!(model.draw(model.params(0.0, 0.3, 2.0), &mut rng), 0);
        }
    }

    #[test]
    fn draws_track_the_mean() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let model = NegativeBinomialUmi;
        let params = model.params(20.0, 0.1, 2.0);
        let n = 20_000;
        let total: u64 = (0..n).map(|_| model.draw(params, &mut rng)).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - 20.0).abs() < 1.0, "mean = {}", mean);
    }

    #[test]
    fn huge_mean_is_capped_not_dropped() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(12);
        let model = NegativeBinomialUmi;
        let params = model.params(1e25, 0.0, 2.0);
        assert!(params.r > 0.0);

        let y = model.draw(params, &mut rng);
        assert!(y as f64 > 0.5 * MAX_POISSON_RATE, "y = {}", y);
    }

    #[test]
    fn pseudotime_past_the_branch_uses_its_last_row() -> anyhow::Result<()> {
        let time = BTreeMap::from([(0, 3), (1, 2)]);
        let mut tree = LineageTree::new(vec![(0, 1)], time, 2, 2)?;
        tree.add_genes(BTreeMap::from([
            (0, array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0]]),
            (1, array![[0.0, 0.0], [50.0, 0.0]]),
        ]));

        let mut rng = rand::rngs::StdRng::seed_from_u64(13);
        let params = CountParams {
            scale: false,
            ..Default::default()
        };
        let cells = sample_data_at_times(
            &tree,
            vec![99; 30],
            Some(vec![1; 30]),
            &params,
            &NegativeBinomialUmi,
            &mut rng,
        )?;

        assert_eq!(cells.counts.dim(), (30, 2));
        assert!(cells.counts.column(1).iter().all(|&y| y == 0));
        // the first row of branch 1 would give only zeros
        assert!(cells.counts.column(0).iter().any(|&y| y > 0));
        Ok(())
    }

    #[test]
    fn lookup_clamps_past_the_end() {
        let means = array![[1.0], [2.0], [3.0]];
        assert_eq!(lookup_mean_row(&means, 10, 11), MeanLookup::Exact(means.row(1)));
        assert_eq!(lookup_mean_row(&means, 10, 13), MeanLookup::Clamped(means.row(2)));
        assert!(lookup_mean_row(&means, 10, 4).is_clamped());
    }

    #[test]
    fn picked_branches_exist_at_their_time() -> anyhow::Result<()> {
        let tree = tree_with_means();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let times = vec![0, 2, 3, 4, 3, 4];
        let picked = pick_branches(&tree, &times, &mut rng)?;
        for (&t, &b) in times.iter().zip(picked.iter()) {
            assert!(tree.branches_at(t).contains(&b));
        }
        let err = pick_branches(&tree, &[5], &mut rng).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LineageError>(),
            Some(&LineageError::NoBranchAtPseudotime(5))
        );
        Ok(())
    }

    #[test]
    fn unscaled_cells_have_unit_scalings() -> anyhow::Result<()> {
        let tree = tree_with_means();
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let params = CountParams {
            scale: false,
            ..Default::default()
        };
        let cells = sample_data_at_times(
            &tree,
            vec![0, 1, 2, 3, 4],
            None,
            &params,
            &NegativeBinomialUmi,
            &mut rng,
        )?;
        assert_eq!(cells.counts.dim(), (5, 2));
        assert!(cells.scalings.iter().all(|&s| s == 1.0));
        Ok(())
    }

    #[test]
    fn counts_follow_branch_means() -> anyhow::Result<()> {
        let tree = tree_with_means();
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let times = vec![4; 50];
        let cells = sample_data_at_times(
            &tree,
            times,
            Some(vec![1; 50]),
            &CountParams::default(),
            &NegativeBinomialUmi,
            &mut rng,
        )?;
        // branch 1 never expresses the second gene
        assert!(cells.counts.column(1).iter().all(|&y| y == 0));
        assert!(cells.counts.column(0).iter().any(|&y| y > 0));
        Ok(())
    }

    #[test]
    fn cell_draws_do_not_depend_on_threads() -> anyhow::Result<()> {
        let tree = tree_with_means();
        let times: Vec<usize> = (0..200).map(|i| i % 5).collect();

        let mut rng_a = rand::rngs::StdRng::seed_from_u64(6);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(6);
        let params = CountParams::default();
        let a = sample_data_at_times(&tree, times.clone(), None, &params, &NegativeBinomialUmi, &mut rng_a)?;
        let b = sample_data_at_times(&tree, times, None, &params, &NegativeBinomialUmi, &mut rng_b)?;

        assert_eq!(a.counts, b.counts);
        assert_eq!(a.branches, b.branches);
        Ok(())
    }

    #[test]
    fn per_gene_params_must_match_genes() {
        let tree = tree_with_means();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let params = CountParams {
            alpha: GeneParam::PerGene(vec![0.1, 0.2, 0.3]),
            ..Default::default()
        };
        let err = sample_data_at_times(&tree, vec![0], None, &params, &NegativeBinomialUmi, &mut rng)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LineageError>(),
            Some(LineageError::InvalidParameter(_))
        ));
    }

    #[test]
    fn negbin_params_are_overdispersed() -> anyhow::Result<()> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(8);
        let (alphas, betas) = generate_negbin_params(100, 0.2, 3.0, &mut rng)?;
        assert_eq!(alphas.len(), 100);
        assert!(alphas.iter().all(|&a| a > 0.0));
        assert!(betas.iter().all(|&b| b > 1.0));
        Ok(())
    }
}
