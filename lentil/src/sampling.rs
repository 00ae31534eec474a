use crate::coefficients::{CoefficientPolicy, DEFAULT_GAMMA_SHAPE};
use crate::counts::{
    generate_negbin_params, sample_data_at_times, CountParams, GeneParam, NegativeBinomialUmi,
    SampledCells,
};
use crate::error::LineageError;
use crate::lineage::{simulate_lineage, LineageParams, LineageSimulation};
use crate::tree::{BranchId, TreeReader};

use log::{debug, info};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{weighted::WeightedIndex, Distribution, LogNormal, Normal};
use std::collections::BTreeMap;

/// Parameters for `sample_whole_tree_restricted`
#[derive(Debug, Clone)]
pub struct RestrictedParams {
    /// Typical `α` of the per-gene count model
    pub alpha: f64,
    /// Typical `β - 1` of the per-gene count model
    pub beta: f64,
    /// Location of the log base expression of each gene
    pub gene_loc: f64,
    /// Spread of the log base expression of each gene
    pub gene_s: f64,
    pub lineage: LineageParams,
    /// Lineage simulations tried before giving up on matching lengths
    pub max_attempts: usize,
    pub scale: bool,
    pub scale_v: f64,
    pub verbose: bool,
}

impl Default for RestrictedParams {
    fn default() -> Self {
        let counts = CountParams::default();
        Self {
            alpha: 0.2,
            beta: 3.0,
            gene_loc: 0.8,
            gene_s: 1.0,
            lineage: LineageParams {
                coefficients: Some(CoefficientPolicy::Gamma {
                    shape: DEFAULT_GAMMA_SHAPE,
                }),
                ..Default::default()
            },
            max_attempts: 100,
            scale: counts.scale,
            scale_v: counts.scale_v,
            verbose: counts.verbose,
        }
    }
}

/// Base expression level of every gene, `exp(N(loc, s))`
pub fn draw_gene_scale(
    genes: usize,
    loc: f64,
    s: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<Vec<f64>> {
    let lognormal = LogNormal::new(loc, s)?;
    Ok((0..genes).map(|_| lognormal.sample(rng)).collect())
}

/// Absolute mean expression `exp(relative) * gene_scale` of every branch
pub fn absolute_means(
    relative_means: &BTreeMap<BranchId, Array2<f64>>,
    gene_scale: &[f64],
) -> anyhow::Result<BTreeMap<BranchId, Array2<f64>>> {
    let scale = Array1::from_vec(gene_scale.to_vec());
    relative_means
        .iter()
        .map(|(&b, rel)| -> anyhow::Result<(BranchId, Array2<f64>)> {
            if rel.ncols() != scale.len() {
                return Err(LineageError::InvalidParameter(format!(
                    "{} gene scales for {} genes on branch {}",
                    scale.len(),
                    rel.ncols(),
                    b
                ))
                .into());
            }
            Ok((b, rel.mapv(f64::exp) * &scale))
        })
        .collect()
}

/// Every branch of the tree has a mean trajectory as long as the branch
pub fn are_lengths_ok<T>(tree: &T, means: &BTreeMap<BranchId, Array2<f64>>) -> bool
where
    T: TreeReader + ?Sized,
{
    !means.is_empty()
        && tree.branches().iter().all(|&b| {
            matches!(
                (means.get(&b), tree.branch_length(b)),
                (Some(m), Some(len)) if m.nrows() == len
            )
        })
}

/// Simulate a lineage with per-gene count parameters and sample every
/// pseudotime of the tree once, on a random branch.
///
/// The mean expression of the tree is overwritten. Returns the lineage
/// simulation behind the means together with the sampled cells.
pub fn sample_whole_tree_restricted<T>(
    tree: &mut T,
    params: &RestrictedParams,
    rng: &mut impl Rng,
) -> anyhow::Result<(LineageSimulation, SampledCells)>
where
    T: TreeReader + ?Sized,
{
    let gg = tree.num_genes();
    let gene_scale = draw_gene_scale(gg, params.gene_loc, params.gene_s, rng)?;

    let mut accepted = None;
    for attempt in 0..params.max_attempts {
        let sim = simulate_lineage(&*tree, &params.lineage, rng)?;
        let means = absolute_means(&sim.relative_means, &gene_scale)?;
        if are_lengths_ok(&*tree, &means) {
            accepted = Some((sim, means));
            break;
        }
        debug!("lineage attempt {} gave mismatched branch lengths", attempt + 1);
    }

    let (sim, means) = accepted.ok_or(LineageError::NotConverged {
        what: "restricted branch lengths",
        attempts: params.max_attempts,
    })?;

    tree.add_genes(means);

    let (alphas, betas) = generate_negbin_params(gg, params.alpha, params.beta, rng)?;
    let count_params = CountParams {
        alpha: GeneParam::PerGene(alphas),
        beta: GeneParam::PerGene(betas),
        scale: params.scale,
        scale_v: params.scale_v,
        verbose: params.verbose,
    };

    let pseudotime: Vec<usize> = (0..tree.max_time()).collect();
    let cells = sample_data_at_times(
        &*tree,
        pseudotime,
        None,
        &count_params,
        &NegativeBinomialUmi,
        rng,
    )?;
    Ok((sim, cells))
}

/// Number of cells sampled around each time point
#[derive(Debug, Clone, PartialEq)]
pub enum CellsPerPoint {
    /// Split evenly over the points, the remainder going to the
    /// earliest ones
    Total(usize),
    PerPoint(Vec<usize>),
}

/// Standard deviation of pseudotimes around each time point
#[derive(Debug, Clone, PartialEq)]
pub enum Spread {
    Uniform(f64),
    PerPoint(Vec<f64>),
}

/// One cell count and one spread per time point
pub fn process_timeseries_input(
    cells: &CellsPerPoint,
    series_points: &[usize],
    spread: &Spread,
) -> anyhow::Result<(Vec<usize>, Vec<f64>)> {
    let npts = series_points.len();
    if npts == 0 {
        return Err(LineageError::InvalidParameter("no time points given".into()).into());
    }

    let cells = match cells {
        CellsPerPoint::Total(total) => (0..npts)
            .map(|i| total / npts + usize::from(i < total % npts))
            .collect(),
        CellsPerPoint::PerPoint(nn) if nn.len() == npts => nn.clone(),
        CellsPerPoint::PerPoint(nn) => {
            return Err(LineageError::InvalidParameter(format!(
                "{} cell counts for {} time points",
                nn.len(),
                npts
            ))
            .into())
        }
    };

    let spread = match spread {
        Spread::Uniform(s) => vec![*s; npts],
        Spread::PerPoint(ss) if ss.len() == npts => ss.clone(),
        Spread::PerPoint(ss) => {
            return Err(LineageError::InvalidParameter(format!(
                "{} spreads for {} time points",
                ss.len(),
                npts
            ))
            .into())
        }
    };

    Ok((cells, spread))
}

/// Pseudotimes of `no_cells` cells scattered around `timepoint`
///
/// Draws from `N(timepoint, var)`, truncates toward zero and maps
/// everything outside the tree to its first or last pseudotime.
pub fn draw_times(
    timepoint: usize,
    no_cells: usize,
    max_time: usize,
    var: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<Vec<usize>> {
    if max_time == 0 {
        return Err(LineageError::InvalidParameter("tree has no pseudotime".into()).into());
    }
    let normal = Normal::new(timepoint as f64, var)?;
    let last = (max_time - 1) as i64;

    Ok((0..no_cells)
        .map(|_| (normal.sample(rng) as i64).clamp(0, last) as usize)
        .collect())
}

/// Sample cells the way a time-course experiment would: a cloud of
/// pseudotimes around each of the `series_points`
pub fn sample_pseudotime_series<T>(
    tree: &T,
    cells: &CellsPerPoint,
    series_points: &[usize],
    spread: &Spread,
    params: &CountParams,
    rng: &mut impl Rng,
) -> anyhow::Result<SampledCells>
where
    T: TreeReader + ?Sized,
{
    let (cells, spread) = process_timeseries_input(cells, series_points, spread)?;
    let max_time = tree.max_time();

    let mut pseudotime = Vec::with_capacity(cells.iter().sum());
    for ((&t, &n), &var) in series_points.iter().zip(cells.iter()).zip(spread.iter()) {
        pseudotime.extend(draw_times(t, n, max_time, var, rng)?);
    }

    info!(
        "drew {} pseudotimes around {} time points",
        pseudotime.len(),
        series_points.len()
    );
    sample_data_at_times(tree, pseudotime, None, params, &NegativeBinomialUmi, rng)
}

/// Sample `n` (pseudotime, branch) points with replacement, weighted by
/// the density of the tree
pub fn sample_density<T>(
    tree: &T,
    n: usize,
    params: &CountParams,
    rng: &mut impl Rng,
) -> anyhow::Result<SampledCells>
where
    T: TreeReader + ?Sized,
{
    let bt = tree.branch_times();

    let mut universe = vec![];
    let mut weights = vec![];
    for &b in tree.branches() {
        let (start, end) = *bt.get(&b).ok_or(LineageError::UnknownBranch(b))?;
        let dens = tree.density(b).ok_or_else(|| {
            LineageError::InvalidParameter(format!("no density for branch {}", b))
        })?;
        if dens.len() != end - start + 1 {
            return Err(LineageError::InvalidParameter(format!(
                "density of branch {} has {} entries, expected {}",
                b,
                dens.len(),
                end - start + 1
            ))
            .into());
        }
        universe.extend((start..=end).map(|t| (t, b)));
        weights.extend_from_slice(dens);
    }

    let disc = WeightedIndex::new(&weights)?;
    let (pseudotime, branches): (Vec<usize>, Vec<BranchId>) =
        (0..n).map(|_| universe[disc.sample(rng)]).unzip();

    sample_data_at_times(
        tree,
        pseudotime,
        Some(branches),
        params,
        &NegativeBinomialUmi,
        rng,
    )
}

/// Branches active over the whole of each timezone
pub fn assign_branches(
    branch_times: &BTreeMap<BranchId, (usize, usize)>,
    timezones: &[(usize, usize)],
) -> Vec<Vec<BranchId>> {
    timezones
        .iter()
        .map(|&(zs, ze)| {
            branch_times
                .iter()
                .filter(|(_, (start, end))| *start <= zs && ze <= *end)
                .map(|(&b, _)| b)
                .collect()
        })
        .collect()
}

/// Every (pseudotime, branch) point of the tree, timezone by timezone
pub fn cover_whole_tree<T>(tree: &T) -> (Vec<usize>, Vec<BranchId>)
where
    T: TreeReader + ?Sized,
{
    let zones = tree.timezones();
    let assignments = assign_branches(&tree.branch_times(), &zones);

    let mut pseudotime = vec![];
    let mut branches = vec![];
    for (&(start, end), active) in zones.iter().zip(assignments.iter()) {
        for &b in active {
            pseudotime.extend(start..=end);
            branches.extend(std::iter::repeat_n(b, end - start + 1));
        }
    }
    (pseudotime, branches)
}

/// Sample every (pseudotime, branch) point of the tree `n_factor` times
pub fn sample_whole_tree<T>(
    tree: &T,
    n_factor: usize,
    params: &CountParams,
    rng: &mut impl Rng,
) -> anyhow::Result<SampledCells>
where
    T: TreeReader + ?Sized,
{
    if n_factor == 0 {
        return Err(LineageError::InvalidParameter("n_factor must be at least 1".into()).into());
    }

    let (pseudotime, branches) = cover_whole_tree(tree);
    let pseudotime: Vec<usize> = pseudotime
        .into_iter()
        .flat_map(|t| std::iter::repeat_n(t, n_factor))
        .collect();
    let branches: Vec<BranchId> = branches
        .into_iter()
        .flat_map(|b| std::iter::repeat_n(b, n_factor))
        .collect();

    sample_data_at_times(
        tree,
        pseudotime,
        Some(branches),
        params,
        &NegativeBinomialUmi,
        rng,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LineageTree;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn bifurcation() -> LineageTree {
        let time = BTreeMap::from([(0, 4), (1, 3), (2, 5)]);
        LineageTree::new(vec![(0, 1), (0, 2)], time, 2, 3).unwrap()
    }

    fn with_flat_means(mut tree: LineageTree) -> LineageTree {
        let means = tree
            .branch_lengths()
            .iter()
            .map(|(&b, &len)| (b, Array2::from_elem((len, tree.num_genes()), 5.0)))
            .collect();
        tree.add_genes(means);
        tree
    }

    #[test]
    fn draw_times_stays_inside_the_tree() -> anyhow::Result<()> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let times = draw_times(50, 100, 60, 4.0, &mut rng)?;
        assert_eq!(times.len(), 100);
        assert!(times.iter().all(|&t| t <= 59));

        let early = draw_times(0, 100, 60, 4.0, &mut rng)?;
        assert!(early.contains(&0));
        Ok(())
    }

    #[test]
    fn total_cells_are_split_over_points() -> anyhow::Result<()> {
        let (cells, spread) =
            process_timeseries_input(&CellsPerPoint::Total(10), &[5, 10, 15], &Spread::Uniform(2.0))?;
        assert_eq!(cells, vec![4, 3, 3]);
        assert_eq!(spread, vec![2.0; 3]);

        let err = process_timeseries_input(
            &CellsPerPoint::PerPoint(vec![1, 2]),
            &[5, 10, 15],
            &Spread::Uniform(2.0),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LineageError>(),
            Some(LineageError::InvalidParameter(_))
        ));
        Ok(())
    }

    #[test]
    fn cover_counts_every_point_once() {
        let tree = bifurcation();
        let (pseudotime, branches) = cover_whole_tree(&tree);
        // 4 points on the root, 3 + 5 after the split
        assert_eq!(pseudotime.len(), 12);
        assert_eq!(branches.iter().filter(|&&b| b == 2).count(), 5);
        for (&t, &b) in pseudotime.iter().zip(branches.iter()) {
            assert!(tree.branches_at(t).contains(&b));
        }
    }

    #[test]
    fn zones_get_active_branches() {
        let tree = bifurcation();
        let zones = tree.timezones();
        assert_eq!(zones, vec![(0, 3), (4, 6), (7, 8)]);
        assert_eq!(
            assign_branches(&tree.branch_times(), &zones),
            vec![vec![0], vec![1, 2], vec![2]]
        );
    }

    #[test]
    fn repeated_cover_keeps_pairs_together() -> anyhow::Result<()> {
        let tree = with_flat_means(bifurcation());
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let cells = sample_whole_tree(&tree, 3, &CountParams::default(), &mut rng)?;
        assert_eq!(cells.counts.nrows(), 36);
        assert_eq!(&cells.pseudotime[..4], &[0, 0, 0, 1]);
        assert_eq!(&cells.branches[..3], &[0, 0, 0]);
        Ok(())
    }

    #[test]
    fn density_draws_only_weighted_points() -> anyhow::Result<()> {
        let mut tree = with_flat_means(bifurcation());
        let mut density = BTreeMap::from([(0, vec![0.0; 4]), (1, vec![0.0; 3]), (2, vec![0.0; 5])]);
        density.insert(2, vec![0.0, 0.0, 1.0, 0.0, 0.0]);
        tree.set_density(density)?;

        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let cells = sample_density(&tree, 25, &CountParams::default(), &mut rng)?;
        assert!(cells.pseudotime.iter().all(|&t| t == 6));
        assert!(cells.branches.iter().all(|&b| b == 2));
        Ok(())
    }

    #[test]
    fn series_without_scaling() -> anyhow::Result<()> {
        let tree = with_flat_means(bifurcation());
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let params = CountParams {
            scale: false,
            ..Default::default()
        };
        let cells = sample_pseudotime_series(
            &tree,
            &CellsPerPoint::PerPoint(vec![5, 7]),
            &[2, 6],
            &Spread::Uniform(1.0),
            &params,
            &mut rng,
        )?;
        assert_eq!(cells.counts.dim(), (12, 3));
        assert!(cells.scalings.iter().all(|&s| s == 1.0));
        Ok(())
    }

    #[test]
    fn absolute_means_scale_each_gene() -> anyhow::Result<()> {
        let rel = BTreeMap::from([(0, array![[0.0, 0.0], [1.0, 0.0]])]);
        let abs = absolute_means(&rel, &[2.0, 3.0])?;
        assert_abs_diff_eq!(
            abs[&0],
            array![[2.0, 3.0], [2.0 * 1_f64.exp(), 3.0]],
            epsilon = 1e-12
        );
        assert!(absolute_means(&rel, &[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn lengths_must_match_every_branch() {
        let tree = bifurcation();
        assert!(!are_lengths_ok(&tree, &BTreeMap::new()));

        let mut means: BTreeMap<BranchId, Array2<f64>> = tree
            .branch_lengths()
            .iter()
            .map(|(&b, &len)| (b, Array2::zeros((len, 3))))
            .collect();
        assert!(are_lengths_ok(&tree, &means));

        means.insert(1, Array2::zeros((2, 3)));
        assert!(!are_lengths_ok(&tree, &means));
    }

    #[test]
    fn restricted_samples_every_pseudotime() -> anyhow::Result<()> {
        let mut tree = bifurcation();
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let (sim, cells) =
            sample_whole_tree_restricted(&mut tree, &RestrictedParams::default(), &mut rng)?;

        assert_eq!(cells.pseudotime, (0..9).collect::<Vec<_>>());
        assert_eq!(cells.counts.dim(), (9, 3));
        assert_eq!(sim.coefficients.dim(), (2, 3));
        for &b in tree.branches() {
            assert!(tree.means(b).is_some());
        }
        Ok(())
    }
}
