use crate::error::LineageError;
use crate::tree::TreeReader;

use log::{info, warn};
use matrix_util::traits::SampleOps;
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Beta, Distribution};

/// Gamma shape used when the caller does not pick a policy
pub const DEFAULT_GAMMA_SHAPE: f64 = 0.05;

/// How gene-to-program weights `H` (K × G) are drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoefficientPolicy {
    /// Dense: every program touches every gene, `H[k,g] ~ Gamma(shape, 1)`
    Gamma { shape: f64 },
    /// Sparse: every gene belongs to two programs, weights `~ Beta(a, b)`
    Beta { a: f64, b: f64 },
}

impl Default for CoefficientPolicy {
    fn default() -> Self {
        CoefficientPolicy::Gamma {
            shape: DEFAULT_GAMMA_SHAPE,
        }
    }
}

/// Decides which genes each program contributes to
pub trait GroupingProvider {
    /// Member genes of each of the `modules` programs
    fn create_groups<R: Rng>(
        &self,
        modules: usize,
        genes: usize,
        rng: &mut R,
    ) -> anyhow::Result<Vec<Vec<usize>>>;
}

/// Every gene joins two distinct programs picked uniformly at random
#[derive(Debug, Clone, Copy, Default)]
pub struct PairedModuleGrouping;

impl GroupingProvider for PairedModuleGrouping {
    fn create_groups<R: Rng>(
        &self,
        modules: usize,
        genes: usize,
        rng: &mut R,
    ) -> anyhow::Result<Vec<Vec<usize>>> {
        if modules < 2 {
            return Err(LineageError::InvalidParameter(format!(
                "assigning each gene to two programs needs at least 2 programs, got {}",
                modules
            ))
            .into());
        }

        let mut groups = vec![vec![]; modules];
        for g in 0..genes {
            for k in rand::seq::index::sample(rng, modules, 2) {
                groups[k].push(g);
            }
        }
        Ok(groups)
    }
}

/// Contribution of the K expression programs to the G genes
///
/// `None` falls back to `Gamma { shape: 0.05 }` with a warning. The
/// beta policy groups genes with `PairedModuleGrouping`.
pub fn simulate_coefficients<T>(
    tree: &T,
    policy: Option<CoefficientPolicy>,
    rng: &mut impl Rng,
) -> anyhow::Result<Array2<f64>>
where
    T: TreeReader + ?Sized,
{
    let policy = policy.unwrap_or_else(|| {
        warn!(
            "no coefficient policy specified: using gamma and a={}",
            DEFAULT_GAMMA_SHAPE
        );
        CoefficientPolicy::default()
    });
    simulate_coefficients_with(tree, policy, &PairedModuleGrouping, rng)
}

/// Same as `simulate_coefficients` with an explicit policy and gene
/// grouping
pub fn simulate_coefficients_with<T, G>(
    tree: &T,
    policy: CoefficientPolicy,
    grouping: &G,
    rng: &mut impl Rng,
) -> anyhow::Result<Array2<f64>>
where
    T: TreeReader + ?Sized,
    G: GroupingProvider,
{
    let kk = tree.num_modules();
    let gg = tree.num_genes();

    let coefficients = match policy {
        CoefficientPolicy::Gamma { shape } => sim_coeff_gamma(kk, gg, shape, rng)?,
        CoefficientPolicy::Beta { a, b } => {
            let groups = grouping.create_groups(kk, gg, rng)?;
            sim_coeff_beta(kk, gg, &groups, a, b, rng)?
        }
    };

    info!("simulated {} x {} coefficients ({:?})", kk, gg, policy);
    Ok(coefficients)
}

fn sim_coeff_gamma(
    kk: usize,
    gg: usize,
    shape: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<Array2<f64>> {
    Array2::<f64>::rgamma_with(kk, gg, (shape, 1.0), rng)
}

fn sim_coeff_beta(
    kk: usize,
    gg: usize,
    groups: &[Vec<usize>],
    a: f64,
    b: f64,
    rng: &mut impl Rng,
) -> anyhow::Result<Array2<f64>> {
    let beta = Beta::new(a, b)?;
    let mut hh = Array2::<f64>::zeros((kk, gg));

    for (k, members) in groups.iter().enumerate().take(kk) {
        for &g in members {
            if g >= gg {
                return Err(LineageError::InvalidParameter(format!(
                    "gene {} of program {} is out of range ({} genes)",
                    g, k, gg
                ))
                .into());
            }
            hh[(k, g)] += beta.sample(rng);
        }
    }
    Ok(hh)
}
