use anyhow::Result;
use clap::Args;
use log::info;
use rand::SeedableRng;

use lentil::coefficients::CoefficientPolicy;
use lentil::counts::{CountParams, SampledCells};
use lentil::lineage::{simulate_lineage, LineageParams, LineageSimulation};
use lentil::sampling::{absolute_means, draw_gene_scale};
use lentil::tree::{LineageTree, TreeReader};
use matrix_util::common_io::{mkdir, write_lines};
use matrix_util::traits::IoOps;

#[derive(Args, Debug, Clone)]
pub struct SimCommonArgs {
    #[arg(short, long, help = "Lineage tree JSON (topology, time, modules, genes)")]
    pub tree: String,

    #[arg(short, long, help = "Output prefix")]
    pub out: String,

    #[arg(long, default_value = "42", help = "Random seed")]
    pub seed: u64,

    #[arg(
        long,
        default_value = "0.4",
        help = "Largest correlation between programs of a branch"
    )]
    pub intra_tol: f64,

    #[arg(
        long,
        default_value = "0.5",
        help = "Parallel branches must correlate less than this"
    )]
    pub inter_tol: f64,

    #[arg(
        long,
        help = "Gamma shape of the program-to-gene weights (or Beta a with --coef-b)"
    )]
    pub coef_a: Option<f64>,

    #[arg(
        long,
        requires = "coef_a",
        help = "Beta b: each gene joins two programs with Beta(a, b) weights"
    )]
    pub coef_b: Option<f64>,

    #[arg(long, default_value = "0.8", help = "Mean of log base expression")]
    pub gene_loc: f64,

    #[arg(long, default_value = "1.0", help = "Spread of log base expression")]
    pub gene_s: f64,

    #[arg(long, default_value_t = false, help = "No library size factors")]
    pub no_scale: bool,

    #[arg(
        long,
        default_value = "0.7",
        help = "Spread of the log library size factors"
    )]
    pub scale_v: f64,
}

impl SimCommonArgs {
    pub fn rng(&self) -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(self.seed)
    }

    pub fn coefficient_policy(&self) -> Option<CoefficientPolicy> {
        match (self.coef_a, self.coef_b) {
            (Some(a), Some(b)) => Some(CoefficientPolicy::Beta { a, b }),
            (Some(shape), None) => Some(CoefficientPolicy::Gamma { shape }),
            _ => None,
        }
    }

    pub fn lineage_params(&self) -> LineageParams {
        LineageParams {
            intra_branch_tol: self.intra_tol,
            inter_branch_tol: self.inter_tol,
            coefficients: self.coefficient_policy(),
            ..Default::default()
        }
    }

    pub fn count_params(&self, alpha: f64, beta: f64, verbose: bool) -> CountParams {
        CountParams {
            alpha: alpha.into(),
            beta: beta.into(),
            scale: !self.no_scale,
            scale_v: self.scale_v,
            verbose,
        }
    }
}

/// Simulate the lineage and store absolute mean expression in the tree
pub fn simulate_means(
    tree: &mut LineageTree,
    args: &SimCommonArgs,
    rng: &mut impl rand::Rng,
) -> Result<LineageSimulation> {
    let sim = simulate_lineage(&*tree, &args.lineage_params(), rng)?;
    let gene_scale = draw_gene_scale(tree.num_genes(), args.gene_loc, args.gene_s, rng)?;
    tree.add_genes(absolute_means(&sim.relative_means, &gene_scale)?);
    Ok(sim)
}

/// Write counts, cell annotations, coefficients and per-branch means and
/// programs under the output prefix
pub fn write_results(
    out: &str,
    tree: &LineageTree,
    sim: &LineageSimulation,
    cells: &SampledCells,
) -> Result<()> {
    let counts_file = format!("{}.counts.tsv.gz", out);
    mkdir(&counts_file)?;
    cells.counts.to_tsv(&counts_file)?;

    let mut lines: Vec<Box<str>> = vec!["cell\tpseudotime\tbranch\tscaling".into()];
    lines.extend(
        cells
            .pseudotime
            .iter()
            .zip(cells.branches.iter())
            .zip(cells.scalings.iter())
            .enumerate()
            .map(|(n, ((t, b), s))| format!("{}\t{}\t{}\t{}", n, t, b, s).into_boxed_str()),
    );
    write_lines(&lines, &format!("{}.cells.tsv.gz", out))?;

    sim.coefficients
        .to_tsv(&format!("{}.coefficients.tsv.gz", out))?;

    for &b in tree.branches() {
        if let Some(means) = tree.means(b) {
            means.to_tsv(&format!("{}.means_{}.tsv.gz", out, b))?;
        }
        if let Some(programs) = sim.programs.get(&b) {
            programs.to_tsv(&format!("{}.programs_{}.tsv.gz", out, b))?;
        }
    }

    info!(
        "wrote {} cells x {} genes to {}.*.tsv.gz",
        cells.counts.nrows(),
        cells.counts.ncols(),
        out
    );
    Ok(())
}
