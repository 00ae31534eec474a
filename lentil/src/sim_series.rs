use anyhow::Result;
use clap::Args;
use log::info;

use crate::sim_common::{simulate_means, write_results, SimCommonArgs};
use lentil::sampling::{sample_pseudotime_series, CellsPerPoint, Spread};
use lentil::tree::LineageTree;

#[derive(Args, Debug, Clone)]
pub struct SimSeriesArgs {
    #[command(flatten)]
    pub common: SimCommonArgs,

    #[arg(
        long,
        value_delimiter = ',',
        required = true,
        help = "Pseudotime points to sample around (comma-separated)"
    )]
    pub points: Vec<usize>,

    #[arg(
        long,
        value_delimiter = ',',
        required = true,
        help = "Cells per point, or a single total split over the points"
    )]
    pub cells: Vec<usize>,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "4.0",
        help = "Spread around each point, or one spread for all"
    )]
    pub std: Vec<f64>,

    #[arg(long, default_value = "0.3", help = "Quadratic term of the count variance")]
    pub alpha: f64,

    #[arg(long, default_value = "2.0", help = "Linear term of the count variance")]
    pub beta: f64,
}

pub fn sim_series(args: &SimSeriesArgs, verbose: bool) -> Result<()> {
    let common = &args.common;
    let mut tree = LineageTree::from_json_file(&common.tree)?;
    let mut rng = common.rng();

    let sim = simulate_means(&mut tree, common, &mut rng)?;

    let cells = match args.cells.as_slice() {
        [total] if args.points.len() > 1 => CellsPerPoint::Total(*total),
        nn => CellsPerPoint::PerPoint(nn.to_vec()),
    };
    let spread = match args.std.as_slice() {
        [s] => Spread::Uniform(*s),
        ss => Spread::PerPoint(ss.to_vec()),
    };

    let params = common.count_params(args.alpha, args.beta, verbose);
    let sampled = sample_pseudotime_series(&tree, &cells, &args.points, &spread, &params, &mut rng)?;
    write_results(&common.out, &tree, &sim, &sampled)?;

    info!("done");
    Ok(())
}
