use anyhow::Result;
use clap::Args;
use log::info;

use crate::sim_common::{simulate_means, write_results, SimCommonArgs};
use lentil::sampling::sample_density;
use lentil::tree::LineageTree;

#[derive(Args, Debug, Clone)]
pub struct SimDensityArgs {
    #[command(flatten)]
    pub common: SimCommonArgs,

    #[arg(long, default_value = "500", help = "Number of cells")]
    pub cells: usize,

    #[arg(long, default_value = "0.3", help = "Quadratic term of the count variance")]
    pub alpha: f64,

    #[arg(long, default_value = "2.0", help = "Linear term of the count variance")]
    pub beta: f64,
}

pub fn sim_density(args: &SimDensityArgs, verbose: bool) -> Result<()> {
    let common = &args.common;
    let mut tree = LineageTree::from_json_file(&common.tree)?;
    let mut rng = common.rng();

    let sim = simulate_means(&mut tree, common, &mut rng)?;

    let params = common.count_params(args.alpha, args.beta, verbose);
    let sampled = sample_density(&tree, args.cells, &params, &mut rng)?;
    write_results(&common.out, &tree, &sim, &sampled)?;

    info!("done");
    Ok(())
}
