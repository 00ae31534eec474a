use anyhow::Result;
use clap::Args;
use log::info;

use crate::sim_common::{write_results, SimCommonArgs};
use lentil::coefficients::{CoefficientPolicy, DEFAULT_GAMMA_SHAPE};
use lentil::sampling::{sample_whole_tree_restricted, RestrictedParams};
use lentil::tree::LineageTree;

#[derive(Args, Debug, Clone)]
pub struct SimRestrictedArgs {
    #[command(flatten)]
    pub common: SimCommonArgs,

    #[arg(long, default_value = "0.2", help = "Typical alpha of the per-gene count model")]
    pub alpha: f64,

    #[arg(long, default_value = "3.0", help = "Typical beta - 1 of the per-gene count model")]
    pub beta: f64,

    #[arg(
        long,
        default_value = "100",
        help = "Lineage simulations tried before giving up"
    )]
    pub max_attempts: usize,
}

pub fn sim_restricted(args: &SimRestrictedArgs, verbose: bool) -> Result<()> {
    let common = &args.common;
    let mut tree = LineageTree::from_json_file(&common.tree)?;
    let mut rng = common.rng();

    let mut lineage = common.lineage_params();
    if lineage.coefficients.is_none() {
        lineage.coefficients = Some(CoefficientPolicy::Gamma {
            shape: DEFAULT_GAMMA_SHAPE,
        });
    }

    let params = RestrictedParams {
        alpha: args.alpha,
        beta: args.beta,
        gene_loc: common.gene_loc,
        gene_s: common.gene_s,
        lineage,
        max_attempts: args.max_attempts,
        scale: !common.no_scale,
        scale_v: common.scale_v,
        verbose,
    };

    let (sim, cells) = sample_whole_tree_restricted(&mut tree, &params, &mut rng)?;
    write_results(&common.out, &tree, &sim, &cells)?;

    info!("done");
    Ok(())
}
