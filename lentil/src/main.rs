mod sim_common;
mod sim_cover;
mod sim_density;
mod sim_restricted;
mod sim_series;

use sim_cover::*;
use sim_density::*;
use sim_restricted::*;
use sim_series::*;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lentil")]
#[command(about = "LinEage Tree sImuLation of single-cell count data")]
struct Cli {
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample every pseudotime once with per-gene count parameters
    Restricted(SimRestrictedArgs),
    /// Sample cells around time points, like a time-course experiment
    Series(SimSeriesArgs),
    /// Sample cells according to the density of the lineage tree
    Density(SimDensityArgs),
    /// Sample every (pseudotime, branch) point a fixed number of times
    Cover(SimCoverArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Restricted(args) => {
            sim_restricted(args, cli.verbose)?;
        }
        Commands::Series(args) => {
            sim_series(args, cli.verbose)?;
        }
        Commands::Density(args) => {
            sim_density(args, cli.verbose)?;
        }
        Commands::Cover(args) => {
            sim_cover(args, cli.verbose)?;
        }
    }

    Ok(())
}
