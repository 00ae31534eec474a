pub mod coefficients; // program-to-gene weights
pub mod counts; // negative binomial UMI counts per cell
pub mod diffusion; // random walk with momentum
pub mod error;
pub mod lineage; // relative means, parallel divergence and stitching
pub mod programs; // decorrelated expression programs per branch
pub mod sampling; // which (pseudotime, branch) points become cells
pub mod tree; // lineage tree and pseudotime bookkeeping
