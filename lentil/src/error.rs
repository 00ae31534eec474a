use crate::tree::BranchId;

/// Failures of the lineage simulation that callers may want to tell
/// apart. Functions return `anyhow::Result`, so recover these with
/// `err.downcast_ref::<LineageError>()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LineageError {
    #[error("value of `{name}` should be between 0 and 1, got {value}")]
    InvalidTolerance { name: &'static str, value: f64 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("the parameters are not enough for {branches} branches ({lengths} branch lengths given)")]
    InsufficientTreeSpecification { branches: usize, lengths: usize },

    #[error("invalid lineage topology: {0}")]
    InvalidTopology(String),

    #[error("branch {0} is not part of the lineage tree")]
    UnknownBranch(BranchId),

    #[error("no mean expression stored for branch {0}")]
    MissingMeans(BranchId),

    #[error("no branch covers pseudotime {0}")]
    NoBranchAtPseudotime(usize),

    #[error("{what} did not converge after {attempts} attempts")]
    NotConverged { what: &'static str, attempts: usize },
}

/// Fail fast unless `value` lies in `[0, 1]`
pub fn check_tolerance(name: &'static str, value: f64) -> anyhow::Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LineageError::InvalidTolerance { name, value }.into())
    }
}
