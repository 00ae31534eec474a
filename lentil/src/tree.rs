use crate::error::LineageError;
use log::info;
use matrix_util::common_io::open_buf_reader;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub type BranchId = usize;

/// Read access to a lineage tree, plus the one mutation the simulator
/// needs (storing mean expression per branch).
///
/// Implementors provide the raw description (branches, lengths,
/// topology); pseudotime bookkeeping is derived from it.
pub trait TreeReader {
    fn branches(&self) -> &[BranchId];

    /// Number of expression programs (K)
    fn num_modules(&self) -> usize;

    /// Number of genes (G)
    fn num_genes(&self) -> usize;

    /// Length of each branch in pseudotime units
    fn branch_lengths(&self) -> &BTreeMap<BranchId, usize>;

    /// `(parent, child)` edges
    fn topology(&self) -> &[(BranchId, BranchId)];

    fn root(&self) -> BranchId;

    /// Sampling weight of every pseudotime point of `branch`
    fn density(&self, branch: BranchId) -> Option<&[f64]>;

    /// Mean expression (T × G) stored for `branch`
    fn means(&self, branch: BranchId) -> Option<&Array2<f64>>;

    fn add_genes(&mut self, means: BTreeMap<BranchId, Array2<f64>>);

    fn branch_length(&self, branch: BranchId) -> Option<usize> {
        self.branch_lengths().get(&branch).copied()
    }

    /// Start and end (inclusive) pseudotime of every branch. A child
    /// starts right after its parent ends.
    fn branch_times(&self) -> BTreeMap<BranchId, (usize, usize)> {
        let mut times = BTreeMap::new();
        let mut queue = VecDeque::from([(self.root(), 0_usize)]);

        while let Some((branch, start)) = queue.pop_front() {
            if times.contains_key(&branch) {
                continue;
            }
            let len = match self.branch_length(branch) {
                Some(len) if len > 0 => len,
                _ => continue,
            };
            times.insert(branch, (start, start + len - 1));
            for &(parent, child) in self.topology() {
                if parent == branch {
                    queue.push_back((child, start + len));
                }
            }
        }
        times
    }

    /// Total pseudotime span of the tree
    fn max_time(&self) -> usize {
        self.branch_times()
            .values()
            .map(|&(_, end)| end + 1)
            .max()
            .unwrap_or(0)
    }

    /// Groups of two or more branches that start at the same
    /// pseudotime, keyed by that start
    fn parallel_branches(&self) -> BTreeMap<usize, Vec<BranchId>> {
        let mut groups: BTreeMap<usize, Vec<BranchId>> = BTreeMap::new();
        for (b, (start, _)) in self.branch_times() {
            groups.entry(start).or_default().push(b);
        }
        groups.retain(|_, bb| bb.len() > 1);
        groups
    }

    /// Split the pseudotime axis into maximal intervals over which the
    /// set of active branches does not change
    fn timezones(&self) -> Vec<(usize, usize)> {
        let mut cuts = BTreeSet::new();
        for (_, (start, end)) in self.branch_times() {
            cuts.insert(start);
            cuts.insert(end + 1);
        }
        let cuts: Vec<usize> = cuts.into_iter().collect();
        cuts.windows(2).map(|w| (w[0], w[1] - 1)).collect()
    }

    /// Branches whose pseudotime interval contains `t`
    fn branches_at(&self, t: usize) -> Vec<BranchId> {
        self.branch_times()
            .into_iter()
            .filter(|(_, (start, end))| *start <= t && t <= *end)
            .map(|(b, _)| b)
            .collect()
    }
}

/// Serialisable description of a lineage tree
///
/// ```json
/// {
///   "topology": [[0, 1], [0, 2]],
///   "time": {"0": 40, "1": 40, "2": 40},
///   "modules": 5,
///   "genes": 200
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSpec {
    #[serde(default)]
    pub topology: Vec<(BranchId, BranchId)>,
    pub time: BTreeMap<BranchId, usize>,
    pub modules: usize,
    pub genes: usize,
    #[serde(default)]
    pub density: Option<BTreeMap<BranchId, Vec<f64>>>,
}

/// A validated lineage tree: one root, every branch reachable from it,
/// at most one parent per branch.
#[derive(Debug, Clone)]
pub struct LineageTree {
    topology: Vec<(BranchId, BranchId)>,
    time: BTreeMap<BranchId, usize>,
    branches: Vec<BranchId>,
    root: BranchId,
    modules: usize,
    genes: usize,
    density: BTreeMap<BranchId, Vec<f64>>,
    means: BTreeMap<BranchId, Array2<f64>>,
}

impl LineageTree {
    /// Build a tree from its edges and branch lengths
    ///
    /// * `topology` - `(parent, child)` edges
    /// * `time` - pseudotime length of each branch
    /// * `modules` - number of expression programs
    /// * `genes` - number of genes
    ///
    /// Branches are the union of `time` keys and edge endpoints, so a
    /// branch may lack a length here; `simulate_lineage` refuses such
    /// trees.
    pub fn new(
        topology: Vec<(BranchId, BranchId)>,
        time: BTreeMap<BranchId, usize>,
        modules: usize,
        genes: usize,
    ) -> anyhow::Result<Self> {
        if modules == 0 || genes == 0 {
            return Err(LineageError::InvalidParameter(format!(
                "need at least one module and one gene (modules={}, genes={})",
                modules, genes
            ))
            .into());
        }

        let mut branches: BTreeSet<BranchId> = time.keys().copied().collect();
        for &(parent, child) in &topology {
            branches.insert(parent);
            branches.insert(child);
        }

        if branches.is_empty() {
            return Err(LineageError::InvalidTopology("no branches".into()).into());
        }

        if let Some((b, _)) = time.iter().find(|(_, len)| **len == 0) {
            return Err(LineageError::InvalidTopology(format!("branch {} has zero length", b)).into());
        }

        let mut parent_of: BTreeMap<BranchId, BranchId> = BTreeMap::new();
        for &(parent, child) in &topology {
            if parent == child {
                return Err(LineageError::InvalidTopology(format!(
                    "branch {} is its own parent",
                    child
                ))
                .into());
            }
            if let Some(prev) = parent_of.insert(child, parent) {
                if prev != parent {
                    return Err(LineageError::InvalidTopology(format!(
                        "branch {} has two parents ({} and {})",
                        child, prev, parent
                    ))
                    .into());
                }
            }
        }

        let roots: Vec<BranchId> = branches
            .iter()
            .copied()
            .filter(|b| !parent_of.contains_key(b))
            .collect();

        let root = match roots.as_slice() {
            [root] => *root,
            _ => {
                return Err(LineageError::InvalidTopology(format!(
                    "expected exactly one root, found {:?}",
                    roots
                ))
                .into())
            }
        };

        // with one root and one parent per branch, anything unreachable
        // sits on a cycle
        let mut reached = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(b) = queue.pop_front() {
            for &(parent, child) in &topology {
                if parent == b && reached.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        if reached.len() != branches.len() {
            return Err(LineageError::InvalidTopology(
                "some branches are not reachable from the root".into(),
            )
            .into());
        }

        let mut tree = Self {
            topology,
            time,
            branches: branches.into_iter().collect(),
            root,
            modules,
            genes,
            density: BTreeMap::new(),
            means: BTreeMap::new(),
        };
        tree.density = tree.default_density();
        Ok(tree)
    }

    pub fn from_spec(spec: TreeSpec) -> anyhow::Result<Self> {
        let mut tree = Self::new(spec.topology, spec.time, spec.modules, spec.genes)?;
        if let Some(density) = spec.density {
            tree.set_density(density)?;
        }
        Ok(tree)
    }

    /// Read a `TreeSpec` from a JSON file (gzipped or not)
    pub fn from_json_file(file: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(file)?;
        let spec: TreeSpec = serde_json::from_reader(reader)?;
        let tree = Self::from_spec(spec)?;
        info!(
            "read a lineage tree with {} branches, {} modules, {} genes from {}",
            tree.branches.len(),
            tree.modules,
            tree.genes,
            file
        );
        Ok(tree)
    }

    /// Equal weight for every (pseudotime, branch) point
    pub fn default_density(&self) -> BTreeMap<BranchId, Vec<f64>> {
        let total: usize = self.time.values().sum();
        if total == 0 {
            return BTreeMap::new();
        }
        let w = 1.0 / total as f64;
        self.time
            .iter()
            .map(|(&b, &len)| (b, vec![w; len]))
            .collect()
    }

    /// Replace the sampling density. Every branch needs one
    /// non-negative weight per pseudotime point; weights need not sum
    /// to one.
    pub fn set_density(&mut self, density: BTreeMap<BranchId, Vec<f64>>) -> anyhow::Result<()> {
        let mut total = 0.0;
        for &b in &self.branches {
            let len = self.branch_length(b).ok_or(LineageError::InsufficientTreeSpecification {
                branches: self.branches.len(),
                lengths: self.time.len(),
            })?;
            let dens = density.get(&b).ok_or_else(|| {
                LineageError::InvalidParameter(format!("no density given for branch {}", b))
            })?;
            if dens.len() != len {
                return Err(LineageError::InvalidParameter(format!(
                    "density of branch {} has {} entries, expected {}",
                    b,
                    dens.len(),
                    len
                ))
                .into());
            }
            if dens.iter().any(|&d| !d.is_finite() || d < 0.0) {
                return Err(LineageError::InvalidParameter(format!(
                    "density of branch {} must be finite and non-negative",
                    b
                ))
                .into());
            }
            total += dens.iter().sum::<f64>();
        }
        if let Some(extra) = density.keys().find(|b| !self.time.contains_key(*b)) {
            return Err(LineageError::UnknownBranch(*extra).into());
        }
        if total <= 0.0 {
            return Err(LineageError::InvalidParameter("density sums to zero".into()).into());
        }
        self.density = density;
        Ok(())
    }
}

impl TreeReader for LineageTree {
    fn branches(&self) -> &[BranchId] {
        &self.branches
    }

    fn num_modules(&self) -> usize {
        self.modules
    }

    fn num_genes(&self) -> usize {
        self.genes
    }

    fn branch_lengths(&self) -> &BTreeMap<BranchId, usize> {
        &self.time
    }

    fn topology(&self) -> &[(BranchId, BranchId)] {
        &self.topology
    }

    fn root(&self) -> BranchId {
        self.root
    }

    fn density(&self, branch: BranchId) -> Option<&[f64]> {
        self.density.get(&branch).map(|d| d.as_slice())
    }

    fn means(&self, branch: BranchId) -> Option<&Array2<f64>> {
        self.means.get(&branch)
    }

    fn add_genes(&mut self, means: BTreeMap<BranchId, Array2<f64>>) {
        self.means.extend(means);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bifurcation() -> LineageTree {
        let time = BTreeMap::from([(0, 10), (1, 10), (2, 5)]);
        LineageTree::new(vec![(0, 1), (0, 2)], time, 3, 20).unwrap()
    }

    fn lineage_error(err: &anyhow::Error) -> &LineageError {
        err.downcast_ref::<LineageError>().unwrap()
    }

    #[test]
    fn branch_times_follow_topology() {
        let tree = bifurcation();
        let bt = tree.branch_times();
        assert_eq!(bt[&0], (0, 9));
        assert_eq!(bt[&1], (10, 19));
        assert_eq!(bt[&2], (10, 14));
        assert_eq!(tree.max_time(), 20);
        assert_eq!(tree.root(), 0);
    }

    #[test]
    fn parallel_branches_share_a_start() {
        let tree = bifurcation();
        let parallel = tree.parallel_branches();
        assert_eq!(parallel.len(), 1);
        assert_eq!(parallel[&10], vec![1, 2]);
    }

    #[test]
    fn timezones_split_at_every_branch_end() {
        let tree = bifurcation();
        assert_eq!(tree.timezones(), vec![(0, 9), (10, 14), (15, 19)]);
        assert_eq!(tree.branches_at(12), vec![1, 2]);
        assert_eq!(tree.branches_at(17), vec![1]);
        assert!(tree.branches_at(20).is_empty());
    }

    #[test]
    fn default_density_is_uniform() {
        let tree = bifurcation();
        let total: f64 = tree
            .branches()
            .iter()
            .map(|&b| tree.density(b).unwrap().iter().sum::<f64>())
            .sum();
        approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_eq!(tree.density(2).unwrap().len(), 5);
    }

    #[test]
    fn rejects_two_roots() {
        let time = BTreeMap::from([(0, 10), (1, 10), (2, 10)]);
        let err = LineageTree::new(vec![(0, 1)], time, 2, 5).unwrap_err();
        assert!(matches!(lineage_error(&err), LineageError::InvalidTopology(_)));
    }

    #[test]
    fn rejects_two_parents() {
        let time = BTreeMap::from([(0, 10), (1, 10), (2, 10)]);
        let err = LineageTree::new(vec![(0, 1), (0, 2), (1, 2)], time, 2, 5).unwrap_err();
        assert!(matches!(lineage_error(&err), LineageError::InvalidTopology(_)));
    }

    #[test]
    fn rejects_bad_density() {
        let mut tree = bifurcation();
        let density = BTreeMap::from([(0, vec![0.1; 10]), (1, vec![0.1; 10]), (2, vec![0.1; 4])]);
        let err = tree.set_density(density).unwrap_err();
        assert!(matches!(lineage_error(&err), LineageError::InvalidParameter(_)));
    }

    #[test]
    fn tree_spec_from_json() -> anyhow::Result<()> {
        let json = r#"{
            "topology": [[0, 1], [0, 2]],
            "time": {"0": 4, "1": 3, "2": 3},
            "modules": 2,
            "genes": 7
        }"#;
        let spec: TreeSpec = serde_json::from_str(json)?;
        let tree = LineageTree::from_spec(spec)?;
        assert_eq!(tree.branches(), &[0, 1, 2]);
        assert_eq!(tree.num_genes(), 7);
        assert_eq!(tree.max_time(), 7);
        Ok(())
    }
}
