use crate::traits::CorrelationOps;
use ndarray::{ArrayBase, Data, Ix1, Ix2};
use num_traits::{Float, FromPrimitive};

/// Pearson correlation between two vectors of the same length
///
/// Returns zero whenever the correlation is undefined: empty or
/// mismatched inputs, or a vector with no variance.
///
/// ```
/// use matrix_util::ndarray_stat::pearson_correlation;
/// use ndarray::array;
/// let x = array![1.0, 2.0, 3.0, 4.0];
/// let y = array![2.0, 4.0, 6.0, 8.0];
/// assert!((pearson_correlation(&x, &y) - 1.0_f64).abs() < 1e-12);
/// ```
pub fn pearson_correlation<T, S1, S2>(xx: &ArrayBase<S1, Ix1>, yy: &ArrayBase<S2, Ix1>) -> T
where
    T: Float + FromPrimitive,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
{
    let n = xx.len();
    if n == 0 || n != yy.len() {
        return T::zero();
    }

    let nn = T::from_usize(n).unwrap_or_else(T::one);
    let mu_x = xx.sum() / nn;
    let mu_y = yy.sum() / nn;

    let mut sxy = T::zero();
    let mut sxx = T::zero();
    let mut syy = T::zero();

    for (&x, &y) in xx.iter().zip(yy.iter()) {
        let dx = x - mu_x;
        let dy = y - mu_y;
        sxy = sxy + dx * dy;
        sxx = sxx + dx * dx;
        syy = syy + dy * dy;
    }

    let denom = (sxx * syy).sqrt();
    if denom > T::zero() && denom.is_finite() {
        let r = sxy / denom;
        // rounding can push |r| a hair above one
        r.max(-T::one()).min(T::one())
    } else {
        T::zero()
    }
}

impl<T, S> CorrelationOps for ArrayBase<S, Ix2>
where
    T: Float + FromPrimitive,
    S: Data<Elem = T>,
{
    type Scalar = T;

    fn row_correlation(&self, i: usize, j: usize) -> T {
        pearson_correlation(&self.row(i), &self.row(j))
    }

    fn max_abs_correlation_upto(&self, k: usize) -> T {
        (0..k.min(self.nrows()))
            .map(|j| self.row_correlation(k, j).abs())
            .fold(T::zero(), T::max)
    }
}
