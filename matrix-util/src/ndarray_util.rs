pub use ndarray::prelude::*;
pub use rand_distr::{Distribution, Gamma};

use crate::traits::*;
use num_traits::{Float, FromPrimitive};

impl<T> SampleOps for ndarray::Array2<T>
where
    T: Float + FromPrimitive,
{
    type Mat = Self;
    type Scalar = T;

    fn rgamma_with(
        dd: usize,
        nn: usize,
        param: (f64, f64),
        rng: &mut impl rand::Rng,
    ) -> anyhow::Result<Self::Mat> {
        let (shape, scale) = param;
        let gamma = Gamma::new(shape, scale)?;

        // row-major fill, so the draw order matches `(row, col)` iteration
        let rvec: Vec<T> = (0..(dd * nn))
            .map(|_| T::from_f64(gamma.sample(rng)).unwrap_or_else(T::zero))
            .collect();

        Ok(Array2::from_shape_vec((dd, nn), rvec)?)
    }
}
