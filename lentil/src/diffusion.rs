use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Initial velocity spread
const VELOCITY_SD: f64 = 0.2;

/// Momentum kept from one step to the next (before damping)
const MOMENTUM: f64 = 0.95;

/// Random walk with a momentum term
///
/// ```text
/// W[t+1] = W[t] + V[t]
/// V[t+1] = 0.95 V[t] + ε(t) - η V[t],   ε(t) ~ N(0, 1/steps)
/// ```
///
/// `W[0] ~ U(0,1)`, `V[0] ~ N(0, 0.2)` and the damping `η ~ U(0,1)` is
/// drawn once per walk. Values usually stay within `[0, 1]` but are not
/// clamped.
///
/// * `steps` - number of points in the walk
/// * `rng` - random number generator
pub fn diffusion(steps: usize, rng: &mut impl Rng) -> anyhow::Result<Array1<f64>> {
    let mut ww = Array1::<f64>::zeros(steps);
    if steps == 0 {
        return Ok(ww);
    }
    let mut vv = Array1::<f64>::zeros(steps);

    ww[0] = rng.random::<f64>();
    vv[0] = Normal::new(0.0, VELOCITY_SD)?.sample(rng);

    let eps = Normal::new(0.0, 1.0 / steps as f64)?;
    let eta = rng.random::<f64>();

    for t in 0..(steps - 1) {
        ww[t + 1] = ww[t] + vv[t];
        vv[t + 1] = MOMENTUM * vv[t] + eps.sample(rng) - eta * vv[t];
    }

    Ok(ww)
}
