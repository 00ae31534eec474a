/// Operations to sample random matrices from a caller-owned random
/// number generator, so that simulations stay reproducible under a
/// fixed seed
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a gamma distribution with `param` is
    /// `(shape α, scale θ)`
    ///
    /// $$f(x|\alpha,\theta) = \frac{\theta^{-\alpha}}{\Gamma(\alpha)} x^{\alpha - 1} e^{-x/\theta}$$
    ///
    /// Note: `rate = 1/scale` or $\beta = 1/\theta$
    fn rgamma_with(
        dd: usize,
        nn: usize,
        param: (f64, f64),
        rng: &mut impl rand::Rng,
    ) -> anyhow::Result<Self::Mat>;
}

/// Correlation between the rows of a matrix
pub trait CorrelationOps {
    type Scalar;

    /// Pearson correlation between row `i` and row `j`
    fn row_correlation(&self, i: usize, j: usize) -> Self::Scalar;

    /// Largest absolute correlation of row `k` against rows `0..k`.
    /// Zero if `k == 0`.
    fn max_abs_correlation_upto(&self, k: usize) -> Self::Scalar;
}

/// Write matrices to delimited text files
pub trait IoOps {
    type Scalar;
    type Mat;

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    fn to_csv(&self, csv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(csv_file, ",")
    }
}
