use crate::common_io::write_lines;
use crate::traits::IoOps;
use ndarray::prelude::*;
use rayon::prelude::*;
use std::fmt::Display;

impl<T> IoOps for Array2<T>
where
    T: Send + Sync + Display,
{
    type Scalar = T;
    type Mat = Self;

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()> {
        let rows: Vec<ArrayView1<T>> = self.rows().into_iter().collect();

        // formatting dominates for wide count matrices
        let lines: Vec<Box<str>> = rows
            .par_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect();

        write_lines(&lines, file)?;
        Ok(())
    }
}
