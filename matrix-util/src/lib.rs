pub mod common_io; // gzip-aware line readers and writers
pub mod ndarray_io; // delimited text output for `ndarray` matrices
pub mod ndarray_stat; // correlation statistics
pub mod ndarray_util; // seeded random matrices
pub mod traits;
