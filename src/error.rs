//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("voxel grid has an empty axis")]
    EmptyRegion,

    #[error("evaluator pool is empty")]
    EmptyPool,

    #[error("image is {0}x{1}, but the voxel grid needs {2}x{3}")]
    BadImageSize(usize, usize, usize, usize),
}
