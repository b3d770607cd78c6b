//! Reduction kernels used by `adcomm`.
//!
//! These are the operator-specific pieces of a differentiable reduction:
//! the primal combine step that the transport folds over contributions, and the
//! per-rank adjoint routing (exclusive products, winner masks) that the reverse
//! sweep applies. Nothing in here knows about tapes or transports; every kernel
//! works on flat slices laid out rank-major (`ranks` consecutive blocks of
//! `elements` values).

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_adjoint;
pub mod cpu_reduce;

pub use cpu_adjoint::{
    exclusive_product, located_winners, mask_non_winners, scale_blocks, sum_rank_blocks,
    value_winners, weighted_block_sum,
};
pub use cpu_reduce::{Located, fold_ranks, fold_ranks_located, max, max_loc, min, min_loc, prod, sum};

#[derive(Error, Debug, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Reduction over zero ranks")]
    NoContributions,
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors the scalar bound of the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

pub(crate) fn check_len(len: usize, expected: usize) -> Result<()> {
    if len != expected {
        return Err(KernelError::ShapeMismatch {
            expected: vec![expected],
            got: vec![len],
        });
    }
    Ok(())
}
