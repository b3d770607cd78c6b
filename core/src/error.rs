//! Error types.
//!
//! Every error in this crate is fatal for the derivative computation it
//! interrupts: once a communication handle fails half way through a sweep,
//! some adjoints have been claimed and others not, and no caller can repair
//! that. The errors exist so the failure carries a diagnostic up to the place
//! that aborts, not so it can be retried.

use adcomm_kernels::KernelError;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::distributed::backend::Transport).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer's end of the channel is gone (its thread exited or panicked).
    #[error("Peer {peer} disconnected")]
    Disconnected { peer: usize },
    /// A rank argument is outside `0..world_size`.
    #[error("Rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
    /// A buffer cannot be split or combined as requested.
    #[error("Buffer size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },
    /// The operator handle was never registered or has been freed.
    #[error("Unknown operator handle {0}")]
    UnknownOperator(u32),
    /// The request has already delivered its result.
    #[error("Request already completed")]
    AlreadyCompleted,
    /// A receiving operation completed without data for this rank.
    #[error("Request completed without a payload")]
    MissingPayload,
}

/// Errors raised by the adjoint adapter and the orchestrators.
#[derive(Error, Debug)]
pub enum AdError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The ranks disagree about the shape of a communication, or the wire
    /// data does not decode. Derivative results would be silently wrong.
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AdError>;
