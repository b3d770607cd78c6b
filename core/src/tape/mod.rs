//! The AD tape collaborator.
//!
//! # What the adapter needs from a tape
//!
//! The communication layer never looks inside a tape. It only needs to:
//!
//! 1. ask whether the tape is recording ([`AdTape::is_recording`]),
//! 2. give a received value a fresh tape index ([`AdTape::register_input`] /
//!    [`AdTape::register_output`]),
//! 3. push an [`ExternalFunction`] that the tape calls back during its sweeps,
//! 4. read, reset, and update adjoint vectors through an [`AdjointInterface`]
//!    while such a callback runs.
//!
//! Any reverse-mode engine that can provide those four things can carry its
//! values through [`AdComm`](crate::comm::AdComm). [`Tape`] is the reference
//! engine used by the tests: a Jacobian (Wengert) tape that stores the partial
//! derivatives of each recorded statement.
//!
//! # Example
//!
//! ```rust
//! use adcomm::tape::{AdTape, AReal, Tape};
//!
//! let mut tape = Tape::new();
//! tape.set_active();
//!
//! let mut x = AReal::new(3.0);
//! tape.register_input(&mut x);
//!
//! // y = x * x
//! let y = tape.mul(x, x);
//! assert_eq!(y.value, 9.0);
//!
//! tape.set_gradient(y.index, 1.0);
//! tape.evaluate().unwrap();
//! assert_eq!(tape.gradient(x.index), 6.0);
//! ```

use crate::error::Result;
use std::fmt;

pub mod engine;
pub mod ops;

pub use engine::{Tape, TapePosition};

/// Opaque key of one tape-tracked scalar.
///
/// `0` means passive (no dependency). The wire format also uses `-1` to mean
/// "active, but the receiving tape has not assigned an index yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TapeIndex(i32);

impl TapeIndex {
    pub const PASSIVE: TapeIndex = TapeIndex(0);
    pub const UNASSIGNED: TapeIndex = TapeIndex(-1);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Anything but [`TapeIndex::PASSIVE`] carries a dependency.
    pub const fn is_active(self) -> bool {
        self.0 != 0
    }

    /// Slot in the tape's index-addressed storage. Passive and sentinel
    /// indices have no slot.
    pub(crate) fn slot(self) -> Option<usize> {
        if self.0 > 0 { Some(self.0 as usize) } else { None }
    }
}

impl fmt::Display for TapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An AD-tracked real: the primal value and the tape index it depends on.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AReal {
    /// The primal value.
    pub value: f64,
    /// The tape entry this value is identified by ([`TapeIndex::PASSIVE`] if none).
    pub index: TapeIndex,
}

impl AReal {
    /// A passive value.
    pub const fn new(value: f64) -> Self {
        Self {
            value,
            index: TapeIndex::PASSIVE,
        }
    }

    pub fn is_active(&self) -> bool {
        self.index.is_active()
    }
}

impl From<f64> for AReal {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// Adjoint access handed to an [`ExternalFunction`] while a sweep runs.
///
/// During the reverse sweep the vectors are adjoints; during the forward sweep
/// the same storage holds tangents.
pub trait AdjointInterface {
    /// Number of derivative directions stored per index.
    fn vector_width(&self) -> usize;

    /// Copies the vector of `index` into `out` (`vector_width` reals).
    /// Passive indices read as zeros.
    fn get_adjoint_vec(&self, index: TapeIndex, out: &mut [f64]);

    /// Sets the vector of `index` to zero.
    fn reset_adjoint_vec(&mut self, index: TapeIndex);

    /// Adds `input` onto the vector of `index`. Passive indices are ignored.
    fn update_adjoint_vec(&mut self, index: TapeIndex, input: &[f64]);

    /// Overwrites the vector of `index`. Passive indices are ignored.
    fn set_adjoint_vec(&mut self, index: TapeIndex, input: &[f64]);

    /// Restores the primal stored for `index` (primal-restoring tapes).
    fn reset_primal(&mut self, index: TapeIndex, value: f64);
}

/// A non-tape-native operation recorded on the tape, with callbacks for both sweeps.
///
/// The tape owns the boxed function from the moment it is pushed; dropping it
/// is the deletion callback.
pub trait ExternalFunction {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Called by the reverse sweep when it reaches this entry.
    fn evaluate_reverse(&mut self, adjoints: &mut dyn AdjointInterface) -> Result<()>;

    /// Called by the forward (tangent) sweep when it reaches this entry.
    fn evaluate_forward(&mut self, tangents: &mut dyn AdjointInterface) -> Result<()>;
}

/// The capabilities the adjoint adapter consumes from a tape.
pub trait AdTape {
    /// Whether statements are currently being recorded.
    fn is_recording(&self) -> bool;

    /// Gives `value` a fresh index as a tape input.
    fn register_input(&mut self, value: &mut AReal) -> TapeIndex;

    /// Gives `value` a fresh index as the output of an external function and
    /// returns the primal that was stored in that slot before.
    fn register_output(&mut self, value: &mut AReal) -> (TapeIndex, f64);

    /// Hands ownership of `func` to the tape.
    fn push_external_function(&mut self, func: Box<dyn ExternalFunction>);

    /// Number of derivative directions per index.
    fn vector_width(&self) -> usize;
}
