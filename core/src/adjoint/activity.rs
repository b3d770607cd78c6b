//! Activity classification.
//!
//! A value is active when it carries a tape index. Reductions decide activity
//! per element while combining, before any rank has seen every contribution,
//! so the combined index is only a marker: [`TapeIndex::UNASSIGNED`] for
//! "some contributor was active" and [`TapeIndex::PASSIVE`] otherwise. The
//! receiving tape replaces the marker with a real index.

use crate::tape::{AReal, TapeIndex};

pub fn is_active(value: &AReal) -> bool {
    value.index.is_active()
}

pub fn any_active(values: &[AReal]) -> bool {
    values.iter().any(is_active)
}

pub fn any_active_index(indices: &[TapeIndex]) -> bool {
    indices.iter().any(|i| i.is_active())
}

/// Merges the dependency of `input` into `inout`.
pub fn combine_dependency(input: TapeIndex, inout: &mut TapeIndex) {
    *inout = if input.is_active() || inout.is_active() {
        TapeIndex::UNASSIGNED
    } else {
        TapeIndex::PASSIVE
    };
}

/// This rank's entry in an activity all-gather.
pub fn activity_flag(values: &[AReal]) -> u8 {
    any_active(values) as u8
}

/// Reads the one-byte-per-rank flags produced by an activity all-gather.
pub fn any_flag_set(flags: &[u8]) -> bool {
    flags.iter().any(|&f| f != 0)
}
