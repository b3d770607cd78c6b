//! Reference Jacobian tape.
//!
//! Each recorded statement stores its left-hand index and the partial
//! derivatives with respect to its arguments. External functions are stored
//! inline, so the reverse sweep reaches them in exact reverse recording order.

use super::{AReal, AdTape, AdjointInterface, ExternalFunction, TapeIndex};
use crate::error::Result;

pub(crate) enum TapeEntry {
    Statement {
        lhs: TapeIndex,
        args: Vec<(TapeIndex, f64)>,
    },
    External(Box<dyn ExternalFunction>),
}

/// A recorded point of a [`Tape`], see [`Tape::position`] and [`Tape::reset_to`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapePosition {
    entries: usize,
    next_index: usize,
}

/// Per-index derivative vectors (`width` reals each) plus primal slots.
struct Store {
    width: usize,
    gradients: Vec<f64>,
    primals: Vec<f64>,
}

impl Store {
    fn ensure(&mut self, slot: usize) {
        if self.primals.len() <= slot {
            self.primals.resize(slot + 1, 0.0);
        }
        if self.gradients.len() < (slot + 1) * self.width {
            self.gradients.resize((slot + 1) * self.width, 0.0);
        }
    }

    fn vec(&self, index: TapeIndex) -> Option<&[f64]> {
        let slot = index.slot()?;
        self.gradients.get(slot * self.width..(slot + 1) * self.width)
    }

    fn vec_mut(&mut self, index: TapeIndex) -> Option<&mut [f64]> {
        let slot = index.slot()?;
        self.ensure(slot);
        Some(&mut self.gradients[slot * self.width..(slot + 1) * self.width])
    }
}

impl AdjointInterface for Store {
    fn vector_width(&self) -> usize {
        self.width
    }

    fn get_adjoint_vec(&self, index: TapeIndex, out: &mut [f64]) {
        match self.vec(index) {
            Some(v) => out.copy_from_slice(v),
            None => out.iter_mut().for_each(|o| *o = 0.0),
        }
    }

    fn reset_adjoint_vec(&mut self, index: TapeIndex) {
        if let Some(v) = self.vec_mut(index) {
            v.iter_mut().for_each(|a| *a = 0.0);
        }
    }

    fn update_adjoint_vec(&mut self, index: TapeIndex, input: &[f64]) {
        if let Some(v) = self.vec_mut(index) {
            v.iter_mut().zip(input).for_each(|(a, &i)| *a += i);
        }
    }

    fn set_adjoint_vec(&mut self, index: TapeIndex, input: &[f64]) {
        if let Some(v) = self.vec_mut(index) {
            let n = v.len().min(input.len());
            v[..n].copy_from_slice(&input[..n]);
        }
    }

    fn reset_primal(&mut self, index: TapeIndex, value: f64) {
        if let Some(slot) = index.slot() {
            self.ensure(slot);
            self.primals[slot] = value;
        }
    }
}

/// A reverse-mode tape with vector-mode gradients.
///
/// Index `0` is reserved for passive values; live indices are handed out
/// sequentially from `1`. Recording is off until [`Tape::set_active`].
pub struct Tape {
    recording: bool,
    next_index: usize,
    entries: Vec<TapeEntry>,
    store: Store,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    /// A tape propagating a single derivative direction.
    pub fn new() -> Self {
        Self::with_vector_width(1)
    }

    /// A tape propagating `width` derivative directions at once.
    pub fn with_vector_width(width: usize) -> Self {
        let width = width.max(1);
        Self {
            recording: false,
            next_index: 1,
            entries: Vec::new(),
            store: Store {
                width,
                gradients: vec![0.0; width],
                primals: vec![0.0],
            },
        }
    }

    pub fn set_active(&mut self) {
        self.recording = true;
    }

    pub fn set_passive(&mut self) {
        self.recording = false;
    }

    pub fn position(&self) -> TapePosition {
        TapePosition {
            entries: self.entries.len(),
            next_index: self.next_index,
        }
    }

    /// Drops everything recorded after `pos` and hands its indices out again.
    ///
    /// Primal slots keep their last value, which is what
    /// [`AdTape::register_output`] reports as the old primal on reuse.
    pub fn reset_to(&mut self, pos: TapePosition) {
        self.entries.truncate(pos.entries);
        self.next_index = pos.next_index;
        let live = pos.next_index * self.store.width;
        if self.store.gradients.len() > live {
            self.store.gradients.truncate(live);
        }
    }

    /// Drops every entry (external functions included) and all gradients.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_index = 1;
        self.store.gradients.clear();
        self.store.gradients.resize(self.store.width, 0.0);
    }

    /// Number of external functions currently owned by the tape.
    pub fn external_function_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, TapeEntry::External(_)))
            .count()
    }

    /// Number of recorded entries (statements and external functions).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First derivative direction of `index`.
    pub fn gradient(&self, index: TapeIndex) -> f64 {
        self.store.vec(index).map(|v| v[0]).unwrap_or(0.0)
    }

    /// All derivative directions of `index`.
    pub fn gradient_vec(&self, index: TapeIndex) -> Vec<f64> {
        let mut out = vec![0.0; self.store.width];
        self.store.get_adjoint_vec(index, &mut out);
        out
    }

    /// Seeds the first derivative direction of `index`.
    pub fn set_gradient(&mut self, index: TapeIndex, value: f64) {
        if let Some(v) = self.store.vec_mut(index) {
            v[0] = value;
        }
    }

    /// Seeds the derivative directions of `index` from `values`.
    ///
    /// Values beyond the vector width are ignored; directions without a value
    /// keep what they held.
    pub fn set_gradient_vec(&mut self, index: TapeIndex, values: &[f64]) {
        self.store.set_adjoint_vec(index, values);
    }

    pub fn clear_adjoints(&mut self) {
        self.store.gradients.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Primal currently stored for `index`.
    pub fn primal(&self, index: TapeIndex) -> f64 {
        index
            .slot()
            .and_then(|s| self.store.primals.get(s).copied())
            .unwrap_or(0.0)
    }

    /// Reverse sweep: propagates adjoints from outputs back to inputs.
    ///
    /// Statement adjoints are claimed (reset) when processed, so evaluating
    /// twice without reseeding yields zeros for intermediate values.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an external function. The sweep stops
    /// there and the gradients are left partially propagated.
    pub fn evaluate(&mut self) -> Result<()> {
        let Tape { entries, store, .. } = self;
        let width = store.width;
        let mut adj = vec![0.0; width];

        for entry in entries.iter_mut().rev() {
            match entry {
                TapeEntry::Statement { lhs, args } => {
                    store.get_adjoint_vec(*lhs, &mut adj);
                    store.reset_adjoint_vec(*lhs);
                    if adj.iter().all(|a| *a == 0.0) {
                        continue;
                    }
                    for (arg, partial) in args.iter() {
                        if let Some(v) = store.vec_mut(*arg) {
                            v.iter_mut().zip(&adj).for_each(|(g, a)| *g += partial * a);
                        }
                    }
                }
                TapeEntry::External(func) => func.evaluate_reverse(store)?,
            }
        }
        Ok(())
    }

    /// Forward (tangent) sweep: recomputes every recorded value's tangent from
    /// the tangents seeded on the inputs.
    pub fn evaluate_forward(&mut self) -> Result<()> {
        let Tape { entries, store, .. } = self;
        let width = store.width;
        let mut arg_tangent = vec![0.0; width];
        let mut tangent = vec![0.0; width];

        for entry in entries.iter_mut() {
            match entry {
                TapeEntry::Statement { lhs, args } => {
                    tangent.iter_mut().for_each(|t| *t = 0.0);
                    for (arg, partial) in args.iter() {
                        store.get_adjoint_vec(*arg, &mut arg_tangent);
                        tangent
                            .iter_mut()
                            .zip(&arg_tangent)
                            .for_each(|(t, a)| *t += partial * a);
                    }
                    store.set_adjoint_vec(*lhs, &tangent);
                }
                TapeEntry::External(func) => func.evaluate_forward(store)?,
            }
        }
        Ok(())
    }

    fn allocate(&mut self, value: f64) -> TapeIndex {
        let slot = self.next_index;
        self.next_index += 1;
        self.store.ensure(slot);
        self.store.primals[slot] = value;
        self.store.gradients[slot * self.store.width..(slot + 1) * self.store.width]
            .iter_mut()
            .for_each(|g| *g = 0.0);
        TapeIndex::new(slot as i32)
    }

    /// Records `lhs = f(args)` with the given partials and returns the result.
    ///
    /// Passive arguments are dropped; if nothing active remains (or the tape is
    /// not recording) the result is passive and nothing is recorded.
    pub(crate) fn push_statement(&mut self, value: f64, args: &[(AReal, f64)]) -> AReal {
        if !self.recording {
            return AReal::new(value);
        }
        let args: Vec<(TapeIndex, f64)> = args
            .iter()
            .filter(|(a, _)| a.is_active())
            .map(|(a, p)| (a.index, *p))
            .collect();
        if args.is_empty() {
            return AReal::new(value);
        }
        let lhs = self.allocate(value);
        self.entries.push(TapeEntry::Statement { lhs, args });
        AReal { value, index: lhs }
    }
}

impl AdTape for Tape {
    fn is_recording(&self) -> bool {
        self.recording
    }

    fn register_input(&mut self, value: &mut AReal) -> TapeIndex {
        value.index = if self.recording {
            self.allocate(value.value)
        } else {
            TapeIndex::PASSIVE
        };
        value.index
    }

    fn register_output(&mut self, value: &mut AReal) -> (TapeIndex, f64) {
        if !self.recording {
            value.index = TapeIndex::PASSIVE;
            return (value.index, 0.0);
        }
        let slot = self.next_index;
        let old = self.store.primals.get(slot).copied().unwrap_or(0.0);
        value.index = self.allocate(value.value);
        (value.index, old)
    }

    fn push_external_function(&mut self, func: Box<dyn ExternalFunction>) {
        self.entries.push(TapeEntry::External(func));
    }

    fn vector_width(&self) -> usize {
        self.store.width
    }
}
