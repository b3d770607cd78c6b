use super::{AdjointKernel, OperatorDescriptor, OperatorKind, PrimalKernel};
use crate::adjoint::activity::combine_dependency;
use crate::adjoint::codec::{LOCATED_WIRE_BYTES, LocatedWire, WIRE_VALUE_BYTES, WireValue};
use crate::distributed::{OpHandle, RawOpFn, Transport};
use crate::error::{AdError, Result};
use adcomm_kernels::Located;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A user-supplied reduction operator.
#[derive(Debug, Clone, Copy)]
pub struct CustomOperator {
    pub commutative: bool,
    pub needs_primal: bool,
    pub primal: PrimalKernel,
    pub pre_adjoint: Option<AdjointKernel>,
    pub post_adjoint: Option<AdjointKernel>,
}

struct Entry {
    descriptor: OperatorDescriptor,
    wire_op: OpHandle,
}

/// Operators known to one rank, with their transport-level wire operators.
///
/// Created once per rank with [`OperatorRegistry::init`] and torn down with
/// [`OperatorRegistry::finalize`]. Every rank must register the same custom
/// operators in the same order: ids are handed out sequentially and nothing
/// checks that ranks agree.
pub struct OperatorRegistry {
    entries: HashMap<OperatorKind, Entry>,
    next_custom: u32,
}

/// Reduces 12-byte wire values: the primal kernel on the primals, the
/// dependency merge on the indices.
fn value_wire_op(kernel: fn(f64, f64) -> f64) -> RawOpFn {
    Arc::new(move |input: &[u8], inout: &mut [u8]| {
        for (i, o) in input
            .chunks_exact(WIRE_VALUE_BYTES)
            .zip(inout.chunks_exact_mut(WIRE_VALUE_BYTES))
        {
            let a = WireValue::read_from(i);
            let mut b = WireValue::read_from(o);
            b.primal = kernel(a.primal, b.primal);
            combine_dependency(a.index, &mut b.index);
            let mut bytes = Vec::with_capacity(WIRE_VALUE_BYTES);
            b.write_to(&mut bytes);
            o.copy_from_slice(&bytes);
        }
    })
}

fn located_wire_op(kernel: fn(Located<f64>, Located<f64>) -> Located<f64>) -> RawOpFn {
    Arc::new(move |input: &[u8], inout: &mut [u8]| {
        for (i, o) in input
            .chunks_exact(LOCATED_WIRE_BYTES)
            .zip(inout.chunks_exact_mut(LOCATED_WIRE_BYTES))
        {
            let a = LocatedWire::read_from(i);
            let mut b = LocatedWire::read_from(o);
            let winner = kernel(
                Located::new(a.value.primal, a.loc),
                Located::new(b.value.primal, b.loc),
            );
            b.value.primal = winner.value;
            b.loc = winner.loc;
            combine_dependency(a.value.index, &mut b.value.index);
            let mut bytes = Vec::with_capacity(LOCATED_WIRE_BYTES);
            b.write_to(&mut bytes);
            o.copy_from_slice(&bytes);
        }
    })
}

fn wire_op(primal: PrimalKernel) -> RawOpFn {
    match primal {
        PrimalKernel::Value(kernel) => value_wire_op(kernel),
        PrimalKernel::Located(kernel) => located_wire_op(kernel),
    }
}

impl OperatorRegistry {
    /// Registers the built-in operators with `transport`.
    pub fn init<T: Transport>(transport: &T) -> Result<Self> {
        let mut registry = Self {
            entries: HashMap::new(),
            next_custom: 0,
        };
        for descriptor in OperatorDescriptor::builtins() {
            registry.insert(transport, descriptor);
        }
        debug!(rank = transport.rank(), "operator registry initialized");
        Ok(registry)
    }

    fn insert<T: Transport>(&mut self, transport: &T, descriptor: OperatorDescriptor) {
        let wire_op = transport.register_op(wire_op(descriptor.primal), descriptor.commutative);
        self.entries.insert(descriptor.kind, Entry { descriptor, wire_op });
    }

    /// Registers a custom operator. Must be called identically on every rank.
    pub fn register<T: Transport>(&mut self, transport: &T, op: CustomOperator) -> OperatorKind {
        let kind = OperatorKind::Custom(self.next_custom);
        self.next_custom += 1;
        self.insert(
            transport,
            OperatorDescriptor {
                kind,
                commutative: op.commutative,
                needs_primal: op.needs_primal,
                primal: op.primal,
                pre_adjoint: op.pre_adjoint,
                post_adjoint: op.post_adjoint,
            },
        );
        debug!(rank = transport.rank(), %kind, "registered custom operator");
        kind
    }

    pub fn descriptor(&self, kind: OperatorKind) -> Result<OperatorDescriptor> {
        self.entries
            .get(&kind)
            .map(|e| e.descriptor)
            .ok_or_else(|| AdError::UnknownOperator(kind.to_string()))
    }

    /// The transport handle that reduces wire values with `kind`.
    pub fn wire_op(&self, kind: OperatorKind) -> Result<OpHandle> {
        self.entries
            .get(&kind)
            .map(|e| e.wire_op)
            .ok_or_else(|| AdError::UnknownOperator(kind.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases every wire operator.
    pub fn finalize<T: Transport>(self, transport: &T) -> Result<()> {
        for entry in self.entries.into_values() {
            transport.free_op(entry.wire_op)?;
        }
        debug!(rank = transport.rank(), "operator registry finalized");
        Ok(())
    }
}
