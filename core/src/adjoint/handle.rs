//! The external function recorded for one communication.
//!
//! A [`CommHandle`] remembers which tape indices went into and came out of a
//! communication on this rank. In the reverse sweep it claims the adjoints
//! of its outputs, ships them back along the mirrored communication pattern
//! and adds what arrives onto its inputs. In the forward sweep it ships
//! tangents along the original pattern.
//!
//! Reverse sweeps of all ranks must reach their handles in mirrored order;
//! the adjoint exchange is itself a communication and matches up the same way
//! the original one did.

use super::buffer::AdjointBuffer;
use super::mailbox::{Mailbox, Sweep};
use crate::config::ToolFlavor;
use crate::distributed::Transport;
use crate::error::{AdError, Result};
use crate::ops::{AdjointContext, OperatorDescriptor};
use crate::tape::{AdjointInterface, ExternalFunction, TapeIndex};
use adcomm_kernels::weighted_block_sum;
use std::rc::Rc;
use tracing::{debug, trace};

/// Which communication a handle stands for, from this rank's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// `ordinal` counts the messages to `dest` with `tag` before this one.
    Send { dest: usize, tag: i32, ordinal: u64 },
    Recv { source: usize, tag: i32, ordinal: u64 },
    Bcast { root: usize },
    Reduce { root: usize },
    Allreduce,
    Gather { root: usize },
    Allgather,
    Scatter { root: usize },
}

impl Pattern {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Recv { .. } => "recv",
            Self::Bcast { .. } => "bcast",
            Self::Reduce { .. } => "reduce",
            Self::Allreduce => "allreduce",
            Self::Gather { .. } => "gather",
            Self::Allgather => "allgather",
            Self::Scatter { .. } => "scatter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    /// Owned by the tape, waiting for a sweep.
    Armed,
    Invoked,
}

/// Primal information captured when a reduction completed, for operators
/// whose adjoint depends on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routing {
    /// Every rank's contribution, `ranks` blocks of `elements`.
    pub primals: Vec<f64>,
    pub result: Vec<f64>,
    pub locations: Vec<i32>,
    pub result_locations: Vec<i32>,
}

pub struct CommHandle<T: Transport> {
    transport: Rc<T>,
    mailbox: Rc<Mailbox>,
    pattern: Pattern,
    /// Indices this rank contributed.
    inputs: Vec<TapeIndex>,
    /// Indices this rank received.
    outputs: Vec<TapeIndex>,
    old_primals: Vec<f64>,
    /// Elements per rank.
    elements: usize,
    operator: Option<OperatorDescriptor>,
    routing: Routing,
    flavor: ToolFlavor,
    state: HandleState,
}

impl<T: Transport> CommHandle<T> {
    pub fn new(transport: Rc<T>, mailbox: Rc<Mailbox>, pattern: Pattern, elements: usize, flavor: ToolFlavor) -> Self {
        Self {
            transport,
            mailbox,
            pattern,
            inputs: Vec::new(),
            outputs: Vec::new(),
            old_primals: Vec::new(),
            elements,
            operator: None,
            routing: Routing::default(),
            flavor,
            state: HandleState::Created,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<TapeIndex>) -> Self {
        self.inputs = inputs;
        self
    }

    /// `old_primals` is only consulted by the primal-restoring flavor.
    pub fn with_outputs(mut self, outputs: Vec<TapeIndex>, old_primals: Vec<f64>) -> Self {
        self.outputs = outputs;
        self.old_primals = old_primals;
        self
    }

    pub fn with_operator(mut self, operator: OperatorDescriptor, routing: Routing) -> Self {
        self.operator = Some(operator);
        self.routing = routing;
        self
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn inputs(&self) -> &[TapeIndex] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TapeIndex] {
        &self.outputs
    }

    fn operator(&self) -> Result<OperatorDescriptor> {
        self.operator.ok_or_else(|| {
            AdError::Protocol(format!("{} handle recorded without an operator", self.pattern.name()))
        })
    }

    fn context(&self, rank: usize, width: usize) -> AdjointContext<'_> {
        AdjointContext {
            rank,
            ranks: self.transport.world_size(),
            elements: self.elements,
            width,
            primals: &self.routing.primals,
            result: &self.routing.result,
            locations: &self.routing.locations,
            result_locations: &self.routing.result_locations,
        }
    }

    /// Claims the adjoints of the outputs and, for the primal-restoring
    /// flavor, puts back the primals the outputs overwrote.
    fn claim_outputs(&self, adjoints: &mut dyn AdjointInterface) -> Result<AdjointBuffer> {
        let mut buf = AdjointBuffer::allocate(self.outputs.len(), adjoints.vector_width());
        buf.pull(adjoints, &self.outputs)?;
        if self.flavor.is_primal_restore() {
            for (&index, &old) in self.outputs.iter().zip(&self.old_primals) {
                adjoints.reset_primal(index, old);
            }
        }
        Ok(buf)
    }

    fn read_inputs(&self, tangents: &dyn AdjointInterface) -> Result<AdjointBuffer> {
        let mut buf = AdjointBuffer::allocate(self.inputs.len(), tangents.vector_width());
        buf.read(tangents, &self.inputs)?;
        Ok(buf)
    }

    fn reverse(&self, adjoints: &mut dyn AdjointInterface) -> Result<()> {
        let transport = &*self.transport;
        let (rank, ranks) = (transport.rank(), transport.world_size());
        let width = adjoints.vector_width();

        match self.pattern {
            Pattern::Send { dest, tag, ordinal } => {
                let bytes = self.mailbox.recv(transport, dest, tag, Sweep::Reverse, ordinal)?;
                AdjointBuffer::from_bytes(&bytes, width)?.push(adjoints, &self.inputs)?;
            }
            Pattern::Recv { source, tag, ordinal } => {
                let claimed = self.claim_outputs(adjoints)?;
                self.mailbox
                    .send(transport, &claimed.to_bytes(), source, tag, Sweep::Reverse, ordinal)?;
            }
            Pattern::Bcast { root } => {
                // The root kept its own values, so its block stays zero.
                let own = if rank == root {
                    AdjointBuffer::allocate(self.elements, width)
                } else {
                    self.claim_outputs(adjoints)?
                };
                if let Some(bytes) = transport.gather(&own.to_bytes(), root)? {
                    let mut all = AdjointBuffer::from_bytes(&bytes, width)?;
                    all.combine_ranks(ranks)?;
                    all.push(adjoints, &self.inputs)?;
                }
            }
            Pattern::Reduce { root } => {
                let op = self.operator()?;
                let seed = if rank == root {
                    let mut claimed = self.claim_outputs(adjoints)?;
                    op.apply_pre(claimed.as_mut_slice(), &self.context(root, width))?;
                    Some(claimed.to_bytes())
                } else {
                    None
                };
                let bytes = transport.bcast(seed.as_deref(), root)?;
                let mut routed = AdjointBuffer::from_bytes(&bytes, width)?;
                op.apply_post(routed.as_mut_slice(), &self.context(rank, width))?;
                routed.push(adjoints, &self.inputs)?;
            }
            Pattern::Allreduce => {
                let op = self.operator()?;
                let claimed = self.claim_outputs(adjoints)?;
                let mut total = AdjointBuffer::from_bytes(&transport.allgather(&claimed.to_bytes())?, width)?;
                total.combine_ranks(ranks)?;
                op.apply_pre(total.as_mut_slice(), &self.context(rank, width))?;
                op.apply_post(total.as_mut_slice(), &self.context(rank, width))?;
                total.push(adjoints, &self.inputs)?;
            }
            Pattern::Gather { root } => {
                let claimed = if rank == root {
                    Some(self.claim_outputs(adjoints)?.to_bytes())
                } else {
                    None
                };
                let own = AdjointBuffer::from_bytes(&transport.scatter(claimed.as_deref(), root)?, width)?;
                own.push(adjoints, &self.inputs)?;
            }
            Pattern::Allgather => {
                let claimed = self.claim_outputs(adjoints)?;
                let all = AdjointBuffer::from_bytes(&transport.allgather(&claimed.to_bytes())?, width)?;
                // Every rank sent adjoints for all blocks; keep the ones for ours.
                let n = self.elements;
                let mut mine = AdjointBuffer::allocate(0, width);
                for source in 0..ranks {
                    mine.extend(&all.slice(source * ranks * n + rank * n, n)?);
                }
                mine.combine_ranks(ranks)?;
                mine.push(adjoints, &self.inputs)?;
            }
            Pattern::Scatter { root } => {
                let claimed = self.claim_outputs(adjoints)?;
                if let Some(bytes) = transport.gather(&claimed.to_bytes(), root)? {
                    AdjointBuffer::from_bytes(&bytes, width)?.push(adjoints, &self.inputs)?;
                }
            }
        }
        Ok(())
    }

    fn forward(&self, tangents: &mut dyn AdjointInterface) -> Result<()> {
        let transport = &*self.transport;
        let rank = transport.rank();
        let width = tangents.vector_width();

        match self.pattern {
            Pattern::Send { dest, tag, ordinal } => {
                let own = self.read_inputs(tangents)?;
                self.mailbox
                    .send(transport, &own.to_bytes(), dest, tag, Sweep::Forward, ordinal)?;
            }
            Pattern::Recv { source, tag, ordinal } => {
                let bytes = self.mailbox.recv(transport, source, tag, Sweep::Forward, ordinal)?;
                AdjointBuffer::from_bytes(&bytes, width)?.store(tangents, &self.outputs)?;
            }
            Pattern::Bcast { root } => {
                let own = if rank == root {
                    Some(self.read_inputs(tangents)?.to_bytes())
                } else {
                    None
                };
                let bytes = transport.bcast(own.as_deref(), root)?;
                if rank != root {
                    AdjointBuffer::from_bytes(&bytes, width)?.store(tangents, &self.outputs)?;
                }
            }
            Pattern::Reduce { root } => {
                let op = self.operator()?;
                let own = self.read_inputs(tangents)?;
                if let Some(bytes) = transport.gather(&own.to_bytes(), root)? {
                    let all = AdjointBuffer::from_bytes(&bytes, width)?;
                    self.store_reduced_tangents(&op, &all, root, tangents)?;
                }
            }
            Pattern::Allreduce => {
                let op = self.operator()?;
                let own = self.read_inputs(tangents)?;
                let all = AdjointBuffer::from_bytes(&transport.allgather(&own.to_bytes())?, width)?;
                self.store_reduced_tangents(&op, &all, rank, tangents)?;
            }
            Pattern::Gather { root } => {
                let own = self.read_inputs(tangents)?;
                if let Some(bytes) = transport.gather(&own.to_bytes(), root)? {
                    AdjointBuffer::from_bytes(&bytes, width)?.store(tangents, &self.outputs)?;
                }
            }
            Pattern::Allgather => {
                let own = self.read_inputs(tangents)?;
                AdjointBuffer::from_bytes(&transport.allgather(&own.to_bytes())?, width)?
                    .store(tangents, &self.outputs)?;
            }
            Pattern::Scatter { root } => {
                let own = if rank == root {
                    Some(self.read_inputs(tangents)?.to_bytes())
                } else {
                    None
                };
                AdjointBuffer::from_bytes(&transport.scatter(own.as_deref(), root)?, width)?
                    .store(tangents, &self.outputs)?;
            }
        }
        Ok(())
    }

    /// Tangent of a reduction: every rank's tangent weighted by its partial.
    fn store_reduced_tangents(
        &self,
        op: &OperatorDescriptor,
        all: &AdjointBuffer,
        owner: usize,
        tangents: &mut dyn AdjointInterface,
    ) -> Result<()> {
        let ranks = self.transport.world_size();
        let width = all.width();
        let partials = op.partials(&self.context(owner, width), owner)?;
        let reduced = weighted_block_sum(all.as_slice(), &partials, self.elements, ranks, width)?;
        AdjointBuffer::from_vec(reduced, width)?.store(tangents, &self.outputs)
    }
}

impl<T: Transport + 'static> CommHandle<T> {
    /// Marks the handle as owned by a tape.
    pub fn arm(mut self) -> Box<dyn ExternalFunction> {
        self.state = HandleState::Armed;
        Box::new(self)
    }
}

impl<T: Transport> ExternalFunction for CommHandle<T> {
    fn name(&self) -> &'static str {
        self.pattern.name()
    }

    fn evaluate_reverse(&mut self, adjoints: &mut dyn AdjointInterface) -> Result<()> {
        trace!(
            handle = self.pattern.name(),
            rank = self.transport.rank(),
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            "reverse"
        );
        self.reverse(adjoints)?;
        self.state = HandleState::Invoked;
        Ok(())
    }

    fn evaluate_forward(&mut self, tangents: &mut dyn AdjointInterface) -> Result<()> {
        trace!(handle = self.pattern.name(), rank = self.transport.rank(), "forward");
        self.forward(tangents)
    }
}

impl<T: Transport> Drop for CommHandle<T> {
    fn drop(&mut self) {
        if self.state == HandleState::Armed {
            debug!(handle = self.pattern.name(), "communication handle released without a reverse sweep");
        }
    }
}
