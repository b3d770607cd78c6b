use super::AdComm;
use crate::adjoint::activity::{any_active_index, any_flag_set};
use crate::adjoint::codec::{LocReal, WireValue, decode_located, decode_values};
use crate::adjoint::handle::{CommHandle, Pattern, Routing};
use crate::distributed::Transport;
use crate::error::{AdError, Result, TransportError};
use crate::ops::{OperatorDescriptor, PrimalKernel};
use crate::tape::{AReal, AdTape, TapeIndex};
use adcomm_kernels::{Located, fold_ranks, fold_ranks_located};

pub(crate) enum ReduceTarget<'a> {
    Values(&'a mut [AReal]),
    Located(&'a mut [LocReal]),
}

pub(crate) struct ReducePending<'a> {
    pub(crate) target: ReduceTarget<'a>,
    pub(crate) inputs: Vec<TapeIndex>,
    pub(crate) op: OperatorDescriptor,
    /// `None` for all-reduce.
    pub(crate) root: Option<usize>,
    pub(crate) elements: usize,
    /// The payload is every rank's contribution rather than the reduced result.
    pub(crate) gathered: bool,
}

/// Work left for completion time.
pub(crate) enum Pending<'a> {
    Send {
        inputs: Vec<TapeIndex>,
        dest: usize,
        tag: i32,
        ordinal: u64,
    },
    Recv {
        out: &'a mut [AReal],
        source: usize,
        tag: i32,
        ordinal: u64,
    },
    Bcast {
        buf: &'a mut [AReal],
        root: usize,
    },
    Reduce(ReducePending<'a>),
    /// `root: None` for all-gather.
    Gather {
        out: &'a mut [AReal],
        inputs: Vec<TapeIndex>,
        root: Option<usize>,
        elements: usize,
    },
    Scatter {
        out: &'a mut [AReal],
        inputs: Vec<TapeIndex>,
        root: usize,
        elements: usize,
    },
    Completed,
}

/// A differentiable communication in flight.
///
/// Must be completed with [`AdComm::wait`] or [`AdComm::test`]. Dropping an
/// incomplete request loses both the received values and the tape recording.
pub struct AdRequest<'a, T: Transport> {
    data: T::Request,
    /// Activity flags of every rank, for collectives where a rank cannot see
    /// every contribution.
    agreement: Option<T::Request>,
    pending: Pending<'a>,
}

fn expect_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(AdError::Protocol(format!(
            "{what}: expected {expected} values, got {got}"
        )));
    }
    Ok(())
}

impl<'a, T: Transport> AdRequest<'a, T> {
    pub(crate) fn new(data: T::Request, agreement: Option<T::Request>, pending: Pending<'a>) -> Self {
        Self {
            data,
            agreement,
            pending,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.pending, Pending::Completed)
    }

    /// Whether every underlying transport request is done.
    pub(crate) fn poll(&mut self, transport: &T) -> Result<bool> {
        if !transport.test(&mut self.data)? {
            return Ok(false);
        }
        match self.agreement.as_mut() {
            Some(agreement) => Ok(transport.test(agreement)?),
            None => Ok(true),
        }
    }

    pub(crate) fn complete(&mut self, comm: &AdComm<'_, T>, tape: &mut dyn AdTape) -> Result<()>
    where
        T: 'static,
    {
        if self.is_completed() {
            return Ok(());
        }
        let transport = comm.transport();
        let payload = transport.wait(&mut self.data)?;
        let flags = match self.agreement.as_mut() {
            Some(agreement) => Some(transport.wait(agreement)?.ok_or(TransportError::MissingPayload)?),
            None => None,
        };
        let pending = std::mem::replace(&mut self.pending, Pending::Completed);
        comm.finish(tape, pending, payload, flags)
    }
}

impl<T: Transport + 'static> AdComm<'_, T> {
    fn handle(&self, pattern: Pattern, elements: usize) -> CommHandle<T> {
        CommHandle::new(
            self.transport.clone(),
            self.mailbox.clone(),
            pattern,
            elements,
            self.tool.flavor(),
        )
    }

    /// Writes received wires into `out`; returns the new indices and the
    /// primals they replaced.
    fn decode_all(&self, tape: &mut dyn AdTape, wires: &[WireValue], out: &mut [AReal]) -> (Vec<TapeIndex>, Vec<f64>) {
        let mut old_primals = Vec::with_capacity(wires.len());
        for (wire, target) in wires.iter().zip(out.iter_mut()) {
            old_primals.push(self.tool.decode_into(tape, wire, target));
        }
        (out.iter().map(|v| v.index).collect(), old_primals)
    }

    pub(crate) fn finish(
        &self,
        tape: &mut dyn AdTape,
        pending: Pending<'_>,
        payload: Option<Vec<u8>>,
        flags: Option<Vec<u8>>,
    ) -> Result<()> {
        let agreed = flags.as_deref().is_some_and(any_flag_set);

        match pending {
            Pending::Completed => {}
            Pending::Send {
                inputs,
                dest,
                tag,
                ordinal,
            } => {
                if self.tool.is_handle_required(tape, any_active_index(&inputs)) {
                    let handle = self
                        .handle(Pattern::Send { dest, tag, ordinal }, inputs.len())
                        .with_inputs(inputs);
                    self.tool.add_tool_action(tape, handle.arm());
                }
            }
            Pending::Recv {
                out,
                source,
                tag,
                ordinal,
            } => {
                let wires = decode_values(&payload.ok_or(TransportError::MissingPayload)?)?;
                expect_len("recv", wires.len(), out.len())?;
                let active = wires.iter().any(|w| w.index.is_active());
                let (outputs, old_primals) = self.decode_all(tape, &wires, out);
                if self.tool.is_handle_required(tape, active) {
                    let handle = self
                        .handle(Pattern::Recv { source, tag, ordinal }, outputs.len())
                        .with_outputs(outputs, old_primals);
                    self.tool.add_tool_action(tape, handle.arm());
                }
            }
            Pending::Bcast { buf, root } => {
                let wires = decode_values(&payload.ok_or(TransportError::MissingPayload)?)?;
                expect_len("bcast", wires.len(), buf.len())?;
                let active = wires.iter().any(|w| w.index.is_active());
                let handle = self.handle(Pattern::Bcast { root }, buf.len());
                let handle = if self.rank() == root {
                    handle.with_inputs(buf.iter().map(|v| v.index).collect())
                } else {
                    let (outputs, old_primals) = self.decode_all(tape, &wires, buf);
                    handle.with_outputs(outputs, old_primals)
                };
                if self.tool.is_handle_required(tape, active) {
                    self.tool.add_tool_action(tape, handle.arm());
                }
            }
            Pending::Reduce(reduce) => self.finish_reduce(tape, reduce, payload, agreed)?,
            Pending::Gather {
                out,
                inputs,
                root,
                elements,
            } => {
                let is_receiver = root.is_none_or(|r| r == self.rank());
                let mut received = None;
                let mut active = agreed;
                if is_receiver {
                    let wires = decode_values(&payload.ok_or(TransportError::MissingPayload)?)?;
                    expect_len("gather", wires.len(), elements * self.world_size())?;
                    expect_len("gather buffer", out.len(), wires.len())?;
                    if root.is_none() {
                        active = wires.iter().any(|w| w.index.is_active());
                    }
                    received = Some(wires);
                }
                let pattern = match root {
                    Some(root) => Pattern::Gather { root },
                    None => Pattern::Allgather,
                };
                let mut handle = self.handle(pattern, elements).with_inputs(inputs);
                if let Some(wires) = received {
                    let (outputs, old_primals) = self.decode_all(tape, &wires, out);
                    handle = handle.with_outputs(outputs, old_primals);
                }
                if self.tool.is_handle_required(tape, active) {
                    self.tool.add_tool_action(tape, handle.arm());
                }
            }
            Pending::Scatter {
                out,
                inputs,
                root,
                elements,
            } => {
                let wires = decode_values(&payload.ok_or(TransportError::MissingPayload)?)?;
                expect_len("scatter", wires.len(), elements)?;
                expect_len("scatter buffer", out.len(), elements)?;
                let (outputs, old_primals) = self.decode_all(tape, &wires, out);
                if self.tool.is_handle_required(tape, agreed) {
                    let handle = self
                        .handle(Pattern::Scatter { root }, elements)
                        .with_inputs(inputs)
                        .with_outputs(outputs, old_primals);
                    self.tool.add_tool_action(tape, handle.arm());
                }
            }
        }
        Ok(())
    }

    fn finish_reduce(
        &self,
        tape: &mut dyn AdTape,
        reduce: ReducePending<'_>,
        payload: Option<Vec<u8>>,
        agreed: bool,
    ) -> Result<()> {
        let ReducePending {
            target,
            inputs,
            op,
            root,
            elements,
            gathered,
        } = reduce;
        let ranks = self.world_size();
        let is_receiver = root.is_none_or(|r| r == self.rank());

        // The reduced wires (for receivers), global activity and routing data.
        let (result, active, routing): (Vec<(WireValue, i32)>, bool, Routing) = match (&target, gathered) {
            (ReduceTarget::Values(_), true) => {
                let wires = decode_values(&payload.ok_or(TransportError::MissingPayload)?)?;
                expect_len("reduce", wires.len(), elements * ranks)?;
                let PrimalKernel::Value(kernel) = op.primal else {
                    return Err(AdError::Protocol(format!("located operator {} on plain values", op.kind)));
                };
                let primals: Vec<f64> = wires.iter().map(|w| w.primal).collect();
                let values = fold_ranks(&primals, elements, ranks, kernel)?;
                let result = reduced_wires(&wires, &values, elements, ranks);
                let active = wires.iter().any(|w| w.index.is_active());
                let routing = Routing {
                    primals,
                    result: values,
                    ..Routing::default()
                };
                (result.into_iter().map(|w| (w, 0)).collect(), active, routing)
            }
            (ReduceTarget::Values(_), false) => {
                let result = match payload {
                    Some(bytes) => decode_values(&bytes)?,
                    None => Vec::new(),
                };
                let active = match root {
                    Some(_) => agreed,
                    None => result.iter().any(|w| w.index.is_active()),
                };
                (result.into_iter().map(|w| (w, 0)).collect(), active, Routing::default())
            }
            (ReduceTarget::Located(_), _) => {
                let wires = decode_located(&payload.ok_or(TransportError::MissingPayload)?)?;
                expect_len("reduce_loc", wires.len(), elements * ranks)?;
                let PrimalKernel::Located(kernel) = op.primal else {
                    return Err(AdError::Protocol(format!("operator {} on located values", op.kind)));
                };
                let located: Vec<Located<f64>> = wires
                    .iter()
                    .map(|w| Located::new(w.value.primal, w.loc))
                    .collect();
                let reduced = fold_ranks_located(&located, elements, ranks, kernel)?;
                let plain: Vec<WireValue> = wires.iter().map(|w| w.value).collect();
                let values: Vec<f64> = reduced.iter().map(|l| l.value).collect();
                let result = reduced_wires(&plain, &values, elements, ranks)
                    .into_iter()
                    .zip(&reduced)
                    .map(|(w, l)| (w, l.loc))
                    .collect();
                let active = plain.iter().any(|w| w.index.is_active());
                let routing = Routing {
                    primals: plain.iter().map(|w| w.primal).collect(),
                    result: values,
                    locations: wires.iter().map(|w| w.loc).collect(),
                    result_locations: reduced.iter().map(|l| l.loc).collect(),
                };
                (result, active, routing)
            }
        };

        let pattern = match root {
            Some(root) => Pattern::Reduce { root },
            None => Pattern::Allreduce,
        };
        let mut handle = self.handle(pattern, elements).with_inputs(inputs);
        if is_receiver {
            expect_len("reduce result", result.len(), elements)?;
            let mut old_primals = Vec::with_capacity(elements);
            let outputs: Vec<TapeIndex> = match target {
                ReduceTarget::Values(out) => {
                    for ((wire, _), target) in result.iter().zip(out.iter_mut()) {
                        old_primals.push(self.tool.decode_into(tape, wire, target));
                    }
                    out.iter().map(|v| v.index).collect()
                }
                ReduceTarget::Located(out) => {
                    for ((wire, loc), target) in result.iter().zip(out.iter_mut()) {
                        old_primals.push(self.tool.decode_into(tape, wire, &mut target.value));
                        target.loc = *loc;
                    }
                    out.iter().map(|v| v.value.index).collect()
                }
            };
            handle = handle.with_outputs(outputs, old_primals);
        }
        if self.tool.is_handle_required(tape, active) {
            self.tool.add_tool_action(tape, handle.with_operator(op, routing).arm());
        }
        Ok(())
    }
}

/// Result wires for locally reduced values: element `e` is marked active when
/// any rank's contribution to it was.
fn reduced_wires(wires: &[WireValue], values: &[f64], elements: usize, ranks: usize) -> Vec<WireValue> {
    values
        .iter()
        .enumerate()
        .map(|(e, &primal)| {
            let active = (0..ranks).any(|r| wires[r * elements + e].index.is_active());
            WireValue {
                primal,
                index: if active { TapeIndex::UNASSIGNED } else { TapeIndex::PASSIVE },
            }
        })
        .collect()
}
