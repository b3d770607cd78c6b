//! Differentiable communication.
//!
//! [`AdComm`] mirrors the usual point-to-point and collective calls but moves
//! [`AReal`] buffers. Each call encodes its values, starts the transport
//! operation and returns an [`AdRequest`]. Decoding the received values and
//! recording the [`CommHandle`](crate::adjoint::CommHandle) on the tape happen
//! only when the request completes (through [`AdComm::wait`] or
//! [`AdComm::test`]), because the received primals are not valid before that.
//! The blocking calls are the non-blocking ones followed by `wait`.
//!
//! # Preconditions
//!
//! - All ranks issue collectives in the same order, with the same operator,
//!   root and element count.
//! - All ranks record (or do not record) the same communications, and run
//!   their reverse sweeps so that handles are reached in mirrored order.
//! - The tape is not reset between recording a handle and evaluating it.
//!
//! # Example
//!
//! ```rust
//! use adcomm::prelude::*;
//! use std::rc::Rc;
//! use std::thread;
//!
//! let handles: Vec<_> = ChannelTransport::world(2)
//!     .into_iter()
//!     .map(|t| {
//!         thread::spawn(move || {
//!             let transport = Rc::new(t);
//!             let registry = OperatorRegistry::init(&*transport).unwrap();
//!             let comm = AdComm::new(transport.clone(), &registry, AdConfig::default());
//!
//!             let mut tape = Tape::new();
//!             tape.set_active();
//!             let mut x = AReal::new(comm.rank() as f64 + 1.0);
//!             tape.register_input(&mut x);
//!
//!             let mut y = [AReal::default()];
//!             comm.allreduce(&mut tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Sum)
//!                 .unwrap();
//!             assert_eq!(y[0].value, 3.0);
//!
//!             tape.set_gradient(y[0].index, 1.0);
//!             tape.evaluate().unwrap();
//!             tape.gradient(x.index)
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     // Both ranks seeded the shared result, so each input sees both seeds.
//!     assert_eq!(h.join().unwrap(), 2.0);
//! }
//! ```

mod request;

pub use request::AdRequest;

use crate::adjoint::activity::activity_flag;
use crate::adjoint::codec::{LocReal, encode_located, encode_values};
use crate::adjoint::mailbox::Mailbox;
use crate::adjoint::tool::AdTool;
use crate::config::AdConfig;
use crate::distributed::Transport;
use crate::error::{AdError, Result};
use crate::ops::{OperatorKind, OperatorRegistry};
use crate::tape::{AReal, AdTape, TapeIndex};
use request::{Pending, ReducePending, ReduceTarget};
use std::rc::Rc;
use tracing::trace;

/// What a rank contributes to a reduction.
#[derive(Debug, Clone, Copy)]
pub enum Contribution<'a> {
    Buffer(&'a [AReal]),
    /// The receive buffer holds the contribution and is overwritten by the
    /// result.
    InPlace,
}

/// Differentiable communication over one transport.
///
/// Use one `AdComm` per transport: point-to-point messages are numbered per
/// communicator.
pub struct AdComm<'r, T: Transport> {
    transport: Rc<T>,
    mailbox: Rc<Mailbox>,
    registry: &'r OperatorRegistry,
    tool: AdTool,
}

fn indices(values: &[AReal]) -> Vec<TapeIndex> {
    values.iter().map(|v| v.index).collect()
}

impl<'r, T: Transport + 'static> AdComm<'r, T> {
    /// `registry` must have been initialized on the same transport.
    pub fn new(transport: Rc<T>, registry: &'r OperatorRegistry, config: AdConfig) -> Self {
        Self {
            transport,
            mailbox: Rc::new(Mailbox::new()),
            registry,
            tool: AdTool::new(config),
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &AdConfig {
        self.tool.config()
    }

    // --- Point-to-point ---

    pub fn isend<'a>(&self, values: &[AReal], dest: usize, tag: i32) -> Result<AdRequest<'a, T>> {
        trace!(rank = self.rank(), dest, tag, elements = values.len(), "isend");
        let data = self.transport.isend(&encode_values(values), dest, tag)?;
        let ordinal = self.mailbox.next_send(dest, tag);
        Ok(AdRequest::new(
            data,
            None,
            Pending::Send {
                inputs: indices(values),
                dest,
                tag,
                ordinal,
            },
        ))
    }

    pub fn irecv<'a>(&self, out: &'a mut [AReal], source: usize, tag: i32) -> Result<AdRequest<'a, T>> {
        trace!(rank = self.rank(), source, tag, elements = out.len(), "irecv");
        let data = self.transport.irecv(source, tag)?;
        let ordinal = self.mailbox.next_recv(source, tag);
        Ok(AdRequest::new(
            data,
            None,
            Pending::Recv {
                out,
                source,
                tag,
                ordinal,
            },
        ))
    }

    pub fn send(&self, tape: &mut dyn AdTape, values: &[AReal], dest: usize, tag: i32) -> Result<()> {
        let request = self.isend(values, dest, tag)?;
        self.wait(tape, request)
    }

    pub fn recv(&self, tape: &mut dyn AdTape, out: &mut [AReal], source: usize, tag: i32) -> Result<()> {
        let request = self.irecv(out, source, tag)?;
        self.wait(tape, request)
    }

    // --- Broadcast ---

    /// The root's buffer is sent; every other rank's buffer is overwritten.
    pub fn ibcast<'a>(&self, buf: &'a mut [AReal], root: usize) -> Result<AdRequest<'a, T>> {
        let data = if self.rank() == root {
            self.transport.ibcast(Some(&encode_values(buf)), root)?
        } else {
            self.transport.ibcast(None, root)?
        };
        Ok(AdRequest::new(data, None, Pending::Bcast { buf, root }))
    }

    pub fn bcast(&self, tape: &mut dyn AdTape, buf: &mut [AReal], root: usize) -> Result<()> {
        let request = self.ibcast(buf, root)?;
        self.wait(tape, request)
    }

    // --- Reductions ---

    fn contribution(&self, send: Contribution<'_>, recv: &[AReal], in_place_allowed: bool) -> Result<Vec<AReal>> {
        match send {
            Contribution::Buffer(values) => Ok(values.to_vec()),
            Contribution::InPlace if in_place_allowed => Ok(recv.to_vec()),
            Contribution::InPlace => Err(AdError::Protocol(
                "in-place contribution is only valid on the receiving rank".to_string(),
            )),
        }
    }

    fn start_reduce<'a>(
        &self,
        values: Vec<AReal>,
        target: &'a mut [AReal],
        kind: OperatorKind,
        root: Option<usize>,
    ) -> Result<AdRequest<'a, T>> {
        let op = self.registry.descriptor(kind)?;
        if op.is_located() {
            return Err(AdError::Protocol(format!(
                "located operator {kind} used on plain values"
            )));
        }
        let is_receiver = root.is_none_or(|r| r == self.rank());
        if is_receiver && target.len() != values.len() {
            return Err(AdError::Protocol(format!(
                "reduction of {} elements into a buffer of {}",
                values.len(),
                target.len()
            )));
        }
        trace!(rank = self.rank(), %kind, ?root, elements = values.len(), "reduce");

        let wire = encode_values(&values);
        let (data, agreement, gathered) = if op.needs_primal {
            (self.transport.iallgather(&wire)?, None, true)
        } else {
            let wire_op = self.registry.wire_op(kind)?;
            match root {
                Some(root) => {
                    let data = self.transport.ireduce(&wire, wire_op, root)?;
                    let agreement = self.transport.iallgather(&[activity_flag(&values)])?;
                    (data, Some(agreement), false)
                }
                None => (self.transport.iallreduce(&wire, wire_op)?, None, false),
            }
        };
        let pending = ReducePending {
            elements: values.len(),
            inputs: indices(&values),
            target: ReduceTarget::Values(target),
            op,
            root,
            gathered,
        };
        Ok(AdRequest::new(data, agreement, Pending::Reduce(pending)))
    }

    /// Reduces to `root`. `recv` is only touched on the root and may be empty
    /// elsewhere.
    pub fn ireduce<'a>(
        &self,
        send: Contribution<'_>,
        recv: &'a mut [AReal],
        kind: OperatorKind,
        root: usize,
    ) -> Result<AdRequest<'a, T>> {
        let values = self.contribution(send, recv, self.rank() == root)?;
        self.start_reduce(values, recv, kind, Some(root))
    }

    pub fn iallreduce<'a>(
        &self,
        send: Contribution<'_>,
        recv: &'a mut [AReal],
        kind: OperatorKind,
    ) -> Result<AdRequest<'a, T>> {
        let values = self.contribution(send, recv, true)?;
        self.start_reduce(values, recv, kind, None)
    }

    pub fn reduce(
        &self,
        tape: &mut dyn AdTape,
        send: Contribution<'_>,
        recv: &mut [AReal],
        kind: OperatorKind,
        root: usize,
    ) -> Result<()> {
        let request = self.ireduce(send, recv, kind, root)?;
        self.wait(tape, request)
    }

    pub fn allreduce(
        &self,
        tape: &mut dyn AdTape,
        send: Contribution<'_>,
        recv: &mut [AReal],
        kind: OperatorKind,
    ) -> Result<()> {
        let request = self.iallreduce(send, recv, kind)?;
        self.wait(tape, request)
    }

    fn start_reduce_loc<'a>(
        &self,
        send: &[LocReal],
        target: &'a mut [LocReal],
        kind: OperatorKind,
        root: Option<usize>,
    ) -> Result<AdRequest<'a, T>> {
        let op = self.registry.descriptor(kind)?;
        if !op.is_located() {
            return Err(AdError::Protocol(format!(
                "operator {kind} used on located values"
            )));
        }
        let is_receiver = root.is_none_or(|r| r == self.rank());
        if is_receiver && target.len() != send.len() {
            return Err(AdError::Protocol(format!(
                "reduction of {} elements into a buffer of {}",
                send.len(),
                target.len()
            )));
        }
        trace!(rank = self.rank(), %kind, ?root, elements = send.len(), "reduce_loc");

        // The winner's location decides the adjoint routing, so every rank
        // needs every contribution.
        let data = self.transport.iallgather(&encode_located(send))?;
        let pending = ReducePending {
            elements: send.len(),
            inputs: send.iter().map(|v| v.value.index).collect(),
            target: ReduceTarget::Located(target),
            op,
            root,
            gathered: true,
        };
        Ok(AdRequest::new(data, None, Pending::Reduce(pending)))
    }

    pub fn ireduce_loc<'a>(
        &self,
        send: &[LocReal],
        recv: &'a mut [LocReal],
        kind: OperatorKind,
        root: usize,
    ) -> Result<AdRequest<'a, T>> {
        self.start_reduce_loc(send, recv, kind, Some(root))
    }

    pub fn iallreduce_loc<'a>(
        &self,
        send: &[LocReal],
        recv: &'a mut [LocReal],
        kind: OperatorKind,
    ) -> Result<AdRequest<'a, T>> {
        self.start_reduce_loc(send, recv, kind, None)
    }

    pub fn reduce_loc(
        &self,
        tape: &mut dyn AdTape,
        send: &[LocReal],
        recv: &mut [LocReal],
        kind: OperatorKind,
        root: usize,
    ) -> Result<()> {
        let request = self.ireduce_loc(send, recv, kind, root)?;
        self.wait(tape, request)
    }

    pub fn allreduce_loc(
        &self,
        tape: &mut dyn AdTape,
        send: &[LocReal],
        recv: &mut [LocReal],
        kind: OperatorKind,
    ) -> Result<()> {
        let request = self.iallreduce_loc(send, recv, kind)?;
        self.wait(tape, request)
    }

    // --- Gather / scatter ---

    /// Gathers `send` from every rank into `recv` on the root, in rank order.
    /// `recv` must hold `world_size * send.len()` values on the root.
    pub fn igather<'a>(&self, send: &[AReal], recv: &'a mut [AReal], root: usize) -> Result<AdRequest<'a, T>> {
        let data = self.transport.igather(&encode_values(send), root)?;
        let agreement = self.transport.iallgather(&[activity_flag(send)])?;
        Ok(AdRequest::new(
            data,
            Some(agreement),
            Pending::Gather {
                out: recv,
                inputs: indices(send),
                root: Some(root),
                elements: send.len(),
            },
        ))
    }

    pub fn iallgather<'a>(&self, send: &[AReal], recv: &'a mut [AReal]) -> Result<AdRequest<'a, T>> {
        let data = self.transport.iallgather(&encode_values(send))?;
        Ok(AdRequest::new(
            data,
            None,
            Pending::Gather {
                out: recv,
                inputs: indices(send),
                root: None,
                elements: send.len(),
            },
        ))
    }

    pub fn gather(&self, tape: &mut dyn AdTape, send: &[AReal], recv: &mut [AReal], root: usize) -> Result<()> {
        let request = self.igather(send, recv, root)?;
        self.wait(tape, request)
    }

    pub fn allgather(&self, tape: &mut dyn AdTape, send: &[AReal], recv: &mut [AReal]) -> Result<()> {
        let request = self.iallgather(send, recv)?;
        self.wait(tape, request)
    }

    /// Splits the root's `send` into `world_size` blocks of `recv.len()`
    /// values; rank `r` receives block `r`. `send` is ignored elsewhere.
    pub fn iscatter<'a>(&self, send: &[AReal], recv: &'a mut [AReal], root: usize) -> Result<AdRequest<'a, T>> {
        let is_root = self.rank() == root;
        if is_root && send.len() != recv.len() * self.world_size() {
            return Err(AdError::Protocol(format!(
                "scatter of {} values into {} blocks of {}",
                send.len(),
                self.world_size(),
                recv.len()
            )));
        }
        let data = if is_root {
            self.transport.iscatter(Some(&encode_values(send)), root)?
        } else {
            self.transport.iscatter(None, root)?
        };
        let flag = if is_root { activity_flag(send) } else { 0 };
        let agreement = self.transport.iallgather(&[flag])?;
        let elements = recv.len();
        Ok(AdRequest::new(
            data,
            Some(agreement),
            Pending::Scatter {
                out: recv,
                inputs: if is_root { indices(send) } else { Vec::new() },
                root,
                elements,
            },
        ))
    }

    pub fn scatter(&self, tape: &mut dyn AdTape, send: &[AReal], recv: &mut [AReal], root: usize) -> Result<()> {
        let request = self.iscatter(send, recv, root)?;
        self.wait(tape, request)
    }

    // --- Completion ---

    /// Blocks until `request` completes, then decodes and records it.
    pub fn wait(&self, tape: &mut dyn AdTape, mut request: AdRequest<'_, T>) -> Result<()> {
        request.complete(self, tape)
    }

    /// Completes `request` if the transport reports it done. Returns whether
    /// it is complete; a completed request needs no further `wait`.
    pub fn test(&self, tape: &mut dyn AdTape, request: &mut AdRequest<'_, T>) -> Result<bool> {
        if request.is_completed() {
            return Ok(true);
        }
        if request.poll(&*self.transport)? {
            request.complete(self, tape)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Waits for every request, in order.
    pub fn wait_all<'a, I>(&self, tape: &mut dyn AdTape, requests: I) -> Result<()>
    where
        I: IntoIterator<Item = AdRequest<'a, T>>,
    {
        for request in requests {
            self.wait(tape, request)?;
        }
        Ok(())
    }

    /// Completes all requests, in order, if and only if all of them are done.
    pub fn test_all(&self, tape: &mut dyn AdTape, requests: &mut [AdRequest<'_, T>]) -> Result<bool> {
        for request in requests.iter_mut() {
            if !request.is_completed() && !request.poll(&*self.transport)? {
                return Ok(false);
            }
        }
        for request in requests.iter_mut() {
            request.complete(self, tape)?;
        }
        Ok(true)
    }
}
