use super::backend::{OpHandle, RawOpFn, Transport, TransportResult};
use crate::error::TransportError;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Matching key of a message. User tags and collective sequence numbers live
/// in separate spaces so collectives never intercept point-to-point traffic.
///
/// User messages also carry their position among the messages with the same
/// tag between the same pair of ranks, so receives match in posting order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    User { tag: i32, seq: u64 },
    Collective(u64),
}

/// One message in flight between two ranks.
#[derive(Debug)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

struct Slot {
    source: usize,
    tag: Tag,
    payload: Option<Vec<u8>>,
}

enum Finish {
    /// Complete as soon as all slots are filled, with a fixed result.
    Ready(Option<Vec<u8>>),
    /// Deliver the single slot's payload.
    Single,
    /// Concatenate slot payloads in rank order.
    Concat,
    /// Fold slot payloads in ascending rank order.
    Fold(OpHandle),
}

/// A request of the [`ChannelTransport`].
pub struct ChannelRequest {
    slots: Vec<Slot>,
    finish: Finish,
    result: Option<Option<Vec<u8>>>,
    delivered: bool,
}

impl ChannelRequest {
    fn ready(result: Option<Vec<u8>>) -> Self {
        Self {
            slots: Vec::new(),
            finish: Finish::Ready(result),
            result: None,
            delivered: false,
        }
    }

    fn expecting(slots: Vec<Slot>, finish: Finish) -> Self {
        Self {
            slots,
            finish,
            result: None,
            delivered: false,
        }
    }

    fn is_filled(&self) -> bool {
        self.slots.iter().all(|s| s.payload.is_some())
    }

    fn offer(&mut self, envelope: Envelope) -> Option<Envelope> {
        match self
            .slots
            .iter_mut()
            .find(|s| s.payload.is_none() && s.source == envelope.source && s.tag == envelope.tag)
        {
            Some(slot) => {
                slot.payload = Some(envelope.payload);
                None
            }
            None => Some(envelope),
        }
    }
}

/// An in-process transport: each rank is a thread, each rank owns one inbox.
///
/// Messages are matched on `(source, tag)` in arrival order. Anything that
/// arrives for a different request is parked until someone asks for it.
/// Reductions fold contributions in ascending rank order on every rank, so
/// all ranks of an all-reduce see bit-identical results.
pub struct ChannelTransport {
    rank: usize,
    world_size: usize,
    inbox: Receiver<Envelope>,
    peers: Vec<Sender<Envelope>>,
    parked: RefCell<VecDeque<Envelope>>,
    collective_seq: Cell<u64>,
    /// Next user sequence number per `(dest, tag)`.
    sent: RefCell<HashMap<(usize, i32), u64>>,
    /// Next user sequence number per `(source, tag)`.
    expected: RefCell<HashMap<(usize, i32), u64>>,
    ops: RefCell<HashMap<u32, RawOpFn>>,
    next_op: Cell<u32>,
}

impl ChannelTransport {
    /// `peers[r]` must be the sending end of rank `r`'s inbox (including our own).
    pub fn new(rank: usize, world_size: usize, inbox: Receiver<Envelope>, peers: Vec<Sender<Envelope>>) -> Self {
        Self {
            rank,
            world_size,
            inbox,
            peers,
            parked: RefCell::new(VecDeque::new()),
            collective_seq: Cell::new(0),
            sent: RefCell::new(HashMap::new()),
            expected: RefCell::new(HashMap::new()),
            ops: RefCell::new(HashMap::new()),
            next_op: Cell::new(1),
        }
    }

    /// Creates `world_size` fully connected transports, one per rank.
    pub fn world(world_size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size).map(|_| channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self::new(rank, world_size, inbox, senders.clone()))
            .collect()
    }

    fn check_rank(&self, rank: usize) -> TransportResult<()> {
        if rank < self.world_size {
            Ok(())
        } else {
            Err(TransportError::RankOutOfRange {
                rank,
                world_size: self.world_size,
            })
        }
    }

    fn post(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> TransportResult<()> {
        self.check_rank(dest)?;
        trace!(rank = self.rank, dest, ?tag, bytes = payload.len(), "post");
        self.peers[dest]
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| TransportError::Disconnected { peer: dest })
    }

    fn next_user(counters: &RefCell<HashMap<(usize, i32), u64>>, peer: usize, tag: i32) -> Tag {
        let mut counters = counters.borrow_mut();
        let seq = counters.entry((peer, tag)).or_insert(0);
        let current = *seq;
        *seq += 1;
        Tag::User { tag, seq: current }
    }

    fn next_collective(&self) -> Tag {
        let seq = self.collective_seq.get();
        self.collective_seq.set(seq + 1);
        Tag::Collective(seq)
    }

    /// One slot per rank; our own contribution is filled in directly.
    fn all_slots(&self, tag: Tag, own: &[u8]) -> Vec<Slot> {
        (0..self.world_size)
            .map(|source| Slot {
                source,
                tag,
                payload: (source == self.rank).then(|| own.to_vec()),
            })
            .collect()
    }

    fn drain_parked(&self, request: &mut ChannelRequest) {
        let mut parked = self.parked.borrow_mut();
        let mut kept = VecDeque::with_capacity(parked.len());
        while let Some(envelope) = parked.pop_front() {
            if let Some(unmatched) = request.offer(envelope) {
                kept.push_back(unmatched);
            }
        }
        *parked = kept;
    }

    fn first_missing_peer(request: &ChannelRequest) -> usize {
        request
            .slots
            .iter()
            .find(|s| s.payload.is_none())
            .map(|s| s.source)
            .unwrap_or_default()
    }

    /// Pulls messages until `request` is filled, or until the inbox is empty
    /// when not blocking.
    fn progress(&self, request: &mut ChannelRequest, blocking: bool) -> TransportResult<()> {
        self.drain_parked(request);
        while !request.is_filled() {
            let envelope = if blocking {
                self.inbox.recv().map_err(|_| TransportError::Disconnected {
                    peer: Self::first_missing_peer(request),
                })?
            } else {
                match self.inbox.try_recv() {
                    Ok(envelope) => envelope,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        return Err(TransportError::Disconnected {
                            peer: Self::first_missing_peer(request),
                        });
                    }
                }
            };
            if let Some(unmatched) = request.offer(envelope) {
                self.parked.borrow_mut().push_back(unmatched);
            }
        }
        Ok(())
    }

    fn complete(&self, request: &mut ChannelRequest) -> TransportResult<()> {
        if request.result.is_some() || request.delivered {
            return Ok(());
        }
        let mut payloads = request.slots.iter_mut().filter_map(|s| s.payload.take());
        let result = match &mut request.finish {
            Finish::Ready(result) => result.take(),
            Finish::Single => payloads.next(),
            Finish::Concat => Some(payloads.flatten().collect()),
            Finish::Fold(op) => {
                let ops = self.ops.borrow();
                let f = ops.get(&op.0).ok_or(TransportError::UnknownOperator(op.0))?;
                let mut acc = payloads.next().ok_or(TransportError::MissingPayload)?;
                for mut next in payloads {
                    if next.len() != acc.len() {
                        return Err(TransportError::SizeMismatch {
                            expected: acc.len(),
                            got: next.len(),
                        });
                    }
                    f(&acc, &mut next);
                    acc = next;
                }
                Some(acc)
            }
        };
        request.result = Some(result);
        Ok(())
    }
}

impl Transport for ChannelTransport {
    type Request = ChannelRequest;

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn isend(&self, data: &[u8], dest: usize, tag: i32) -> TransportResult<ChannelRequest> {
        self.check_rank(dest)?;
        self.post(dest, Self::next_user(&self.sent, dest, tag), data.to_vec())?;
        Ok(ChannelRequest::ready(None))
    }

    fn irecv(&self, source: usize, tag: i32) -> TransportResult<ChannelRequest> {
        self.check_rank(source)?;
        // The match is fixed now, not at completion.
        let slot = Slot {
            source,
            tag: Self::next_user(&self.expected, source, tag),
            payload: None,
        };
        Ok(ChannelRequest::expecting(vec![slot], Finish::Single))
    }

    fn ibcast(&self, data: Option<&[u8]>, root: usize) -> TransportResult<ChannelRequest> {
        self.check_rank(root)?;
        let tag = self.next_collective();
        if self.rank == root {
            let data = data.ok_or(TransportError::MissingPayload)?;
            for dest in (0..self.world_size).filter(|&r| r != root) {
                self.post(dest, tag, data.to_vec())?;
            }
            Ok(ChannelRequest::ready(Some(data.to_vec())))
        } else {
            let slot = Slot {
                source: root,
                tag,
                payload: None,
            };
            Ok(ChannelRequest::expecting(vec![slot], Finish::Single))
        }
    }

    fn igather(&self, data: &[u8], root: usize) -> TransportResult<ChannelRequest> {
        self.check_rank(root)?;
        let tag = self.next_collective();
        if self.rank == root {
            Ok(ChannelRequest::expecting(self.all_slots(tag, data), Finish::Concat))
        } else {
            self.post(root, tag, data.to_vec())?;
            Ok(ChannelRequest::ready(None))
        }
    }

    fn iallgather(&self, data: &[u8]) -> TransportResult<ChannelRequest> {
        let tag = self.next_collective();
        for dest in (0..self.world_size).filter(|&r| r != self.rank) {
            self.post(dest, tag, data.to_vec())?;
        }
        Ok(ChannelRequest::expecting(self.all_slots(tag, data), Finish::Concat))
    }

    fn iscatter(&self, data: Option<&[u8]>, root: usize) -> TransportResult<ChannelRequest> {
        self.check_rank(root)?;
        let tag = self.next_collective();
        if self.rank != root {
            let slot = Slot {
                source: root,
                tag,
                payload: None,
            };
            return Ok(ChannelRequest::expecting(vec![slot], Finish::Single));
        }

        let data = data.ok_or(TransportError::MissingPayload)?;
        if data.len() % self.world_size != 0 {
            return Err(TransportError::SizeMismatch {
                expected: data.len() - data.len() % self.world_size,
                got: data.len(),
            });
        }
        let chunk = data.len() / self.world_size;
        let mut own = None;
        for (dest, part) in data.chunks(chunk.max(1)).take(self.world_size).enumerate() {
            if dest == root {
                own = Some(part.to_vec());
            } else {
                self.post(dest, tag, part.to_vec())?;
            }
        }
        if chunk == 0 {
            // Nothing to split; every rank still gets an empty chunk.
            for dest in (0..self.world_size).filter(|&r| r != root) {
                self.post(dest, tag, Vec::new())?;
            }
        }
        Ok(ChannelRequest::ready(Some(own.unwrap_or_default())))
    }

    fn ireduce(&self, data: &[u8], op: OpHandle, root: usize) -> TransportResult<ChannelRequest> {
        self.check_rank(root)?;
        let tag = self.next_collective();
        if self.rank == root {
            Ok(ChannelRequest::expecting(self.all_slots(tag, data), Finish::Fold(op)))
        } else {
            self.post(root, tag, data.to_vec())?;
            Ok(ChannelRequest::ready(None))
        }
    }

    fn iallreduce(&self, data: &[u8], op: OpHandle) -> TransportResult<ChannelRequest> {
        let tag = self.next_collective();
        for dest in (0..self.world_size).filter(|&r| r != self.rank) {
            self.post(dest, tag, data.to_vec())?;
        }
        Ok(ChannelRequest::expecting(self.all_slots(tag, data), Finish::Fold(op)))
    }

    fn wait(&self, request: &mut ChannelRequest) -> TransportResult<Option<Vec<u8>>> {
        if request.delivered {
            return Err(TransportError::AlreadyCompleted);
        }
        self.progress(request, true)?;
        self.complete(request)?;
        request.delivered = true;
        Ok(request.result.take().flatten())
    }

    fn test(&self, request: &mut ChannelRequest) -> TransportResult<bool> {
        if request.delivered || request.result.is_some() {
            return Ok(true);
        }
        self.progress(request, false)?;
        if request.is_filled() {
            self.complete(request)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn register_op(&self, op: RawOpFn, _commutative: bool) -> OpHandle {
        let id = self.next_op.get();
        self.next_op.set(id + 1);
        self.ops.borrow_mut().insert(id, op);
        OpHandle(id)
    }

    fn free_op(&self, op: OpHandle) -> TransportResult<()> {
        self.ops
            .borrow_mut()
            .remove(&op.0)
            .map(|_| ())
            .ok_or(TransportError::UnknownOperator(op.0))
    }
}
