use crate::error::TransportError;
use std::sync::Arc;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A user-defined reduction over raw bytes.
///
/// Called as `op(input, inout)` and must leave `inout[i] = f(input[i], inout[i])`
/// for every element packed in the buffers. The transport folds contributions
/// in ascending rank order by feeding the running accumulator as `input`.
pub type RawOpFn = Arc<dyn Fn(&[u8], &mut [u8]) + Send + Sync>;

/// Handle of an operator registered with [`Transport::register_op`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpHandle(pub u32);

/// Abstraction for the message-passing layer the adjoint adapter runs on.
///
/// Every operation moves raw bytes; typing and derivative bookkeeping happen
/// in the layers above. All ranks must issue collectives in the same order.
///
/// Implementations:
/// - [`ChannelTransport`](super::cpu_backend::ChannelTransport): in-process
///   ranks on threads, connected with `crossbeam` channels.
pub trait Transport {
    /// Handle of an operation in flight.
    type Request;

    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Starts sending `data` to `dest`. Sends are buffered: completion never
    /// waits for the receiver.
    fn isend(&self, data: &[u8], dest: usize, tag: i32) -> TransportResult<Self::Request>;

    /// Starts receiving the next message from `source` with `tag`.
    ///
    /// Receives for the same `(source, tag)` match messages in the order the
    /// receives were posted, whatever order they complete in.
    fn irecv(&self, source: usize, tag: i32) -> TransportResult<Self::Request>;

    /// Starts a broadcast. The root passes `Some(data)`, everyone else `None`;
    /// every rank completes with the root's bytes.
    fn ibcast(&self, data: Option<&[u8]>, root: usize) -> TransportResult<Self::Request>;

    /// Starts a gather. The root completes with all contributions concatenated
    /// in rank order; other ranks complete with `None`.
    fn igather(&self, data: &[u8], root: usize) -> TransportResult<Self::Request>;

    /// Starts an all-gather. Every rank completes with all contributions
    /// concatenated in rank order.
    fn iallgather(&self, data: &[u8]) -> TransportResult<Self::Request>;

    /// Starts a scatter. The root passes `Some(data)` holding `world_size`
    /// equal chunks; rank `r` completes with chunk `r`.
    fn iscatter(&self, data: Option<&[u8]>, root: usize) -> TransportResult<Self::Request>;

    /// Starts a reduction to `root` with a registered operator.
    fn ireduce(&self, data: &[u8], op: OpHandle, root: usize) -> TransportResult<Self::Request>;

    /// Starts a reduction whose result every rank receives.
    fn iallreduce(&self, data: &[u8], op: OpHandle) -> TransportResult<Self::Request>;

    /// Blocks until `request` completes and returns its payload, if any.
    fn wait(&self, request: &mut Self::Request) -> TransportResult<Option<Vec<u8>>>;

    /// Makes progress on `request` without blocking; `true` once it is complete.
    /// A completed request still hands its payload out through [`Transport::wait`].
    fn test(&self, request: &mut Self::Request) -> TransportResult<bool>;

    /// Registers a reduction operator.
    fn register_op(&self, op: RawOpFn, commutative: bool) -> OpHandle;

    /// Releases an operator handle.
    fn free_op(&self, op: OpHandle) -> TransportResult<()>;

    fn send(&self, data: &[u8], dest: usize, tag: i32) -> TransportResult<()> {
        let mut request = self.isend(data, dest, tag)?;
        self.wait(&mut request)?;
        Ok(())
    }

    fn recv(&self, source: usize, tag: i32) -> TransportResult<Vec<u8>> {
        let mut request = self.irecv(source, tag)?;
        self.wait(&mut request)?.ok_or(TransportError::MissingPayload)
    }

    fn bcast(&self, data: Option<&[u8]>, root: usize) -> TransportResult<Vec<u8>> {
        let mut request = self.ibcast(data, root)?;
        self.wait(&mut request)?.ok_or(TransportError::MissingPayload)
    }

    fn gather(&self, data: &[u8], root: usize) -> TransportResult<Option<Vec<u8>>> {
        let mut request = self.igather(data, root)?;
        self.wait(&mut request)
    }

    fn allgather(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        let mut request = self.iallgather(data)?;
        self.wait(&mut request)?.ok_or(TransportError::MissingPayload)
    }

    fn scatter(&self, data: Option<&[u8]>, root: usize) -> TransportResult<Vec<u8>> {
        let mut request = self.iscatter(data, root)?;
        self.wait(&mut request)?.ok_or(TransportError::MissingPayload)
    }

    fn reduce(&self, data: &[u8], op: OpHandle, root: usize) -> TransportResult<Option<Vec<u8>>> {
        let mut request = self.ireduce(data, op, root)?;
        self.wait(&mut request)
    }

    fn allreduce(&self, data: &[u8], op: OpHandle) -> TransportResult<Vec<u8>> {
        let mut request = self.iallreduce(data, op)?;
        self.wait(&mut request)?.ok_or(TransportError::MissingPayload)
    }
}
