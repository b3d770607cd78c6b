//! Message identity for point-to-point handles.
//!
//! In a sweep, a point-to-point handle exchanges one message with the peer's
//! matching handle. Handles are recorded when a request completes, and two
//! receives from the same peer and tag may complete in either order, so the
//! peers can reach their handles in different orders. Every sweep message
//! therefore carries the ordinal of the original message it belongs to, and
//! messages that arrive before their handle asks for them wait here.

use crate::distributed::Transport;
use crate::error::{AdError, Result};
use std::cell::RefCell;
use std::collections::HashMap;

/// Ordinal (u64 LE) followed by the sweep code.
const HEADER_BYTES: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sweep {
    Reverse,
    Forward,
}

impl Sweep {
    fn code(self) -> u8 {
        match self {
            Self::Reverse => 0,
            Self::Forward => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Reverse),
            1 => Ok(Self::Forward),
            other => Err(AdError::Protocol(format!("unknown sweep code {other}"))),
        }
    }
}

type Counters = RefCell<HashMap<(usize, i32), u64>>;

fn bump(counters: &Counters, peer: usize, tag: i32) -> u64 {
    let mut counters = counters.borrow_mut();
    let next = counters.entry((peer, tag)).or_insert(0);
    let ordinal = *next;
    *next += 1;
    ordinal
}

/// One per rank, shared by every point-to-point handle of that rank.
#[derive(Debug, Default)]
pub struct Mailbox {
    sent: Counters,
    received: Counters,
    early: RefCell<HashMap<(usize, i32, Sweep, u64), Vec<u8>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal of the next message sent to `dest` with `tag`.
    pub fn next_send(&self, dest: usize, tag: i32) -> u64 {
        bump(&self.sent, dest, tag)
    }

    /// Ordinal of the next receive posted for `source` and `tag`. Receives
    /// match in posting order, so this equals the sender's ordinal.
    pub fn next_recv(&self, source: usize, tag: i32) -> u64 {
        bump(&self.received, source, tag)
    }

    pub fn send<T: Transport>(
        &self,
        transport: &T,
        payload: &[u8],
        dest: usize,
        tag: i32,
        sweep: Sweep,
        ordinal: u64,
    ) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_BYTES + payload.len());
        bytes.extend_from_slice(&ordinal.to_le_bytes());
        bytes.push(sweep.code());
        bytes.extend_from_slice(payload);
        transport.send(&bytes, dest, tag)?;
        Ok(())
    }

    /// Blocks until the `sweep` message for original message `ordinal` from
    /// `source` is available, parking any other message that arrives first.
    pub fn recv<T: Transport>(
        &self,
        transport: &T,
        source: usize,
        tag: i32,
        sweep: Sweep,
        ordinal: u64,
    ) -> Result<Vec<u8>> {
        if let Some(payload) = self.early.borrow_mut().remove(&(source, tag, sweep, ordinal)) {
            return Ok(payload);
        }
        loop {
            let bytes = transport.recv(source, tag)?;
            if bytes.len() < HEADER_BYTES {
                return Err(AdError::Protocol(format!(
                    "sweep message of {} bytes is shorter than its header",
                    bytes.len()
                )));
            }
            let (header, payload) = bytes.split_at(HEADER_BYTES);
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[..8]);
            let got = (Sweep::from_code(header[8])?, u64::from_le_bytes(raw));
            if got == (sweep, ordinal) {
                return Ok(payload.to_vec());
            }
            self.early
                .borrow_mut()
                .insert((source, tag, got.0, got.1), payload.to_vec());
        }
    }

    /// Messages received ahead of their handle and not yet claimed.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.early.borrow().len()
    }
}
