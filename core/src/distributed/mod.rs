//! # Message passing
//!
//! The layer underneath the adjoint adapter: a rank-addressed transport that
//! moves bytes point-to-point and collectively.
//!
//! ## Module Contents
//!
//! *   [`Transport`](backend::Transport): the interface the rest of the crate is
//!     written against. Non-blocking operations return a request; the blocking
//!     forms are provided methods that wait on it.
//! *   [`ChannelTransport`](cpu_backend::ChannelTransport): ranks as threads in one
//!     process, connected with `crossbeam` channels. Good enough to run every
//!     communication pattern, and deterministic in its reduction order.
//!
//! ## Quick Start
//!
//! ```rust
//! use adcomm::distributed::{ChannelTransport, Transport};
//! use std::thread;
//!
//! let handles: Vec<_> = ChannelTransport::world(2)
//!     .into_iter()
//!     .map(|t| {
//!         thread::spawn(move || {
//!             let data = (t.rank() == 0).then(|| vec![42u8]);
//!             t.bcast(data.as_deref(), 0).unwrap()
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     assert_eq!(h.join().unwrap(), vec![42]);
//! }
//! ```

pub mod backend;
pub mod cpu_backend;

pub use backend::{OpHandle, RawOpFn, Transport, TransportResult};
pub use cpu_backend::{ChannelRequest, ChannelTransport, Envelope, Tag};
