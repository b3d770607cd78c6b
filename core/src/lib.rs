//! # adcomm
//!
//! `adcomm` lets reverse-mode AD values travel through message passing
//! without losing their derivatives. A value sent from one rank to another,
//! broadcast, reduced, gathered or scattered comes back out of the reverse
//! sweep with the same adjoints it would have had if the whole computation
//! had run on a single tape.
//!
//! ## Modules
//!
//! - [`tape`]: the AD tape interface the adapter consumes, plus a reference
//!   Jacobian tape.
//! - [`distributed`]: the byte-level transport and an in-process
//!   implementation over `crossbeam` channels.
//! - [`adjoint`]: the adapter itself: wire codec, activity classification,
//!   adjoint buffers and the external function recorded per communication.
//! - [`ops`]: reduction operators and their adjoint kernels.
//! - [`comm`]: the user-facing differentiable communication calls.
//!
//! ## Example
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
//!             let mut tape = Tape::new();
//!             tape.set_active();
//!
//!             if comm.rank() == 0 {
//!                 let mut x = AReal::new(3.0);
//!                 tape.register_input(&mut x);
//!                 comm.send(&mut tape, &[x], 1, 0).unwrap();
//!                 tape.evaluate().unwrap();
//!                 tape.gradient(x.index)
//!             } else {
//!                 let mut y = [AReal::default()];
//!                 comm.recv(&mut tape, &mut y, 0, 0).unwrap();
//!                 // z = y * y
//!                 let z = tape.mul(y[0], y[0]);
//!                 tape.set_gradient(z.index, 1.0);
//!                 tape.evaluate().unwrap();
//!                 z.value
//!             }
//!         })
//!     })
//!     .collect();
//! let results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
//! // dz/dx = 2x on the sending rank
//! assert_eq!(results, vec![6.0, 9.0]);
//! ```

pub mod adjoint;
pub mod comm;
pub mod config;
pub mod distributed;
pub mod error;
pub mod ops;
pub mod tape;

pub use config::{AdConfig, ToolFlavor};
pub use error::{AdError, Result, TransportError};

pub mod prelude {
    pub use crate::adjoint::LocReal;
    pub use crate::comm::{AdComm, AdRequest, Contribution};
    pub use crate::config::{AdConfig, ToolFlavor};
    pub use crate::distributed::{ChannelTransport, Transport};
    pub use crate::error::{AdError, Result};
    pub use crate::ops::{CustomOperator, OperatorKind, OperatorRegistry};
    pub use crate::tape::{AReal, AdTape, Tape, TapeIndex};
}
