//! The adjoint-interface adapter.
//!
//! Everything between an AD value and the transport:
//!
//! - [`codec`]: AD values to wire bytes and back.
//! - [`activity`]: which values carry a dependency, and agreement across ranks.
//! - [`buffer`]: scoped adjoint storage and the rank combination.
//! - [`tool`]: flavor-dependent tape registration.
//! - [`handle`]: the external function recorded per communication.
//! - [`mailbox`]: matching point-to-point sweep messages to their handles.

pub mod activity;
pub mod buffer;
pub mod codec;
pub mod handle;
pub mod mailbox;
pub mod tool;

pub use buffer::AdjointBuffer;
pub use codec::{LocReal, LocatedWire, WireValue};
pub use handle::{CommHandle, HandleState, Pattern, Routing};
pub use mailbox::{Mailbox, Sweep};
pub use tool::AdTool;
