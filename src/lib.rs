//! padpilot - controller automation over a serial link
//!
//! ```text
//! CommandRegistry ─► CommandDescriptor ─► CommandLifecycle ─┐
//!                                                           │ Submitter
//! KeyboardSource ───────────────────────────────────────────┼──────────► InputArbiter ─► SerialTransport
//! PointerSource ────────────────────────────────────────────┘
//! ```

pub mod arbiter;
pub mod command;
pub mod config;
pub mod input;
pub mod lifecycle;
pub mod registry;
pub mod transport;
