//! Serial transport subsystem
//!
//! Owns the physical connection to the controller MCU and the frame format
//! that travels over it.
//!
//! 1. [`frame`] - Controller state and its wire frame
//! 2. [`serial`] - Port open/close and whole-frame writes
//! 3. [`mock`] - In-memory port for tests and dry runs
//!
//! The transport is never shared directly: it is moved into the
//! [`InputArbiter`](crate::arbiter::InputArbiter), which is the only place
//! frames are written from.

pub mod frame;
pub mod mock;
pub mod serial;

pub use frame::{Button, ControllerState, Frame, Hat, Stick, StickSide};
pub use serial::{
    available_ports, PortOpener, SerialLink, SerialTransport, SystemPortOpener, TransportParams,
    MAX_STALLED_WRITES,
};

/// Errors of the serial transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Port {port} is already open")]
    PortBusy { port: String },

    #[error("Serial device not found: {port}")]
    DeviceNotFound { port: String },

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport is closed")]
    Closed,
}
