//! BLE communication module.
//!
//! The [`transport::Transport`] trait is the seam between the manager core
//! and the radio; [`bgx::BgxTransport`] is the production implementation.

pub mod bgx;
pub mod transport;
pub mod uuids;

pub use bgx::BgxTransport;
pub use transport::{
    BusMode, DeviceRef, DeviceState, RadioState, Transport, TransportEvent,
};
pub use uuids::*;
