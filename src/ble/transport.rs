//! Transport abstraction for the board's serial link.
//!
//! The manager core never talks to a radio directly. It issues intents through
//! the [`Transport`] trait and observes their outcomes on the event stream
//! returned by [`Transport::subscribe`]. The bundled [`BgxTransport`] backs
//! this with btleplug; tests drive the core with fakes.
//!
//! [`BgxTransport`]: crate::ble::bgx::BgxTransport

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::Result;

/// Operating modes of the board's serial link.
///
/// Command strings are only meaningful in a command mode; button-press data
/// only flows in stream mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusMode {
    /// Mode has not been reported yet.
    #[default]
    Unknown,
    /// Plain data streaming.
    Stream,
    /// Command mode entered from the board side.
    LocalCommand,
    /// Command mode entered from the central side.
    RemoteCommand,
    /// The module reported a mode this library does not handle.
    Unsupported,
}

/// State of the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// State has not been reported yet.
    #[default]
    Unknown,
    /// The radio is resetting.
    Resetting,
    /// BLE is not supported on this system.
    Unsupported,
    /// The application is not authorized to use the radio.
    Unauthorized,
    /// The radio is off.
    PoweredOff,
    /// The radio is on and ready.
    PoweredOn,
}

impl RadioState {
    /// Check whether scan and connect intents are serviceable.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// Connection state of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected at the link level; services and characteristics are being
    /// discovered.
    Interrogating,
    /// Fully connected and ready for traffic.
    Connected,
    /// Disconnect in progress.
    Disconnecting,
}

impl DeviceState {
    /// Check if fully connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Interrogating | Self::Disconnecting)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Interrogating => write!(f, "Interrogating"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A discovered board.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceRef {
    /// Stable identifier of the board, unique within a session.
    pub identifier: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm, if known.
    pub rssi: Option<i16>,
    /// Firmware revision string, once learned during interrogation.
    pub firmware_revision: Option<String>,
}

impl DeviceRef {
    /// Create a reference with only an identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            rssi: None,
            firmware_revision: None,
        }
    }
}

/// Notification from the transport.
///
/// One tagged enum rather than a handful of callback traits; the manager core
/// dispatches these with a single match.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The host radio changed state.
    RadioStateChanged(RadioState),
    /// A board was discovered or re-advertised with updated properties.
    DeviceDiscovered(DeviceRef),
    /// A board's connection state changed.
    DeviceStateChanged {
        /// Identifier of the board.
        identifier: String,
        /// The new state.
        state: DeviceState,
    },
    /// Serial data arrived from a connected board.
    DataReceived {
        /// Identifier of the board.
        identifier: String,
        /// The raw payload.
        data: Bytes,
    },
    /// The board's serial link changed bus mode.
    BusModeChanged {
        /// Identifier of the board.
        identifier: String,
        /// The new mode.
        mode: BusMode,
    },
    /// A previously issued command write was acknowledged.
    WriteComplete {
        /// Identifier of the board.
        identifier: String,
    },
}

/// Capability set the manager core consumes.
///
/// All methods issue an intent and return promptly; completion is observed on
/// the event stream. Implementations must deliver events for any one board in
/// the order the underlying link produced them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start scanning for boards.
    async fn start_scan(&self) -> Result<()>;

    /// Stop an in-progress scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Begin connecting to a discovered board.
    async fn connect_device(&self, identifier: &str) -> Result<()>;

    /// Begin disconnecting from a board.
    async fn disconnect_device(&self, identifier: &str) -> Result<()>;

    /// Request a bus-mode switch on a connected board.
    async fn set_bus_mode(&self, identifier: &str, mode: BusMode) -> Result<()>;

    /// Write a command string to a connected board.
    async fn send_command(&self, identifier: &str, command: &str) -> Result<()>;

    /// Subscribe to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
