//! Error types for the pillowcase-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No board with the given identifier is in the discovered set.
    #[error("Board not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the board is not connected.
    #[error("Board not connected: {identifier}")]
    NotConnected {
        /// The identifier of the board.
        identifier: String,
    },

    /// Characteristic not found on the board.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Invalid data was received from the board.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// The manager's core task has shut down and no longer accepts intents.
    #[error("Board manager is shut down")]
    ManagerClosed,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
