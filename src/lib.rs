// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # pillowcase-ble
//!
//! A cross-platform Rust library for managing HatchMed Pillow Case
//! call-button boards over Bluetooth Low Energy.
//!
//! The board is a Silicon Labs BGX serial bridge wired to up to seven call
//! buttons. This library owns the whole connection lifecycle: it scans for
//! boards, reconnects to the board it saw last, brings freshly connected
//! boards up to the required configuration by running a scripted update over
//! the BGX command protocol, and then surfaces button presses streamed over
//! the serial link.
//!
//! ## Features
//!
//! - **Board Discovery**: Scan for nearby boards, bounded or indefinite
//! - **Automatic Reconnect**: Persist the last board and reconnect on sight
//! - **Configuration Updates**: Scripted command-mode update run on connect
//! - **Button Events**: Streamed presses decoded and delivered as events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pillowcase_ble::{BgxTransport, BoardEvent, BoardManager, FileStore, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = BgxTransport::new().await?;
//!     let store = FileStore::new("pillowcase-board-id.txt");
//!     let manager = BoardManager::new(transport, store);
//!
//!     let mut events = manager.subscribe();
//!
//!     // Begin scanning; reconnects automatically if a board was saved.
//!     manager.configure(false, false);
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             BoardEvent::ButtonPressed(number) => println!("Button {number}!"),
//!             BoardEvent::DevicesFound(devices) => {
//!                 // No saved board: pick one.
//!                 if let Some(device) = devices.first() {
//!                     manager.connect(&device.identifier)?;
//!                 }
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod error;
pub mod manager;
pub mod sequencer;
pub mod storage;
pub mod version;

// Re-exports for convenience
pub use error::{Error, Result};
pub use manager::{BoardEvent, BoardManager, CallbackHandle, SCAN_WINDOW};
pub use sequencer::{REQUIRED_BOARD_VERSION, UPDATE_SCRIPT};
pub use storage::{FileStore, IdentifierStore, MemoryStore};
pub use version::BoardVersion;

// Re-export commonly used types from submodules
pub use ble::bgx::BgxTransport;
pub use ble::transport::{
    BusMode, DeviceRef, DeviceState, RadioState, Transport, TransportEvent,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<BoardManager>();
        let _ = std::any::TypeId::of::<BoardEvent>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<DeviceRef>();
        let _ = std::any::TypeId::of::<DeviceState>();
        let _ = std::any::TypeId::of::<BoardVersion>();
    }

    #[test]
    fn test_update_script_is_exported() {
        assert!(!UPDATE_SCRIPT.is_empty());
        assert_eq!(REQUIRED_BOARD_VERSION, BoardVersion::new(1, 0, 0));
    }
}
