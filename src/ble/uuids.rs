//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for board communication. The serial link
//! is a Silicon Labs BGX module exposing the Xpress Streaming Service.

use uuid::Uuid;

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = Uuid::from_u128(0x0000_2a26_0000_1000_8000_00805f9b34fb);

// Xpress Streaming Service (Silicon Labs BGX)
/// BGX Xpress Streaming Service UUID.
pub const XPRESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x331a_36f5_2459_45ea_9d95_6142f0c4b307);
/// Serial Rx characteristic UUID (write to board).
pub const XPRESS_RX_UUID: Uuid = Uuid::from_u128(0xa9da_6040_0823_4995_94ec_9ce41ca28833);
/// Serial Tx characteristic UUID (notifications from board).
pub const XPRESS_TX_UUID: Uuid = Uuid::from_u128(0xa73e_9a10_628f_4494_a099_12efaf72258f);
/// Bus mode characteristic UUID (read, write, notify).
pub const XPRESS_MODE_UUID: Uuid = Uuid::from_u128(0x75a9_f022_af03_4e41_b4bc_9de90a47d50b);

/// Check if a service UUID belongs to the BGX serial bridge.
pub fn is_xpress_service(uuid: &Uuid) -> bool {
    *uuid == XPRESS_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let device_info = DEVICE_INFO_SERVICE_UUID.to_string();
        assert!(device_info.contains("180a"));

        let xpress = XPRESS_SERVICE_UUID.to_string();
        assert!(xpress.contains("331a36f5"));
    }

    #[test]
    fn test_is_xpress_service() {
        assert!(is_xpress_service(&XPRESS_SERVICE_UUID));
        assert!(!is_xpress_service(&DEVICE_INFO_SERVICE_UUID));
        assert!(!is_xpress_service(&XPRESS_MODE_UUID));
    }
}
